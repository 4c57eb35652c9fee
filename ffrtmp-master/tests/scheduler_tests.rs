use ffrtmp_common::model::{
    ExitReason, JobPriority, JobResult, JobStatus, NodeCapabilities, NodeStatus, NodeType,
    QueueType, TenantId,
};
use ffrtmp_master::config::{CleanupConfig, SchedulerConfig};
use ffrtmp_master::model::{JobFilter, JobSpec, RegisterNodeRequest};
use ffrtmp_master::repo::memory::InMemoryStore;
use ffrtmp_master::repo::{JobRepo, NodeRepo};
use ffrtmp_master::service::background::{admission_tick, cleanup_pass, supervisor_tick};
use ffrtmp_master::service::job::{JobError, JobService, JobServiceDefault};
use ffrtmp_master::service::node::{NodeService, NodeServiceDefault};
use std::sync::Arc;
use std::time::Duration;
use test_r::test;

test_r::enable!();

struct Fixture {
    job_repo: Arc<dyn JobRepo>,
    node_repo: Arc<dyn NodeRepo>,
    job_service: JobServiceDefault,
    node_service: NodeServiceDefault,
    scheduler_config: SchedulerConfig,
}

fn fixture() -> Fixture {
    let store = InMemoryStore::new();
    let job_repo: Arc<dyn JobRepo> = Arc::new(store.clone());
    let node_repo: Arc<dyn NodeRepo> = Arc::new(store);
    let scheduler_config = SchedulerConfig::default();
    Fixture {
        job_service: JobServiceDefault::new(
            job_repo.clone(),
            node_repo.clone(),
            scheduler_config.clone(),
        ),
        node_service: NodeServiceDefault::new(node_repo.clone(), job_repo.clone()),
        job_repo,
        node_repo,
        scheduler_config,
    }
}

fn tenant() -> TenantId {
    TenantId::default()
}

fn capabilities(has_gpu: bool) -> NodeCapabilities {
    NodeCapabilities {
        cpu_threads: 8,
        cpu_model: "test-cpu".to_string(),
        has_gpu,
        gpu_type: has_gpu.then(|| "test-gpu".to_string()),
        ram_bytes: 16 * 1024 * 1024 * 1024,
        labels: Default::default(),
    }
}

fn node_request(max_concurrent: u32) -> RegisterNodeRequest {
    RegisterNodeRequest {
        address: "10.0.0.1:9000".to_string(),
        node_type: NodeType::Server,
        capabilities: capabilities(false),
        max_concurrent: Some(max_concurrent),
    }
}

fn job_spec(scenario: &str) -> JobSpec {
    JobSpec {
        scenario: scenario.to_string(),
        parameters: Default::default(),
        wrapper_constraints: None,
        priority: None,
        queue: None,
        engine: None,
        requires_gpu: false,
        sla_target_seconds: None,
        max_retries: None,
    }
}

fn completed_result() -> JobResult {
    JobResult {
        status: JobStatus::Completed,
        exit_code: Some(0),
        error: None,
        stderr_tail: None,
        exit_reason: Some(ExitReason::Success),
        duration_seconds: 1.5,
        output_bytes: 1024,
        bandwidth_mbps: 4.2,
        sla_met: Some(true),
    }
}

async fn admit_all(fixture: &Fixture) {
    admission_tick(fixture.job_repo.as_ref(), &fixture.scheduler_config)
        .await
        .unwrap();
}

#[test]
async fn priority_inversion_resistance() {
    let fixture = fixture();
    let tenant = tenant();

    let low = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                priority: Some(JobPriority::Low),
                ..job_spec("j1")
            },
        )
        .await
        .unwrap();
    let medium = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                priority: Some(JobPriority::Medium),
                ..job_spec("j2")
            },
        )
        .await
        .unwrap();
    let high = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                priority: Some(JobPriority::High),
                ..job_spec("j3")
            },
        )
        .await
        .unwrap();
    admit_all(&fixture).await;

    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let job = fixture
            .job_service
            .claim_next(&tenant, &node.id)
            .await
            .unwrap()
            .expect("a job should be eligible");
        order.push(job.id);
        fixture
            .job_service
            .report_started(&tenant, &job.id, &node.id)
            .await
            .unwrap();
        fixture
            .job_service
            .report_result(&tenant, &job.id, &node.id, &completed_result())
            .await
            .unwrap();
    }

    assert_eq!(order, vec![high.id, medium.id, low.id]);
}

#[test]
async fn queue_class_ordering() {
    let fixture = fixture();
    let tenant = tenant();

    let batch = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                queue: Some(QueueType::Batch),
                ..job_spec("j1")
            },
        )
        .await
        .unwrap();
    let default = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                queue: Some(QueueType::Default),
                ..job_spec("j2")
            },
        )
        .await
        .unwrap();
    let live = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                queue: Some(QueueType::Live),
                ..job_spec("j3")
            },
        )
        .await
        .unwrap();
    admit_all(&fixture).await;

    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let job = fixture
            .job_service
            .claim_next(&tenant, &node.id)
            .await
            .unwrap()
            .unwrap();
        order.push(job.id);
        fixture
            .job_service
            .report_started(&tenant, &job.id, &node.id)
            .await
            .unwrap();
        fixture
            .job_service
            .report_result(&tenant, &job.id, &node.id, &completed_result())
            .await
            .unwrap();
    }

    assert_eq!(order, vec![live.id, default.id, batch.id]);
}

#[test]
async fn fifo_within_same_class() {
    let fixture = fixture();
    let tenant = tenant();

    let mut submitted = Vec::new();
    for i in 0..4 {
        // Distinct created_at values.
        tokio::time::sleep(Duration::from_millis(2)).await;
        submitted.push(
            fixture
                .job_service
                .submit(&tenant, &job_spec(&format!("job-{i}")))
                .await
                .unwrap()
                .id,
        );
    }
    admit_all(&fixture).await;

    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();

    for expected in submitted {
        let job = fixture
            .job_service
            .claim_next(&tenant, &node.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, expected);
        fixture
            .job_service
            .report_started(&tenant, &job.id, &node.id)
            .await
            .unwrap();
        fixture
            .job_service
            .report_result(&tenant, &job.id, &node.id, &completed_result())
            .await
            .unwrap();
    }
}

#[test]
async fn concurrent_claims_never_share_a_job() {
    let fixture = fixture();
    let tenant = tenant();

    fixture
        .job_service
        .submit(&tenant, &job_spec("only"))
        .await
        .unwrap();
    admit_all(&fixture).await;

    let node_a = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    let node_b = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        fixture.job_service.claim_next(&tenant, &node_a.id),
        fixture.job_service.claim_next(&tenant, &node_b.id),
    );
    let claims = [a.unwrap(), b.unwrap()];
    assert_eq!(claims.iter().filter(|claim| claim.is_some()).count(), 1);
}

#[test]
async fn claim_respects_slot_limit_and_capabilities() {
    let fixture = fixture();
    let tenant = tenant();

    fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                requires_gpu: true,
                ..job_spec("gpu-job")
            },
        )
        .await
        .unwrap();
    admit_all(&fixture).await;

    let cpu_node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    assert!(fixture
        .job_service
        .claim_next(&tenant, &cpu_node.id)
        .await
        .unwrap()
        .is_none());

    let gpu_node = fixture
        .node_service
        .register(
            &tenant,
            &RegisterNodeRequest {
                capabilities: capabilities(true),
                ..node_request(1)
            },
        )
        .await
        .unwrap();
    let job = fixture
        .job_service
        .claim_next(&tenant, &gpu_node.id)
        .await
        .unwrap()
        .expect("gpu node should claim the job");

    // The single slot is taken now.
    assert_eq!(job.status, JobStatus::Assigned);
    fixture
        .job_service
        .submit(&tenant, &job_spec("second"))
        .await
        .unwrap();
    admit_all(&fixture).await;
    assert!(fixture
        .job_service
        .claim_next(&tenant, &gpu_node.id)
        .await
        .unwrap()
        .is_none());

    let node = fixture
        .node_repo
        .get(&tenant, &gpu_node.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Busy);
}

#[test]
async fn node_timeout_requeues_with_retry_increment() {
    let fixture = fixture();
    let tenant = tenant();

    let job = fixture
        .job_service
        .submit(&tenant, &job_spec("transcode"))
        .await
        .unwrap();
    admit_all(&fixture).await;

    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    let claimed = fixture
        .job_service
        .claim_next(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();
    fixture
        .job_service
        .report_started(&tenant, &claimed.id, &node.id)
        .await
        .unwrap();

    // The node goes silent; with a tiny timeout the supervisor must
    // reclaim the job exactly once.
    let config = SchedulerConfig {
        node_timeout: Duration::from_millis(1),
        ..SchedulerConfig::default()
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    supervisor_tick(fixture.node_repo.as_ref(), fixture.job_repo.as_ref(), &config)
        .await
        .unwrap();

    let requeued = fixture.job_service.get(&tenant, &job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.assigned_node_id, None);

    let node = fixture
        .node_repo
        .get(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Offline);
}

#[test]
async fn retry_exhaustion_fails_the_job() {
    let fixture = fixture();
    let tenant = tenant();

    let job = fixture
        .job_service
        .submit(
            &tenant,
            &JobSpec {
                max_retries: Some(1),
                ..job_spec("flaky")
            },
        )
        .await
        .unwrap();
    admit_all(&fixture).await;

    let config = SchedulerConfig {
        node_timeout: Duration::from_millis(1),
        ..SchedulerConfig::default()
    };

    for round in 0..2 {
        let node = fixture
            .node_service
            .register(&tenant, &node_request(1))
            .await
            .unwrap();
        let claimed = fixture
            .job_service
            .claim_next(&tenant, &node.id)
            .await
            .unwrap();
        assert!(claimed.is_some(), "round {round} should claim the job");
        tokio::time::sleep(Duration::from_millis(10)).await;
        supervisor_tick(fixture.node_repo.as_ref(), fixture.job_repo.as_ref(), &config)
            .await
            .unwrap();
    }

    let failed = fixture.job_service.get(&tenant, &job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(
        failed.result.as_ref().and_then(|result| result.error.clone()),
        Some("exhausted_retries".to_string())
    );
    assert!(failed.completed_at.unwrap() >= failed.created_at);
}

#[test]
async fn cancel_queued_is_immediate() {
    let fixture = fixture();
    let tenant = tenant();

    let job = fixture
        .job_service
        .submit(&tenant, &job_spec("to-cancel"))
        .await
        .unwrap();
    admit_all(&fixture).await;

    let canceled = fixture.job_service.cancel(&tenant, &job.id).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(canceled.completed_at.is_some());

    // No worker ever sees it.
    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    assert!(fixture
        .job_service
        .claim_next(&tenant, &node.id)
        .await
        .unwrap()
        .is_none());
}

#[test]
async fn cancel_running_sets_flag_for_worker_poll() {
    let fixture = fixture();
    let tenant = tenant();

    let job = fixture
        .job_service
        .submit(&tenant, &job_spec("long"))
        .await
        .unwrap();
    admit_all(&fixture).await;

    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    fixture
        .job_service
        .claim_next(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();
    fixture
        .job_service
        .report_started(&tenant, &job.id, &node.id)
        .await
        .unwrap();

    let flagged = fixture.job_service.cancel(&tenant, &job.id).await.unwrap();
    assert_eq!(flagged.status, JobStatus::Running);
    assert!(flagged.cancel_requested);

    // The worker observes the flag on its poll and reports canceled.
    let observed = fixture.job_service.get(&tenant, &job.id).await.unwrap();
    assert!(observed.cancel_requested);
    let (final_job, applied) = fixture
        .job_service
        .report_result(
            &tenant,
            &job.id,
            &node.id,
            &JobResult {
                status: JobStatus::Canceled,
                exit_reason: Some(ExitReason::Signal),
                ..completed_result()
            },
        )
        .await
        .unwrap();
    assert!(applied);
    assert_eq!(final_job.status, JobStatus::Canceled);
}

#[test]
async fn duplicate_results_collapse() {
    let fixture = fixture();
    let tenant = tenant();

    let job = fixture
        .job_service
        .submit(&tenant, &job_spec("once"))
        .await
        .unwrap();
    admit_all(&fixture).await;
    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    fixture
        .job_service
        .claim_next(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();
    fixture
        .job_service
        .report_started(&tenant, &job.id, &node.id)
        .await
        .unwrap();

    let (first, applied_first) = fixture
        .job_service
        .report_result(&tenant, &job.id, &node.id, &completed_result())
        .await
        .unwrap();
    assert!(applied_first);

    let (second, applied_second) = fixture
        .job_service
        .report_result(
            &tenant,
            &job.id,
            &node.id,
            &JobResult {
                status: JobStatus::Failed,
                ..completed_result()
            },
        )
        .await
        .unwrap();
    assert!(!applied_second);
    // First report wins.
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.completed_at, first.completed_at);
}

#[test]
async fn heartbeat_is_idempotent() {
    let fixture = fixture();
    let tenant = tenant();

    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();

    fixture
        .node_service
        .heartbeat(&tenant, &node.id)
        .await
        .unwrap();
    let after_first = fixture
        .node_repo
        .get(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();

    fixture
        .node_service
        .heartbeat(&tenant, &node.id)
        .await
        .unwrap();
    let after_second = fixture
        .node_repo
        .get(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(after_first.status, after_second.status);
    assert!(after_second.last_seen >= after_first.last_seen);
}

#[test]
async fn deregister_requeues_in_flight_jobs() {
    let fixture = fixture();
    let tenant = tenant();

    let job = fixture
        .job_service
        .submit(&tenant, &job_spec("moving"))
        .await
        .unwrap();
    admit_all(&fixture).await;
    let node = fixture
        .node_service
        .register(&tenant, &node_request(1))
        .await
        .unwrap();
    fixture
        .job_service
        .claim_next(&tenant, &node.id)
        .await
        .unwrap()
        .unwrap();

    fixture
        .node_service
        .deregister(&tenant, &node.id)
        .await
        .unwrap();

    let requeued = fixture.job_service.get(&tenant, &job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
}

#[test]
async fn tenant_isolation_on_jobs_and_claims() {
    let fixture = fixture();
    let tenant_a = TenantId::try_new("tenant-a").unwrap();
    let tenant_b = TenantId::try_new("tenant-b").unwrap();

    let job = fixture
        .job_service
        .submit(&tenant_a, &job_spec("private"))
        .await
        .unwrap();
    admit_all(&fixture).await;

    assert!(matches!(
        fixture.job_service.get(&tenant_b, &job.id).await,
        Err(JobError::NotFound(_))
    ));
    assert!(fixture
        .job_service
        .list(&tenant_b, &JobFilter::default())
        .await
        .unwrap()
        .is_empty());

    let foreign_node = fixture
        .node_service
        .register(&tenant_b, &node_request(1))
        .await
        .unwrap();
    assert!(fixture
        .job_service
        .claim_next(&tenant_b, &foreign_node.id)
        .await
        .unwrap()
        .is_none());
}

#[test]
async fn cleanup_removes_only_old_terminal_jobs() {
    let fixture = fixture();
    let tenant = tenant();
    let node = fixture
        .node_service
        .register(&tenant, &node_request(5))
        .await
        .unwrap();

    let mut terminal = Vec::new();
    for i in 0..5 {
        let job = fixture
            .job_service
            .submit(&tenant, &job_spec(&format!("done-{i}")))
            .await
            .unwrap();
        terminal.push(job.id);
    }
    let survivor = fixture
        .job_service
        .submit(&tenant, &job_spec("still-pending"))
        .await
        .unwrap();
    admit_all(&fixture).await;

    for _ in &terminal {
        let claimed = fixture
            .job_service
            .claim_next(&tenant, &node.id)
            .await
            .unwrap()
            .unwrap();
        fixture
            .job_service
            .report_started(&tenant, &claimed.id, &node.id)
            .await
            .unwrap();
        fixture
            .job_service
            .report_result(&tenant, &claimed.id, &node.id, &completed_result())
            .await
            .unwrap();
    }

    let config = CleanupConfig {
        retention_days: 0,
        ..CleanupConfig::default()
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let deleted = cleanup_pass(fixture.job_repo.as_ref(), &config).await.unwrap();
    assert_eq!(deleted, 5);

    for id in &terminal {
        assert!(matches!(
            fixture.job_service.get(&tenant, id).await,
            Err(JobError::NotFound(_))
        ));
    }
    // The pending job survives even with zero retention.
    let survivor = fixture
        .job_service
        .get(&tenant, &survivor.id)
        .await
        .unwrap();
    assert!(!survivor.status.is_terminal());
    assert!(survivor.completed_at.is_none());
}
