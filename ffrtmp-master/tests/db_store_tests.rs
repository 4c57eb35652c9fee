use chrono::{Duration as ChronoDuration, Utc};
use ffrtmp_common::config::{DbConfig, DbSqliteConfig};
use ffrtmp_common::model::{
    EnginePreference, Job, JobId, JobPriority, JobStatus, Node, NodeCapabilities, NodeId,
    NodeStatus, NodeType, QueueType, TenantId,
};
use ffrtmp_master::repo::db::DbStore;
use ffrtmp_master::repo::{JobRepo, NodeRepo};
use tempfile::TempDir;
use test_r::test;

test_r::enable!();

async fn sqlite_store(dir: &TempDir) -> DbStore {
    let config = DbConfig::Sqlite(DbSqliteConfig {
        database: dir.path().join("store.db"),
        max_connections: 2,
    });
    DbStore::connect(&config).await.expect("store should open")
}

fn capabilities(has_gpu: bool) -> NodeCapabilities {
    NodeCapabilities {
        cpu_threads: 8,
        cpu_model: "test-cpu".to_string(),
        has_gpu,
        gpu_type: has_gpu.then(|| "test-gpu".to_string()),
        ram_bytes: 8 * 1024 * 1024 * 1024,
        labels: Default::default(),
    }
}

fn node(tenant: &TenantId, has_gpu: bool, max_concurrent: u32) -> Node {
    let now = Utc::now();
    Node {
        id: NodeId::new_v4(),
        tenant_id: tenant.clone(),
        address: "10.0.0.1:9000".to_string(),
        node_type: NodeType::Server,
        capabilities: capabilities(has_gpu),
        status: NodeStatus::Available,
        max_concurrent,
        last_seen: now,
        registered_at: now,
    }
}

fn queued_job(
    tenant: &TenantId,
    scenario: &str,
    priority: JobPriority,
    requires_gpu: bool,
    created_offset_ms: i64,
) -> Job {
    Job {
        id: JobId::new_v4(),
        tenant_id: tenant.clone(),
        scenario: scenario.to_string(),
        parameters: Default::default(),
        wrapper_constraints: None,
        priority,
        queue: QueueType::Default,
        engine: EnginePreference::Auto,
        requires_gpu,
        status: JobStatus::Queued,
        cancel_requested: false,
        assigned_node_id: None,
        retry_count: 0,
        max_retries: 3,
        created_at: Utc::now() + ChronoDuration::milliseconds(created_offset_ms),
        assigned_at: None,
        started_at: None,
        completed_at: None,
        sla_target_seconds: None,
        result: None,
    }
}

#[test]
async fn claim_follows_priority_then_fifo_order() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let tenant = TenantId::default();

    let worker = node(&tenant, false, 3);
    NodeRepo::create(&store, &worker).await.unwrap();

    let low = queued_job(&tenant, "low", JobPriority::Low, false, 0);
    let medium = queued_job(&tenant, "medium", JobPriority::Medium, false, 1);
    let high = queued_job(&tenant, "high", JobPriority::High, false, 2);
    for job in [&low, &medium, &high] {
        JobRepo::create(&store, job).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let claimed = store
            .claim_next_job(&tenant, &worker.id)
            .await
            .unwrap()
            .expect("a job should be claimable");
        order.push(claimed.id);
    }
    assert_eq!(order, vec![high.id, medium.id, low.id]);

    assert!(store
        .claim_next_job(&tenant, &worker.id)
        .await
        .unwrap()
        .is_none());
}

#[test]
async fn claim_scans_past_a_full_page_of_capability_mismatches() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let tenant = TenantId::default();

    // 40 GPU jobs sort ahead of the single CPU job (higher priority and
    // older), pushing the only eligible candidate past the first scan
    // page of a GPU-less worker.
    for i in 0..40 {
        let job = queued_job(&tenant, &format!("gpu-{i}"), JobPriority::High, true, i);
        JobRepo::create(&store, &job).await.unwrap();
    }
    let eligible = queued_job(&tenant, "cpu-only", JobPriority::Low, false, 100);
    JobRepo::create(&store, &eligible).await.unwrap();

    let worker = node(&tenant, false, 1);
    NodeRepo::create(&store, &worker).await.unwrap();

    let claimed = store
        .claim_next_job(&tenant, &worker.id)
        .await
        .unwrap()
        .expect("the CPU job must be found behind the GPU backlog");
    assert_eq!(claimed.id, eligible.id);
    assert_eq!(claimed.status, JobStatus::Assigned);
    assert_eq!(claimed.assigned_node_id, Some(worker.id));

    // The single slot is taken; the GPU backlog stays queued.
    assert!(store
        .claim_next_job(&tenant, &worker.id)
        .await
        .unwrap()
        .is_none());
}
