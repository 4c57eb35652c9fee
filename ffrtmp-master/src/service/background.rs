use crate::bootstrap::Services;
use crate::config::{CleanupConfig, MasterServiceConfig, SchedulerConfig};
use crate::metrics;
use crate::repo::{JobRepo, NodeRepo, RepoError};
use chrono::{Duration as ChronoDuration, Utc};
use ffrtmp_common::model::{JobStatus, NodeStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const ADMISSION_BATCH: u32 = 100;

/// All long-lived master loops. Each one is a cooperative task bound to
/// the shutdown token; ticks never abort the loop on error.
pub fn spawn_background_loops(
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    services: &Services,
    config: &MasterServiceConfig,
    shutdown: CancellationToken,
) {
    join_set.spawn(admission_loop(
        services.job_repo.clone(),
        config.scheduler.clone(),
        shutdown.clone(),
    ));
    join_set.spawn(timeout_supervisor_loop(
        services.node_repo.clone(),
        services.job_repo.clone(),
        config.scheduler.clone(),
        shutdown.clone(),
    ));
    join_set.spawn(cleanup_loop(
        services.job_repo.clone(),
        config.cleanup.clone(),
        shutdown.clone(),
    ));
    join_set.spawn(vacuum_loop(
        services.job_repo.clone(),
        config.cleanup.clone(),
        shutdown.clone(),
    ));
    join_set.spawn(metrics_loop(services.job_repo.clone(), shutdown));
}

/// Moves pending jobs into the schedulable queue in submission order,
/// honoring the per-tenant queued ceiling.
async fn admission_loop(
    job_repo: Arc<dyn JobRepo>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut interval = tokio::time::interval(config.admission_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = admission_tick(job_repo.as_ref(), &config).await {
                    warn!("admission tick failed: {err}");
                }
            }
        }
    }
    Ok(())
}

pub async fn admission_tick(job_repo: &dyn JobRepo, config: &SchedulerConfig) -> Result<(), RepoError> {
    let pending = job_repo.list_pending(ADMISSION_BATCH).await?;
    for job in pending {
        if config.max_queued_jobs_per_tenant > 0 {
            let queued = job_repo.count_queued(&job.tenant_id).await?;
            if queued >= config.max_queued_jobs_per_tenant as i64 {
                debug!(tenant = %job.tenant_id, "tenant queue is full, admission deferred");
                continue;
            }
        }
        job_repo.mark_queued(&job.id).await?;
        metrics::record_job_state(JobStatus::Queued);
    }
    Ok(())
}

/// Marks silent nodes offline and returns their jobs (and overrunning
/// jobs) to the queue, failing them once retries are exhausted.
async fn timeout_supervisor_loop(
    node_repo: Arc<dyn NodeRepo>,
    job_repo: Arc<dyn JobRepo>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut interval = tokio::time::interval(config.supervisor_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = supervisor_tick(node_repo.as_ref(), job_repo.as_ref(), &config).await {
                    warn!("timeout supervisor tick failed: {err}");
                }
            }
        }
    }
    Ok(())
}

pub async fn supervisor_tick(
    node_repo: &dyn NodeRepo,
    job_repo: &dyn JobRepo,
    config: &SchedulerConfig,
) -> Result<(), RepoError> {
    let now = Utc::now();
    let node_timeout = ChronoDuration::from_std(config.node_timeout)
        .unwrap_or_else(|_| ChronoDuration::seconds(90));

    let nodes = node_repo.list_all().await?;
    let mut dead_nodes: HashSet<_> = HashSet::new();
    for node in &nodes {
        if node.status == NodeStatus::Offline {
            dead_nodes.insert(node.id);
        } else if now - node.last_seen > node_timeout {
            warn!(node_id = %node.id, "node heartbeat timed out, marking offline");
            node_repo.mark_offline(&node.id).await?;
            dead_nodes.insert(node.id);
        }
    }
    let known: HashSet<_> = nodes.iter().map(|node| node.id).collect();

    for job in job_repo.list_dispatched().await? {
        let node_gone = match job.assigned_node_id {
            Some(node_id) => dead_nodes.contains(&node_id) || !known.contains(&node_id),
            None => true,
        };

        let job_timeout = job
            .wrapper_constraints
            .as_ref()
            .and_then(|constraints| constraints.timeout_sec)
            .map(|seconds| ChronoDuration::seconds(seconds as i64))
            .unwrap_or_else(|| {
                ChronoDuration::from_std(config.job_timeout)
                    .unwrap_or_else(|_| ChronoDuration::seconds(600))
            });
        let overrunning = job.status == JobStatus::Running
            && job
                .started_at
                .is_some_and(|started| now - started > job_timeout);

        if node_gone || overrunning {
            if let Some(updated) = job_repo.requeue_or_fail(&job.id).await? {
                metrics::record_job_state(updated.status);
                info!(
                    job_id = %job.id,
                    status = %updated.status,
                    retry_count = updated.retry_count,
                    reason = if node_gone { "node_timeout" } else { "job_timeout" },
                    "dispatched job reclaimed"
                );
            }
        }
    }
    Ok(())
}

/// Deletes terminal jobs past retention in small batches. The first
/// pass is delayed after startup; non-terminal jobs are never touched.
async fn cleanup_loop(
    job_repo: Arc<dyn JobRepo>,
    config: CleanupConfig,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        _ = tokio::time::sleep(config.startup_delay) => {}
    }

    let mut interval = tokio::time::interval(config.cleanup_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match cleanup_pass(job_repo.as_ref(), &config).await {
                    Ok(deleted) if deleted > 0 => {
                        info!("cleanup removed {deleted} terminal jobs");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("cleanup pass failed: {err}"),
                }
            }
        }
    }
    Ok(())
}

pub async fn cleanup_pass(job_repo: &dyn JobRepo, config: &CleanupConfig) -> Result<u64, RepoError> {
    let cutoff = Utc::now() - ChronoDuration::days(config.retention_days as i64);
    let mut total = 0u64;
    loop {
        let deleted = job_repo
            .delete_terminal_older_than(cutoff, config.batch_size)
            .await?;
        total += deleted;
        if deleted < config.batch_size as u64 {
            break;
        }
        tokio::time::sleep(config.batch_pause).await;
    }
    Ok(total)
}

async fn vacuum_loop(
    job_repo: Arc<dyn JobRepo>,
    config: CleanupConfig,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + config.vacuum_interval,
        config.vacuum_interval,
    );
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match job_repo.vacuum().await {
                    Ok(()) => info!("store vacuum completed"),
                    Err(err) => warn!("store vacuum failed: {err}"),
                }
            }
        }
    }
    Ok(())
}

async fn metrics_loop(
    job_repo: Arc<dyn JobRepo>,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut interval = tokio::time::interval(METRICS_REFRESH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                metrics::record_uptime();
                match job_repo.aggregates().await {
                    Ok(aggregates) => metrics::update_aggregates(&aggregates),
                    Err(err) => warn!("aggregate refresh failed: {err}"),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::JobSpec;
    use crate::repo::memory::InMemoryStore;
    use crate::service::job::{JobService, JobServiceDefault};
    use ffrtmp_common::model::TenantId;

    fn services(store: InMemoryStore) -> (Arc<dyn JobRepo>, Arc<dyn NodeRepo>, JobServiceDefault) {
        let job_repo: Arc<dyn JobRepo> = Arc::new(store.clone());
        let node_repo: Arc<dyn NodeRepo> = Arc::new(store);
        let service = JobServiceDefault::new(
            job_repo.clone(),
            node_repo.clone(),
            SchedulerConfig::default(),
        );
        (job_repo, node_repo, service)
    }

    fn spec(scenario: &str) -> JobSpec {
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

    #[test]
    async fn admission_moves_pending_to_queued_in_order() {
        let store = InMemoryStore::new();
        let (job_repo, _, service) = services(store);
        let tenant = TenantId::default();

        let first = service.submit(&tenant, &spec("a")).await.unwrap();
        let second = service.submit(&tenant, &spec("b")).await.unwrap();

        admission_tick(job_repo.as_ref(), &SchedulerConfig::default())
            .await
            .unwrap();

        let queued = job_repo.count_queued(&tenant).await.unwrap();
        assert_eq!(queued, 2);
        for id in [first.id, second.id] {
            let job = job_repo.get(&tenant, &id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Queued);
        }
    }

    #[test]
    async fn admission_respects_tenant_queue_ceiling() {
        let store = InMemoryStore::new();
        let (job_repo, _, service) = services(store);
        let tenant = TenantId::default();

        for i in 0..3 {
            service
                .submit(&tenant, &spec(&format!("job-{i}")))
                .await
                .unwrap();
        }

        let config = SchedulerConfig {
            max_queued_jobs_per_tenant: 2,
            ..SchedulerConfig::default()
        };
        admission_tick(job_repo.as_ref(), &config).await.unwrap();
        assert_eq!(job_repo.count_queued(&tenant).await.unwrap(), 2);

        // The third job stays pending and is admitted once the queue drains.
        let pending = job_repo.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    async fn cleanup_with_no_terminal_jobs_deletes_nothing() {
        let store = InMemoryStore::new();
        let (job_repo, _, service) = services(store);
        let tenant = TenantId::default();
        service.submit(&tenant, &spec("a")).await.unwrap();

        let config = CleanupConfig {
            retention_days: 0,
            ..CleanupConfig::default()
        };
        let deleted = cleanup_pass(job_repo.as_ref(), &config).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(job_repo.list_pending(10).await.unwrap().len(), 1);
    }
}
