use crate::model::JobFilter;
use crate::repo::{
    exhausted_result, CancelOutcome, JobRepo, NodeRepo, RepoError, ResultOutcome, StoreAggregates,
    TenantRepo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ffrtmp_common::config::DbConfig;
use ffrtmp_common::model::{
    EnginePreference, Job, JobId, JobPriority, JobResult, JobStatus, Node, NodeCapabilities,
    NodeId, NodeStatus, NodeType, QueueType, Tenant, TenantId, WrapperConstraints,
};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../db/migration/schema.sql");

/// Page size for the ordered candidate scan in `claim_next_job`. The
/// scan pages through the whole queued set, so a run of
/// capability-mismatched heads never hides an eligible job further
/// down the order.
const CLAIM_CANDIDATE_PAGE: i64 = 32;

/// Production store over SQLite or Postgres through the `Any` driver.
/// Timestamps are epoch milliseconds, ids are TEXT UUIDs, structured
/// fields are JSON TEXT.
#[derive(Clone)]
pub struct DbStore {
    pool: AnyPool,
}

impl DbStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, RepoError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections())
            .connect(&config.connection_string())
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), RepoError> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        info!("database schema is up to date");
        Ok(())
    }

    async fn refresh_node_status(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        node_id: &NodeId,
    ) -> Result<(), RepoError> {
        let assigned: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE assigned_node_id = $1 AND status IN ('assigned', 'running')",
        )
        .bind(node_id.to_string())
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE nodes
             SET status = CASE WHEN $1 >= max_concurrent THEN 'busy' ELSE 'available' END
             WHERE id = $2 AND status <> 'offline'",
        )
        .bind(assigned)
        .bind(node_id.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

fn from_millis(value: i64) -> Result<DateTime<Utc>, RepoError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| RepoError::Internal(format!("invalid timestamp: {value}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, RepoError> {
    Uuid::parse_str(value).map_err(|err| RepoError::Internal(format!("invalid uuid: {err}")))
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> Result<T, RepoError> {
    value.parse().map_err(RepoError::Internal)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepoError> {
    serde_json::to_string(value).map_err(|err| RepoError::Internal(err.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, RepoError> {
    serde_json::from_str(value).map_err(|err| RepoError::Internal(err.to_string()))
}

fn node_from_row(row: &AnyRow) -> Result<Node, RepoError> {
    let capabilities: NodeCapabilities = from_json(&row.try_get::<String, _>("capabilities")?)?;
    Ok(Node {
        id: NodeId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        address: row.try_get("address")?,
        node_type: parse_node_type(&row.try_get::<String, _>("node_type")?)?,
        capabilities,
        status: parse_enum::<NodeStatus>(&row.try_get::<String, _>("status")?)?,
        max_concurrent: row.try_get::<i64, _>("max_concurrent")? as u32,
        last_seen: from_millis(row.try_get("last_seen")?)?,
        registered_at: from_millis(row.try_get("registered_at")?)?,
    })
}

fn parse_node_type(value: &str) -> Result<NodeType, RepoError> {
    match value {
        "desktop" => Ok(NodeType::Desktop),
        "server" => Ok(NodeType::Server),
        "edge" => Ok(NodeType::Edge),
        _ => Err(RepoError::Internal(format!("invalid node type: {value}"))),
    }
}

fn parse_engine(value: &str) -> Result<EnginePreference, RepoError> {
    match value {
        "ffmpeg" => Ok(EnginePreference::Ffmpeg),
        "gstreamer" => Ok(EnginePreference::Gstreamer),
        "auto" => Ok(EnginePreference::Auto),
        _ => Err(RepoError::Internal(format!("invalid engine: {value}"))),
    }
}

fn job_from_row(row: &AnyRow) -> Result<Job, RepoError> {
    let parameters: HashMap<String, serde_json::Value> =
        from_json(&row.try_get::<String, _>("parameters")?)?;
    let wrapper_constraints: Option<WrapperConstraints> = row
        .try_get::<Option<String>, _>("wrapper_constraints")?
        .map(|raw| from_json(&raw))
        .transpose()?;
    let result: Option<JobResult> = row
        .try_get::<Option<String>, _>("result")?
        .map(|raw| from_json(&raw))
        .transpose()?;

    Ok(Job {
        id: JobId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        scenario: row.try_get("scenario")?,
        parameters,
        wrapper_constraints,
        priority: parse_enum::<JobPriority>(&row.try_get::<String, _>("priority")?)?,
        queue: parse_enum::<QueueType>(&row.try_get::<String, _>("queue_type")?)?,
        engine: parse_engine(&row.try_get::<String, _>("engine")?)?,
        requires_gpu: row.try_get::<i64, _>("requires_gpu")? != 0,
        status: parse_enum::<JobStatus>(&row.try_get::<String, _>("status")?)?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        assigned_node_id: row
            .try_get::<Option<String>, _>("assigned_node_id")?
            .map(|raw| parse_uuid(&raw).map(NodeId))
            .transpose()?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: from_millis(row.try_get("created_at")?)?,
        assigned_at: row
            .try_get::<Option<i64>, _>("assigned_at")?
            .map(from_millis)
            .transpose()?,
        started_at: row
            .try_get::<Option<i64>, _>("started_at")?
            .map(from_millis)
            .transpose()?,
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(from_millis)
            .transpose()?,
        sla_target_seconds: row
            .try_get::<Option<i64>, _>("sla_target_seconds")?
            .map(|value| value as u64),
        result,
    })
}

#[async_trait]
impl TenantRepo for DbStore {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>, RepoError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Tenant {
                id: TenantId(row.try_get("id")?),
                name: row.try_get("name")?,
                display_name: row.try_get("display_name")?,
                is_active: row.try_get::<i64, _>("is_active")? != 0,
                config: from_json(&row.try_get::<String, _>("config")?)?,
            })
        })
        .transpose()
    }

    async fn upsert(&self, tenant: &Tenant) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO tenants (id, name, display_name, is_active, config)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET name = $2, display_name = $3, is_active = $4, config = $5",
        )
        .bind(&tenant.id.0)
        .bind(&tenant.name)
        .bind(&tenant.display_name)
        .bind(tenant.is_active as i64)
        .bind(to_json(&tenant.config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeRepo for DbStore {
    async fn create(&self, node: &Node) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO nodes (id, tenant_id, address, node_type, capabilities, status,
                                max_concurrent, last_seen, registered_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(node.id.to_string())
        .bind(&node.tenant_id.0)
        .bind(&node.address)
        .bind(node.node_type.to_string())
        .bind(to_json(&node.capabilities)?)
        .bind(node.status.to_string())
        .bind(node.max_concurrent as i64)
        .bind(to_millis(node.last_seen))
        .bind(to_millis(node.registered_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, tenant: &TenantId, id: &NodeId) -> Result<Option<Node>, RepoError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(&tenant.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn list(&self, tenant: &TenantId) -> Result<Vec<Node>, RepoError> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE tenant_id = $1 ORDER BY registered_at")
            .bind(&tenant.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<Node>, RepoError> {
        let rows = sqlx::query("SELECT * FROM nodes")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn heartbeat(
        &self,
        tenant: &TenantId,
        id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE nodes
             SET last_seen = $1,
                 status = CASE WHEN status = 'offline' THEN 'available' ELSE status END
             WHERE id = $2 AND tenant_id = $3",
        )
        .bind(to_millis(now))
        .bind(id.to_string())
        .bind(&tenant.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_offline(&self, id: &NodeId) -> Result<(), RepoError> {
        sqlx::query("UPDATE nodes SET status = 'offline' WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepo for DbStore {
    async fn create(&self, job: &Job) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO jobs (id, tenant_id, scenario, parameters, wrapper_constraints,
                               priority, priority_rank, queue_type, queue_rank, engine,
                               requires_gpu, status, cancel_requested, assigned_node_id,
                               retry_count, max_retries, created_at, assigned_at, started_at,
                               completed_at, sla_target_seconds, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22)",
        )
        .bind(job.id.to_string())
        .bind(&job.tenant_id.0)
        .bind(&job.scenario)
        .bind(to_json(&job.parameters)?)
        .bind(
            job.wrapper_constraints
                .as_ref()
                .map(to_json)
                .transpose()?,
        )
        .bind(job.priority.to_string())
        .bind(job.priority.rank())
        .bind(job.queue.to_string())
        .bind(job.queue.rank())
        .bind(job.engine.to_string())
        .bind(job.requires_gpu as i64)
        .bind(job.status.to_string())
        .bind(job.cancel_requested as i64)
        .bind(job.assigned_node_id.map(|id| id.to_string()))
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(to_millis(job.created_at))
        .bind(job.assigned_at.map(to_millis))
        .bind(job.started_at.map(to_millis))
        .bind(job.completed_at.map(to_millis))
        .bind(job.sla_target_seconds.map(|value| value as i64))
        .bind(job.result.as_ref().map(to_json).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, tenant: &TenantId, id: &JobId) -> Result<Option<Job>, RepoError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(&tenant.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, tenant: &TenantId, filter: &JobFilter) -> Result<Vec<Job>, RepoError> {
        let mut builder =
            sqlx::QueryBuilder::<sqlx::Any>::new("SELECT * FROM jobs WHERE tenant_id = ");
        builder.push_bind(tenant.0.clone());
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.to_string());
        }
        if let Some(priority) = filter.priority {
            builder.push(" AND priority = ");
            builder.push_bind(priority.to_string());
        }
        if let Some(queue) = filter.queue {
            builder.push(" AND queue_type = ");
            builder.push_bind(queue.to_string());
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(filter.limit.map(|limit| limit as i64).unwrap_or(1000));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next_job(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, RepoError> {
        let mut tx = self.pool.begin().await?;

        let node_row =
            sqlx::query("SELECT * FROM nodes WHERE id = $1 AND tenant_id = $2 AND status <> 'offline'")
                .bind(node_id.to_string())
                .bind(&tenant.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(node_row) = node_row else {
            return Ok(None);
        };
        let node = node_from_row(&node_row)?;

        let assigned: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE assigned_node_id = $1 AND status IN ('assigned', 'running')",
        )
        .bind(node_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if assigned >= node.max_concurrent as i64 {
            return Ok(None);
        }

        let now = Utc::now();
        let mut offset = 0i64;
        loop {
            let candidates = sqlx::query(
                "SELECT * FROM jobs WHERE tenant_id = $1 AND status = 'queued'
                 ORDER BY priority_rank, queue_rank, created_at, id LIMIT $2 OFFSET $3",
            )
            .bind(&tenant.0)
            .bind(CLAIM_CANDIDATE_PAGE)
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;
            if candidates.is_empty() {
                break;
            }

            for row in &candidates {
                let mut job = job_from_row(row)?;
                if !job.matches_capabilities(&node.capabilities) {
                    continue;
                }

                // CAS guard: a concurrent claim in another transaction
                // may have taken this candidate already.
                let updated = sqlx::query(
                    "UPDATE jobs SET status = 'assigned', assigned_node_id = $1, assigned_at = $2
                     WHERE id = $3 AND status = 'queued'",
                )
                .bind(node_id.to_string())
                .bind(to_millis(now))
                .bind(job.id.to_string())
                .execute(&mut *tx)
                .await?;

                if updated.rows_affected() == 1 {
                    job.status = JobStatus::Assigned;
                    job.assigned_node_id = Some(*node_id);
                    job.assigned_at = Some(now);

                    self.refresh_node_status(&mut tx, node_id).await?;
                    tx.commit().await?;
                    return Ok(Some(job));
                }
            }

            offset += candidates.len() as i64;
        }

        Ok(None)
    }

    async fn record_started(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, RepoError> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = $1
             WHERE id = $2 AND tenant_id = $3 AND status = 'assigned' AND assigned_node_id = $4",
        )
        .bind(to_millis(now))
        .bind(id.to_string())
        .bind(&tenant.0)
        .bind(node_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        JobRepo::get(self, tenant, id).await
    }

    async fn record_result(
        &self,
        id: &JobId,
        node_id: &NodeId,
        result: &JobResult,
    ) -> Result<ResultOutcome, RepoError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(ResultOutcome::NotFound);
        };
        let job = job_from_row(&row)?;

        if job.status.is_terminal() {
            return Ok(ResultOutcome::AlreadyTerminal(job));
        }
        if !job.status.is_dispatched() || job.assigned_node_id != Some(*node_id) {
            return Ok(ResultOutcome::WrongNode(job));
        }

        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE jobs SET status = $1, completed_at = $2, result = $3
             WHERE id = $4 AND status IN ('assigned', 'running')",
        )
        .bind(result.status.to_string())
        .bind(to_millis(now))
        .bind(to_json(result)?)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Lost the race against another report or a re-queue.
            let job = job_from_row(
                &sqlx::query("SELECT * FROM jobs WHERE id = $1")
                    .bind(id.to_string())
                    .fetch_one(&mut *tx)
                    .await?,
            )?;
            return Ok(ResultOutcome::AlreadyTerminal(job));
        }

        self.refresh_node_status(&mut tx, node_id).await?;

        let mut job = job;
        job.status = result.status;
        job.completed_at = Some(now);
        job.result = Some(result.clone());

        tx.commit().await?;
        Ok(ResultOutcome::Applied(job))
    }

    async fn request_cancel(
        &self,
        tenant: &TenantId,
        id: &JobId,
    ) -> Result<CancelOutcome, RepoError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(&tenant.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(CancelOutcome::NotFound);
        };
        let mut job = job_from_row(&row)?;

        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job));
        }

        if job.status.is_dispatched() {
            sqlx::query("UPDATE jobs SET cancel_requested = $1 WHERE id = $2")
                .bind(1i64)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            job.cancel_requested = true;
            Ok(CancelOutcome::Flagged(job))
        } else {
            let now = Utc::now();
            sqlx::query(
                "UPDATE jobs SET cancel_requested = $1, status = 'canceled', completed_at = $2
                 WHERE id = $3",
            )
            .bind(1i64)
            .bind(to_millis(now))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            job.cancel_requested = true;
            job.status = JobStatus::Canceled;
            job.completed_at = Some(now);
            Ok(CancelOutcome::Canceled(job))
        }
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<Job>, RepoError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn count_queued(&self, tenant: &TenantId) -> Result<i64, RepoError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE tenant_id = $1 AND status = 'queued'",
        )
        .bind(&tenant.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_queued(&self, id: &JobId) -> Result<(), RepoError> {
        sqlx::query("UPDATE jobs SET status = 'queued' WHERE id = $1 AND status = 'pending'")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_dispatched(&self) -> Result<Vec<Job>, RepoError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status IN ('assigned', 'running')")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn requeue_or_fail(&self, id: &JobId) -> Result<Option<Job>, RepoError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM jobs WHERE id = $1 AND status IN ('assigned', 'running')",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;
        let node_id = job.assigned_node_id;
        let now = Utc::now();

        if job.retry_count >= job.max_retries {
            let result = exhausted_result(&job, now);
            sqlx::query(
                "UPDATE jobs SET status = 'failed', completed_at = $1, result = $2
                 WHERE id = $3 AND status IN ('assigned', 'running')",
            )
            .bind(to_millis(now))
            .bind(to_json(&result)?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.result = Some(result);
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'queued', retry_count = retry_count + 1,
                        assigned_node_id = NULL, assigned_at = NULL, started_at = NULL
                 WHERE id = $1 AND status IN ('assigned', 'running')",
            )
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            job.status = JobStatus::Queued;
            job.retry_count += 1;
            job.assigned_node_id = None;
            job.assigned_at = None;
            job.started_at = None;
        }

        if let Some(node_id) = node_id {
            self.refresh_node_status(&mut tx, &node_id).await?;
        }
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, RepoError> {
        let deleted = sqlx::query(
            "DELETE FROM jobs WHERE id IN (
                 SELECT id FROM jobs
                 WHERE status IN ('completed', 'failed', 'canceled')
                   AND COALESCE(completed_at, created_at) < $1
                 LIMIT $2
             )",
        )
        .bind(to_millis(cutoff))
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }

    async fn aggregates(&self) -> Result<StoreAggregates, RepoError> {
        let mut aggregates = StoreAggregates::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status = parse_enum::<JobStatus>(&row.try_get::<String, _>("status")?)?;
            aggregates
                .jobs_by_status
                .insert(status, row.try_get::<i64, _>("n")?);
        }

        let rows = sqlx::query(
            "SELECT priority, COUNT(*) AS n FROM jobs WHERE status = 'queued' GROUP BY priority",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let priority = parse_enum::<JobPriority>(&row.try_get::<String, _>("priority")?)?;
            aggregates
                .queued_by_priority
                .insert(priority, row.try_get::<i64, _>("n")?);
        }

        let rows = sqlx::query(
            "SELECT queue_type, COUNT(*) AS n FROM jobs WHERE status = 'queued' GROUP BY queue_type",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let queue = parse_enum::<QueueType>(&row.try_get::<String, _>("queue_type")?)?;
            aggregates
                .queued_by_queue
                .insert(queue, row.try_get::<i64, _>("n")?);
        }

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM nodes GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status = parse_enum::<NodeStatus>(&row.try_get::<String, _>("status")?)?;
            let count = row.try_get::<i64, _>("n")?;
            aggregates.nodes_by_status.insert(status, count);
            aggregates.nodes_total += count;
        }

        Ok(aggregates)
    }

    async fn vacuum(&self) -> Result<(), RepoError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}
