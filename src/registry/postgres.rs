//! Postgres-backed registry client.
//!
//! Runtime queries in the same style as the rest of the registry tooling:
//! every call is one auto-committed statement, and the conditional update in
//! [`PgJobRegistry::mark_starting`] is what prevents two scheduler instances
//! from dispatching the same job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::models::topology::{
    ClusterTopology, DatabaseDefinition, DatabaseInstance, Machine, QueueDefinition,
};
use crate::models::{JobExecutionState, JobFilter, JobRecord};
use crate::registry::client::JobRegistry;

const JOB_COLUMNS: &str = "\
    j.id, j.queue_id, j.user_id, u.name AS user_name, j.name, j.external_id, \
    j.workflow_type, j.state, j.cancel_requested, j.recurring, j.timeout_seconds, \
    j.scheduled_at, j.started_at, j.finished_at, j.error_message, j.lock_owner, \
    j.domain_id, j.federation_id";

#[derive(Debug, sqlx::FromRow)]
struct JobInstanceRow {
    id: Uuid,
    queue_id: Uuid,
    user_id: Uuid,
    user_name: String,
    name: String,
    external_id: i64,
    workflow_type: String,
    state: String,
    cancel_requested: bool,
    recurring: bool,
    timeout_seconds: Option<i64>,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    lock_owner: Option<Uuid>,
    domain_id: Uuid,
    federation_id: Uuid,
}

impl TryFrom<JobInstanceRow> for JobRecord {
    type Error = SchedulerError;

    fn try_from(row: JobInstanceRow) -> Result<Self> {
        let state: JobExecutionState = row
            .state
            .parse()
            .map_err(SchedulerError::Registry)?;

        Ok(JobRecord {
            id: row.id,
            queue_id: row.queue_id,
            user_id: row.user_id,
            user_name: row.user_name,
            name: row.name,
            external_id: row.external_id,
            workflow_type: row.workflow_type,
            state,
            cancel_requested: row.cancel_requested,
            recurring: row.recurring,
            timeout: row.timeout_seconds.map(|s| Duration::from_secs(s.max(0) as u64)),
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
            lock_owner: row.lock_owner,
            domain_id: row.domain_id,
            federation_id: row.federation_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MachineRow {
    id: Uuid,
    name: String,
    host_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    machine_id: Option<Uuid>,
    name: String,
    max_outstanding_jobs: i32,
    timeout_seconds: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DatabaseDefinitionRow {
    id: Uuid,
    name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DatabaseInstanceRow {
    id: Uuid,
    definition_id: Uuid,
    machine_id: Uuid,
    name: String,
    version: String,
}

/// Registry client backed by the shared Postgres registry database.
#[derive(Clone)]
pub struct PgJobRegistry {
    pool: PgPool,
}

impl PgJobRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobRegistry for PgJobRegistry {
    async fn load_cluster(
        &self,
        cluster_name: &str,
        with_layout: bool,
    ) -> Result<ClusterTopology> {
        let cluster = sqlx::query_as::<_, ClusterRow>("SELECT id, name FROM clusters WHERE name = $1")
            .bind(cluster_name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::Topology(format!("unknown cluster {cluster_name}")))?;

        let mut topology = ClusterTopology {
            cluster_id: cluster.id,
            cluster_name: cluster.name,
            ..ClusterTopology::default()
        };

        let machines = sqlx::query_as::<_, MachineRow>(
            "SELECT id, name, host_name FROM machines WHERE cluster_id = $1",
        )
        .bind(cluster.id)
        .fetch_all(&self.pool)
        .await?;

        for row in machines {
            topology.machines.insert(
                row.id,
                Machine {
                    id: row.id,
                    name: row.name,
                    host_name: row.host_name,
                },
            );
        }

        let queues = sqlx::query_as::<_, QueueRow>(
            "SELECT id, machine_id, name, max_outstanding_jobs, timeout_seconds \
             FROM queue_instances WHERE cluster_id = $1",
        )
        .bind(cluster.id)
        .fetch_all(&self.pool)
        .await?;

        for row in queues {
            topology.queues.insert(
                row.id,
                QueueDefinition {
                    id: row.id,
                    name: row.name,
                    machine_id: row.machine_id,
                    max_outstanding_jobs: row.max_outstanding_jobs.max(0) as usize,
                    timeout: Duration::from_secs(row.timeout_seconds.max(0) as u64),
                },
            );
        }

        if with_layout {
            let definitions = sqlx::query_as::<_, DatabaseDefinitionRow>(
                "SELECT id, name FROM database_definitions WHERE cluster_id = $1",
            )
            .bind(cluster.id)
            .fetch_all(&self.pool)
            .await?;

            for row in definitions {
                topology.database_definitions.insert(
                    row.id,
                    DatabaseDefinition {
                        id: row.id,
                        name: row.name,
                        instances_by_version: Default::default(),
                    },
                );
            }

            let instances = sqlx::query_as::<_, DatabaseInstanceRow>(
                "SELECT i.id, i.definition_id, i.machine_id, i.name, i.version \
                 FROM database_instances i \
                 JOIN database_definitions d ON d.id = i.definition_id \
                 WHERE d.cluster_id = $1",
            )
            .bind(cluster.id)
            .fetch_all(&self.pool)
            .await?;

            for row in instances {
                topology.add_database_instance(DatabaseInstance {
                    id: row.id,
                    definition_id: row.definition_id,
                    machine_id: row.machine_id,
                    name: row.name,
                    version: row.version,
                });
            }
        }

        Ok(topology)
    }

    async fn find_next_jobs(
        &self,
        queue_id: Uuid,
        last_user_id: Option<Uuid>,
        max_count: usize,
    ) -> Result<Vec<JobRecord>> {
        // Jobs of users other than the last-served one sort first; within
        // each group, oldest scheduled wins.
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_instances j \
             JOIN users u ON u.id = j.user_id \
             WHERE j.queue_id = $1 \
               AND j.state IN ('scheduled', 'persisted') \
               AND j.lock_owner IS NULL \
             ORDER BY ($2::uuid IS NOT NULL AND j.user_id = $2) ASC, \
                      j.scheduled_at ASC NULLS LAST \
             LIMIT $3"
        );

        let rows = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(queue_id)
            .bind(last_user_id)
            .bind(max_count as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM job_instances j \
             JOIN users u ON u.id = j.user_id WHERE TRUE"
        ));

        if !filter.queue_ids.is_empty() {
            builder.push(" AND j.queue_id = ANY(");
            builder.push_bind(filter.queue_ids.clone());
            builder.push(")");
        }

        if let Some(user_id) = filter.user_id {
            builder.push(" AND j.user_id = ");
            builder.push_bind(user_id);
        }

        if !filter.states.is_empty() {
            let states: Vec<String> = filter.states.iter().map(|s| s.to_string()).collect();
            builder.push(" AND j.state = ANY(");
            builder.push_bind(states);
            builder.push(")");
        }

        if let Some(flag) = filter.cancel_requested {
            builder.push(" AND j.cancel_requested = ");
            builder.push_bind(flag);
        }

        let rows = builder
            .build_query_as::<JobInstanceRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn mark_starting(&self, job_id: Uuid) -> Result<bool> {
        // Conditional write: exactly one scheduler instance wins this
        // transition, everyone else sees zero rows affected.
        let result = sqlx::query(
            "UPDATE job_instances SET state = 'starting' \
             WHERE id = $1 AND state IN ('scheduled', 'persisted')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_started(&self, job_id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE job_instances SET started_at = $2 WHERE id = $1")
            .bind(job_id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_state(
        &self,
        job_id: Uuid,
        state: JobExecutionState,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE job_instances SET state = $2, error_message = $3 WHERE id = $1")
            .bind(job_id)
            .bind(state.to_string())
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_finished(
        &self,
        job_id: Uuid,
        state: JobExecutionState,
        error_message: Option<&str>,
    ) -> Result<()> {
        // Terminal states clear the cancel flag; Persisted keeps it so a
        // pending cancel survives the persist/resume round trip.
        sqlx::query(
            "UPDATE job_instances \
             SET state = $2, error_message = $3, finished_at = $4, \
                 cancel_requested = cancel_requested AND NOT $5 \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(state.to_string())
        .bind(error_message)
        .bind(Utc::now())
        .bind(state.is_terminal())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn obtain_lock(&self, job_id: Uuid, owner: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_instances SET lock_owner = $2 \
             WHERE id = $1 AND (lock_owner IS NULL OR lock_owner = $2)",
        )
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::Registry(format!(
                "job {job_id} is locked by another scheduler instance"
            )));
        }
        Ok(())
    }

    async fn release_lock(&self, job_id: Uuid, force: bool) -> Result<()> {
        // Non-forced release relies on the caller only releasing locks it
        // obtained; forced release is the crash-recovery path.
        let _ = force;
        sqlx::query("UPDATE job_instances SET lock_owner = NULL WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule_if_recurring(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_instances \
                 (id, queue_id, user_id, name, external_id, workflow_type, state, \
                  cancel_requested, recurring, timeout_seconds, scheduled_at, \
                  domain_id, federation_id) \
             SELECT gen_random_uuid(), queue_id, user_id, name, external_id, \
                    workflow_type, 'scheduled', FALSE, recurring, timeout_seconds, \
                    $2, domain_id, federation_id \
             FROM job_instances WHERE id = $1 AND recurring",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
