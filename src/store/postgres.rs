//! PostgreSQL backend
//!
//! All queries use runtime-checked `sqlx::query()` because the tables are
//! created by migrations that may not exist at compile time.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    lease_expired_message, EntityStore, JobQueue, MappingStore, ProvenanceLog, UnitOfWork,
};
use crate::error::StoreError;
use crate::types::{
    Entity, JobStatus, NewJob, NewMapping, NewProvenanceEvent, ResolutionJob, ResolutionTally,
    RESOLUTION_STAGE,
};

const JOB_COLUMNS: &str = "id, name, dataset_id, entity_type, config_json, status, created_at, \
                           started_at, ended_at, result_summary, exc_info";

/// Job queue and stores over a connection pool
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Resolution schema migrations applied");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<ResolutionJob, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status).ok_or(StoreError::InvalidColumn {
        column: "status",
        value: status.clone(),
    })?;

    Ok(ResolutionJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        dataset_id: row.try_get("dataset_id")?,
        entity_type: row.try_get("entity_type")?,
        config_json: row.try_get("config_json")?,
        status,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        result_summary: row.try_get("result_summary")?,
        exc_info: row.try_get("exc_info")?,
    })
}

/// `external_ids` is JSONB, but older writers stored serialized text. Anything
/// that is not an object of scalars becomes an empty map.
fn parse_external_ids(value: Option<serde_json::Value>) -> BTreeMap<String, String> {
    let value = match value {
        Some(serde_json::Value::String(text)) => {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::Null)
        }
        Some(value) => value,
        None => return BTreeMap::new(),
    };

    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                serde_json::Value::Number(n) => Some((k, n.to_string())),
                serde_json::Value::Bool(b) => Some((k, b.to_string())),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[async_trait]
impl JobQueue for PgBackend {
    type Work = PgWork;

    async fn claim_next_job(&self) -> Result<Option<ResolutionJob>, StoreError> {
        // Atomic claim with CTE form; rows locked by other claimants are skipped
        let row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM resolution_jobs
                WHERE status = 'queued'
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE resolution_jobs j
            SET status = 'running', started_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING {}
            "#,
            qualified_job_columns("j")
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn begin_work(&self) -> Result<PgWork, StoreError> {
        Ok(PgWork {
            tx: self.pool.begin().await?,
        })
    }

    async fn fail_job(&self, job_id: Uuid, exc_info: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resolution_jobs
            SET status = 'failed', ended_at = now(), exc_info = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(exc_info)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_stale_jobs(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resolution_jobs
            SET status = 'failed', ended_at = now(), exc_info = $2
            WHERE status = 'running'
              AND started_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(lease_expired_message(older_than))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn enqueue_job(&self, job: &NewJob) -> Result<ResolutionJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO resolution_jobs (id, name, dataset_id, entity_type, config_json, status)
            VALUES ($1, $2, $3, $4, $5, 'queued')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&job.name)
        .bind(job.dataset_id)
        .bind(&job.entity_type)
        .bind(&job.config_json)
        .fetch_one(&self.pool)
        .await?;

        job_from_row(&row)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<ResolutionJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM resolution_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }
}

fn qualified_job_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One job's transaction. Dropping it without completing rolls back.
pub struct PgWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EntityStore for PgWork {
    async fn load_entities(&mut self, entity_type: &str) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, display_name, external_ids
            FROM entities
            WHERE entity_type = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(entity_type)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| -> Result<Entity, StoreError> {
                Ok(Entity {
                    id: row.try_get("id")?,
                    entity_type: row.try_get("entity_type")?,
                    display_name: row.try_get("display_name")?,
                    external_ids: parse_external_ids(row.try_get("external_ids")?),
                })
            })
            .collect()
    }

    async fn create_entity(
        &mut self,
        entity_type: &str,
        display_name: &str,
        external_ids: &BTreeMap<String, String>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO entities (id, entity_type, display_name, external_ids)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(entity_type)
        .bind(display_name)
        .bind(serde_json::to_value(external_ids)?)
        .execute(&mut *self.tx)
        .await?;

        debug!(entity_id = %id, entity_type, display_name, "Created entity");
        Ok(id)
    }
}

#[async_trait]
impl MappingStore for PgWork {
    async fn load_existing_mappings(
        &mut self,
        dataset_id: Uuid,
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_record_id, entity_id
            FROM entity_map
            WHERE dataset_id = $1 AND source_record_id IS NOT NULL
            "#,
        )
        .bind(dataset_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| -> Result<(String, Uuid), StoreError> {
                Ok((row.try_get("source_record_id")?, row.try_get("entity_id")?))
            })
            .collect()
    }

    async fn insert_mapping_if_absent(
        &mut self,
        mapping: &NewMapping,
    ) -> Result<bool, StoreError> {
        // Single conditional insert; the unique index covers concurrent writers
        // that pass the NOT EXISTS check at the same time.
        let result = sqlx::query(
            r#"
            INSERT INTO entity_map
                (id, dataset_id, entity_id, source_record_id, source_keys, method, score)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE NOT EXISTS (
                SELECT 1 FROM entity_map
                WHERE dataset_id = $2 AND source_record_id = $4
            )
            ON CONFLICT (dataset_id, source_record_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mapping.dataset_id)
        .bind(mapping.entity_id)
        .bind(&mapping.source_record_id)
        // Keyless records store SQL NULL, not a JSON null
        .bind(Some(&mapping.source_keys).filter(|keys| !keys.is_null()))
        .bind(mapping.method.as_str())
        .bind(mapping.score)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ProvenanceLog for PgWork {
    async fn append_provenance(&mut self, event: &NewProvenanceEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO provenance_event (id, job_id, dataset_id, stage, detail)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.job_id)
        .bind(event.dataset_id)
        .bind(RESOLUTION_STAGE)
        .bind(serde_json::to_value(&event.detail)?)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for PgWork {
    async fn complete_job(
        self,
        job_id: Uuid,
        summary: &ResolutionTally,
    ) -> Result<(), StoreError> {
        let mut tx = self.tx;
        let result = sqlx::query(
            r#"
            UPDATE resolution_jobs
            SET status = 'completed', ended_at = now(), result_summary = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(summary.to_json())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Swept as stale or never claimed; the transaction rolls back on drop
            let actual: Option<String> =
                sqlx::query_scalar("SELECT status FROM resolution_jobs WHERE id = $1")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match actual {
                Some(actual) => StoreError::UnexpectedJobStatus {
                    job_id,
                    expected: JobStatus::Running.as_str(),
                    actual,
                },
                None => StoreError::UnknownJob(job_id),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
