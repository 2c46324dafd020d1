//! In-memory backend for testing and development.
//!
//! All tables live behind one `std::sync::Mutex`; no lock is held across an
//! await point. A [`MemoryWork`] writes through to the shared tables and keeps
//! an undo log, so rollback (explicit or on drop) removes exactly the rows it
//! added. Other units can see those rows before commit. That is weaker
//! isolation than Postgres, but mapping uniqueness and insert-only tallies
//! behave the same: a second insert for the same key returns `false`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    lease_expired_message, EntityStore, JobQueue, MappingStore, ProvenanceLog, UnitOfWork,
};
use crate::error::StoreError;
use crate::types::{
    Entity, EntityMapping, JobStatus, NewJob, NewMapping, NewProvenanceEvent, ProvenanceEvent,
    ResolutionJob, ResolutionTally, RESOLUTION_STAGE,
};

#[derive(Debug, Default)]
struct Tables {
    entities: Vec<Entity>,
    mappings: Vec<EntityMapping>,
    provenance: Vec<ProvenanceEvent>,
    jobs: Vec<ResolutionJob>,
}

/// Shared in-memory tables. Cloning shares the same tables, like cloning a
/// connection pool.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    /// Register an entity outside any job, as the external registration path
    /// does.
    pub fn register_entity(
        &self,
        entity_type: &str,
        display_name: &str,
        external_ids: BTreeMap<String, String>,
    ) -> Entity {
        let entity = Entity {
            id: Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            display_name: display_name.to_string(),
            external_ids,
        };
        self.tables().entities.push(entity.clone());
        entity
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.tables().entities.clone()
    }

    pub fn mappings(&self, dataset_id: Uuid) -> Vec<EntityMapping> {
        self.tables()
            .mappings
            .iter()
            .filter(|m| m.dataset_id == dataset_id)
            .cloned()
            .collect()
    }

    pub fn provenance_events(&self, job_id: Uuid) -> Vec<ProvenanceEvent> {
        self.tables()
            .provenance
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn jobs(&self) -> Vec<ResolutionJob> {
        self.tables().jobs.clone()
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    // A panic while holding the lock cannot leave a table half-written:
    // every mutation is a single push, remove or field assignment.
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl JobQueue for MemoryBackend {
    type Work = MemoryWork;

    async fn claim_next_job(&self) -> Result<Option<ResolutionJob>, StoreError> {
        let mut tables = self.tables();
        let next = tables
            .jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Queued)
            .min_by_key(|job| job.created_at);

        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn begin_work(&self) -> Result<MemoryWork, StoreError> {
        Ok(MemoryWork {
            tables: Arc::clone(&self.tables),
            undo: UndoLog::default(),
            finished: false,
        })
    }

    async fn fail_job(&self, job_id: Uuid, exc_info: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        let Some(job) = tables
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id && job.status == JobStatus::Running)
        else {
            return Ok(false);
        };
        job.status = JobStatus::Failed;
        job.ended_at = Some(Utc::now());
        job.exc_info = Some(exc_info.to_string());
        Ok(true)
    }

    async fn fail_stale_jobs(&self, older_than: Duration) -> Result<u64, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
        else {
            return Ok(0);
        };
        let message = lease_expired_message(older_than);

        let mut tables = self.tables();
        let mut failed = 0;
        for job in tables.jobs.iter_mut() {
            let stale = job.status == JobStatus::Running
                && job.started_at.is_some_and(|started| started <= cutoff);
            if stale {
                job.status = JobStatus::Failed;
                job.ended_at = Some(Utc::now());
                job.exc_info = Some(message.clone());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn enqueue_job(&self, job: &NewJob) -> Result<ResolutionJob, StoreError> {
        let job = ResolutionJob {
            id: Uuid::new_v4(),
            name: job.name.clone(),
            dataset_id: job.dataset_id,
            entity_type: job.entity_type.clone(),
            config_json: job.config_json.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result_summary: None,
            exc_info: None,
        };
        self.tables().jobs.push(job.clone());
        Ok(job)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<ResolutionJob>, StoreError> {
        Ok(self.tables().jobs.iter().find(|job| job.id == job_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryWork
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct UndoLog {
    entities: Vec<Uuid>,
    mappings: Vec<Uuid>,
    provenance: Vec<Uuid>,
}

/// One job's unit of work against [`MemoryBackend`]
#[derive(Debug)]
pub struct MemoryWork {
    tables: Arc<Mutex<Tables>>,
    undo: UndoLog,
    finished: bool,
}

impl MemoryWork {
    fn undo_all(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        let mut tables = lock(&self.tables);
        tables.entities.retain(|e| !undo.entities.contains(&e.id));
        tables.mappings.retain(|m| !undo.mappings.contains(&m.id));
        tables.provenance.retain(|p| !undo.provenance.contains(&p.id));
    }
}

impl Drop for MemoryWork {
    fn drop(&mut self) {
        // Dropping an unfinished unit rolls it back, like a dropped sqlx
        // transaction.
        if !self.finished {
            self.undo_all();
        }
    }
}

#[async_trait]
impl EntityStore for MemoryWork {
    async fn load_entities(&mut self, entity_type: &str) -> Result<Vec<Entity>, StoreError> {
        Ok(lock(&self.tables)
            .entities
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn create_entity(
        &mut self,
        entity_type: &str,
        display_name: &str,
        external_ids: &BTreeMap<String, String>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        lock(&self.tables).entities.push(Entity {
            id,
            entity_type: entity_type.to_string(),
            display_name: display_name.to_string(),
            external_ids: external_ids.clone(),
        });
        self.undo.entities.push(id);
        Ok(id)
    }
}

#[async_trait]
impl MappingStore for MemoryWork {
    async fn load_existing_mappings(
        &mut self,
        dataset_id: Uuid,
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        Ok(lock(&self.tables)
            .mappings
            .iter()
            .filter(|m| m.dataset_id == dataset_id)
            .map(|m| (m.source_record_id.clone(), m.entity_id))
            .collect())
    }

    async fn insert_mapping_if_absent(
        &mut self,
        mapping: &NewMapping,
    ) -> Result<bool, StoreError> {
        let id = Uuid::new_v4();
        {
            let mut tables = lock(&self.tables);
            let exists = tables.mappings.iter().any(|m| {
                m.dataset_id == mapping.dataset_id
                    && m.source_record_id == mapping.source_record_id
            });
            if exists {
                return Ok(false);
            }
            tables.mappings.push(EntityMapping {
                id,
                dataset_id: mapping.dataset_id,
                entity_id: mapping.entity_id,
                source_record_id: mapping.source_record_id.clone(),
                source_keys: mapping.source_keys.clone(),
                method: mapping.method,
                score: mapping.score,
                created_at: Utc::now(),
            });
        }
        self.undo.mappings.push(id);
        Ok(true)
    }
}

#[async_trait]
impl ProvenanceLog for MemoryWork {
    async fn append_provenance(&mut self, event: &NewProvenanceEvent) -> Result<(), StoreError> {
        let id = Uuid::new_v4();
        let detail = serde_json::to_value(&event.detail)?;
        lock(&self.tables).provenance.push(ProvenanceEvent {
            id,
            job_id: event.job_id,
            dataset_id: event.dataset_id,
            stage: RESOLUTION_STAGE.to_string(),
            detail,
            created_at: Utc::now(),
        });
        self.undo.provenance.push(id);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryWork {
    async fn complete_job(
        mut self,
        job_id: Uuid,
        summary: &ResolutionTally,
    ) -> Result<(), StoreError> {
        {
            let mut tables = lock(&self.tables);
            let job = tables
                .jobs
                .iter_mut()
                .find(|job| job.id == job_id)
                .ok_or(StoreError::UnknownJob(job_id))?;

            if job.status != JobStatus::Running {
                return Err(StoreError::UnexpectedJobStatus {
                    job_id,
                    expected: JobStatus::Running.as_str(),
                    actual: job.status.to_string(),
                });
            }
            job.status = JobStatus::Completed;
            job.ended_at = Some(Utc::now());
            job.result_summary = Some(summary.to_json());
        }
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}
