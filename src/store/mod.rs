//! Persistence ports for entity resolution.
//!
//! The engine operates exclusively through these traits, enabling pluggable
//! backends ([`memory::MemoryBackend`] for tests and dry runs, Postgres for
//! production).
//!
//! Two scopes exist:
//!
//! - [`JobQueue`] is shared by the worker loop and issues autocommitted
//!   statements: claiming, failing and sweeping jobs.
//! - [`UnitOfWork`] is one job's transaction. All entity, mapping and
//!   provenance writes of a job go through it and commit together with the
//!   job's `completed` status, or are discarded by [`UnitOfWork::rollback`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{Entity, NewJob, NewMapping, NewProvenanceEvent, ResolutionJob, ResolutionTally};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryBackend;
#[cfg(feature = "database")]
pub use postgres::PgBackend;

/// Reads and writes canonical entities
#[async_trait]
pub trait EntityStore: Send {
    /// All entities of one type, in creation order.
    async fn load_entities(&mut self, entity_type: &str) -> Result<Vec<Entity>, StoreError>;

    /// Create an entity and return its id. No uniqueness is enforced here.
    async fn create_entity(
        &mut self,
        entity_type: &str,
        display_name: &str,
        external_ids: &BTreeMap<String, String>,
    ) -> Result<Uuid, StoreError>;
}

/// Insert-only persistence of (dataset, source record) → entity
#[async_trait]
pub trait MappingStore: Send {
    /// `source_record_id → entity_id` for every mapped record of a dataset.
    async fn load_existing_mappings(
        &mut self,
        dataset_id: Uuid,
    ) -> Result<HashMap<String, Uuid>, StoreError>;

    /// Insert the mapping unless one already exists for
    /// `(dataset_id, source_record_id)`. Returns whether a row was inserted.
    async fn insert_mapping_if_absent(&mut self, mapping: &NewMapping)
        -> Result<bool, StoreError>;
}

/// Append-only audit events
#[async_trait]
pub trait ProvenanceLog: Send {
    async fn append_provenance(&mut self, event: &NewProvenanceEvent) -> Result<(), StoreError>;
}

/// Everything the resolution engine needs from one transaction
pub trait ResolutionStore: EntityStore + MappingStore + ProvenanceLog {}

impl<T> ResolutionStore for T where T: EntityStore + MappingStore + ProvenanceLog {}

/// One job's transaction
#[async_trait]
pub trait UnitOfWork: ResolutionStore + Sized {
    /// Transition `job_id` from running to completed with its tally as the
    /// result summary, then commit every write of this unit.
    async fn complete_job(self, job_id: Uuid, summary: &ResolutionTally)
        -> Result<(), StoreError>;

    /// Discard every write of this unit.
    async fn rollback(self) -> Result<(), StoreError>;
}

/// The shared job table
#[async_trait]
pub trait JobQueue: Send + Sync {
    type Work: UnitOfWork;

    /// Atomically move the oldest unlocked queued job to running and return
    /// it. Concurrent claimants never receive the same job.
    async fn claim_next_job(&self) -> Result<Option<ResolutionJob>, StoreError>;

    /// Open the transaction a claimed job's resolution work runs in.
    async fn begin_work(&self) -> Result<Self::Work, StoreError>;

    /// Transition a running job to failed. Returns `false` when the job was
    /// no longer running.
    async fn fail_job(&self, job_id: Uuid, exc_info: &str) -> Result<bool, StoreError>;

    /// Fail running jobs whose claim is older than `older_than`. Returns how
    /// many were failed.
    async fn fail_stale_jobs(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Insert a queued job.
    async fn enqueue_job(&self, job: &NewJob) -> Result<ResolutionJob, StoreError>;

    /// Load one job by id.
    async fn job(&self, job_id: Uuid) -> Result<Option<ResolutionJob>, StoreError>;
}

/// `exc_info` written for jobs failed by the stale-job sweep.
pub fn lease_expired_message(older_than: Duration) -> String {
    format!("job lease expired after {}s", older_than.as_secs())
}
