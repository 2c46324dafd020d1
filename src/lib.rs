//! Batch Entity Resolution
//!
//! Maps dataset records onto canonical entities with a three-tier strategy
//! and an idempotent, insert-only mapping table.
//!
//! # Architecture
//!
//! ```text
//! resolution_jobs (queued)
//!       │  claim: FOR UPDATE SKIP LOCKED
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  ResolutionWorker                       │
//! │  one job per poll, own unit of work     │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  ResolutionEngine (per record)          │
//! │  mapped? → exact → semantic → create    │
//! └─────────────────────────────────────────┘
//!       │
//!       ├─── entity_map (insert-only)
//!       ├─── entities (created on no match)
//!       └─── provenance_event (one per job)
//! ```
//!
//! Completed jobs commit all writes together with their status; failed jobs
//! roll back and are then marked `failed` with the error text.

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
#[cfg(feature = "worker")]
pub mod health;
pub mod normalize;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{ResolutionConfig, SourceRecord, WorkerConfig};
pub use embedding::{Embedder, EmbeddingConfig, EmbeddingMatrix, HttpEmbedder, SharedEmbedder};
pub use engine::ResolutionEngine;
pub use error::{ConfigError, EmbeddingError, ResolutionError, StoreError};
pub use store::{
    EntityStore, JobQueue, MappingStore, MemoryBackend, ProvenanceLog, ResolutionStore,
    UnitOfWork,
};
#[cfg(feature = "database")]
pub use store::PgBackend;
pub use types::{
    Entity, EntityMapping, JobStatus, MatchMethod, NewJob, NewMapping, ProvenanceEvent,
    ResolutionJob, ResolutionTally,
};
pub use worker::{PollOutcome, ResolutionWorker};
