//! Core types for entity resolution.
//!
//! Typed structs with `Serialize`/`Deserialize` everywhere; JSON only appears
//! where the persisted contract is JSON (`config_json`, `source_keys`,
//! provenance `detail`).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provenance stage written by this subsystem.
pub const RESOLUTION_STAGE: &str = "resolution";

// ─── Entities ────────────────────────────────────────────────────────────────

/// A canonical, deduplicated real-world thing that source records map to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub entity_type: String,
    pub display_name: String,
    /// Identifier scheme → identifier value (e.g. `"wikidata" → "Q7259"`).
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

// ─── Mappings ────────────────────────────────────────────────────────────────

/// How a source record was matched to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Exact,
    Semantic,
    Created,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic => "semantic",
            Self::Created => "created",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mapping about to be written through the insert-only path.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMapping {
    pub dataset_id: Uuid,
    pub entity_id: Uuid,
    pub source_record_id: String,
    /// The record's `keys` object, or `Null` when the record had none.
    pub source_keys: serde_json::Value,
    pub method: MatchMethod,
    pub score: Option<f64>,
}

/// A persisted (dataset, source record) → entity association. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub entity_id: Uuid,
    pub source_record_id: String,
    pub source_keys: serde_json::Value,
    pub method: MatchMethod,
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

/// Lifecycle of a resolution job: `queued → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the shared resolution job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionJob {
    pub id: Uuid,
    pub name: String,
    pub dataset_id: Uuid,
    pub entity_type: String,
    /// Raw job configuration; parsed by [`crate::config::ResolutionConfig`].
    pub config_json: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result_summary: Option<serde_json::Value>,
    pub exc_info: Option<String>,
}

/// Fields supplied by whoever submits a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub dataset_id: Uuid,
    pub entity_type: String,
    pub config_json: serde_json::Value,
}

// ─── Tallies and provenance ─────────────────────────────────────────────────

/// Per-method outcome counts for one job; also the job's `result_summary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionTally {
    pub exact: u64,
    pub semantic: u64,
    pub created: u64,
    pub unmatched: u64,
}

impl ResolutionTally {
    pub fn record(&mut self, method: MatchMethod) {
        match method {
            MatchMethod::Exact => self.exact += 1,
            MatchMethod::Semantic => self.semantic += 1,
            MatchMethod::Created => self.created += 1,
        }
    }

    pub fn record_unmatched(&mut self) {
        self.unmatched += 1;
    }

    pub fn total(&self) -> u64 {
        self.exact + self.semantic + self.created + self.unmatched
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "exact": self.exact,
            "semantic": self.semantic,
            "created": self.created,
            "unmatched": self.unmatched,
        })
    }
}

/// `detail` payload of a resolution provenance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionProvenance {
    pub config_hash: String,
    pub model: String,
    #[serde(flatten)]
    pub tally: ResolutionTally,
}

/// Provenance event about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProvenanceEvent {
    pub job_id: Uuid,
    pub dataset_id: Uuid,
    pub detail: ResolutionProvenance,
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub dataset_id: Uuid,
    pub stage: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
