//! Resolution engine
//!
//! Resolves every record of a job against the canonical entities of the job's
//! type, in list order, first success wins:
//!
//! 1. skip records already mapped for the dataset
//! 2. exact match on normalized join-key values
//! 3. semantic match on embedded text, accepted at `score >= threshold`
//! 4. create a new entity when enabled
//! 5. otherwise unmatched
//!
//! Entities created during a job join the job-local [`WorkingSet`], so later
//! duplicates in the same batch consolidate onto them.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{config_hash, ResolutionConfig, SourceRecord};
use crate::embedding::{dot, SharedEmbedder};
use crate::error::{EmbeddingError, ResolutionError};
use crate::normalize::{
    entity_key_values, key_text, record_key_values, scalar_external_ids, semantic_text,
};
use crate::store::ResolutionStore;
use crate::types::{
    Entity, MatchMethod, NewMapping, NewProvenanceEvent, ResolutionJob, ResolutionProvenance,
    ResolutionTally,
};

/// Score of exact and created matches.
const CERTAIN_SCORE: f64 = 1.0;

/// Outcome of matching one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordMatch {
    pub entity_id: Uuid,
    pub method: MatchMethod,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Working set
// ---------------------------------------------------------------------------

/// A candidate entity with its precomputed lexical keys and cached embedding.
#[derive(Debug, Clone)]
struct Candidate {
    entity: Entity,
    keys: HashSet<String>,
    vector: Option<Vec<f32>>,
}

impl Candidate {
    fn new(entity: Entity) -> Self {
        let keys = entity_key_values(&entity);
        Self {
            entity,
            keys,
            vector: None,
        }
    }

    fn embeddable(&self) -> bool {
        !self.entity.display_name.trim().is_empty()
    }
}

/// Candidate entities of one job execution, in iteration order. Never shared
/// across jobs.
#[derive(Debug, Default)]
pub struct WorkingSet {
    candidates: Vec<Candidate>,
}

impl WorkingSet {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            candidates: entities.into_iter().map(Candidate::new).collect(),
        }
    }

    pub fn push(&mut self, entity: Entity) {
        self.candidates.push(Candidate::new(entity));
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Whether any candidate has, or can get, a vector to compare against.
    fn has_semantic_candidates(&self) -> bool {
        self.candidates
            .iter()
            .any(|c| c.vector.is_some() || c.embeddable())
    }

    /// First candidate whose key set intersects `values`.
    fn exact_match(&self, values: &HashSet<String>) -> Option<Uuid> {
        if values.is_empty() {
            return None;
        }
        self.candidates
            .iter()
            .find(|c| !c.keys.is_disjoint(values))
            .map(|c| c.entity.id)
    }

    /// Embed `query` together with every embeddable candidate that has no
    /// cached vector yet, in one batch call. Returns the query vector.
    async fn embed_with_pending(
        &mut self,
        embedder: &SharedEmbedder,
        query: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let pending: Vec<usize> = self
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.vector.is_none() && c.embeddable())
            .map(|(i, _)| i)
            .collect();

        let mut texts = Vec::with_capacity(pending.len() + 1);
        texts.push(query.to_string());
        texts.extend(
            pending
                .iter()
                .map(|&i| self.candidates[i].entity.display_name.clone()),
        );

        let matrix = embedder.embed(&texts).await?;
        if matrix.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: matrix.len(),
            });
        }

        let mut rows = matrix.into_rows().into_iter();
        let query_vector = rows.next().unwrap_or_default();
        for (&i, row) in pending.iter().zip(rows) {
            self.candidates[i].vector = Some(row);
        }
        Ok(query_vector)
    }

    /// Highest scoring candidate for `query`, first wins on ties.
    fn best_semantic(&self, query: &[f32]) -> Option<(Uuid, f64)> {
        let mut best: Option<(Uuid, f64)> = None;
        for candidate in &self.candidates {
            let Some(vector) = &candidate.vector else {
                continue;
            };
            let score = dot(query, vector);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate.entity.id, score));
            }
        }
        best
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Three-tier resolver over an injected embedding client
#[derive(Clone)]
pub struct ResolutionEngine {
    embedder: SharedEmbedder,
}

impl ResolutionEngine {
    pub fn new(embedder: SharedEmbedder) -> Self {
        Self { embedder }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Resolve every record of `job` through `store` and append one
    /// provenance event. Returns the per-method tally.
    pub async fn run<S: ResolutionStore>(
        &self,
        store: &mut S,
        job: &ResolutionJob,
    ) -> Result<ResolutionTally, ResolutionError> {
        let config = ResolutionConfig::from_job_json(&job.config_json)?;
        if config.records.is_empty() {
            debug!(job_id = %job.id, "Job has no records");
            return Ok(ResolutionTally::default());
        }

        let entities = store.load_entities(&job.entity_type).await?;
        let mut existing = store.load_existing_mappings(job.dataset_id).await?;
        let mut working_set = WorkingSet::new(entities);

        info!(
            job_id = %job.id,
            records = config.records.len(),
            candidates = working_set.len(),
            already_mapped = existing.len(),
            "Resolving job"
        );

        let mut tally = ResolutionTally::default();
        for record in &config.records {
            if existing.contains_key(&record.source_record_id) {
                continue;
            }

            let Some(found) = self
                .match_record(store, job, &config, &mut working_set, record)
                .await?
            else {
                debug!(source_record_id = %record.source_record_id, "Record unmatched");
                tally.record_unmatched();
                continue;
            };

            let inserted = store
                .insert_mapping_if_absent(&NewMapping {
                    dataset_id: job.dataset_id,
                    entity_id: found.entity_id,
                    source_record_id: record.source_record_id.clone(),
                    source_keys: source_keys(record),
                    method: found.method,
                    score: Some(found.score),
                })
                .await?;

            existing.insert(record.source_record_id.clone(), found.entity_id);
            if inserted {
                tally.record(found.method);
            } else {
                debug!(
                    source_record_id = %record.source_record_id,
                    "Mapping already written by a concurrent job"
                );
            }
        }

        store
            .append_provenance(&NewProvenanceEvent {
                job_id: job.id,
                dataset_id: job.dataset_id,
                detail: ResolutionProvenance {
                    config_hash: config_hash(&job.config_json)?,
                    model: self.embedder.model_name().to_string(),
                    tally,
                },
            })
            .await?;

        info!(
            job_id = %job.id,
            exact = tally.exact,
            semantic = tally.semantic,
            created = tally.created,
            unmatched = tally.unmatched,
            "Resolution finished"
        );
        Ok(tally)
    }

    async fn match_record<S: ResolutionStore>(
        &self,
        store: &mut S,
        job: &ResolutionJob,
        config: &ResolutionConfig,
        working_set: &mut WorkingSet,
        record: &SourceRecord,
    ) -> Result<Option<RecordMatch>, ResolutionError> {
        if !config.join_keys.is_empty() {
            let values = record_key_values(&record.keys, &config.join_keys);
            if let Some(entity_id) = working_set.exact_match(&values) {
                debug!(source_record_id = %record.source_record_id, %entity_id, "Exact match");
                return Ok(Some(RecordMatch {
                    entity_id,
                    method: MatchMethod::Exact,
                    score: CERTAIN_SCORE,
                }));
            }
        }

        if !config.semantic_fields.is_empty() && working_set.has_semantic_candidates() {
            let query = semantic_text(&record.keys, &config.semantic_fields);
            if !query.is_empty() {
                let query_vector = working_set
                    .embed_with_pending(&self.embedder, &query)
                    .await?;
                match working_set.best_semantic(&query_vector) {
                    Some((entity_id, score)) if score >= config.threshold => {
                        debug!(
                            source_record_id = %record.source_record_id,
                            %entity_id,
                            score,
                            "Semantic match"
                        );
                        return Ok(Some(RecordMatch {
                            entity_id,
                            method: MatchMethod::Semantic,
                            score,
                        }));
                    }
                    Some((_, score)) => {
                        debug!(
                            source_record_id = %record.source_record_id,
                            best_score = score,
                            threshold = config.threshold,
                            "Best semantic candidate below threshold"
                        );
                    }
                    None => {}
                }
            }
        }

        if config.create_if_no_match {
            let display_name = created_display_name(record);
            let external_ids = scalar_external_ids(&record.keys);
            let entity_id = store
                .create_entity(&job.entity_type, &display_name, &external_ids)
                .await?;
            working_set.push(Entity {
                id: entity_id,
                entity_type: job.entity_type.clone(),
                display_name,
                external_ids,
            });
            return Ok(Some(RecordMatch {
                entity_id,
                method: MatchMethod::Created,
                score: CERTAIN_SCORE,
            }));
        }

        Ok(None)
    }
}

/// `keys.name`, else `keys.display_name`, else the record id.
fn created_display_name(record: &SourceRecord) -> String {
    ["name", "display_name"]
        .iter()
        .filter_map(|field| record.keys.get(*field))
        .filter_map(key_text)
        .find(|text| !text.trim().is_empty())
        .unwrap_or_else(|| record.source_record_id.clone())
}

fn source_keys(record: &SourceRecord) -> Value {
    if record.keys.is_empty() {
        Value::Null
    } else {
        Value::Object(record.keys.clone())
    }
}
