//! Shared fixtures for resolution integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use entity_resolver::{
    Embedder, EmbeddingError, EmbeddingMatrix, JobQueue, MemoryBackend, NewJob, ResolutionEngine,
    ResolutionJob, ResolutionTally, UnitOfWork,
};

/// Vector dimension of the stub embedder.
pub const DIM: usize = 64;

/// First slot used for texts without an explicit vector. Explicit vectors
/// must stay below it so the two never overlap.
const FIRST_FREE_SLOT: usize = 16;

pub const STUB_MODEL: &str = "stub-embedder";

/// Deterministic embedder.
///
/// Texts registered with [`StubEmbedder::with_vector`] get that vector, padded
/// to [`DIM`]. Any other text gets a one-hot vector of its own, so distinct
/// unregistered texts score 0 against each other and identical texts score 1.
#[derive(Default)]
pub struct StubEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fail_on: Vec<String>,
    slots: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `vector` must already be unit length.
    pub fn with_vector(mut self, text: &str, vector: &[f32]) -> Self {
        assert!(vector.len() <= FIRST_FREE_SLOT);
        let mut padded = vector.to_vec();
        padded.resize(DIM, 0.0);
        self.vectors.insert(text.to_string(), padded);
        self
    }

    /// Fail every batch that contains `text`.
    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on.push(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    fn one_hot(&self, text: &str) -> Vec<f32> {
        let mut slots = self.slots.lock().unwrap();
        let next = FIRST_FREE_SLOT + slots.len();
        let slot = *slots.entry(text.to_string()).or_insert(next);
        assert!(slot < DIM, "stub embedder ran out of one-hot slots");
        let mut v = vec![0.0; DIM];
        v[slot] = 1.0;
        v
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingMatrix, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(texts.to_vec());

        if texts.iter().any(|t| self.fail_on.contains(t)) {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: 0,
            });
        }
        if texts.is_empty() {
            return Ok(EmbeddingMatrix::empty());
        }

        let rows = texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| self.one_hot(t))
            })
            .collect();
        EmbeddingMatrix::from_rows(rows)
    }

    fn model_name(&self) -> &str {
        STUB_MODEL
    }
}

pub fn engine(embedder: Arc<StubEmbedder>) -> ResolutionEngine {
    ResolutionEngine::new(embedder)
}

pub fn new_job(dataset_id: Uuid, config_json: Value) -> NewJob {
    NewJob {
        name: "resolve people".to_string(),
        dataset_id,
        entity_type: "person".to_string(),
        config_json,
    }
}

/// Enqueue, claim and resolve one job, committing on success.
pub async fn run_job(
    backend: &MemoryBackend,
    engine: &ResolutionEngine,
    dataset_id: Uuid,
    config_json: Value,
) -> (ResolutionJob, ResolutionTally) {
    let queued = backend
        .enqueue_job(&new_job(dataset_id, config_json))
        .await
        .unwrap();
    let job = backend.claim_next_job().await.unwrap().unwrap();
    assert_eq!(job.id, queued.id);

    let mut work = backend.begin_work().await.unwrap();
    let tally = engine.run(&mut work, &job).await.unwrap();
    work.complete_job(job.id, &tally).await.unwrap();
    (job, tally)
}

pub fn tally(exact: u64, semantic: u64, created: u64, unmatched: u64) -> ResolutionTally {
    ResolutionTally {
        exact,
        semantic,
        created,
        unmatched,
    }
}
