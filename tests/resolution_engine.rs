//! Resolution engine behaviour against the in-memory backend

mod helpers;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use entity_resolver::config::config_hash;
use entity_resolver::store::memory::MemoryWork;
use entity_resolver::types::NewProvenanceEvent;
use entity_resolver::{
    Entity, EntityStore, JobQueue, MappingStore, MatchMethod, MemoryBackend, NewMapping,
    ProvenanceLog, StoreError,
};

use helpers::{engine, run_job, tally, StubEmbedder, STUB_MODEL};

const SQRT_3_OVER_2: f32 = 0.866_025_4;

#[tokio::test]
async fn test_exact_match_is_case_and_whitespace_insensitive() {
    let backend = MemoryBackend::new();
    let ada = backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let embedder = Arc::new(StubEmbedder::new());
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(embedder.clone()),
        dataset,
        json!({
            "records": [{"source_record_id": "r1", "keys": {"name": "  ada lovelace "}}],
            "joinKeys": ["name"],
        }),
    )
    .await;

    assert_eq!(result, tally(1, 0, 0, 0));
    let mappings = backend.mappings(dataset);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].entity_id, ada.id);
    assert_eq!(mappings[0].method, MatchMethod::Exact);
    assert_eq!(mappings[0].score, Some(1.0));
    // Exact matches never reach the embedder
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_exact_match_on_external_identifier() {
    let backend = MemoryBackend::new();
    let ada = backend.register_entity(
        "person",
        "Augusta Ada King",
        [("wikidata".to_string(), "Q7259".to_string())].into(),
    );
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(Arc::new(StubEmbedder::new())),
        dataset,
        json!({
            "records": [{"source_record_id": "r1", "keys": {"qid": "q7259"}}],
            "joinKeys": ["qid"],
            "semanticFields": [],
        }),
    )
    .await;

    assert_eq!(result, tally(1, 0, 0, 0));
    assert_eq!(backend.mappings(dataset)[0].entity_id, ada.id);
}

#[tokio::test]
async fn test_entities_of_other_types_are_not_candidates() {
    let backend = MemoryBackend::new();
    backend.register_entity("organization", "Ada Lovelace", BTreeMap::new());
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(Arc::new(StubEmbedder::new())),
        dataset,
        json!({
            "records": [{"source_record_id": "r1", "keys": {"name": "Ada Lovelace"}}],
            "joinKeys": ["name"],
            "semanticFields": [],
        }),
    )
    .await;

    assert_eq!(result, tally(0, 0, 0, 1));
    assert!(backend.mappings(dataset).is_empty());
}

#[tokio::test]
async fn test_semantic_score_equal_to_threshold_is_accepted() {
    let backend = MemoryBackend::new();
    let ada = backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let embedder = Arc::new(
        StubEmbedder::new()
            .with_vector("Ada Lovelace", &[1.0, 0.0])
            .with_vector("The Countess", &[0.5, SQRT_3_OVER_2]),
    );
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(embedder),
        dataset,
        json!({
            "records": [{"source_record_id": "r1", "keys": {"name": "The Countess"}}],
            "threshold": 0.5,
        }),
    )
    .await;

    assert_eq!(result, tally(0, 1, 0, 0));
    let mapping = &backend.mappings(dataset)[0];
    assert_eq!(mapping.entity_id, ada.id);
    assert_eq!(mapping.method, MatchMethod::Semantic);
    assert_eq!(mapping.score, Some(0.5));
}

#[tokio::test]
async fn test_semantic_score_below_threshold_is_unmatched() {
    let backend = MemoryBackend::new();
    backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let embedder = Arc::new(
        StubEmbedder::new()
            .with_vector("Ada Lovelace", &[1.0, 0.0])
            .with_vector("The Countess", &[0.5, SQRT_3_OVER_2]),
    );
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(embedder),
        dataset,
        json!({
            "records": [{"source_record_id": "r1", "keys": {"name": "The Countess"}}],
            "threshold": 0.500_001,
        }),
    )
    .await;

    assert_eq!(result, tally(0, 0, 0, 1));
    assert!(backend.mappings(dataset).is_empty());
}

#[tokio::test]
async fn test_blank_semantic_text_skips_embedding() {
    let backend = MemoryBackend::new();
    backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let embedder = Arc::new(StubEmbedder::new());

    let (_, result) = run_job(
        &backend,
        &engine(embedder.clone()),
        Uuid::new_v4(),
        json!({"records": [{"source_record_id": "r1", "keys": {"name": "   "}}]}),
    )
    .await;

    assert_eq!(result, tally(0, 0, 0, 1));
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_no_embeddable_candidate_skips_embedding() {
    let backend = MemoryBackend::new();
    backend.register_entity("person", "   ", BTreeMap::new());
    let embedder = Arc::new(StubEmbedder::new().failing_on("Grace Hopper"));
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(embedder.clone()),
        dataset,
        json!({"records": [{"source_record_id": "r1", "keys": {"name": "Grace Hopper"}}]}),
    )
    .await;

    assert_eq!(result, tally(0, 0, 0, 1));
    assert_eq!(embedder.calls(), 0);
    assert!(backend.mappings(dataset).is_empty());
}

#[tokio::test]
async fn test_candidate_vectors_are_embedded_once_per_job() {
    let backend = MemoryBackend::new();
    backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    backend.register_entity("person", "", BTreeMap::new());
    let embedder = Arc::new(StubEmbedder::new());

    run_job(
        &backend,
        &engine(embedder.clone()),
        Uuid::new_v4(),
        json!({
            "records": [
                {"source_record_id": "r1", "keys": {"name": "Someone"}},
                {"source_record_id": "r2", "keys": {"name": "Someone Else"}},
            ],
        }),
    )
    .await;

    let batches = embedder.batches();
    assert_eq!(batches.len(), 2);
    // Query first, then the non-empty candidate names
    assert_eq!(batches[0], vec!["Someone".to_string(), "Ada Lovelace".to_string()]);
    assert_eq!(batches[1], vec!["Someone Else".to_string()]);
}

#[tokio::test]
async fn test_within_batch_duplicates_consolidate_semantically() {
    let backend = MemoryBackend::new();
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(Arc::new(StubEmbedder::new())),
        dataset,
        json!({
            "records": [
                {"source_record_id": "r1", "keys": {"name": "Grace Hopper"}},
                {"source_record_id": "r2", "keys": {"name": "Grace Hopper"}},
            ],
            "createIfNoMatch": true,
        }),
    )
    .await;

    assert_eq!(result, tally(0, 1, 1, 0));
    let entities = backend.entities();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].display_name, "Grace Hopper");

    let mappings = backend.mappings(dataset);
    assert_eq!(mappings.len(), 2);
    assert!(mappings.iter().all(|m| m.entity_id == entities[0].id));
}

#[tokio::test]
async fn test_within_batch_duplicates_consolidate_exactly() {
    let backend = MemoryBackend::new();
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(Arc::new(StubEmbedder::new())),
        dataset,
        json!({
            "records": [
                {"source_record_id": "r1", "keys": {"name": "Grace Hopper"}},
                {"source_record_id": "r2", "keys": {"name": "grace hopper"}},
            ],
            "joinKeys": ["name"],
            "createIfNoMatch": true,
        }),
    )
    .await;

    assert_eq!(result, tally(1, 0, 1, 0));
    assert_eq!(backend.entities().len(), 1);
}

#[tokio::test]
async fn test_created_entity_carries_record_keys() {
    let backend = MemoryBackend::new();
    let dataset = Uuid::new_v4();

    run_job(
        &backend,
        &engine(Arc::new(StubEmbedder::new())),
        dataset,
        json!({
            "records": [
                {"source_record_id": "r1", "keys": {"display_name": "G. Hopper", "navy_id": 1906}},
                {"source_record_id": "r2", "keys": {}},
            ],
            "semanticFields": [],
            "createIfNoMatch": true,
        }),
    )
    .await;

    let entities = backend.entities();
    assert_eq!(entities.len(), 2);
    assert_eq!(entities[0].display_name, "G. Hopper");
    assert_eq!(entities[0].external_ids.get("navy_id").map(String::as_str), Some("1906"));
    assert_eq!(entities[1].display_name, "r2");

    let mappings = backend.mappings(dataset);
    let r2 = mappings.iter().find(|m| m.source_record_id == "r2").unwrap();
    assert_eq!(r2.method, MatchMethod::Created);
    assert_eq!(r2.source_keys, serde_json::Value::Null);
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let backend = MemoryBackend::new();
    let ada = backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let babbage = backend.register_entity("person", "Charles Babbage", BTreeMap::new());
    let embedder = Arc::new(
        StubEmbedder::new()
            .with_vector("Ada Lovelace", &[1.0, 0.0, 0.0])
            .with_vector("Charles Babbage", &[0.0, 1.0, 0.0])
            .with_vector("inventor of the difference engine", &[0.0, 0.9, 0.435_889_9]),
    );
    let dataset = Uuid::new_v4();
    let config = json!({
        "records": [
            {"source_record_id": "A", "keys": {"name": "ada lovelace", "bio": "poet's daughter"}},
            {"source_record_id": "B", "keys": {"name": "C. B.", "bio": "inventor of the difference engine"}},
            {"source_record_id": "C", "keys": {"name": "Nobody", "bio": "unknown"}},
        ],
        "joinKeys": ["name"],
        "semanticFields": ["bio"],
        "threshold": 0.85,
        "createIfNoMatch": false,
    });

    let (job, result) = run_job(&backend, &engine(embedder), dataset, config.clone()).await;

    assert_eq!(result, tally(1, 1, 0, 1));

    let mappings = backend.mappings(dataset);
    assert_eq!(mappings.len(), 2);
    let a = mappings.iter().find(|m| m.source_record_id == "A").unwrap();
    let b = mappings.iter().find(|m| m.source_record_id == "B").unwrap();
    assert_eq!((a.entity_id, a.method), (ada.id, MatchMethod::Exact));
    assert_eq!((b.entity_id, b.method), (babbage.id, MatchMethod::Semantic));
    assert!((b.score.unwrap() - 0.9).abs() < 1e-6);

    let events = backend.provenance_events(job.id);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stage, "resolution");
    assert_eq!(events[0].dataset_id, dataset);
    assert_eq!(
        events[0].detail,
        json!({
            "config_hash": config_hash(&config).unwrap(),
            "model": STUB_MODEL,
            "exact": 1,
            "semantic": 1,
            "created": 0,
            "unmatched": 1,
        })
    );

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(
        stored.result_summary,
        Some(json!({"exact": 1, "semantic": 1, "created": 0, "unmatched": 1}))
    );
}

#[tokio::test]
async fn test_second_run_adds_no_mappings() {
    let backend = MemoryBackend::new();
    backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let engine = engine(Arc::new(StubEmbedder::new()));
    let dataset = Uuid::new_v4();
    let config = json!({
        "records": [
            {"source_record_id": "r1", "keys": {"name": "Ada Lovelace"}},
            {"source_record_id": "r2", "keys": {"name": "Grace Hopper"}},
            {"source_record_id": "r3", "keys": {"name": "Nobody"}},
        ],
        "joinKeys": ["name"],
        "semanticFields": [],
    });

    let (_, first) = run_job(&backend, &engine, dataset, config.clone()).await;
    assert_eq!(first, tally(1, 0, 0, 2));

    let (_, second) = run_job(&backend, &engine, dataset, config).await;
    // Mapped records are skipped; unmatched ones are evaluated again
    assert_eq!(second, tally(0, 0, 0, 2));
    assert_eq!(backend.mappings(dataset).len(), 1);
}

#[tokio::test]
async fn test_same_record_ids_in_other_dataset_are_independent() {
    let backend = MemoryBackend::new();
    backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let engine = engine(Arc::new(StubEmbedder::new()));
    let config = json!({
        "records": [{"source_record_id": "r1", "keys": {"name": "Ada Lovelace"}}],
        "joinKeys": ["name"],
    });

    let (_, first) = run_job(&backend, &engine, Uuid::new_v4(), config.clone()).await;
    let (_, second) = run_job(&backend, &engine, Uuid::new_v4(), config).await;

    assert_eq!(first, tally(1, 0, 0, 0));
    assert_eq!(second, tally(1, 0, 0, 0));
}

#[tokio::test]
async fn test_duplicate_record_id_within_job_is_mapped_once() {
    let backend = MemoryBackend::new();
    let dataset = Uuid::new_v4();

    let (_, result) = run_job(
        &backend,
        &engine(Arc::new(StubEmbedder::new())),
        dataset,
        json!({
            "records": [
                {"source_record_id": "r1", "keys": {"name": "Grace Hopper"}},
                {"source_record_id": "r1", "keys": {"name": "Someone Else"}},
            ],
            "createIfNoMatch": true,
        }),
    )
    .await;

    assert_eq!(result, tally(0, 0, 1, 0));
    assert_eq!(backend.entities().len(), 1);
    assert_eq!(backend.mappings(dataset).len(), 1);
}

#[tokio::test]
async fn test_empty_records_is_a_no_op() {
    let backend = MemoryBackend::new();
    let embedder = Arc::new(StubEmbedder::new());

    let (job, result) = run_job(
        &backend,
        &engine(embedder.clone()),
        Uuid::new_v4(),
        json!({"records": [], "createIfNoMatch": true}),
    )
    .await;

    assert_eq!(result, tally(0, 0, 0, 0));
    assert!(backend.provenance_events(job.id).is_empty());
    assert_eq!(embedder.calls(), 0);
}

/// Lets a competing writer map `record_id` right after the engine has read
/// the dataset's existing mappings.
struct RacingStore {
    inner: MemoryWork,
    backend: MemoryBackend,
    record_id: String,
    entity_id: Uuid,
}

#[async_trait]
impl EntityStore for RacingStore {
    async fn load_entities(&mut self, entity_type: &str) -> Result<Vec<Entity>, StoreError> {
        self.inner.load_entities(entity_type).await
    }

    async fn create_entity(
        &mut self,
        entity_type: &str,
        display_name: &str,
        external_ids: &BTreeMap<String, String>,
    ) -> Result<Uuid, StoreError> {
        self.inner
            .create_entity(entity_type, display_name, external_ids)
            .await
    }
}

#[async_trait]
impl MappingStore for RacingStore {
    async fn load_existing_mappings(
        &mut self,
        dataset_id: Uuid,
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        let snapshot = self.inner.load_existing_mappings(dataset_id).await?;

        let mut other = self.backend.begin_work().await?;
        other
            .insert_mapping_if_absent(&NewMapping {
                dataset_id,
                entity_id: self.entity_id,
                source_record_id: self.record_id.clone(),
                source_keys: json!({"name": "Ada Lovelace"}),
                method: MatchMethod::Exact,
                score: Some(1.0),
            })
            .await?;
        // Keep the competing row without a job to complete
        std::mem::forget(other);

        Ok(snapshot)
    }

    async fn insert_mapping_if_absent(&mut self, mapping: &NewMapping) -> Result<bool, StoreError> {
        self.inner.insert_mapping_if_absent(mapping).await
    }
}

#[async_trait]
impl ProvenanceLog for RacingStore {
    async fn append_provenance(&mut self, event: &NewProvenanceEvent) -> Result<(), StoreError> {
        self.inner.append_provenance(event).await
    }
}

#[tokio::test]
async fn test_mapping_won_by_concurrent_writer_is_not_tallied() {
    let backend = MemoryBackend::new();
    let ada = backend.register_entity("person", "Ada Lovelace", BTreeMap::new());
    let dataset = Uuid::new_v4();
    let queued = backend
        .enqueue_job(&helpers::new_job(
            dataset,
            json!({
                "records": [
                    {"source_record_id": "r1", "keys": {"name": "Ada Lovelace"}},
                    {"source_record_id": "r2", "keys": {"name": "ada lovelace"}},
                ],
                "joinKeys": ["name"],
            }),
        ))
        .await
        .unwrap();
    let job = backend.claim_next_job().await.unwrap().unwrap();
    assert_eq!(job.id, queued.id);

    let mut store = RacingStore {
        inner: backend.begin_work().await.unwrap(),
        backend: backend.clone(),
        record_id: "r1".to_string(),
        entity_id: ada.id,
    };
    let result = engine(Arc::new(StubEmbedder::new()))
        .run(&mut store, &job)
        .await
        .unwrap();

    assert_eq!(result, tally(1, 0, 0, 0));
    assert_eq!(backend.mappings(dataset).len(), 2);
}
