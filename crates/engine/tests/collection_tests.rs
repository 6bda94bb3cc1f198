use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vecstore::error::ValidationError;
use vecstore::storage::StorageAdapter;
use vecstore::{
    CollectionOptions, DbConfig, DbError, Document, DocumentUpdate, FilterClause,
    FilterCondition, HybridQuery, SearchOptions, VectorDb,
};
use vecstore_core::hnsw::DistanceMetric;
use vecstore_core::search::{FusionMethod, WeightedFusion};
use vecstore_core::VectorError;

async fn memory_db() -> VectorDb {
    VectorDb::open(DbConfig::in_memory(3))
        .await
        .expect("open in-memory db")
}

fn doc(id: &str, vector: [f32; 3]) -> Document {
    Document::new(id, vector.to_vec())
}

#[tokio::test]
async fn nearest_neighbor_scores_exact_match_highest() {
    let db = memory_db().await;
    let docs = db
        .create_collection("docs", CollectionOptions::new(3))
        .await
        .unwrap();
    docs.add(doc("a", [1.0, 0.0, 0.0])).await.unwrap();
    docs.add(doc("b", [0.0, 1.0, 0.0])).await.unwrap();

    let results = docs
        .search(&[1.0, 0.0, 0.0], SearchOptions::new(1))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "a");
    assert!((results[0].score - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn search_results_are_bounded_and_sorted() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    for i in 0..40 {
        let angle = i as f32 * 0.07;
        docs.add(doc(&format!("d{i}"), [angle.cos(), angle.sin(), 0.1]))
            .await
            .unwrap();
    }

    let results = docs
        .search(&[1.0, 0.0, 0.1], SearchOptions::new(7))
        .await
        .unwrap();
    assert_eq!(results.len(), 7);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(results[0].id, "d0");
}

#[tokio::test]
async fn empty_collection_search_returns_nothing() {
    let db = memory_db().await;
    let docs = db.collection("empty").await.unwrap();
    let results = docs
        .search(&[0.0, 0.0, 1.0], SearchOptions::new(5))
        .await
        .unwrap();
    assert!(results.is_empty());
    assert!(docs.keyword_search("anything", 5, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn upsert_keeps_created_at_and_replaces_vector() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("a", [1.0, 0.0, 0.0]).with_text("first"))
        .await
        .unwrap();
    let before = db
        .storage()
        .get_document(docs.id(), "a")
        .await
        .unwrap()
        .unwrap();

    docs.add(doc("a", [0.0, 0.0, 1.0]).with_text("second"))
        .await
        .unwrap();
    let after = db
        .storage()
        .get_document(docs.id(), "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.text.as_deref(), Some("second"));

    let fetched = docs.get("a").await.unwrap().unwrap();
    assert_eq!(fetched.vector, vec![0.0, 0.0, 1.0]);
    assert_eq!(docs.stats().await.unwrap().documents, 1);
}

#[tokio::test]
async fn update_merges_fields() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(
        doc("a", [1.0, 0.0, 0.0])
            .with_text("original text")
            .with_metadata("lang", "en"),
    )
    .await
    .unwrap();

    let updated = docs
        .update(
            "a",
            DocumentUpdate {
                vector: Some(vec![0.0, 1.0, 0.0]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.text.as_deref(), Some("original text"));
    assert_eq!(updated.metadata.len(), 1);

    let results = docs
        .search(&[0.0, 1.0, 0.0], SearchOptions::new(1))
        .await
        .unwrap();
    assert_eq!(results[0].id, "a");
    assert!(results[0].score > 0.99);
}

#[tokio::test]
async fn update_can_clear_text() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("a", [1.0, 0.0, 0.0]).with_text("searchable words"))
        .await
        .unwrap();

    let updated = docs
        .update(
            "a",
            DocumentUpdate {
                text: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.text, None);
    assert_eq!(docs.get("a").await.unwrap().unwrap().text, None);
    assert!(docs.keyword_search("searchable", 5, None).await.unwrap().is_empty());

    let replaced = docs
        .update(
            "a",
            DocumentUpdate {
                text: Some(Some("fresh words".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(replaced.text.as_deref(), Some("fresh words"));
}

#[tokio::test]
async fn update_missing_document_is_not_found() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    let err = docs
        .update("ghost", DocumentUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DocumentNotFound(id) if id == "ghost"));
    assert!(db
        .wal()
        .entries()
        .await
        .iter()
        .all(|e| e.operation.kind().as_str() != "update_document"));
}

#[tokio::test]
async fn delete_removes_from_index_and_storage() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("a", [1.0, 0.0, 0.0]).with_text("alpha"))
        .await
        .unwrap();
    docs.add(doc("b", [0.0, 1.0, 0.0])).await.unwrap();

    assert!(docs.delete("a").await.unwrap());
    assert!(!docs.delete("a").await.unwrap());
    assert!(docs.get("a").await.unwrap().is_none());

    let results = docs
        .search(&[1.0, 0.0, 0.0], SearchOptions::new(5))
        .await
        .unwrap();
    assert_eq!(results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
    assert!(docs.keyword_search("alpha", 5, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_many_and_delete_where() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    for (i, lang) in ["en", "de", "en", "fr", "en"].iter().enumerate() {
        docs.add(doc(&format!("d{i}"), [1.0, i as f32, 0.0]).with_metadata("lang", *lang))
            .await
            .unwrap();
    }

    assert_eq!(docs.delete_many(["d1", "missing"]).await.unwrap(), 1);
    let removed = docs
        .delete_where(&FilterClause::must(FilterCondition::eq("lang", "en")))
        .await
        .unwrap();
    assert_eq!(removed, 3);

    let stats = docs.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.indexed, 1);
    assert!(docs.get("d3").await.unwrap().is_some());
}

#[tokio::test]
async fn filtered_search_and_threshold() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("en1", [1.0, 0.0, 0.0]).with_metadata("lang", "en"))
        .await
        .unwrap();
    docs.add(doc("de1", [0.9, 0.1, 0.0]).with_metadata("lang", "de"))
        .await
        .unwrap();
    docs.add(doc("en2", [0.0, 1.0, 0.0]).with_metadata("lang", "en"))
        .await
        .unwrap();

    let filter = FilterClause::must(FilterCondition::eq("lang", "en"));
    let results = docs
        .search(&[1.0, 0.0, 0.0], SearchOptions::new(3).with_filter(filter))
        .await
        .unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["en1", "en2"]);

    let close_only = docs
        .search(
            &[1.0, 0.0, 0.0],
            SearchOptions::new(3).with_threshold(0.5).with_vectors(),
        )
        .await
        .unwrap();
    assert_eq!(close_only.len(), 2);
    assert!(close_only.iter().all(|r| r.vector.is_some()));

    let nothing = docs
        .search(
            &[1.0, 0.0, 0.0],
            SearchOptions::new(3)
                .with_filter(FilterClause::must(FilterCondition::eq("lang", "jp"))),
        )
        .await
        .unwrap();
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn keyword_search_ranks_matching_text() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("fox", [1.0, 0.0, 0.0]).with_text("the quick brown fox"))
        .await
        .unwrap();
    docs.add(doc("dog", [0.0, 1.0, 0.0]).with_text("lazy dog sleeps"))
        .await
        .unwrap();

    let hits = docs.keyword_search("fox", 10, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "fox");
    assert!(hits[0].score > 0.0);
    assert!(docs.keyword_search("zebra", 10, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn hybrid_search_fuses_both_rankings() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("vec_only", [1.0, 0.0, 0.0]).with_text("unrelated words"))
        .await
        .unwrap();
    docs.add(doc("both", [0.9, 0.1, 0.0]).with_text("rust vector database"))
        .await
        .unwrap();
    docs.add(doc("text_only", [0.0, 0.0, 1.0]).with_text("rust database engine"))
        .await
        .unwrap();

    let rrf = docs
        .hybrid_search(HybridQuery::new(vec![1.0, 0.0, 0.0], "rust vector", 3))
        .await
        .unwrap();
    assert_eq!(rrf[0].id, "both");
    assert!(rrf[0].vector_score.is_some() && rrf[0].keyword_score.is_some());
    assert!(rrf.windows(2).all(|w| w[0].score >= w[1].score));

    let weighted = docs
        .hybrid_search(
            HybridQuery::new(vec![1.0, 0.0, 0.0], "rust vector", 2)
                .with_fusion(FusionMethod::Weighted(WeightedFusion::default()))
                .with_min_score(0.0),
        )
        .await
        .unwrap();
    assert_eq!(weighted.len(), 2);
    assert_eq!(weighted[0].id, "both");
}

#[tokio::test]
async fn add_many_reports_progress() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let progress = move |completed: usize, total: usize| {
        assert!(completed <= total);
        seen.fetch_add(1, Ordering::SeqCst);
    };

    let batch: Vec<_> = (0..25)
        .map(|i| doc(&format!("d{i}"), [1.0, i as f32, 2.0]))
        .collect();
    let written = docs.add_many(batch, Some(&progress)).await.unwrap();
    assert_eq!(written, 25);
    assert_eq!(calls.load(Ordering::SeqCst), 25);
    assert_eq!(docs.stats().await.unwrap().indexed, 25);
    assert!(db.wal().pending().await.is_empty());
}

#[tokio::test]
async fn add_many_rejects_whole_batch_on_invalid_document() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    let batch = vec![
        doc("ok1", [1.0, 0.0, 0.0]),
        Document::new("bad", vec![1.0, 0.0]),
        doc("ok2", [0.0, 1.0, 0.0]),
    ];
    let err = docs.add_many(batch, None).await.unwrap_err();
    assert!(matches!(
        err,
        DbError::Validation(ValidationError::Vector(VectorError::DimensionMismatch { .. }))
    ));
    assert_eq!(docs.stats().await.unwrap().documents, 0);
    assert!(db
        .wal()
        .entries()
        .await
        .iter()
        .all(|e| e.operation.kind().as_str() != "add_document"));
}

#[tokio::test]
async fn cancelled_batch_writes_nothing() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("keep", [1.0, 0.0, 0.0])).await.unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    let progress = move |completed: usize, _total: usize| {
        if completed == 3 {
            cancel.cancel();
        }
    };
    let batch: Vec<_> = (0..10)
        .map(|i| doc(&format!("d{i}"), [0.0, 1.0, i as f32]))
        .chain(std::iter::once(doc("keep", [0.0, 0.0, 1.0])))
        .collect();
    let err = docs
        .add_many_cancellable(batch, Some(&progress), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled));

    let stats = docs.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.indexed, 1);
    assert_eq!(docs.get("keep").await.unwrap().unwrap().vector, vec![1.0, 0.0, 0.0]);
    assert!(db.wal().pending().await.is_empty());
}

#[tokio::test]
async fn cancelled_deletes_remove_nothing() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    for i in 0..5 {
        docs.add(doc(&format!("d{i}"), [1.0, i as f32, 0.0]).with_text("shared"))
            .await
            .unwrap();
    }
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(
        docs.delete_where_cancellable(&FilterClause::default(), &token).await,
        Err(DbError::Cancelled)
    ));
    assert!(matches!(
        docs.delete_many_cancellable(["d0", "d1"], &token).await,
        Err(DbError::Cancelled)
    ));
    assert!(matches!(docs.clear_cancellable(&token).await, Err(DbError::Cancelled)));
    assert!(matches!(
        docs.rebuild_index_cancellable(&token).await,
        Err(DbError::Cancelled)
    ));

    let stats = docs.stats().await.unwrap();
    assert_eq!(stats.documents, 5);
    assert_eq!(stats.indexed, 5);
    assert_eq!(stats.keyword_documents, 5);
    assert!(db.wal().pending().await.is_empty());
    assert!(db
        .wal()
        .entries()
        .await
        .iter()
        .all(|e| e.operation.kind().as_str() != "clear_collection"));
}

#[tokio::test]
async fn delete_many_restores_rows_when_cancelled_midway() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    let ids: Vec<String> = (0..200).map(|i| format!("d{i}")).collect();
    let batch: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| doc(id, [1.0, i as f32, 0.5]))
        .collect();
    docs.add_many(batch, None).await.unwrap();

    let token = CancellationToken::new();
    let deleting = {
        let docs = docs.clone();
        let token = token.clone();
        let ids = ids.clone();
        tokio::spawn(async move { docs.delete_many_cancellable(ids, &token).await })
    };
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    token.cancel();

    match deleting.await.unwrap() {
        Err(DbError::Cancelled) => {
            let stats = docs.stats().await.unwrap();
            assert_eq!(stats.documents, 200);
            assert_eq!(stats.vectors, 200);
            assert_eq!(stats.indexed, 200);
        }
        // The whole batch finished before the cancel landed.
        Ok(deleted) => assert_eq!(deleted, 200),
        Err(other) => panic!("unexpected error {other:?}"),
    }
    assert!(db.wal().pending().await.is_empty());
}

#[tokio::test]
async fn cancelled_import_creates_no_collection() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    docs.add(doc("a", [1.0, 0.0, 0.0])).await.unwrap();
    let bytes = docs.export().await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(
        db.import_cancellable(&bytes, Some("copy"), &token).await,
        Err(DbError::Cancelled)
    ));
    assert!(db.get_collection("copy").await.unwrap().is_none());
}

#[tokio::test]
async fn validation_errors_are_reported_before_writes() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();

    let err = docs
        .add(Document::new("nan", vec![f32::NAN, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    let err = docs
        .search(&[1.0, 0.0], SearchOptions::new(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    let err = docs
        .search(&[1.0, 0.0, 0.0], SearchOptions::new(0))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(ValidationError::InvalidK { .. })));
    let err = db
        .create_collection("bad name", CollectionOptions::new(3))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(ValidationError::InvalidCollectionName(_))));
    assert_eq!(docs.stats().await.unwrap().documents, 0);
}

#[tokio::test]
async fn collection_lifecycle() {
    let db = memory_db().await;
    let created = db
        .create_collection(
            "euclid",
            CollectionOptions::new(2).with_metric(DistanceMetric::Euclidean),
        )
        .await
        .unwrap();
    assert_eq!(created.metric(), DistanceMetric::Euclidean);
    assert!(db
        .create_collection("euclid", CollectionOptions::new(2))
        .await
        .is_err());

    created.add(Document::new("p", vec![3.0, 4.0])).await.unwrap();
    let hits = created
        .search(&[0.0, 0.0], SearchOptions::new(1))
        .await
        .unwrap();
    assert!((hits[0].score - 1.0 / 6.0).abs() < 1e-5);

    let names: Vec<_> = db
        .list_collections()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["euclid".to_string()]);

    assert!(db.delete_collection("euclid").await.unwrap());
    assert!(!db.delete_collection("euclid").await.unwrap());
    assert!(matches!(
        created.add(Document::new("q", vec![1.0, 1.0])).await,
        Err(DbError::CollectionNotFound(_))
    ));
    assert!(db.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn clear_collection_and_database() {
    let db = memory_db().await;
    let a = db.collection("a").await.unwrap();
    let b = db.collection("b").await.unwrap();
    a.add(doc("x", [1.0, 0.0, 0.0]).with_text("hello"))
        .await
        .unwrap();
    b.add(doc("y", [0.0, 1.0, 0.0])).await.unwrap();

    a.clear().await.unwrap();
    let stats = a.stats().await.unwrap();
    assert_eq!((stats.documents, stats.indexed, stats.keyword_documents), (0, 0, 0));
    assert_eq!(b.stats().await.unwrap().documents, 1);

    db.clear().await.unwrap();
    assert!(db.list_collections().await.unwrap().is_empty());
    assert!(matches!(b.get("y").await, Err(DbError::CollectionNotFound(_))));
}

#[tokio::test]
async fn shortcuts_use_default_collection() {
    let db = memory_db().await;
    db.add(doc("a", [1.0, 0.0, 0.0])).await.unwrap();
    assert!(db.get("a").await.unwrap().is_some());
    let hits = db
        .search(&[1.0, 0.0, 0.0], SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(db.delete("a").await.unwrap());
    assert_eq!(db.list_collections().await.unwrap()[0].name, "default");
}

#[tokio::test]
async fn concurrent_writers_are_serialized() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    let mut tasks = Vec::new();
    for t in 0..4 {
        let docs = docs.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..20 {
                let v = [t as f32 + 1.0, i as f32, 1.0];
                docs.add(doc(&format!("t{t}-{i}"), v)).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let stats = docs.stats().await.unwrap();
    assert_eq!(stats.documents, 80);
    assert_eq!(stats.indexed, 80);
    assert!(db.wal().pending().await.is_empty());
}

#[tokio::test]
async fn closed_database_rejects_calls() {
    let db = memory_db().await;
    let docs = db.collection("docs").await.unwrap();
    db.close().await.unwrap();
    db.close().await.unwrap();
    assert!(matches!(db.collection("docs").await, Err(DbError::Closed)));
    assert!(matches!(
        docs.add(doc("a", [1.0, 0.0, 0.0])).await,
        Err(DbError::Closed)
    ));
}
