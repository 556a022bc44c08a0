//! End-to-end reconciliation runs against a scripted document store and a
//! directory-backed sink.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jrex_source::{map_document, DocumentStore, SourceError};
use jrex_store::{DirStore, ObjectStore};
use jrex_sync::{
    decode_snapshot, encode_snapshot, Normalizer, ReconciliationEngine, RunMode, RunOutcome,
    XLSX_CONTENT_TYPE,
};
use serde_json::{json, Value};
use tempfile::tempdir;

const SNAPSHOT: &str = "journal-data.xlsx";
const ID_A: &str = "000000010000000000000000";
const ID_B: &str = "000000020000000000000000";
const ID_C: &str = "000000030000000000000000";

struct ScriptedSource {
    documents: Vec<Value>,
    // Returned regardless of the watermark bound, like a journal whose
    // completion landed after the snapshot already covered its identity.
    unfiltered: Vec<Value>,
    pipelines: Mutex<Vec<Value>>,
}

impl ScriptedSource {
    fn new(documents: Vec<Value>) -> Self {
        Self {
            documents,
            unfiltered: Vec::new(),
            pipelines: Mutex::new(Vec::new()),
        }
    }

    fn with_unfiltered(mut self, documents: Vec<Value>) -> Self {
        self.unfiltered = documents;
        self
    }

    fn recorded_watermarks(&self) -> Vec<Option<String>> {
        self.pipelines
            .lock()
            .expect("pipeline log")
            .iter()
            .map(|pipeline| {
                pipeline
                    .pointer("/0/$match/_id/$gt/$oid")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for ScriptedSource {
    async fn ping(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn aggregate(
        &self,
        _collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, SourceError> {
        self.pipelines
            .lock()
            .expect("pipeline log")
            .push(json!(pipeline));

        let after = pipeline
            .first()
            .and_then(|stage| stage.pointer("/$match/_id/$gt/$oid"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut documents: Vec<Value> = self
            .documents
            .iter()
            .filter(|doc| match &after {
                None => true,
                Some(bound) => doc["journal_id"]
                    .as_str()
                    .map(|id| id > bound.as_str())
                    .unwrap_or(false),
            })
            .cloned()
            .collect();
        documents.extend(self.unfiltered.iter().cloned());
        Ok(documents)
    }
}

fn doc(id: &str, user: &str) -> Value {
    json!({
        "journal_id": id,
        "User Name": user,
        "User email": format!("{user}@example.com"),
        "Timestamp": { "$date": "2024-03-01T08:30:00Z" },
        "End Date Time": { "$date": "2024-03-01T09:30:00Z" },
        "n_Name": "Umstead",
        "City": "Raleigh",
        "State": "NC",
        "Zip": "27612",
        "LocCountry": "",
        "Address": "8801 Glenwood Ave",
        "n_Place": "Umstead, Raleigh NC",
        "n_Lati": 35.890471,
        "n_Long": -78.750465,
        "n_park_nbr": "P-17",
    })
}

async fn seed_snapshot(sink: &DirStore, docs: &[Value]) {
    let normalizer = Normalizer::new();
    let rows = normalizer.clean(docs.iter().map(map_document).collect());
    let bytes = encode_snapshot(&rows).expect("encode seed snapshot");
    sink.check_container().await.expect("container");
    sink.upload(SNAPSHOT, XLSX_CONTENT_TYPE, &bytes)
        .await
        .expect("seed upload");
}

#[tokio::test]
async fn full_run_rebuilds_without_duplicates() {
    let dir = tempdir().expect("tempdir");
    let sink = DirStore::new(dir.path());
    seed_snapshot(&sink, &[doc(ID_A, "stale")]).await;

    let source = Arc::new(ScriptedSource::new(vec![doc(ID_A, "fresh"), doc(ID_B, "b")]));
    let engine = ReconciliationEngine::new(
        source.clone(),
        Arc::new(sink.clone()),
        SNAPSHOT,
        RunMode::Full,
    );

    let outcome = engine.run_once().await.expect("run");
    let RunOutcome::Uploaded(summary) = outcome else {
        panic!("expected an upload");
    };
    assert_eq!(summary.fetched_rows, 2);
    assert_eq!(summary.snapshot_rows, 2);
    assert_eq!(summary.snapshot_sha256.len(), 64);

    // Full runs never pass a watermark bound to the store.
    assert_eq!(source.recorded_watermarks().last(), Some(&None));

    let rows = decode_snapshot(&sink.download(SNAPSHOT).await.expect("download"));
    assert_eq!(rows.len(), 2);
    let row_a = rows
        .iter()
        .find(|r| r.journal_id == ID_A)
        .expect("row for id_a");
    assert_eq!(row_a.user_name, "fresh");
}

#[tokio::test]
async fn incremental_run_appends_past_watermark() {
    let dir = tempdir().expect("tempdir");
    let sink = DirStore::new(dir.path());
    seed_snapshot(&sink, &[doc(ID_A, "a"), doc(ID_B, "b")]).await;

    let source = Arc::new(ScriptedSource::new(vec![
        doc(ID_A, "a"),
        doc(ID_B, "b"),
        doc(ID_C, "c"),
    ]));
    let engine = ReconciliationEngine::new(
        source.clone(),
        Arc::new(sink.clone()),
        SNAPSHOT,
        RunMode::Incremental,
    );

    let outcome = engine.run_once().await.expect("run");
    let RunOutcome::Uploaded(summary) = outcome else {
        panic!("expected an upload");
    };
    assert_eq!(summary.fetched_rows, 1);
    assert_eq!(summary.snapshot_rows, 3);

    // The store only ever saw the bounded fetch.
    assert_eq!(
        source.recorded_watermarks(),
        vec![Some(ID_B.to_string())]
    );

    let rows = decode_snapshot(&sink.download(SNAPSHOT).await.expect("download"));
    let mut ids: Vec<_> = rows.iter().map(|r| r.journal_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec![ID_A, ID_B, ID_C]);
}

#[tokio::test]
async fn overlapping_refetch_resolves_to_newest() {
    let dir = tempdir().expect("tempdir");
    let sink = DirStore::new(dir.path());
    seed_snapshot(&sink, &[doc(ID_A, "a"), doc(ID_B, "old-b")]).await;

    let source = Arc::new(
        ScriptedSource::new(vec![doc(ID_A, "a"), doc(ID_B, "old-b"), doc(ID_C, "c")])
            .with_unfiltered(vec![doc(ID_B, "new-b")]),
    );
    let engine = ReconciliationEngine::new(
        source,
        Arc::new(sink.clone()),
        SNAPSHOT,
        RunMode::Incremental,
    );

    let outcome = engine.run_once().await.expect("run");
    let RunOutcome::Uploaded(summary) = outcome else {
        panic!("expected an upload");
    };
    assert_eq!(summary.fetched_rows, 2);
    // existing (2) + new (2) - overlap (1)
    assert_eq!(summary.snapshot_rows, 3);

    let rows = decode_snapshot(&sink.download(SNAPSHOT).await.expect("download"));
    let row_b = rows
        .iter()
        .find(|r| r.journal_id == ID_B)
        .expect("row for id_b");
    assert_eq!(row_b.user_name, "new-b");
}

#[tokio::test]
async fn empty_fetch_leaves_snapshot_untouched() {
    let dir = tempdir().expect("tempdir");
    let sink = DirStore::new(dir.path());
    seed_snapshot(&sink, &[doc(ID_A, "a"), doc(ID_B, "b")]).await;
    let before = sink.download(SNAPSHOT).await.expect("download");

    let source = Arc::new(ScriptedSource::new(vec![doc(ID_A, "a"), doc(ID_B, "b")]));
    let engine = ReconciliationEngine::new(
        source,
        Arc::new(sink.clone()),
        SNAPSHOT,
        RunMode::Incremental,
    );

    let outcome = engine.run_once().await.expect("run");
    assert!(matches!(outcome, RunOutcome::NoNewData));

    let after = sink.download(SNAPSHOT).await.expect("download");
    assert_eq!(before, after);
}
