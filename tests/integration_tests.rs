/// Integration tests for the complete RowGate stack
///
/// These tests drive RowStore end to end through the executor, retry
/// controller and cache against the in-memory store, with tokio's clock
/// paused so backoff and rate windows elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use rowgate::descriptor::DimensionRequest;
use rowgate::{
    abort_pair, fields, CallContext, CallKind, ErrorKind, Fault, MemoryStore, Row, RowGateConfig,
    RowGateError, RowStore, SchemaChange, Transport, Upserted,
};

fn row(cells: &[&str]) -> Row {
    cells.iter().map(|c| c.to_string()).collect()
}

fn setup(rows: Vec<Row>) -> (Arc<MemoryStore>, RowStore) {
    let memory = Arc::new(MemoryStore::new().with_sheet("T", rows));
    let store = RowStore::new(RowGateConfig::default(), memory.clone()).unwrap();
    (memory, store)
}

/// Header plus r1..r5 at positions 2..6.
fn five_records() -> Vec<Row> {
    vec![
        row(&["id", "name"]),
        row(&["r1", "one"]),
        row(&["r2", "two"]),
        row(&["r3", "three"]),
        row(&["r4", "four"]),
        row(&["r5", "five"]),
    ]
}

fn ids(memory: &MemoryStore) -> Vec<String> {
    memory
        .rows("T")
        .into_iter()
        .skip(1)
        .map(|r| r.first().cloned().unwrap_or_default())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_ensure_schema_writes_once() {
    let (memory, store) = setup(Vec::new());

    let first = store.ensure_schema("T", &["id", "name", "qty"]).await.unwrap();
    let second = store.ensure_schema("T", &["id", "name", "qty"]).await.unwrap();

    assert_eq!(first, SchemaChange::Created);
    assert_eq!(second, SchemaChange::Unchanged);
    assert_eq!(memory.call_count("values.update"), 1);
    assert_eq!(memory.rows("T"), vec![row(&["id", "name", "qty"])]);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_schema_extends_and_tolerates_extra_columns() {
    let (memory, store) = setup(vec![row(&["id", "name"]), row(&["a", "x"])]);

    let change = store.ensure_schema("T", &["id", "name", "qty"]).await.unwrap();
    assert_eq!(change, SchemaChange::Extended);
    assert_eq!(memory.rows("T")[0], row(&["id", "name", "qty"]));
    assert_eq!(memory.rows("T")[1], row(&["a", "x"]));

    memory.reset_calls();
    let change = store.ensure_schema("T", &["id", "name"]).await.unwrap();
    assert_eq!(change, SchemaChange::Unchanged);
    assert_eq!(memory.call_count("values.update"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_schema_replaces_conflicting_header() {
    let (memory, store) = setup(vec![row(&["id", "colour", "size"])]);

    let change = store.ensure_schema("T", &["id", "name"]).await.unwrap();
    assert_eq!(change, SchemaChange::Replaced);
    assert_eq!(memory.rows("T")[0], row(&["id", "name"]));
}

#[tokio::test(start_paused = true)]
async fn test_upsert_appends_then_updates_in_place() {
    let (memory, store) = setup(vec![row(&["id", "name", "qty"])]);

    let a = store
        .upsert_row("T", "id", "a", &fields([("name", "bolt"), ("qty", "4")]))
        .await
        .unwrap();
    let b = store
        .upsert_row("T", "id", "b", &fields([("name", "nut"), ("qty", "9")]))
        .await
        .unwrap();
    assert_eq!(a, Upserted::Inserted { position: Some(2) });
    assert_eq!(b, Upserted::Inserted { position: Some(3) });

    let again = store
        .upsert_row("T", "id", "a", &fields([("qty", "5")]))
        .await
        .unwrap();
    assert_eq!(again, Upserted::Updated { position: 2 });
    assert_eq!(
        memory.rows("T"),
        vec![
            row(&["id", "name", "qty"]),
            row(&["a", "bolt", "5"]),
            row(&["b", "nut", "9"]),
        ]
    );
    assert_eq!(memory.call_count("values.append"), 2);
    assert_eq!(memory.call_count("values.update"), 1);

    let found = store.find_row("T", "id", "a").await.unwrap().unwrap();
    assert_eq!(found.position, 2);
    assert_eq!(found.get("name"), Some("bolt"));
    assert_eq!(found.get("qty"), Some("5"));
}

#[tokio::test(start_paused = true)]
async fn test_find_row_trims_key_and_reports_position() {
    let (_memory, store) = setup(vec![
        row(&["id", "name"]),
        row(&["a", "x"]),
        row(&[]),
        row(&[" b ", "y"]),
    ]);

    let found = store.find_row("T", "id", "b").await.unwrap().unwrap();
    assert_eq!(found.position, 4);
    assert_eq!(found.get("name"), Some("y"));

    assert!(store.find_row("T", "id", "zz").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_key_column_is_fatal_with_context() {
    let (_memory, store) = setup(vec![row(&["id", "name"]), row(&["a", "x"])]);

    let err = store.find_row("T", "email", "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    match err {
        RowGateError::Operation { op, range, source, .. } => {
            assert_eq!(op, "find_row");
            assert_eq!(range, "T");
            assert!(matches!(*source, RowGateError::UnknownColumn { .. }));
        }
        other => panic!("expected operation context, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_delete_rows_processes_highest_position_first() {
    let (memory, store) = setup(five_records());
    let sheet_id = memory.sheet_id("T").unwrap();

    let deleted = store
        .delete_rows("T", |r| matches!(r.get("id"), Some("r2") | Some("r4")))
        .await
        .unwrap();

    assert_eq!(deleted, vec![5, 3]);
    assert_eq!(
        memory.rows("T"),
        vec![
            row(&["id", "name"]),
            row(&["r1", "one"]),
            row(&["r3", "three"]),
            row(&["r5", "five"]),
        ]
    );

    let batch = memory
        .calls()
        .into_iter()
        .find_map(|c| match c {
            CallKind::BatchUpdate { requests } => Some(requests),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        batch,
        vec![
            DimensionRequest::delete_row(sheet_id, 5),
            DimensionRequest::delete_row(sheet_id, 3),
        ]
    );
    assert_eq!(memory.call_count("batchUpdate"), 1);
}

#[tokio::test]
async fn test_ascending_deletes_remove_the_wrong_row() {
    let memory = MemoryStore::new().with_sheet("T", five_records());
    let sheet_id = memory.sheet_id("T").unwrap();

    // Positions 3 and 5 hold r2 and r4, but deleting 3 first shifts r5 up to 5.
    let call = CallKind::BatchUpdate {
        requests: vec![
            DimensionRequest::delete_row(sheet_id, 3),
            DimensionRequest::delete_row(sheet_id, 5),
        ],
    };
    memory.send(&call).await.unwrap();

    assert_eq!(ids(&memory), vec!["r1", "r3", "r4"]);
}

#[tokio::test(start_paused = true)]
async fn test_delete_rows_with_no_match_issues_no_write() {
    let (memory, store) = setup(five_records());

    let deleted = store.delete_rows("T", |r| r.get("id") == Some("nope")).await.unwrap();
    assert!(deleted.is_empty());
    assert_eq!(memory.call_count("batchUpdate"), 0);
    assert_eq!(memory.call_count("spreadsheets.get"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_rows_hits_shifted_row_when_sheet_changes_mid_operation() {
    let (memory, store) = setup(vec![
        row(&["id", "name"]),
        row(&["r1", "one"]),
        row(&["r2", "two"]),
        row(&["r3", "three"]),
    ]);

    // Another client inserts above r2 between our read and our delete.
    memory.before_next_batch_update(|tables| {
        if let Some(sheet) = tables.sheet_mut("T") {
            sheet.insert_row(2, vec!["intruder".to_string(), "x".to_string()]);
        }
    });

    let deleted = store.delete_rows("T", |r| r.get("id") == Some("r2")).await.unwrap();

    assert_eq!(deleted, vec![3]);
    // Row 3 now holds r1, so r1 is gone and r2 survives.
    assert_eq!(ids(&memory), vec!["intruder", "r2", "r3"]);
}

#[tokio::test(start_paused = true)]
async fn test_update_rows_preserves_positions() {
    let (memory, store) = setup(vec![
        row(&["id", "status"]),
        row(&["a", "old"]),
        row(&["b", "keep"]),
        row(&["c", "old"]),
    ]);

    let updated = store
        .update_rows("T", |r| r.get("status") == Some("old"), &fields([("status", "new")]))
        .await
        .unwrap();

    assert_eq!(updated, vec![2, 4]);
    assert_eq!(
        memory.rows("T"),
        vec![
            row(&["id", "status"]),
            row(&["a", "new"]),
            row(&["b", "keep"]),
            row(&["c", "new"]),
        ]
    );
    assert_eq!(memory.call_count("values.append"), 0);
    assert_eq!(memory.call_count("batchUpdate"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reads_are_cached_and_writes_invalidate() {
    let (memory, store) = setup(vec![row(&["id", "name"]), row(&["a", "x"])]);

    assert_eq!(store.read_rows("T").await.unwrap().len(), 1);
    assert_eq!(store.read_rows("T").await.unwrap().len(), 1);
    assert_eq!(memory.call_count("values.get"), 1);

    store
        .upsert_row("T", "id", "b", &fields([("name", "y")]))
        .await
        .unwrap();

    let rows = store.read_rows("T").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("id"), Some("b"));

    let stats = store.stats();
    assert!(stats.cache.hits >= 1);
    assert!(stats.cache.invalidations >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_band_edit_visible_after_ttl() {
    let (memory, store) = setup(vec![row(&["id"]), row(&["a"])]);
    assert_eq!(store.read_rows("T").await.unwrap().len(), 1);

    memory.edit(|tables| {
        if let Some(sheet) = tables.sheet_mut("T") {
            sheet.rows.push(row(&["b"]));
        }
    });
    assert_eq!(store.read_rows("T").await.unwrap().len(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(store.read_rows("T").await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_write_is_an_error_not_a_success() {
    let (memory, store) = setup(vec![row(&["id", "name"])]);
    // Let the read through, then fail every append attempt.
    memory.push_faults([
        Fault::Stall(Duration::ZERO),
        Fault::status(503),
        Fault::status(503),
        Fault::status(503),
    ]);

    let err = store
        .upsert_row("T", "id", "a", &fields([("name", "x")]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.attempts(), 3);
    assert!(matches!(err, RowGateError::Operation { op: "upsert_row", .. }));
    assert_eq!(memory.call_count("values.append"), 3);
    assert_eq!(memory.rows("T").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ambiguous_append_failure_is_not_resent() {
    let (memory, store) = setup(vec![row(&["id", "name"])]);
    memory.push_faults([Fault::Stall(Duration::ZERO), Fault::status(502)]);

    let err = store
        .upsert_row("T", "id", "a", &fields([("name", "x")]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(memory.call_count("values.append"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_quota_errors_back_off_and_recover() {
    let (memory, store) = setup(vec![row(&["id", "qty"]), row(&["a", "1"])]);
    memory.push_faults([
        Fault::Stall(Duration::ZERO),
        Fault::quota(429),
        Fault::quota(500),
    ]);

    let start = tokio::time::Instant::now();
    let outcome = store
        .upsert_row("T", "id", "a", &fields([("qty", "2")]))
        .await
        .unwrap();

    assert_eq!(outcome, Upserted::Updated { position: 2 });
    assert_eq!(memory.call_count("values.update"), 3);
    // Quota backoff starts at three times the transient base.
    assert!(start.elapsed() >= Duration::from_millis(1500 + 3000));
    assert_eq!(memory.rows("T")[1], row(&["a", "2"]));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_quota_surfaces_as_quota() {
    let (memory, store) = setup(vec![row(&["id", "qty"]), row(&["a", "1"])]);
    memory.push_faults([Fault::quota(429), Fault::quota(429), Fault::quota(429)]);

    let err = store.find_row("T", "id", "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Quota);
    assert_eq!(err.status(), Some(429));
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_bounds_the_operation() {
    let (memory, store) = setup(vec![row(&["id"]), row(&["a"])]);
    memory.push_fault(Fault::Stall(Duration::from_secs(10)));

    let bounded = store.with_context(CallContext::default().with_timeout(Duration::from_secs(2)));
    let err = bounded.find_row("T", "id", "a").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_abort_cancels_in_flight_operation() {
    let (memory, store) = setup(vec![row(&["id"]), row(&["a"])]);
    memory.push_fault(Fault::Stall(Duration::from_secs(10)));

    let (handle, signal) = abort_pair();
    let cancellable = store.with_context(CallContext::default().with_abort(signal));

    let (result, _) = tokio::join!(cancellable.find_row("T", "id", "a"), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.abort();
    });

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_registered_schema_is_ensured_before_writes() {
    let (memory, store) = setup(Vec::new());
    store.register_schema("T", &["id", "name"]);

    store
        .upsert_row("T", "id", "a", &fields([("name", "x")]))
        .await
        .unwrap();
    store
        .upsert_row("T", "id", "b", &fields([("name", "y")]))
        .await
        .unwrap();

    assert_eq!(
        memory.rows("T"),
        vec![row(&["id", "name"]), row(&["a", "x"]), row(&["b", "y"])]
    );
    // One header write; the second upsert found it already in place.
    assert_eq!(memory.call_count("values.update"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_insert_rows_at_shifts_rows_down() {
    let (memory, store) = setup(vec![row(&["id"]), row(&["r1"]), row(&["r2"])]);

    store.insert_rows_at("T", 3, vec![row(&["new"])]).await.unwrap();

    assert_eq!(ids(&memory), vec!["r1", "new", "r2"]);
    let found = store.find_row("T", "id", "r2").await.unwrap().unwrap();
    assert_eq!(found.position, 4);
}

#[tokio::test(start_paused = true)]
async fn test_raw_get_and_append() {
    let (memory, store) = setup(vec![row(&["id"]), row(&["r1"])]);

    assert_eq!(store.get("T!A2").await.unwrap(), vec![row(&["r1"])]);
    assert_eq!(store.get("T!A2").await.unwrap(), vec![row(&["r1"])]);
    assert_eq!(memory.call_count("values.get"), 1);

    let position = store.append("T", vec![row(&["r2"])]).await.unwrap();
    assert_eq!(position, Some(3));

    assert_eq!(store.get("T!A2").await.unwrap(), vec![row(&["r1"]), row(&["r2"])]);
    assert_eq!(memory.call_count("values.get"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sheet_metadata_is_cached_across_deletes() {
    let (memory, store) = setup(five_records());

    store.delete_rows("T", |r| r.get("id") == Some("r1")).await.unwrap();
    store.delete_rows("T", |r| r.get("id") == Some("r2")).await.unwrap();

    assert_eq!(memory.call_count("spreadsheets.get"), 1);
    assert_eq!(ids(&memory), vec!["r3", "r4", "r5"]);
}

#[tokio::test(start_paused = true)]
async fn test_header_write_invalidates_sheet_with_star_in_title() {
    let memory = Arc::new(
        MemoryStore::new().with_sheet("Q*1", vec![row(&["id", "name"]), row(&["a", "x"])]),
    );
    let store = RowStore::new(RowGateConfig::default(), memory.clone()).unwrap();

    let change = store.ensure_schema("Q*1", &["id", "name"]).await.unwrap();
    assert_eq!(change, SchemaChange::Unchanged);
    assert_eq!(store.read_rows("Q*1").await.unwrap()[0].get("qty"), None);

    let change = store.ensure_schema("Q*1", &["id", "name", "qty"]).await.unwrap();
    assert_eq!(change, SchemaChange::Extended);
    let change = store.ensure_schema("Q*1", &["id", "name", "qty"]).await.unwrap();
    assert_eq!(change, SchemaChange::Unchanged);
    assert_eq!(memory.call_count("values.update"), 1);

    let rows = store.read_rows("Q*1").await.unwrap();
    assert_eq!(rows[0].get("qty"), Some(""));
}

#[tokio::test(start_paused = true)]
async fn test_empty_reads_are_not_cached() {
    let (memory, store) = setup(Vec::new());

    assert!(store.read_rows("T").await.unwrap().is_empty());
    assert!(store.read_rows("T").await.unwrap().is_empty());
    assert_eq!(memory.call_count("values.get"), 2);

    memory.edit(|tables| {
        if let Some(sheet) = tables.sheet_mut("T") {
            sheet.rows.push(row(&["id"]));
            sheet.rows.push(row(&["a"]));
        }
    });
    assert_eq!(store.read_rows("T").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_raw_get_uses_default_ttl() {
    let memory = Arc::new(MemoryStore::new().with_sheet("T", vec![row(&["id"]), row(&["r1"])]));
    let mut config = RowGateConfig::default();
    config.cache.default_ttl_ms = 5_000;
    let store = RowStore::new(config, memory.clone()).unwrap();

    store.get("T!A2").await.unwrap();
    tokio::time::advance(Duration::from_secs(4)).await;
    store.get("T!A2").await.unwrap();
    assert_eq!(memory.call_count("values.get"), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    store.get("T!A2").await.unwrap();
    assert_eq!(memory.call_count("values.get"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_raw_get_with_oversized_column_is_an_error() {
    let (_memory, store) = setup(vec![row(&["id"]), row(&["r1"])]);

    let err = store.get("T!AAAAAAAAAAAAAAAA1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}
