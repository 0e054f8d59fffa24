mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use cellstore::domain::{ColumnSelection, DatasetPrefix, Domain};
use cellstore::engine::{CompactOutcome, Engine, EngineSettings};
use cellstore::error::CellStoreError;
use cellstore::jobs::{JobKey, JobStatus};
use cellstore::layout::Locator;
use cellstore::planner::QueryRequest;
use cellstore::storage::StorageBackend;

use common::*;

fn select_all() -> QueryRequest {
    QueryRequest::new(tcell(), Domain::Gex, ColumnSelection::All)
}

fn completed(outcome: CompactOutcome) -> cellstore::compactor::CompactionResult {
    match outcome {
        CompactOutcome::Completed(result) => result,
        other => panic!("expected a completed compaction, got {other:?}"),
    }
}

fn seeded() -> Warehouse {
    let warehouse = Warehouse::new();
    warehouse.write(GEX_CORE, &gex_core());
    warehouse.write("GEX/tcell_gex_cd8a.parquet", &cd8a_extension());
    warehouse.write("GEX/tcell_gex_foxp3.parquet", &foxp3_extension());
    warehouse
}

#[test]
fn compaction_preserves_logical_content() {
    let warehouse = seeded();
    let engine = warehouse.engine();
    let before = engine.query(&select_all()).unwrap().rows;

    let result = completed(engine.compact(&tcell(), Domain::Gex).unwrap());
    assert!(result.core_rewritten);
    assert_eq!(result.added_columns, vec!["CD8A".to_string(), "FOXP3".to_string()]);
    assert_eq!(result.merged.len(), 2);
    assert!(result.left_in_place.is_empty());
    assert!(!warehouse.exists("GEX/tcell_gex_cd8a.parquet"));
    assert!(!warehouse.exists("GEX/tcell_gex_foxp3.parquet"));
    assert!(!warehouse.exists("GEX/tcell_gex_core.parquet.tmp"));

    let after = engine.query(&select_all()).unwrap().rows;
    assert_eq!(column_names(&before), column_names(&after));
    for column in ["CD4", "CD8A", "FOXP3"] {
        assert_eq!(float_column(&before, column), float_column(&after, column));
    }
    assert_eq!(column_names(&warehouse.read(GEX_CORE)), column_names(&after));
}

#[test]
fn compaction_is_idempotent() {
    let warehouse = seeded();
    let engine = warehouse.engine();
    completed(engine.compact(&tcell(), Domain::Gex).unwrap());
    let first = column_names(&warehouse.read(GEX_CORE));

    let second = completed(engine.compact(&tcell(), Domain::Gex).unwrap());
    assert!(!second.core_rewritten);
    assert!(second.merged.is_empty());
    assert_eq!(column_names(&warehouse.read(GEX_CORE)), first);
}

#[test]
fn fragments_without_new_columns_are_merged_trivially() {
    let warehouse = Warehouse::new();
    warehouse.write(GEX_CORE, &gex_core());
    warehouse.write(
        "GEX/tcell_gex_dup.parquet",
        &batch(vec![
            ("Barcode", strings(&["AAA"])),
            ("CD4", floats(&[42.0])),
        ]),
    );
    let engine = warehouse.engine();

    let result = completed(engine.compact(&tcell(), Domain::Gex).unwrap());
    assert!(!result.core_rewritten);
    assert_eq!(result.merged.len(), 1);
    assert!(!warehouse.exists("GEX/tcell_gex_dup.parquet"));
    assert_eq!(
        float_column(&warehouse.read(GEX_CORE), "CD4"),
        vec![Some(5.0), Some(0.1), Some(4.2), Some(3.3)]
    );
}

#[test]
fn invalid_fragments_are_removed_and_unreadable_ones_kept() {
    let warehouse = Warehouse::new();
    warehouse.write(GEX_CORE, &gex_core());
    warehouse.write(
        "GEX/tcell_gex_nokey.parquet",
        &batch(vec![("cell", strings(&["AAA"])), ("GZMB", floats(&[1.0]))]),
    );
    warehouse.write_raw("GEX/tcell_gex_broken.parquet", b"not parquet");

    let result = completed(warehouse.engine().compact(&tcell(), Domain::Gex).unwrap());
    assert_eq!(result.removed_invalid.len(), 1);
    assert!(!warehouse.exists("GEX/tcell_gex_nokey.parquet"));
    assert!(warehouse.exists("GEX/tcell_gex_broken.parquet"));

    let keep = Warehouse::new();
    keep.write(GEX_CORE, &gex_core());
    keep.write(
        "GEX/tcell_gex_nokey.parquet",
        &batch(vec![("cell", strings(&["AAA"])), ("GZMB", floats(&[1.0]))]),
    );
    let settings = EngineSettings {
        delete_invalid_fragments: false,
        ..EngineSettings::default()
    };
    let engine = Engine::local(keep.root(), settings).unwrap();
    let result = completed(engine.compact(&tcell(), Domain::Gex).unwrap());
    assert!(result.removed_invalid.is_empty());
    assert!(keep.exists("GEX/tcell_gex_nokey.parquet"));
}

#[test]
fn failed_replace_leaves_every_fragment_untouched() {
    let warehouse = seeded();
    let inner: Arc<dyn StorageBackend> = warehouse.store.clone();
    let engine = TestStore::failing_replace(inner).engine();
    let core_before = column_names(&warehouse.read(GEX_CORE));

    let err = engine.compact(&tcell(), Domain::Gex).unwrap_err();
    assert_matches!(err, CellStoreError::BackendUnavailable(_));

    assert_eq!(column_names(&warehouse.read(GEX_CORE)), core_before);
    assert!(warehouse.exists("GEX/tcell_gex_cd8a.parquet"));
    assert!(warehouse.exists("GEX/tcell_gex_foxp3.parquet"));
    assert!(!warehouse.exists("GEX/tcell_gex_core.parquet.tmp"));

    let key = JobKey::compaction(&tcell(), Domain::Gex);
    assert_eq!(engine.job_status(&key), JobStatus::Idle);

    let snapshot = engine.catalog(&tcell(), Domain::Gex).unwrap();
    assert_eq!(snapshot.extensions.len(), 2);
    let response = engine.query(&select_all()).unwrap();
    assert_eq!(response.rows.num_columns(), 9);
}

#[test]
fn concurrent_compactions_run_once() {
    let warehouse = seeded();
    let gate = Gate::closed();
    let inner: Arc<dyn StorageBackend> = warehouse.store.clone();
    let engine = TestStore::gated(inner, Arc::clone(&gate)).engine();

    let first = {
        let engine = engine.clone();
        thread::spawn(move || engine.compact(&tcell(), Domain::Gex))
    };
    gate.wait_for(1);
    assert_eq!(engine.status(&tcell()), JobStatus::Running);

    let second = engine.compact(&tcell(), Domain::Gex).unwrap();
    assert_matches!(second, CompactOutcome::AlreadyRunning);
    assert_eq!(gate.entered(), 1);

    gate.open();
    let result = completed(first.join().unwrap().unwrap());
    assert_eq!(result.merged.len(), 2);
    assert_eq!(engine.status(&tcell()), JobStatus::Idle);
}

#[test]
fn background_compaction_reports_ready_until_acknowledged() {
    let warehouse = seeded();
    let gate = Gate::closed();
    let inner: Arc<dyn StorageBackend> = warehouse.store.clone();
    let engine = TestStore::gated(inner, Arc::clone(&gate)).engine();

    let outcome = engine.compact_in_background(&tcell(), Domain::Gex).unwrap();
    assert_matches!(outcome, CompactOutcome::Scheduled);
    gate.wait_for(1);
    assert_eq!(engine.status(&tcell()), JobStatus::Running);
    assert_matches!(
        engine.compact_in_background(&tcell(), Domain::Gex).unwrap(),
        CompactOutcome::AlreadyRunning
    );

    gate.open();
    let status = engine.wait_while_running(&tcell(), Duration::from_secs(10));
    assert_eq!(status, JobStatus::Ready);
    assert!(!warehouse.exists("GEX/tcell_gex_cd8a.parquet"));

    let snapshot = engine.catalog(&tcell(), Domain::Gex).unwrap();
    assert!(snapshot.extensions.is_empty());
    assert!(snapshot.core.as_ref().unwrap().has_column("FOXP3"));

    assert_eq!(engine.acknowledge(&tcell()), 1);
    assert_eq!(engine.status(&tcell()), JobStatus::Idle);
}

#[test]
fn full_queue_is_reported() {
    let warehouse = seeded();
    let other: DatasetPrefix = "myeloid".parse().unwrap();
    let gate = Gate::closed();
    let inner: Arc<dyn StorageBackend> = warehouse.store.clone();
    let resolver = cellstore::storage::StorageResolver::local_only(Arc::new(TestStore::gated(
        inner,
        Arc::clone(&gate),
    )));
    let settings = EngineSettings {
        worker_threads: 1,
        queue_capacity: 1,
        ..EngineSettings::default()
    };
    let engine = Engine::with_parts(
        resolver,
        Arc::new(cellstore::backfill::Unconfigured),
        settings,
    )
    .unwrap();

    engine.compact_in_background(&tcell(), Domain::Gex).unwrap();
    gate.wait_for(1);
    engine.compact_in_background(&tcell(), Domain::Pert).unwrap();
    let err = engine.compact_in_background(&other, Domain::Gex).unwrap_err();
    assert_matches!(err, CellStoreError::QueueFull);
    assert_eq!(engine.status(&other), JobStatus::Idle);
    gate.open();
}

#[test]
fn compact_all_continues_past_failures() {
    let warehouse = seeded();
    warehouse.write_raw("GEX/myeloid_gex_core.parquet", b"PAR1 truncated");
    let engine = warehouse.engine();
    let broken: DatasetPrefix = "myeloid".parse().unwrap();
    let empty: DatasetPrefix = "bcell".parse().unwrap();

    let outcomes = engine.compact_all(&[broken.clone(), empty, tcell()], Domain::Gex);
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].0, broken);
    assert_matches!(outcomes[0].1, Err(CellStoreError::CorruptFragment { .. }));
    assert_matches!(
        &outcomes[1].1,
        Ok(CompactOutcome::Completed(result)) if result.merged.is_empty() && !result.core_rewritten
    );
    assert_matches!(outcomes[2].1, Ok(CompactOutcome::Completed(_)));
    assert!(!warehouse.exists("GEX/tcell_gex_cd8a.parquet"));
}

#[test]
fn dataset_without_core_is_left_alone() {
    let warehouse = Warehouse::new();
    warehouse.write("GEX/myeloid_gex_cd8a.parquet", &cd8a_extension());
    let engine = warehouse.engine();
    let myeloid: DatasetPrefix = "myeloid".parse().unwrap();

    let result = completed(engine.compact(&myeloid, Domain::Gex).unwrap());
    assert!(result.merged.is_empty());
    assert!(!result.core_rewritten);
    assert!(warehouse.exists("GEX/myeloid_gex_cd8a.parquet"));
    assert!(!warehouse.exists("GEX/myeloid_gex_core.parquet"));
    assert_eq!(engine.status(&myeloid), JobStatus::Idle);

    let err = engine
        .query(&QueryRequest::new(myeloid, Domain::Gex, ColumnSelection::All))
        .unwrap_err();
    assert_matches!(err, CellStoreError::NotFound(_));
}

#[test]
fn undeletable_fragment_is_merged_again_next_run() {
    let warehouse = Warehouse::new();
    warehouse.write(GEX_CORE, &gex_core());
    warehouse.write("GEX/tcell_gex_cd8a.parquet", &cd8a_extension());
    let extension = Locator::new("GEX/tcell_gex_cd8a.parquet");
    let inner: Arc<dyn StorageBackend> = warehouse.store.clone();

    let first = completed(
        TestStore::failing_delete(inner)
            .engine()
            .compact(&tcell(), Domain::Gex)
            .unwrap(),
    );
    assert!(first.core_rewritten);
    assert_eq!(first.left_in_place, vec![extension.clone()]);
    assert!(warehouse.exists("GEX/tcell_gex_cd8a.parquet"));
    assert!(column_names(&warehouse.read(GEX_CORE)).contains(&"CD8A".to_string()));

    let second = completed(warehouse.engine().compact(&tcell(), Domain::Gex).unwrap());
    assert!(!second.core_rewritten);
    assert_eq!(second.merged, vec![extension]);
    assert!(second.left_in_place.is_empty());
    assert!(!warehouse.exists("GEX/tcell_gex_cd8a.parquet"));
}

#[test]
fn compaction_and_invalidate_reread_the_color_map() {
    let warehouse = seeded();
    warehouse.write_raw("Color/tcell_colors.json", br#"{"Treg": "red"}"#);
    let engine = warehouse.engine();
    let treg = |engine: &Engine| {
        let colors = engine.query(&select_all()).unwrap().metadata.colors.unwrap();
        colors.get("Treg").cloned()
    };
    assert_eq!(treg(&engine).as_deref(), Some("red"));

    warehouse.write_raw("Color/tcell_colors.json", br#"{"Treg": "blue"}"#);
    assert_eq!(treg(&engine).as_deref(), Some("red"));
    completed(engine.compact(&tcell(), Domain::Gex).unwrap());
    assert_eq!(treg(&engine).as_deref(), Some("blue"));

    warehouse.write_raw("Color/tcell_colors.json", br#"{"Treg": "green"}"#);
    engine.invalidate(&tcell());
    let colors = engine.colors(&tcell(), false).unwrap();
    assert_eq!(colors.get("Treg").map(String::as_str), Some("green"));
}
