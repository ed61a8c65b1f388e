//! End-to-end scenarios against the public `Database`/`Table` surface.

use common::EngineConfig;
use db::Database;
use engine::METADATA_COLUMNS;
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};

fn small_config() -> EngineConfig {
    EngineConfig::builder()
        .page_size(64) // 8 records/page
        .buffer_pool_frames(256)
        .base_pages_per_range(2)
        .merge_tail_page_threshold(4)
        .build()
}

#[test]
fn scenario_insert_then_select_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new();
    db.open(dir.path(), small_config()).unwrap();
    let t = db.create_table("grades", 5, 0);

    let rid = t.insert_base_record(&[Some(1), Some(90), Some(80), Some(70), Some(60)]).unwrap();
    let row = t.read_latest_record(rid).unwrap().unwrap();
    assert_eq!(row[METADATA_COLUMNS..], [Some(1), Some(90), Some(80), Some(70), Some(60)]);
}

#[test]
fn scenario_duplicate_insert_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new();
    db.open(dir.path(), small_config()).unwrap();
    let t = db.create_table("grades", 3, 0);

    t.insert_base_record(&[Some(1), Some(1), Some(1)]).unwrap();
    let err = t.insert_base_record(&[Some(1), Some(2), Some(2)]).unwrap_err();
    assert!(matches!(err, common::DbError::Constraint(_)));
}

#[test]
fn scenario_update_primary_key_row_and_read_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new();
    db.open(dir.path(), small_config()).unwrap();
    let t = db.create_table("grades", 3, 0);

    let rid = t.insert_base_record(&[Some(1), Some(10), Some(20)]).unwrap();
    t.append_tail_record(&[None, Some(11), None], rid).unwrap();
    t.append_tail_record(&[None, None, Some(21)], rid).unwrap();

    let latest = t.read_latest_record(rid).unwrap().unwrap();
    assert_eq!(latest[METADATA_COLUMNS..], [Some(1), Some(11), Some(21)]);

    let one_back = t.read_latest_record_modified(rid, -1).unwrap().unwrap();
    assert_eq!(one_back[METADATA_COLUMNS..], [Some(1), Some(11), Some(20)]);

    let original = t.read_latest_record_modified(rid, -2).unwrap().unwrap();
    assert_eq!(original[METADATA_COLUMNS..], [Some(1), Some(10), Some(20)]);
}

#[test]
fn scenario_bulk_insert_and_range_sum() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new();
    db.open(dir.path(), small_config()).unwrap();
    let t = db.create_table("grades", 2, 0);

    for key in 0..50 {
        t.insert_base_record(&[Some(key), Some(key * 2)]).unwrap();
    }

    let mut sum = 0i64;
    for key in 10..20 {
        let rid = match t.locate(0, key).unwrap() {
            engine::Located::Single(Some(rid)) => rid,
            other => panic!("expected single rid for key {key}, got {other:?}"),
        };
        let row = t.read_latest_record(rid).unwrap().unwrap();
        sum += row[METADATA_COLUMNS + 1].unwrap();
    }
    assert_eq!(sum, (10..20).map(|k| k * 2).sum::<i64>());
}

#[test]
fn scenario_nine_updates_then_merge_and_historical_read() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::builder()
        .page_size(64)
        .buffer_pool_frames(256)
        .base_pages_per_range(2)
        .merge_tail_page_threshold(1)
        .build();
    let mut db = Database::new();
    db.open(dir.path(), config).unwrap();
    let t = db.create_table("grades", 2, 0);

    let rid = t.insert_base_record(&[Some(1), Some(0)]).unwrap();
    for version in 1..=9 {
        t.append_tail_record(&[None, Some(version)], rid).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let row = t.read_latest_record(rid).unwrap().unwrap();
        if row[METADATA_COLUMNS + 1] == Some(9) {
            break;
        }
        assert!(Instant::now() < deadline, "background merge never converged");
        std::thread::sleep(Duration::from_millis(20));
    }

    let original = t.read_latest_record_modified(rid, -9).unwrap().unwrap();
    assert_eq!(original[METADATA_COLUMNS..], [Some(1), Some(0)]);

    t.shutdown();
}

#[test]
fn scenario_insert_update_delete_clears_every_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new();
    db.open(dir.path(), small_config()).unwrap();
    let t = db.create_table("grades", 3, 0);

    let rid = t.insert_base_record(&[Some(1), Some(10), Some(20)]).unwrap();
    t.append_tail_record(&[None, Some(11), None], rid).unwrap();
    t.create_index(2).unwrap();

    assert_eq!(t.locate(0, 1), Some(engine::Located::Single(Some(rid))));
    assert_eq!(t.locate(2, 20), Some(engine::Located::Many(vec![rid])));

    t.delete_record(rid).unwrap();

    assert_eq!(t.locate(0, 1), Some(engine::Located::Single(None)));
    assert_eq!(t.locate(2, 20), Some(engine::Located::Many(vec![])));
    assert!(t.read_latest_record(rid).unwrap().is_none());
    assert!(!t.get_base_rids().contains(&rid));
}
