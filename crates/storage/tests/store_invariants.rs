#![forbid(unsafe_code)]

use engram_core::IdCategory;
use engram_storage::{DispatchState, StateStore};
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("engram_store_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn id_ranges_stay_disjoint_across_reopen() {
    let dir = temp_dir("ids_across_reopen");

    let first = {
        let mut store = StateStore::open(&dir).expect("open store");
        store
            .reserve_ids(IdCategory::Concept, 4)
            .expect("first reservation")
    };

    // Simulated crash: drop and reopen the store file.
    let second = {
        let mut store = StateStore::open(&dir).expect("reopen store");
        store
            .reserve_ids(IdCategory::Concept, 3)
            .expect("second reservation")
    };

    assert_eq!(first.end, second.start, "ranges must be adjacent, never overlapping");
    assert!(second.start > first.start);
}

#[test]
fn counter_floor_survives_reopen() {
    let dir = temp_dir("floor_across_reopen");
    {
        let mut store = StateStore::open(&dir).expect("open store");
        store
            .bump_counter_floor(IdCategory::Epistemic, 40)
            .expect("floor");
    }
    let mut store = StateStore::open(&dir).expect("reopen store");
    let range = store
        .reserve_ids(IdCategory::Epistemic, 1)
        .expect("reserve after floor");
    assert_eq!(range.formatted(), vec!["E040"]);
}

#[test]
fn crash_between_stale_and_commit_is_recoverable() {
    let dir = temp_dir("crash_stale_commit");

    let dispatch_id = {
        let mut store = StateStore::open(&dir).expect("open store");
        let id = store
            .dispatch_begin(1, "fold", Some("in.md"), Some("p.txt"))
            .expect("begin");
        store
            .dispatch_set_state(id, DispatchState::Dispatched, None)
            .expect("dispatched");
        store
            .dispatch_set_state(id, DispatchState::Validated, None)
            .expect("validated");
        // Crash-safe ordering: stale flag goes durable before `committed`.
        store.mark_l0_stale().expect("mark stale");
        // Crash here — `committed` never recorded.
        id
    };

    let mut store = StateStore::open(&dir).expect("reopen after crash");
    assert!(store.l0_stale().expect("stale flag survived"));

    let to_recover = store.recover_on_startup().expect("recover");
    assert_eq!(to_recover.len(), 1);
    assert_eq!(to_recover[0].id, dispatch_id);
    assert_eq!(to_recover[0].state, DispatchState::Validated);

    // Recovery completes the transition; the flag is already set.
    store.mark_l0_stale().expect("idempotent re-mark");
    store
        .dispatch_set_state(dispatch_id, DispatchState::Committed, None)
        .expect("committed");
    let row = store
        .dispatch_get(dispatch_id)
        .expect("get")
        .expect("row exists");
    assert_eq!(row.state, DispatchState::Committed);
    assert!(store.l0_stale().expect("staleness set on committed record"));
}

#[test]
fn buffer_consumption_is_serializable_with_totals() {
    let dir = temp_dir("buffer_totals");
    let mut store = StateStore::open(&dir).expect("open store");

    for (path, chars, date) in [
        ("a.md", 10, "2026-01-01"),
        ("b.md", 20, "2026-01-02"),
        ("c.md", 30, "2026-01-03"),
    ] {
        store
            .buffer_append(
                path,
                engram_storage::ItemKind::Doc,
                chars,
                Some(date),
                None,
                None,
            )
            .expect("append");
    }
    assert_eq!(store.buffer_chars().expect("total"), 60);

    let items = store.buffer_items().expect("items");
    let ids: Vec<i64> = items.iter().take(2).map(|i| i.id).collect();
    let consumed = store.buffer_consume(&ids).expect("consume");
    assert_eq!(consumed.len(), 2);
    assert_eq!(store.buffer_chars().expect("total after consume"), 30);
}
