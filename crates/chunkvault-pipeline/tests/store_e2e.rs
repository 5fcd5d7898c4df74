//! End-to-end store scenarios: ingest, dedup classes, delta encoding,
//! capping, arrangement, elimination, and byte-exact restores.

use std::path::Path;

use bytes::Bytes;
use chunkvault_core::config::StoreConfig;
use chunkvault_pipeline::store::Store;
use chunkvault_store::layout::{count_cids, Layout};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("chunkvault=info")
        .try_init();
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn restore_to_vec(store: &Store, version: u64, dir: &Path) -> Vec<u8> {
    let out = dir.join(format!("restored_{}", version));
    store.restore(version, &out).unwrap();
    std::fs::read(&out).unwrap()
}

#[test]
fn single_version_all_unique_restores_byte_for_byte() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(StoreConfig::new(dir.path().join("store"))).unwrap();

    let data = random_bytes(1, 200 * 1024);
    let stats = store.ingest(Bytes::from(data.clone())).unwrap();

    assert_eq!(stats.version, 1);
    assert_eq!(stats.dedup.unique_chunks, stats.chunks);
    assert_eq!(stats.dedup.internal_chunks, 0);
    assert_eq!(stats.dedup.adjacent_chunks, 0);
    assert_eq!(stats.write.recipe_records, stats.chunks);
    assert!(stats.arrangement.is_none());

    assert_eq!(restore_to_vec(&store, 1, dir.path()), data);
}

#[test]
fn identical_second_version_is_pure_adjacent_dedup() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let mut store = Store::open(StoreConfig::new(&root)).unwrap();

    let data = random_bytes(2, 160 * 1024);
    store.ingest(Bytes::from(data.clone())).unwrap();
    let stats = store.ingest(Bytes::from(data.clone())).unwrap();

    // Every chunk points at the previous version; no new payload bytes.
    assert_eq!(stats.dedup.adjacent_chunks, stats.chunks);
    assert_eq!(stats.dedup.unique_chunks, 0);
    assert_eq!(stats.write.containers.containers, 0);

    // Arrangement kept everything active: the old category re-anchored
    // under the new layout, nothing archived.
    let layout = Layout::new(&root);
    assert!(count_cids(|cid| layout.active_container(1, 2, cid)) > 0);
    assert_eq!(count_cids(|cid| layout.active_container(1, 1, cid)), 0);
    assert_eq!(count_cids(|cid| layout.archived_container(1, 1, cid)), 0);

    assert_eq!(restore_to_vec(&store, 1, dir.path()), data);
    assert_eq!(restore_to_vec(&store, 2, dir.path()), data);
}

#[test]
fn disjoint_second_version_archives_the_first() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let mut store = Store::open(StoreConfig::new(&root)).unwrap();

    let v1 = random_bytes(3, 96 * 1024);
    let v2 = random_bytes(4, 96 * 1024);
    store.ingest(Bytes::from(v1.clone())).unwrap();
    let stats = store.ingest(Bytes::from(v2.clone())).unwrap();

    assert_eq!(stats.dedup.adjacent_chunks, 0);
    let arrangement = stats.arrangement.unwrap();
    assert!(arrangement.archived_chunks > 0);
    assert_eq!(arrangement.active_chunks, 0);

    // The first version's chunks now live only in archived volumes.
    let layout = Layout::new(&root);
    assert!(count_cids(|cid| layout.archived_container(1, 1, cid)) > 0);
    assert_eq!(count_cids(|cid| layout.active_container(1, 2, cid)), 0);

    assert_eq!(restore_to_vec(&store, 1, dir.path()), v1);
    assert_eq!(restore_to_vec(&store, 2, dir.path()), v2);
}

#[test]
fn similar_chunk_is_stored_as_a_delta() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(StoreConfig::new(dir.path().join("store"))).unwrap();

    // One 8 KiB chunk of zeros, then the same chunk with 16 bytes
    // flipped near the end: similar, not identical.
    let v1 = vec![0u8; 8192];
    let mut v2 = v1.clone();
    for b in v2[8000..8016].iter_mut() {
        *b = 0xff;
    }

    store.ingest(Bytes::from(v1.clone())).unwrap();
    let stats = store.ingest(Bytes::from(v2.clone())).unwrap();

    assert_eq!(stats.dedup.delta_chunks, 1);
    assert_eq!(stats.dedup.unique_chunks, 0);
    assert!(stats.dedup.delta_reduced_bytes > 0);

    assert_eq!(restore_to_vec(&store, 2, dir.path()), v2);
    assert_eq!(restore_to_vec(&store, 1, dir.path()), v1);
}

#[test]
fn cold_bases_are_capped_and_chunks_stay_unique() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");

    // One container per base chunk, so every base needs its own
    // container-granular prefetch.
    let mut config = StoreConfig::new(&root);
    config.container_size = 8192;
    config.capping_threshold = 10;

    let v1 = random_bytes(5, 800 * 1024);
    // Flip a few bytes once per 8 KiB stride: many chunks become similar
    // to their version-1 counterparts, each referencing a distinct base.
    let mut v2 = v1.clone();
    let mut offset = 4000;
    while offset + 16 < v2.len() {
        for b in v2[offset..offset + 16].iter_mut() {
            *b ^= 0x5a;
        }
        offset += 8192;
    }

    let mut store = Store::open(config.clone()).unwrap();
    store.ingest(Bytes::from(v1.clone())).unwrap();
    store.save().unwrap();
    drop(store);

    // Reopen so the base cache is cold: every delta intent needs a load,
    // and every base sees only one reference in the segment.
    let mut store = Store::open(config).unwrap();
    let stats = store.ingest(Bytes::from(v2.clone())).unwrap();

    assert_eq!(stats.dedup.delta_chunks, 0);
    assert!(stats.dedup.capping_rejects > 0);

    assert_eq!(restore_to_vec(&store, 1, dir.path()), v1);
    assert_eq!(restore_to_vec(&store, 2, dir.path()), v2);
}

#[test]
fn threshold_of_one_never_caps_and_loads_bases_from_disk() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let mut config = StoreConfig::new(&root);
    config.container_size = 8192;
    config.capping_threshold = 1;

    let v1 = random_bytes(20, 400 * 1024);
    let mut v2 = v1.clone();
    let mut offset = 4000;
    while offset + 16 < v2.len() {
        for b in v2[offset..offset + 16].iter_mut() {
            *b ^= 0x5a;
        }
        offset += 8192;
    }

    let mut store = Store::open(config.clone()).unwrap();
    store.ingest(Bytes::from(v1.clone())).unwrap();
    store.save().unwrap();
    drop(store);

    // Cold cache again, but a threshold of one accepts every base: the
    // miss path prefetches each base's container from disk.
    let mut store = Store::open(config).unwrap();
    let stats = store.ingest(Bytes::from(v2.clone())).unwrap();

    assert_eq!(stats.dedup.capping_rejects, 0);
    assert!(stats.dedup.delta_chunks > 0);
    assert!(stats.dedup.cache.loads > 0);

    assert_eq!(restore_to_vec(&store, 1, dir.path()), v1);
    assert_eq!(restore_to_vec(&store, 2, dir.path()), v2);
}

#[test]
fn retention_eliminates_the_oldest_version() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let mut config = StoreConfig::new(&root);
    config.retention = 3;
    let mut store = Store::open(config).unwrap();

    let common = random_bytes(6, 64 * 1024);
    let versions: Vec<Vec<u8>> = (0..4u64)
        .map(|i| {
            let mut data = common.clone();
            data.extend_from_slice(&random_bytes(100 + i, 32 * 1024));
            data
        })
        .collect();

    for (i, data) in versions.iter().enumerate() {
        let stats = store.ingest(Bytes::from(data.clone())).unwrap();
        assert_eq!(stats.eliminated, i == 3);
    }
    assert_eq!(store.total_versions(), 3);

    // Versions renumbered: old version 2 is now version 1.
    assert_eq!(restore_to_vec(&store, 1, dir.path()), versions[1]);
    assert_eq!(restore_to_vec(&store, 2, dir.path()), versions[2]);
    assert_eq!(restore_to_vec(&store, 3, dir.path()), versions[3]);
    assert!(store
        .restore(4, &dir.path().join("restored_gone"))
        .is_err());
}

#[test]
fn containers_roll_at_the_size_boundary() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let mut config = StoreConfig::new(&root);
    config.container_size = 32 * 1024;
    let mut store = Store::open(config).unwrap();

    let data = random_bytes(7, 200 * 1024);
    let stats = store.ingest(Bytes::from(data.clone())).unwrap();

    let layout = Layout::new(&root);
    let cids = count_cids(|cid| layout.active_container(1, 1, cid));
    assert!(stats.write.containers.containers >= 2);
    assert_eq!(cids, stats.write.containers.containers);

    assert_eq!(restore_to_vec(&store, 1, dir.path()), data);
}

#[test]
fn index_survives_save_and_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let config = StoreConfig::new(&root);

    let data = random_bytes(8, 128 * 1024);
    let mut store = Store::open(config.clone()).unwrap();
    store.ingest(Bytes::from(data.clone())).unwrap();
    store.save().unwrap();
    drop(store);

    let mut store = Store::open(config).unwrap();
    assert_eq!(store.total_versions(), 1);
    let stats = store.ingest(Bytes::from(data.clone())).unwrap();

    // The reloaded earlier generation still deduplicates everything.
    assert_eq!(stats.dedup.adjacent_chunks, stats.chunks);
    assert_eq!(stats.dedup.unique_chunks, 0);

    assert_eq!(restore_to_vec(&store, 1, dir.path()), data);
    assert_eq!(restore_to_vec(&store, 2, dir.path()), data);
}

#[test]
fn every_version_of_a_mutating_history_restores_exactly() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let mut config = StoreConfig::new(&root);
    config.retention = 10;
    let mut store = Store::open(config).unwrap();

    // A history that mixes carried-over, edited, and fresh regions.
    let mut rng = StdRng::seed_from_u64(9);
    let mut image = random_bytes(10, 256 * 1024);
    let mut versions = Vec::new();
    for round in 0..4u64 {
        // Edit a region in place.
        let at = (round as usize * 37 + 11) * 1024 % (image.len() - 2048);
        rng.fill_bytes(&mut image[at..at + 2048]);
        // Append fresh data.
        let mut fresh = vec![0u8; 16 * 1024];
        rng.fill_bytes(&mut fresh);
        image.extend_from_slice(&fresh);
        versions.push(image.clone());
        store.ingest(Bytes::from(image.clone())).unwrap();
    }

    for (i, expected) in versions.iter().enumerate() {
        let restored = restore_to_vec(&store, i as u64 + 1, dir.path());
        assert_eq!(&restored, expected, "version {} mismatch", i + 1);
    }
}

#[test]
fn empty_version_is_representable() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(StoreConfig::new(dir.path().join("store"))).unwrap();

    let data = random_bytes(11, 64 * 1024);
    store.ingest(Bytes::from(data.clone())).unwrap();
    let stats = store.ingest(Bytes::new()).unwrap();
    assert_eq!(stats.chunks, 0);

    assert_eq!(restore_to_vec(&store, 2, dir.path()), Vec::<u8>::new());
    assert_eq!(restore_to_vec(&store, 1, dir.path()), data);
}

#[test]
fn ingest_file_reads_the_input_from_disk() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(StoreConfig::new(dir.path().join("store"))).unwrap();

    let data = random_bytes(12, 96 * 1024);
    let input = dir.path().join("image.bin");
    std::fs::write(&input, &data).unwrap();

    let stats = store.ingest_file(&input).unwrap();
    assert_eq!(stats.version, 1);
    assert_eq!(restore_to_vec(&store, 1, dir.path()), data);
}

#[test]
fn restore_of_an_unknown_version_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path().join("store"))).unwrap();
    assert!(store.restore(1, &dir.path().join("nothing")).is_err());
    assert!(store.restore(0, &dir.path().join("nothing")).is_err());
}
