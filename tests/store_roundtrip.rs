use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use kmer_forge::{KmerStore, StoreError};
use proptest::prelude::*;
use tempfile::NamedTempFile;

fn build(k: usize, seqs: &[(&[u8], u32)]) -> KmerStore<u32> {
    let mut store = KmerStore::new(k).unwrap();
    let windows = seqs.iter().map(|(s, _)| s.len().saturating_sub(k - 1)).sum();
    store.init_size(windows).unwrap();
    for &(seq, taxon) in seqs {
        for start in 0..seq.len().saturating_sub(k - 1) {
            let _ = store.put(seq, start, taxon);
        }
    }
    store.optimize().unwrap();
    store
}

#[test]
fn saved_store_loads_identically() {
    let store = build(
        11,
        &[
            (b"ACGTTGCAAGGCTTAGGCATCGANNNCGATTAGCCATG", 562),
            (b"TTGACCAGGATTACAGGACT", 9606),
        ],
    );

    let file = NamedTempFile::new().unwrap();
    {
        let mut out = BufWriter::new(File::create(file.path()).unwrap());
        store.save(&mut out).unwrap();
        out.flush().unwrap();
    }
    let loaded: KmerStore<u32> =
        KmerStore::load(BufReader::new(File::open(file.path()).unwrap())).unwrap();

    assert_eq!(loaded.k(), 11);
    assert_eq!(loaded.len(), store.len());
    assert_eq!(loaded.values(), store.values());

    let original: Vec<(u64, u32)> = store.iter().map(|(k, v)| (k, *v)).collect();
    let mut reloaded = Vec::new();
    loaded.visit(|k, v| reloaded.push((k, *v)));
    assert_eq!(original, reloaded);

    let window = b"GGCTTAGGCAT";
    assert_eq!(loaded.get(window, 0, false), Some(&562));
    assert_eq!(loaded.get(window, 0, false), store.get(window, 0, false));
    assert_eq!(loaded.get(b"TTGACCAGGAT", 0, false), Some(&9606));
    assert_eq!(loaded.get(b"CCCCCCCCCCC", 0, false), None);
}

#[test]
fn corrupt_files_are_rejected() {
    let store = build(5, &[(b"ACGTACGGT", 1)]);
    let mut bytes = Vec::new();
    store.save(&mut bytes).unwrap();

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(matches!(
        KmerStore::<u32>::load(&bad_magic[..]),
        Err(StoreError::Format(_))
    ));

    let truncated = &bytes[..bytes.len() / 2];
    assert!(KmerStore::<u32>::load(truncated).is_err());
}

#[test]
fn store_lifecycle_errors() {
    let mut store: KmerStore<u32> = KmerStore::new(4).unwrap();
    assert!(matches!(store.put(b"ACGT", 0, 1), Err(StoreError::NotInitialized)));
    store.init_size(1).unwrap();
    assert!(matches!(store.init_size(1), Err(StoreError::AlreadyInitialized)));
    assert!(matches!(store.put(b"ACNT", 0, 1), Err(StoreError::Kmer(_))));
    assert!(store.put(b"ACGT", 0, 1).unwrap());
    assert!(!store.put(b"ACGT", 0, 2).unwrap());
    assert!(matches!(
        store.put(b"CCCC", 0, 3),
        Err(StoreError::CapacityExceeded(_))
    ));

    store.optimize().unwrap();
    store.optimize().unwrap();
    assert_eq!(store.get(b"ACGT", 0, false), Some(&2));
    assert!(matches!(store.put(b"ACGT", 0, 1), Err(StoreError::AlreadyOptimized)));
    assert!(KmerStore::<u32>::new(33).is_err());
}

proptest! {
    #[test]
    fn optimized_store_answers_like_a_map(
        entries in prop::collection::vec((any::<u64>(), 0u32..8), 0..300),
    ) {
        let k = 20;
        let mask = (1u64 << (2 * k)) - 1;
        let mut store = KmerStore::new(k).unwrap();
        store.init_size(entries.len()).unwrap();
        let mut expected = std::collections::BTreeMap::new();
        for &(kmer, value) in &entries {
            store.put_packed(kmer & mask, value).unwrap();
            expected.insert(kmer & mask, value);
        }
        store.optimize().unwrap();

        prop_assert_eq!(store.len(), expected.len());
        let walked: Vec<(u64, u32)> = store.iter().map(|(k, v)| (k, *v)).collect();
        let wanted: Vec<(u64, u32)> = expected.into_iter().collect();
        prop_assert_eq!(walked, wanted);
    }
}
