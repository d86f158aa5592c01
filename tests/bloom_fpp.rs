use std::collections::HashSet;

use kmer_forge::utils::cgat::kmer_mask;
use kmer_forge::{BloomFilter, HashStrategy, KmerStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const K: usize = 25;
const STRATEGIES: [HashStrategy; 3] = [
    HashStrategy::TwoLongs,
    HashStrategy::Polynomial,
    HashStrategy::Tabulation,
];

fn random_kmers(rng: &mut StdRng, n: usize) -> HashSet<u64> {
    let mut kmers = HashSet::with_capacity(n);
    while kmers.len() < n {
        kmers.insert(rng.random::<u64>() & kmer_mask(K));
    }
    kmers
}

fn check_strategy(strategy: HashStrategy) {
    let mut rng = StdRng::seed_from_u64(0x6b6d_6572);
    let inserted = random_kmers(&mut rng, 20_000);

    let mut bloom = BloomFilter::new(K, inserted.len() as u64, 0.01, strategy).unwrap();
    for &kmer in &inserted {
        bloom.put_packed(kmer);
    }
    assert!(inserted.iter().all(|&kmer| bloom.contains_packed(kmer)));

    let samples = 100_000;
    let mut false_positives = 0;
    let mut tested = 0;
    while tested < samples {
        let kmer = rng.random::<u64>() & kmer_mask(K);
        if inserted.contains(&kmer) {
            continue;
        }
        tested += 1;
        if bloom.contains_packed(kmer) {
            false_positives += 1;
        }
    }
    let rate = false_positives as f64 / samples as f64;
    assert!(rate < 0.02, "{strategy:?}: false positive rate {rate}");
    assert!(bloom.estimated_fpp() < 0.02);
}

#[test]
fn two_longs_meets_target_rate() {
    check_strategy(HashStrategy::TwoLongs);
}

#[test]
fn polynomial_meets_target_rate() {
    check_strategy(HashStrategy::Polynomial);
}

#[test]
fn tabulation_meets_target_rate() {
    check_strategy(HashStrategy::Tabulation);
}

#[test]
fn filter_from_store_has_no_false_negatives() {
    let reference = b"GATTACAGATTACAGGCTTAACCGGTTAACGATCGATCGGATCCA";
    let k = 9;
    let mut store = KmerStore::new(k).unwrap();
    store.init_size(reference.len()).unwrap();
    for start in 0..=reference.len() - k {
        store.put(reference, start, 1u8).unwrap();
    }
    store.optimize().unwrap();

    for strategy in STRATEGIES {
        let bloom = BloomFilter::from_store(&store, 0.001, strategy).unwrap();
        for start in 0..=reference.len() - k {
            assert!(bloom.contains(reference, start, false));
        }
    }
}

#[test]
fn saved_filter_answers_identically() {
    let mut rng = StdRng::seed_from_u64(7);
    let inserted = random_kmers(&mut rng, 500);
    for strategy in STRATEGIES {
        let mut bloom = BloomFilter::new(K, 500, 0.05, strategy).unwrap();
        for &kmer in &inserted {
            bloom.put_packed(kmer);
        }
        let mut bytes = Vec::new();
        bloom.save(&mut bytes).unwrap();
        let loaded = BloomFilter::load(&bytes[..]).unwrap();
        assert_eq!(loaded.strategy(), strategy);
        assert_eq!(loaded.bit_size(), bloom.bit_size());
        for _ in 0..2_000 {
            let kmer = rng.random::<u64>() & kmer_mask(K);
            assert_eq!(loaded.contains_packed(kmer), bloom.contains_packed(kmer));
        }
    }
}
