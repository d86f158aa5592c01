use kmer_forge::CgatRingBuffer;
use kmer_forge::utils::cgat::{
    pack_forward, pack_reverse_complement, reverse_complement, reverse_complement_packed, unpack,
};
use proptest::prelude::*;

fn cgat(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"CGATcgat".to_vec()), len)
}

proptest! {
    #[test]
    fn packing_is_lossless(seq in cgat(1..33)) {
        let k = seq.len();
        let kmer = pack_forward(&seq, 0, k).unwrap();
        prop_assert_eq!(unpack(kmer, k), seq.to_ascii_uppercase());
    }

    #[test]
    fn reverse_complement_is_symmetric(seq in cgat(1..33)) {
        let k = seq.len();
        let fwd = pack_forward(&seq, 0, k).unwrap();
        let rev = pack_reverse_complement(&seq, 0, k).unwrap();
        prop_assert_eq!(reverse_complement_packed(fwd, k), rev);
        prop_assert_eq!(reverse_complement_packed(rev, k), fwd);
        prop_assert_eq!(pack_forward(&reverse_complement(&seq), 0, k).unwrap(), rev);
    }

    #[test]
    fn ring_buffer_tracks_direct_packing(
        k in 1usize..=32,
        seq in prop::collection::vec(prop::sample::select(b"CGATN".to_vec()), 0..200),
    ) {
        let mut ring = CgatRingBuffer::new(k, -1);
        let mut run = 0usize;
        for (i, &b) in seq.iter().enumerate() {
            if ring.push(b).is_err() {
                run = 0;
                prop_assert!(!ring.is_filled());
                continue;
            }
            run += 1;
            prop_assert_eq!(ring.is_filled(), run >= k);
            if ring.is_filled() {
                let start = i + 1 - k;
                prop_assert_eq!(ring.kmer(), pack_forward(&seq, start, k).unwrap());
                let rev = pack_reverse_complement(&seq, start, k).unwrap();
                prop_assert_eq!(ring.reverse_kmer(), rev);
            }
        }
    }
}

#[test]
fn longest_kmer_uses_all_bits() {
    let seq = [b'T'; 32];
    let kmer = pack_forward(&seq, 0, 32).unwrap();
    assert_eq!(kmer, u64::MAX);
    assert_eq!(
        pack_reverse_complement(&seq, 0, 32).unwrap(),
        0xAAAA_AAAA_AAAA_AAAA
    );
}
