use kbloom_lib::builder::chunk::split_chunks;
use kbloom_lib::kmer::{canonical, encode_kmer, reverse_complement};
use kbloom_lib::{
    build_partial, canonical_kmer, merge, BloomFilter, BuildConfiguration, CanonicalKmers, FilterBuilder,
    FilterParams,
};
use proptest::prelude::*;

fn revcomp_text(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_canonical_is_strand_independent(
        kmer in prop::collection::vec(prop::sample::select(b"ACGTacgt".to_vec()), 1..=32)
    ) {
        let rc = revcomp_text(&kmer);
        prop_assert_eq!(canonical_kmer(&kmer).unwrap(), canonical_kmer(&rc).unwrap());

        let k = kmer.len();
        let code = encode_kmer(&kmer).unwrap();
        prop_assert_eq!(reverse_complement(code, k), encode_kmer(&rc).unwrap());
        prop_assert_eq!(canonical(code, k), canonical(reverse_complement(code, k), k));
    }

    #[test]
    fn prop_sequence_and_its_reverse_complement_share_kmers(
        k in 1usize..=16,
        seq in prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..200)
    ) {
        let mut fwd: Vec<u64> = CanonicalKmers::new(&seq, k).unwrap().map(|h| h.code).collect();
        let mut rev: Vec<u64> = CanonicalKmers::new(&revcomp_text(&seq), k).unwrap().map(|h| h.code).collect();
        fwd.sort_unstable();
        rev.sort_unstable();
        prop_assert_eq!(fwd, rev);
    }

    #[test]
    fn prop_no_false_negatives(
        k in 1usize..=32,
        num_bits in 1u64..4096,
        num_hashes in 1usize..=8,
        seed in any::<u64>(),
        seq in prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..300)
    ) {
        let params = FilterParams::new(k, num_bits, num_hashes, seed).unwrap();
        let mut filter = BloomFilter::new(&params).unwrap();
        filter.insert_sequence(&seq);
        for hit in CanonicalKmers::new(&seq, k).unwrap() {
            prop_assert!(filter.contains(hit.code));
        }
    }

    #[test]
    fn prop_partial_merge_equals_serial_build(
        k in 1usize..=12,
        chunk_size in prop_oneof![1usize..64, (usize::MAX - 64)..=usize::MAX],
        seq in prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..400)
    ) {
        let params = FilterParams::new(k, 997, 3, 11).unwrap();

        let mut serial = BloomFilter::new(&params).unwrap();
        serial.insert_sequence(&seq);

        let mut merged = BloomFilter::new(&params).unwrap();
        for chunk in split_chunks(&seq, k, chunk_size) {
            merged = merge(merged, &build_partial(chunk, &params).unwrap()).unwrap();
        }

        prop_assert_eq!(merged.as_bytes(), serial.as_bytes());
        prop_assert_eq!(merged.num_inserted(), serial.num_inserted());
    }

    #[test]
    fn prop_builder_keeps_every_kmer_for_any_chunk_size(
        k in 1usize..=16,
        threads in 1usize..=4,
        chunk_size in prop_oneof![1usize..32, 32usize..100_000, (usize::MAX - 64)..=usize::MAX],
        records in prop::collection::vec(
            prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..150),
            1..5
        )
    ) {
        let config = BuildConfiguration::new(k)
            .unwrap()
            .with_explicit_size(2048, 3)
            .with_threads(threads)
            .with_chunk_size(chunk_size);
        let filter = FilterBuilder::new(config).unwrap().build_from_sequences(&records).unwrap();

        let mut expected = 0u64;
        for record in &records {
            for hit in CanonicalKmers::new(record, k).unwrap() {
                prop_assert!(filter.contains(hit.code));
                expected += 1;
            }
        }
        prop_assert_eq!(filter.num_inserted(), expected);
    }

    #[test]
    fn prop_merge_is_commutative(
        a in prop::collection::vec(any::<u64>(), 0..50),
        b in prop::collection::vec(any::<u64>(), 0..50)
    ) {
        let params = FilterParams::new(31, 512, 4, 3).unwrap();
        let mut fa = BloomFilter::new(&params).unwrap();
        let mut fb = BloomFilter::new(&params).unwrap();
        a.iter().for_each(|&key| fa.insert(key));
        b.iter().for_each(|&key| fb.insert(key));

        let ab = merge(fa.clone(), &fb).unwrap();
        let ba = merge(fb, &fa).unwrap();
        prop_assert_eq!(ab, ba);
    }
}
