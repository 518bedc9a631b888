//! Deterministic row -> cluster sharding.

use md5::{Digest, Md5};

/// Index of the cluster owning a row: the two 64-bit halves of the row
/// name's MD5 digest XORed together, modulo the number of clusters. A pure
/// function of the row and the cluster count.
pub(crate) fn cluster_index(row: &str, num_clusters: usize) -> usize {
    if num_clusters <= 1 {
        return 0;
    }

    let digest = Md5::digest(row.as_bytes());
    let hi = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    let lo = u64::from_be_bytes(digest[8..16].try_into().unwrap());
    ((hi ^ lo) % num_clusters as u64) as usize
}

#[cfg(test)]
mod sharding_tests {
    use super::*;

    #[test]
    fn deterministic() {
        for row in ["row1", "abc", "0", "99", ""] {
            assert_eq!(cluster_index(row, 4), cluster_index(row, 4));
        }
    }

    #[test]
    fn single_cluster_short_circuits() {
        assert_eq!(cluster_index("anything", 1), 0);
    }

    #[test]
    fn always_in_range() {
        for i in 0..100 {
            let row = format!("{}", i);
            for n in 1..8usize {
                assert!(cluster_index(&row, n) < n);
            }
        }
    }

    #[test]
    fn spreads_rows_across_clusters() {
        let mut counts = [0usize; 2];
        for i in 0..100 {
            counts[cluster_index(&format!("{}", i), 2)] += 1;
        }
        // 100 distinct rows must not all land on one side
        assert!(counts[0] > 0 && counts[1] > 0);
        assert_eq!(counts[0] + counts[1], 100);
    }
}
