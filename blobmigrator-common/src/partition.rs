use sha2::{Digest, Sha256};

/// One of `count` disjoint slices of an id keyspace.
///
/// Assignment hashes the id, so every id belongs to exactly one shard and the
/// split does not depend on listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    /// All partitions of a keyspace split `count` ways. A count of zero is
    /// treated as one.
    pub fn all(count: u32) -> Vec<Partition> {
        let count = count.max(1);
        (0..count).map(|index| Partition { index, count }).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        shard_of(id, self.count) == self.index
    }
}

/// Shard index for an id: first 8 bytes of SHA-256, modulo `count`.
pub fn shard_of(id: &str, count: u32) -> u32 {
    if count <= 1 {
        return 0;
    }
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(count)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_id_in_exactly_one_partition() {
        let parts = Partition::all(16);
        for i in 0..500 {
            let id = format!("blob-{}", i);
            let owners = parts.iter().filter(|p| p.contains(&id)).count();
            assert_eq!(owners, 1, "id {}", id);
        }
    }

    #[test]
    fn test_assignment_is_stable() {
        assert_eq!(shard_of("abc", 16), shard_of("abc", 16));
        assert_eq!(shard_of("abc", 1), 0);
        assert_eq!(shard_of("abc", 0), 0);
    }

    #[test]
    fn test_zero_count_means_one() {
        let parts = Partition::all(0);
        assert_eq!(parts, vec![Partition { index: 0, count: 1 }]);
        assert!(parts[0].contains("anything"));
    }

    #[test]
    fn test_spread_over_shards() {
        let mut seen = [false; 4];
        for i in 0..200 {
            seen[shard_of(&format!("id{}", i), 4) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
