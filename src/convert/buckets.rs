//! Tag indexing and the dedicated/remainder bucket partition.
//!
//! During ingestion every tagged entity is appended to the member list of
//! its `(key, value)` pair. After the stream is consumed each key's
//! values are partitioned by population: values above the threshold get
//! their own quadtree file, everything else merges into one remainder
//! bucket that carries a value per item.

use rustc_hash::FxHashMap;

/// Per-kind map of tag key to value to member list.
#[derive(Debug)]
pub struct TagIndex<T> {
    keys: FxHashMap<String, FxHashMap<String, Vec<T>>>,
}

impl<T> Default for TagIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TagIndex<T> {
    pub fn new() -> Self {
        Self {
            keys: FxHashMap::default(),
        }
    }

    /// Append `member` to the bucket of `(key, value)`.
    pub fn insert(&mut self, key: &str, value: &str, member: T) {
        self.keys
            .entry(key.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .push(member);
    }

    /// Number of distinct tag keys seen.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Partition every key's values into dedicated buckets and one
    /// remainder bucket.
    ///
    /// A value whose member list is larger than `dedicated_threshold`
    /// gets its own bucket; all others merge into the remainder as
    /// `(value, member)` pairs. Keys and values are emitted in sorted
    /// order, so the partition is a pure function of the index contents.
    pub fn into_partitions(self, dedicated_threshold: usize) -> Vec<KeyPartition<T>> {
        let mut partitions: Vec<KeyPartition<T>> = self
            .keys
            .into_iter()
            .map(|(key, values)| {
                let mut values: Vec<(String, Vec<T>)> = values.into_iter().collect();
                values.sort_by(|a, b| a.0.cmp(&b.0));
                let mut dedicated = Vec::new();
                let mut remainder = Vec::new();
                for (value, members) in values {
                    if members.len() > dedicated_threshold {
                        dedicated.push((value, members));
                    } else {
                        for member in members {
                            remainder.push((value.clone(), member));
                        }
                    }
                }
                KeyPartition {
                    key,
                    dedicated,
                    remainder,
                }
            })
            .collect();
        partitions.sort_by(|a, b| a.key.cmp(&b.key));
        partitions
    }
}

/// The buckets of one tag key.
#[derive(Debug)]
pub struct KeyPartition<T> {
    pub key: String,
    /// Values populous enough for their own quadtree file, sorted.
    pub dedicated: Vec<(String, Vec<T>)>,
    /// Everything else, merged, each member paired with its value.
    pub remainder: Vec<(String, T)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_index(threshold: usize) -> Vec<KeyPartition<u32>> {
        let mut index = TagIndex::new();
        for member in 0..10 {
            index.insert("highway", "residential", member);
        }
        index.insert("highway", "service", 100);
        index.insert("highway", "track", 101);
        index.insert("surface", "gravel", 200);
        index.into_partitions(threshold)
    }

    #[test]
    fn test_partition_by_population() {
        let partitions = build_index(5);
        assert_eq!(partitions.len(), 2);

        let highway = &partitions[0];
        assert_eq!(highway.key, "highway");
        assert_eq!(highway.dedicated.len(), 1);
        assert_eq!(highway.dedicated[0].0, "residential");
        assert_eq!(highway.dedicated[0].1.len(), 10);
        assert_eq!(
            highway.remainder,
            vec![("service".to_string(), 100), ("track".to_string(), 101)]
        );

        let surface = &partitions[1];
        assert_eq!(surface.key, "surface");
        assert!(surface.dedicated.is_empty());
        assert_eq!(surface.remainder, vec![("gravel".to_string(), 200)]);
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        // Exactly threshold-many members stay in the remainder.
        let partitions = build_index(10);
        let highway = &partitions[0];
        assert!(highway.dedicated.is_empty());
        assert_eq!(highway.remainder.len(), 12);
    }

    #[test]
    fn test_partition_is_deterministic() {
        let first = build_index(5);
        let second = build_index(5);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.key, b.key);
            assert_eq!(a.dedicated, b.dedicated);
            assert_eq!(a.remainder, b.remainder);
        }
    }
}
