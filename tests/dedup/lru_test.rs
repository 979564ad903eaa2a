// LRU Cache Tests
// Capacity bound and insertion-order eviction under arbitrary workloads

use blemesh::dedup::LruCache;
use proptest::prelude::*;
use std::collections::VecDeque;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u8>().prop_map(|k| Op::Insert(k % 32)),
        1 => any::<u8>().prop_map(|k| Op::Remove(k % 32)),
    ]
}

proptest! {
    /// The cache always matches a simple reference model: at most `capacity`
    /// keys, evicting the key whose latest insert is oldest
    #[test]
    fn prop_matches_reference_model(capacity in 1usize..12, ops in proptest::collection::vec(op(), 0..200)) {
        let mut cache = LruCache::new(capacity);
        let mut model: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                Op::Insert(k) => {
                    if let Some(pos) = model.iter().position(|m| *m == k) {
                        model.remove(pos);
                    } else if model.len() == capacity {
                        model.pop_front();
                    }
                    model.push_back(k);
                    cache.insert(k, u32::from(k) * 10);
                }
                Op::Remove(k) => {
                    if let Some(pos) = model.iter().position(|m| *m == k) {
                        model.remove(pos);
                    }
                    cache.remove(&k);
                }
            }
            prop_assert!(cache.len() <= capacity);
        }

        let keys: Vec<u8> = cache.keys().copied().collect();
        prop_assert_eq!(keys, model.iter().copied().collect::<Vec<_>>());
        for k in &model {
            prop_assert_eq!(cache.get(k), Some(&(u32::from(*k) * 10)));
        }
    }
}

#[test]
fn test_evicted_entry_is_returned() {
    let mut cache = LruCache::new(2);
    assert_eq!(cache.insert("a", 1), None);
    assert_eq!(cache.insert("b", 2), None);
    assert_eq!(cache.insert("c", 3), Some(("a", 1)));
    assert_eq!(cache.evictions(), 1);
    assert!(!cache.contains(&"a"));
}

#[test]
fn test_reinsert_refreshes_position() {
    let mut cache = LruCache::new(2);
    cache.insert(1, ());
    cache.insert(2, ());
    cache.insert(1, ());
    cache.insert(3, ());
    assert!(cache.contains(&1));
    assert!(!cache.contains(&2));
}

#[test]
fn test_tombstones_are_compacted() {
    let mut cache = LruCache::new(4).with_compaction_threshold(3);
    for _ in 0..10 {
        cache.insert(1, ());
    }
    assert!(cache.tombstones() <= 3);
    assert!(cache.compactions() > 0);
    assert_eq!(cache.len(), 1);
}
