//! Property tests for the cache manager under random operation sequences

use blade_cache::cache::{CacheConfig, CacheManager, ObjectHandle};
use blade_cache::error::CacheError;
use blade_cache::protocol::Key;
use proptest::prelude::*;

const CAPACITY: usize = 1024;
const MAX_OBJECT: usize = 512;

#[derive(Clone, Debug)]
enum Op {
    Put { key: u8, size: usize },
    Get { key: u8 },
    Release { slot: usize },
    Delete { key: u8 },
    EvictUntil { bytes: usize },
}

/// Strategy over a small key space so operations collide often
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8, 1usize..=MAX_OBJECT).prop_map(|(key, size)| Op::Put { key, size }),
        3 => (0u8..8).prop_map(|key| Op::Get { key }),
        3 => any::<usize>().prop_map(|slot| Op::Release { slot }),
        1 => (0u8..8).prop_map(|key| Op::Delete { key }),
        1 => (1usize..=CAPACITY).prop_map(|bytes| Op::EvictUntil { bytes }),
    ]
}

fn key(k: u8) -> Key {
    Key::new(format!("key-{}", k).as_bytes())
}

fn value(k: u8, version: u32, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (k as u32 ^ version).wrapping_add(i as u32) as u8)
        .collect()
}

fn check_invariants(cache: &CacheManager, held: &[(ObjectHandle, Vec<u8>)]) -> Result<(), TestCaseError> {
    let stats = cache.stats();
    prop_assert!(stats.stored_bytes <= stats.capacity);
    let arena = stats.arena.expect("arena stats");
    prop_assert_eq!(arena.used, stats.stored_bytes);
    prop_assert_eq!(stats.outstanding_leases, held.len());

    // Every leased version still holds exactly what was written
    for (handle, expected) in held {
        let bytes = cache.read(handle).expect("leased handle readable");
        prop_assert_eq!(&bytes[..], &expected[..]);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: capacity is never exceeded and leased data is never reclaimed.
    #[test]
    fn prop_leases_protect_data_under_pressure(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let cache = CacheManager::new(CacheConfig::with_capacity(CAPACITY, MAX_OBJECT)).unwrap();
        let mut current: Vec<Option<Vec<u8>>> = vec![None; 8];
        let mut held: Vec<(ObjectHandle, Vec<u8>)> = Vec::new();
        let mut version = 0u32;

        for op in ops {
            match op {
                Op::Put { key: k, size } => {
                    version += 1;
                    let data = value(k, version, size);
                    match cache.put(key(k), &data) {
                        Ok(()) => {
                            // Round trip straight after a successful put
                            let handle = cache.get(&key(k)).unwrap();
                            prop_assert_eq!(&cache.read(&handle).unwrap()[..], &data[..]);
                            cache.release_lease(&handle.key, handle.lease).unwrap();
                            current[k as usize] = Some(data);
                        }
                        Err(CacheError::Conflict) | Err(CacheError::OutOfSpace { .. }) => {}
                        Err(e) => prop_assert!(false, "unexpected put error: {}", e),
                    }
                }
                Op::Get { key: k } => match cache.get(&key(k)) {
                    Ok(handle) => {
                        let expected = current[k as usize].clone().expect("present key has a value");
                        held.push((handle, expected));
                    }
                    Err(CacheError::NotFound) => {}
                    Err(e) => prop_assert!(false, "unexpected get error: {}", e),
                },
                Op::Release { slot } => {
                    if !held.is_empty() {
                        let (handle, _) = held.swap_remove(slot % held.len());
                        cache.release_lease(&handle.key, handle.lease).unwrap();
                    }
                }
                Op::Delete { key: k } => {
                    let _ = cache.delete(&key(k));
                    current[k as usize] = None;
                }
                Op::EvictUntil { bytes } => match cache.evict_until(bytes) {
                    Ok(_) | Err(CacheError::OutOfSpace { .. }) => {}
                    Err(e) => prop_assert!(false, "unexpected eviction error: {}", e),
                },
            }

            // Evicted keys drop out of the model
            for (k, slot) in current.iter_mut().enumerate() {
                if !cache.contains(&key(k as u8)) {
                    *slot = None;
                }
            }
            check_invariants(&cache, &held)?;
        }

        for (handle, _) in held.drain(..) {
            cache.release_lease(&handle.key, handle.lease).unwrap();
        }
        let stats = cache.stats();
        prop_assert_eq!(stats.outstanding_leases, 0);
        prop_assert_eq!(stats.draining_entries, 0);
        prop_assert_eq!(stats.pending_deletes, 0);
        let live: usize = (0..8u8).filter_map(|k| cache.object_size(&key(k)).ok()).sum();
        prop_assert_eq!(stats.stored_bytes, live);
    }

    /// Property: a rejected put leaves the previous version untouched.
    #[test]
    fn prop_oversized_put_keeps_old_value(size in (MAX_OBJECT + 1)..(2 * MAX_OBJECT)) {
        let cache = CacheManager::new(CacheConfig::with_capacity(CAPACITY, MAX_OBJECT)).unwrap();
        cache.put(key(0), b"original").unwrap();

        let result = cache.put(key(0), &vec![7u8; size]);
        prop_assert!(matches!(result, Err(CacheError::InvalidSize(_))));

        let handle = cache.get(&key(0)).unwrap();
        prop_assert_eq!(&cache.read(&handle).unwrap()[..], &b"original"[..]);
        cache.release_lease(&handle.key, handle.lease).unwrap();
    }
}
