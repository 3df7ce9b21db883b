use rand::seq::SliceRandom;
use std::sync::Arc;
use std::thread;
use weak_cache::{GrowableCache, Tracked};

fn tracked<V>(value: V) -> Arc<Tracked<V>> {
    Arc::new(Tracked::new(value))
}

#[test]
fn unbounded_keeps_every_live_value() {
    let cache = GrowableCache::<u64, u64>::new(0, 0);
    let values: Vec<_> = (0..1000).map(tracked).collect();
    for (k, v) in values.iter().enumerate() {
        cache.put(&(k as u64), v);
    }

    assert_eq!(cache.len(), 1000);
    for k in 0..1000 {
        assert_eq!(cache.get(&k), Some(k));
    }
}

#[test]
fn default_is_unbounded() {
    let cache: GrowableCache<u64, u64> = GrowableCache::default();
    assert_eq!(cache.capacity(), 0);
    assert!(cache.is_empty());
}

#[test]
fn overwrite() {
    let cache = GrowableCache::<&str, &str>::new(4, 0);
    let first = tracked("first");
    let second = tracked("second");
    cache.put("k", &first);
    cache.put("k", &second);
    assert_eq!(cache.get("k"), Some("second"));
    assert_eq!(cache.len(), 1);

    drop(second);
    assert_eq!(cache.get("k"), None);
    assert!(cache.is_empty());
}

#[test]
fn get_arc_shares_the_value() {
    let cache = GrowableCache::<u32, String>::new(0, 0);
    let value = tracked(String::from("shared"));
    cache.put(&1, &value);
    let found = cache.get_arc(&1).unwrap();
    assert!(Arc::ptr_eq(&found, &value));
    assert_eq!(found.as_str(), "shared");
}

#[test]
fn missing_key() {
    let cache = GrowableCache::<u32, u32>::new(0, 0);
    assert_eq!(cache.get(&1), None);
    let value = tracked(1);
    cache.put(&1, &value);
    assert_eq!(cache.get(&2), None);
}

#[test]
fn bounded_never_exceeds_max_size() {
    let cache = GrowableCache::<u32, u32>::new(0, 8);
    let values: Vec<_> = (0..100).map(tracked).collect();
    for (k, v) in values.iter().enumerate() {
        cache.put(&(k as u32), v);
        assert!(cache.len() <= 8);
        // the latest write always survives its own insertion
        assert_eq!(cache.get(&(k as u32)), Some(k as u32));
    }
    assert_eq!(cache.len(), 8);
}

#[test]
fn dropped_values_free_room_before_eviction() {
    let cache = GrowableCache::<u32, u32>::new(0, 4);
    let keep: Vec<_> = (0..3).map(tracked).collect();
    for (k, v) in keep.iter().enumerate() {
        cache.put(&(k as u32), v);
    }
    let temporary = tracked(100);
    cache.put(&100, &temporary);
    drop(temporary);

    // the slot freed by `temporary` is reused, so none of the live entries is evicted
    let last = tracked(200);
    cache.put(&200, &last);
    assert_eq!(cache.len(), 4);
    for k in 0..3 {
        assert_eq!(cache.get(&k), Some(k));
    }
    assert_eq!(cache.get(&200), Some(200));
}

#[test]
fn concurrent_drops() {
    let threads = num_cpus::get().clamp(2, 8);
    let cache = Arc::new(GrowableCache::<u64, u64>::new(0, 0));

    let mut values: Vec<_> = (0..(threads as u64 * 64)).map(tracked).collect();
    for v in &values {
        cache.put(&***v, v);
    }
    assert_eq!(cache.len(), values.len());

    values.shuffle(&mut rand::thread_rng());
    let chunks: Vec<Vec<_>> = values.chunks(64).map(|c| c.to_vec()).collect();
    drop(values);

    let mut handles = Vec::new();
    for chunk in chunks {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            for v in chunk {
                let key = **v;
                assert_eq!(cache.get(&key), Some(key));
                drop(v);
                assert_eq!(cache.get(&key), None);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("failed to join thread");
    }

    assert!(cache.is_empty());
}

#[test]
fn concurrent_puts_and_gets() {
    let threads = num_cpus::get().clamp(2, 8);
    let cache = Arc::new(GrowableCache::<u64, (u64, u64)>::new(0, 32));

    let mut handles = Vec::new();
    for t in 0..threads as u64 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let mut alive = Vec::new();
            for i in 0..500u64 {
                let key = i % 48;
                let value = tracked((key, t));
                cache.put(&key, &value);
                if i % 3 == 0 {
                    alive.push(value);
                }
                if let Some((found, _)) = cache.get(&key) {
                    assert_eq!(found, key);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("failed to join thread");
    }
    assert!(cache.len() <= 32);
}

#[test]
fn debug() {
    let cache = GrowableCache::<u32, u32>::new(0, 16);
    let value = tracked(1);
    cache.put(&1, &value);
    let formatted = format!("{:?}", cache);
    assert!(formatted.starts_with("GrowableCache"));
    assert!(formatted.contains("live: 1"));
}
