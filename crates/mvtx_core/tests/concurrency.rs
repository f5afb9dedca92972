//! Multi-threaded behavior: lock waits, timeouts and deadlock detection.

use mvtx_core::{CoreError, MvStore, TransactionConfig, TransactionStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn open_store(config: TransactionConfig) -> Arc<TransactionStore> {
    let ts = TransactionStore::with_config(Arc::new(MvStore::in_memory()), config).unwrap();
    ts.init().unwrap();
    ts
}

#[test]
fn concurrent_update_without_wait_is_locked() {
    let ts = open_store(TransactionConfig::new().lock_timeout(Some(Duration::ZERO)));
    let tx1 = ts.begin().unwrap();
    let map1 = tx1.open_map::<String, i64>("data").unwrap();
    map1.put("1".to_string(), 10).unwrap();

    let tx2 = ts.begin().unwrap();
    let map2 = tx2.open_map::<String, i64>("data").unwrap();
    let err = map2.put("1".to_string(), 20).unwrap_err();
    assert!(matches!(err, CoreError::Locked { .. }));
    assert!(err.is_retryable());
    assert_eq!(map2.get(&"1".to_string()).unwrap(), None);

    tx1.commit().unwrap();
    assert_eq!(map2.get(&"1".to_string()).unwrap(), Some(10));
    assert_eq!(map2.put("1".to_string(), 20).unwrap(), Some(10));
    tx2.commit().unwrap();
}

#[test]
fn lock_timeout_elapses() {
    let ts = open_store(TransactionConfig::new().lock_timeout(Some(Duration::from_millis(50))));
    let holder = ts.begin().unwrap();
    holder.open_map::<i64, i64>("data").unwrap().put(1, 1).unwrap();

    let waiter = ts.begin().unwrap();
    let map = waiter.open_map::<i64, i64>("data").unwrap();
    let started = std::time::Instant::now();
    assert!(matches!(map.lock(&1), Err(CoreError::Locked { .. })));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn blocked_writer_proceeds_after_commit() {
    let ts = open_store(TransactionConfig::default());
    let holder = ts.begin().unwrap();
    let map = holder.open_map::<i64, i64>("data").unwrap();
    map.put(1, 1).unwrap();

    let waiter = {
        let ts = Arc::clone(&ts);
        thread::spawn(move || {
            let tx = ts.begin().unwrap();
            let map = tx.open_map::<i64, i64>("data").unwrap();
            let seen = map.put(1, 2).unwrap();
            tx.commit().unwrap();
            seen
        })
    };

    thread::sleep(Duration::from_millis(50));
    map.put(1, 5).unwrap();
    holder.commit().unwrap();
    assert_eq!(waiter.join().unwrap(), Some(5));

    let tx = ts.begin().unwrap();
    assert_eq!(tx.open_map::<i64, i64>("data").unwrap().get(&1).unwrap(), Some(2));
}

#[test]
fn blocked_writer_proceeds_after_savepoint_rollback() {
    let ts = open_store(TransactionConfig::default());
    let holder = ts.begin().unwrap();
    let map = holder.open_map::<i64, i64>("data").unwrap();
    let sp = holder.set_savepoint();
    map.put(1, 1).unwrap();

    let waiter = {
        let ts = Arc::clone(&ts);
        thread::spawn(move || {
            let tx = ts.begin().unwrap();
            let map = tx.open_map::<i64, i64>("data").unwrap();
            let seen = map.put(1, 2).unwrap();
            tx.commit().unwrap();
            seen
        })
    };

    thread::sleep(Duration::from_millis(50));
    holder.rollback_to_savepoint(sp).unwrap();
    assert_eq!(waiter.join().unwrap(), None);
    holder.commit().unwrap();
}

/// Each of `threads` transactions locks key `i`, then key `i + 1`,
/// closing one cycle.
fn deadlock_cycle(threads: usize) {
    let ts = open_store(TransactionConfig::new().lock_timeout(Some(Duration::from_secs(10))));
    let keys = threads as i64;
    let t = ts.begin().unwrap();
    let m = t.open_map::<i64, i64>("test").unwrap();
    for i in 0..keys {
        m.put(i, 0).unwrap();
    }
    t.commit().unwrap();

    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..keys)
        .map(|initial| {
            let ts = Arc::clone(&ts);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<(), CoreError> {
                let tx = ts.begin()?;
                let result = (|| -> Result<(), CoreError> {
                    let map = tx.open_map::<i64, i64>("test")?;
                    map.compute_if_present(&initial, |_, v| Some(v + 1))?;
                    barrier.wait();
                    let key = (initial + 1) % keys;
                    map.lock(&key)?;
                    let current = map.get(&key)?.unwrap_or_default();
                    map.put(key, current + 1)?;
                    Ok(())
                })();
                match result {
                    Ok(()) => tx.commit(),
                    Err(e) => {
                        tx.rollback()?;
                        Err(e)
                    }
                }
            })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        if let Err(e) = handle.join().unwrap() {
            assert!(matches!(e, CoreError::Deadlock { .. }), "{e}");
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    let t = ts.begin().unwrap();
    let m = t.open_map::<i64, i64>("test").unwrap();
    let mut count = 0;
    for i in 0..keys {
        count += m.get(&i).unwrap().expect("value present");
    }
    t.commit().unwrap();
    assert_eq!(count, 2 * (keys - failures));
    assert!(ts.get_open_transactions().is_empty());
}

#[test]
fn deadlock_between_two_fails_exactly_one() {
    deadlock_cycle(2);
}

#[test]
fn deadlock_among_three_fails_exactly_one() {
    deadlock_cycle(3);
}

#[test]
fn exactly_one_try_put_wins() {
    const THREADS: usize = 8;
    let ts = open_store(TransactionConfig::default());
    let barrier = Arc::new(Barrier::new(THREADS));
    let wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let ts = Arc::clone(&ts);
            let barrier = Arc::clone(&barrier);
            let wins = Arc::clone(&wins);
            thread::spawn(move || {
                let tx = ts.begin().unwrap();
                let map = tx.open_map::<String, i64>("data").unwrap();
                barrier.wait();
                if map.try_put("key".to_string(), i as i64).unwrap() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
                // keep holding until everyone has tried
                barrier.wait();
                tx.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(wins.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_add_and_remove_keep_the_map_consistent() {
    let ts = open_store(TransactionConfig::default());
    let tx = ts.begin().unwrap();
    let map = tx.open_map::<i64, i64>("data").unwrap();
    for i in 0..10 {
        map.put(i, i).unwrap();
    }
    tx.commit().unwrap();

    let handles: Vec<_> = (0..4i64)
        .map(|t| {
            let ts = Arc::clone(&ts);
            thread::spawn(move || {
                for round in 0..200i64 {
                    let tx = ts.begin().unwrap();
                    let map = tx.open_map::<i64, i64>("data").unwrap();
                    let key = (t * 31 + round) % 10;
                    if round % 2 == 0 {
                        map.remove(&key).unwrap();
                    } else {
                        map.put(key, round).unwrap();
                    }
                    if round % 3 == 0 {
                        tx.rollback().unwrap();
                    } else {
                        tx.commit().unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let tx = ts.begin().unwrap();
    let map = tx.open_map::<i64, i64>("data").unwrap();
    let keys: Vec<i64> = map.keys(None).collect::<Result<_, _>>().unwrap();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys.len(), map.size().unwrap());
    assert!(ts.get_open_transactions().len() == 1);
}

#[test]
fn readers_never_see_uncommitted_values() {
    let ts = open_store(TransactionConfig::default());
    let tx = ts.begin().unwrap();
    let map = tx.open_map::<i64, i64>("data").unwrap();
    for i in 0..32 {
        map.put(i, 0).unwrap();
    }
    tx.commit().unwrap();

    let writer = {
        let ts = Arc::clone(&ts);
        thread::spawn(move || {
            for _ in 0..50 {
                let tx = ts.begin().unwrap();
                let map = tx.open_map::<i64, i64>("data").unwrap();
                for i in 0..32 {
                    map.put(i, -1).unwrap();
                }
                tx.rollback().unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let ts = Arc::clone(&ts);
            thread::spawn(move || {
                for _ in 0..50 {
                    let tx = ts.begin().unwrap();
                    let map = tx.open_map::<i64, i64>("data").unwrap();
                    for entry in map.iter() {
                        let (_, value) = entry.unwrap();
                        assert_eq!(value, 0);
                    }
                    tx.commit().unwrap();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}
