//! Stress tests for the transaction store.
//!
//! These runs check behavior under heavy load and concurrent access.

use mvtx_core::{CoreError, CoreResult, TransactionStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MAP: &str = "stress";
const ACCOUNTS: &str = "accounts";

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Number of distinct keys.
    pub key_count: usize,
    /// Length of stored text values.
    pub value_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            key_count: 1_000,
            value_size: 64,
        }
    }
}

fn value_of(config: &StressConfig, i: usize) -> String {
    let mut value = format!("{i}:");
    value.extend(std::iter::repeat('x').take(config.value_size.saturating_sub(value.len())));
    value
}

fn key_of(config: &StressConfig, i: usize) -> i64 {
    (i % config.key_count.max(1)) as i64
}

fn populate(ts: &Arc<TransactionStore>, config: &StressConfig) -> CoreResult<()> {
    let tx = ts.begin()?;
    let map = tx.open_map::<i64, String>(MAP)?;
    for i in 0..config.key_count {
        map.put(key_of(config, i), value_of(config, i))?;
    }
    tx.commit()
}

/// Run a sequential write stress test, one transaction per write.
pub fn stress_sequential_writes(ts: &Arc<TransactionStore>, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let result = (|| -> CoreResult<()> {
            let tx = ts.begin()?;
            tx.open_map::<i64, String>(MAP)?
                .put(key_of(config, i), value_of(config, i))?;
            tx.commit()
        })();

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a mixed put/remove/read stress test inside a few long
/// transactions, with savepoints rolled back along the way.
pub fn stress_mixed_operations(ts: &Arc<TransactionStore>, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    let per_tx = 100usize;
    for batch in 0..config.operations.div_ceil(per_tx) {
        let result = (|| -> CoreResult<usize> {
            let tx = ts.begin()?;
            let map = tx.open_map::<i64, String>(MAP)?;
            let savepoint = tx.set_savepoint();
            let mut done = 0;
            for i in batch * per_tx..((batch + 1) * per_tx).min(config.operations) {
                let key = key_of(config, i);
                match i % 3 {
                    0 => {
                        map.put(key, value_of(config, i))?;
                    }
                    1 => {
                        map.get(&key)?;
                    }
                    _ => {
                        map.remove(&key)?;
                    }
                }
                done += 1;
            }
            if batch % 4 == 3 {
                tx.rollback_to_savepoint(savepoint)?;
            }
            tx.commit()?;
            Ok(done)
        })();

        match result {
            Ok(done) => successful += done,
            Err(_) => failed += per_tx,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a concurrent read stress test over committed data while a writer
/// keeps an uncommitted version of every key.
pub fn stress_concurrent_reads(ts: Arc<TransactionStore>, config: &StressConfig) -> StressTestResult {
    if populate(&ts, config).is_err() {
        return StressTestResult::new(0, config.operations, Duration::ZERO);
    }

    // hold tentative values the readers must never see
    let writer = ts.begin().and_then(|tx| {
        let map = tx.open_map::<i64, String>(MAP)?;
        for i in 0..config.key_count {
            map.put(key_of(config, i), String::new())?;
        }
        Ok(tx)
    });

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let ts = Arc::clone(&ts);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();

            thread::spawn(move || {
                let Ok(tx) = ts.begin() else {
                    failed.fetch_add(ops_per_thread, Ordering::Relaxed);
                    return;
                };
                let Ok(map) = tx.open_map::<i64, String>(MAP) else {
                    failed.fetch_add(ops_per_thread, Ordering::Relaxed);
                    return;
                };
                for i in 0..ops_per_thread {
                    let idx = (t * ops_per_thread + i) % config.key_count.max(1);
                    match map.get(&key_of(&config, idx)) {
                        Ok(Some(value)) if value == value_of(&config, idx) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                let _ = tx.commit();
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    if let Ok(tx) = writer {
        let _ = tx.rollback();
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Outcome of [`stress_bank_transfers`].
#[derive(Debug, Clone)]
pub struct TransferResult {
    /// Transfers attempted and how they ended.
    pub stats: StressTestResult,
    /// Transfers aborted by deadlock detection.
    pub deadlocks: usize,
    /// Sum of all balances before the run.
    pub expected_total: i64,
    /// Sum of all balances after the run.
    pub actual_total: i64,
}

/// Moves money between `key_count` accounts from `threads` threads.
///
/// Each transfer locks both accounts in random order, so transfers
/// deadlock; the victim rolls back. The total balance must not change.
///
/// # Errors
///
/// Fails if the accounts cannot be set up or summed afterwards.
pub fn stress_bank_transfers(
    ts: Arc<TransactionStore>,
    config: &StressConfig,
) -> CoreResult<TransferResult> {
    const INITIAL: i64 = 1_000;
    let accounts = config.key_count.max(2);
    let expected_total = INITIAL * accounts as i64;
    let tx = ts.begin()?;
    let map = tx.open_map::<i64, i64>(ACCOUNTS)?;
    for a in 0..accounts as i64 {
        map.put(a, INITIAL)?;
    }
    tx.commit()?;

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let deadlocks = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let ts = Arc::clone(&ts);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let deadlocks = Arc::clone(&deadlocks);

            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let accounts = accounts as i64;
                for _ in 0..ops_per_thread {
                    let from = rng.gen_range(0..accounts);
                    let to = (from + rng.gen_range(1..accounts)) % accounts;
                    let amount = rng.gen_range(0..50);
                    match transfer(&ts, from, to, amount) {
                        Ok(()) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(CoreError::Deadlock { .. }) => {
                            deadlocks.fetch_add(1, Ordering::Relaxed);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    let stats = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );

    let tx = ts.begin()?;
    let map = tx.open_map::<i64, i64>(ACCOUNTS)?;
    let mut actual_total = 0;
    for entry in map.iter() {
        actual_total += entry?.1;
    }
    tx.commit()?;

    Ok(TransferResult {
        stats,
        deadlocks: deadlocks.load(Ordering::Relaxed),
        expected_total,
        actual_total,
    })
}

fn transfer(ts: &Arc<TransactionStore>, from: i64, to: i64, amount: i64) -> CoreResult<()> {
    let tx = ts.begin()?;
    let result = (|| -> CoreResult<()> {
        let map = tx.open_map::<i64, i64>(ACCOUNTS)?;
        let balance = map.lock(&from)?.unwrap_or_default();
        // give the other side time to take its first lock
        thread::yield_now();
        map.compute_if_present(&to, |_, b| Some(b + amount))?;
        map.put(from, balance - amount)?;
        Ok(())
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            tx.rollback()?;
            Err(e)
        }
    }
}
