//! Wait-for graph used to park blocked writers and detect deadlocks.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{trace, warn};

/// Edges `waiter -> holder` for every transaction currently parked on a
/// lock, plus the condition variable used to wake them.
///
/// A waiter holds at most one edge, inserted just before it parks and
/// removed when it wakes, so the graph only ever describes live waits.
#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    edges: Mutex<HashMap<TransactionId, TransactionId>>,
    released: Condvar,
}

fn closes_cycle(edges: &HashMap<TransactionId, TransactionId>, start: TransactionId) -> bool {
    let mut current = start;
    for _ in 0..edges.len() {
        match edges.get(&current) {
            Some(&next) if next == start => return true,
            Some(&next) => current = next,
            None => return false,
        }
    }
    false
}

impl WaitForGraph {
    /// Parks `waiter` for at most `slice` while `holder` keeps its lock.
    ///
    /// `holder_active` is evaluated under the graph mutex; if the holder
    /// already ended, the call returns at once.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Deadlock`] if the wait would close a cycle.
    pub(crate) fn wait(
        &self,
        waiter: TransactionId,
        holder: TransactionId,
        slice: Duration,
        holder_active: impl FnOnce() -> bool,
    ) -> CoreResult<()> {
        let mut edges = self.edges.lock();
        edges.insert(waiter, holder);
        if closes_cycle(&edges, waiter) {
            edges.remove(&waiter);
            warn!(%waiter, %holder, "deadlock detected");
            return Err(CoreError::Deadlock {
                transaction_id: waiter,
                blocker: holder,
            });
        }
        if holder_active() {
            trace!(%waiter, %holder, "waiting for lock");
            self.released.wait_for(&mut edges, slice);
        }
        edges.remove(&waiter);
        Ok(())
    }

    /// Drops every edge pointing at `finished` and wakes all waiters.
    pub(crate) fn release(&self, finished: TransactionId) {
        let mut edges = self.edges.lock();
        edges.retain(|_, holder| *holder != finished);
        edges.remove(&finished);
        drop(edges);
        self.released.notify_all();
    }

    /// Wakes all waiters so they re-read the keys they wait for.
    pub(crate) fn notify(&self) {
        let _edges = self.edges.lock();
        self.released.notify_all();
    }

    #[cfg(test)]
    fn edge_count(&self) -> usize {
        self.edges.lock().len()
    }
}
