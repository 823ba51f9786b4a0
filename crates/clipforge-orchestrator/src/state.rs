//! Shared in-memory ledger with write-through persistence.

use clipforge_core::{BatchError, EventBus, JobEvent, Ledger, LedgerStore, PersistenceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The working copy of the ledger.
///
/// Every mutation goes through [`LedgerState::transact`], which holds one
/// lock for the mutation, the write to the store and the emission of the
/// resulting events. Writes and events are therefore causally ordered.
pub struct LedgerState {
    ledger: Mutex<Ledger>,
    store: Arc<dyn LedgerStore>,
    events: Arc<EventBus>,
    failed_writes: AtomicUsize,
}

impl LedgerState {
    /// Loads the ledger from `store`.
    ///
    /// Jobs interrupted by a previous process come back as pending.
    pub fn load(store: Arc<dyn LedgerStore>, events: Arc<EventBus>) -> Result<Self, PersistenceError> {
        let ledger = store.load()?;
        debug!(store = %store.describe(), jobs = ledger.len(), "Ledger state loaded");
        Ok(Self { ledger: Mutex::new(ledger), store, events, failed_writes: AtomicUsize::new(0) })
    }

    /// Event bus this state publishes to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Applies `mutate`, persists, then publishes the events it produced.
    ///
    /// Nothing is persisted or published when `mutate` fails; `mutate` must
    /// leave the ledger untouched in that case.
    pub async fn transact<T>(
        &self,
        mutate: impl FnOnce(&mut Ledger, &mut Vec<JobEvent>) -> Result<T, BatchError>,
    ) -> Result<T, BatchError> {
        let mut ledger = self.ledger.lock().await;
        let mut events = Vec::new();
        let value = mutate(&mut ledger, &mut events)?;

        self.persist(&ledger);
        for event in events {
            self.events.emit(event);
        }
        Ok(value)
    }

    /// Runs `read` against the current ledger.
    pub async fn read<T>(&self, read: impl FnOnce(&Ledger) -> T) -> T {
        let ledger = self.ledger.lock().await;
        read(&ledger)
    }

    /// Writes the current ledger to the store.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let ledger = self.ledger.lock().await;
        self.store.save(&ledger)
    }

    /// Ledger writes that failed even after the retry.
    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }

    fn persist(&self, ledger: &Ledger) {
        let Err(first) = self.store.save(ledger) else {
            return;
        };
        debug!(error = %first, "Ledger write failed, retrying once");
        if let Err(e) = self.store.save(ledger) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            warn!(store = %self.store.describe(), error = %e, "Ledger write failed, continuing in memory");
            self.events.emit(JobEvent::PersistenceDegraded { error: e.to_string() });
        }
    }
}

impl std::fmt::Debug for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerState")
            .field("store", &self.store.describe())
            .field("failed_writes", &self.failed_writes())
            .finish_non_exhaustive()
    }
}
