//! Per-collection sequence tracking.
//!
//! Each collection owns a tracker that follows the committed sequence of its
//! backing key-store. The tracker distinguishes changes made by this
//! database handle (reported while its transaction is open) from external
//! changes committed by sibling handles on the same physical file.

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct TrackerState {
    in_transaction: bool,
    changed_in_transaction: bool,
    last_sequence: u64,
    external_sequence: u64,
}

/// Tracks committed sequences for one key-store.
#[derive(Debug)]
pub struct SequenceTracker {
    store_name: String,
    state: Mutex<TrackerState>,
}

impl SequenceTracker {
    /// Creates a tracker for the named key-store, seeded with its current
    /// last sequence.
    #[must_use]
    pub fn new(store_name: impl Into<String>, last_sequence: u64) -> Self {
        Self {
            store_name: store_name.into(),
            state: Mutex::new(TrackerState {
                last_sequence,
                ..TrackerState::default()
            }),
        }
    }

    /// Name of the tracked key-store.
    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// The latest committed sequence this tracker has observed, from either
    /// the owning handle or an external one.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        let state = self.state.lock();
        state.last_sequence.max(state.external_sequence)
    }

    /// Called when the owning database's transaction begins.
    pub fn begin_transaction(&self) {
        let mut state = self.state.lock();
        state.in_transaction = true;
        state.changed_in_transaction = false;
    }

    /// Records a document mutation made inside the open transaction.
    pub fn document_changed(&self) {
        let mut state = self.state.lock();
        if state.in_transaction {
            state.changed_in_transaction = true;
        }
    }

    /// Whether the open transaction mutated this store.
    #[must_use]
    pub fn changed_during_transaction(&self) -> bool {
        self.state.lock().changed_in_transaction
    }

    /// Called when the owning database's transaction ends.
    ///
    /// `store_last_sequence` is the key-store's sequence after the commit
    /// (or abort) took effect; mutations become visible only on commit.
    pub fn end_transaction(&self, committed: bool, store_last_sequence: u64) {
        let mut state = self.state.lock();
        if committed && state.changed_in_transaction {
            state.last_sequence = state.last_sequence.max(store_last_sequence);
        }
        state.in_transaction = false;
        state.changed_in_transaction = false;
    }

    /// Records a commit made by a sibling handle on the same physical file.
    ///
    /// May be called from an arbitrary thread.
    pub fn add_external_transaction(&self, last_sequence: u64) {
        let mut state = self.state.lock();
        state.external_sequence = state.external_sequence.max(last_sequence);
    }
}
