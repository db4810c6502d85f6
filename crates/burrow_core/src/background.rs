//! The background data-file wrapper.
//!
//! Live queries run on a second `DataFile` handle that shares the physical
//! file with the foreground handle, so query execution never blocks
//! foreground operations. The wrapper owns that handle behind a lock (the
//! "background-DB lock"), and relays storage commit notifications, which
//! arrive whenever the foreground handle commits, to registered
//! transaction observers.

use burrow_storage::{ChangedStore, CommitListener, DataFile};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Observer of transactions committed against the shared physical file.
pub trait TransactionObserver: Send + Sync {
    /// Called after a commit, on the committer's thread.
    fn transaction_committed(&self);
}

type Observers = Arc<Mutex<Vec<Weak<dyn TransactionObserver>>>>;

/// Relays storage commit notifications to transaction observers.
struct ObserverRelay {
    observers: Observers,
}

impl CommitListener for ObserverRelay {
    fn transaction_committed(&self, _changes: &[ChangedStore]) {
        let snapshot: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|w| w.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in snapshot {
            observer.transaction_committed();
        }
    }
}

/// Owns the background data-file handle and its lock.
pub struct BackgroundDb {
    data_file: Mutex<Option<Box<dyn DataFile>>>,
    observers: Observers,
    // Kept alive for the lifetime of the background handle; the data file
    // only holds a weak reference to registered listeners.
    _relay: Arc<ObserverRelay>,
}

impl BackgroundDb {
    pub(crate) fn new(data_file: Box<dyn DataFile>) -> Arc<Self> {
        let observers: Observers = Arc::new(Mutex::new(Vec::new()));
        let relay = Arc::new(ObserverRelay {
            observers: Arc::clone(&observers),
        });
        data_file.add_commit_listener(relay.clone());
        Arc::new(Self {
            data_file: Mutex::new(Some(data_file)),
            observers,
            _relay: relay,
        })
    }

    /// Runs `f` with the background data file held locked.
    ///
    /// The handle is `None` after [`close`](Self::close). State that must be
    /// consistent with in-progress background work (such as a live querier's
    /// stopping flag) is read and written only inside this lock.
    pub fn use_locked<T>(&self, f: impl FnOnce(Option<&dyn DataFile>) -> T) -> T {
        let guard = self.data_file.lock();
        f(guard.as_deref())
    }

    /// Registers a transaction observer.
    pub fn add_transaction_observer(&self, observer: &Arc<dyn TransactionObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    /// Removes a transaction observer (matched by identity).
    pub fn remove_transaction_observer(&self, observer: &Arc<dyn TransactionObserver>) {
        self.observers.lock().retain(|w| {
            w.upgrade()
                .map_or(false, |live| !Arc::ptr_eq(&live, observer))
        });
    }

    /// Closes the background handle. Subsequent `use_locked` callers see
    /// `None`.
    pub fn close(&self) {
        let taken = self.data_file.lock().take();
        if let Some(df) = taken {
            let _ = df.close();
            debug!("closed background data file");
        }
    }
}
