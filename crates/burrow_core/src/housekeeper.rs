//! Document-expiration housekeeping.
//!
//! Each collection with expiring documents runs one housekeeper: a worker
//! thread that sleeps until the earliest expiration and then purges expired
//! documents in a transaction of its own. The worker holds only a weak
//! reference to its collection, so it dies quietly when the collection (or
//! database) goes away.

use crate::collection::Collection;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Idle wait when no expiration is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct HkState {
    stop: bool,
    /// Earliest expiration reported since the last scheduling pass.
    poke: Option<u64>,
}

struct Shared {
    state: Mutex<HkState>,
    cv: Condvar,
}

/// Expiration worker for one collection.
pub(crate) struct Housekeeper {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    /// Spawns the worker.
    pub(crate) fn start(collection: Weak<Collection>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(HkState::default()),
            cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("burrow-housekeeper".into())
            .spawn(move || run(&worker_shared, &collection))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Wakes the worker because a document's expiration moved earlier.
    pub(crate) fn document_expiration_changed(&self, when: u64) {
        let mut state = self.shared.state.lock();
        state.poke = Some(state.poke.map_or(when, |p| p.min(when)));
        drop(state);
        self.shared.cv.notify_one();
    }

    /// Stops the worker and joins it.
    pub(crate) fn stop(mut self) {
        self.shared.state.lock().stop = true;
        self.shared.cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: &Shared, collection: &Weak<Collection>) {
    debug!("housekeeper started");
    loop {
        let next = {
            let Some(coll) = collection.upgrade() else { break };
            coll.next_expiration().unwrap_or_default()
        };

        let mut state = shared.state.lock();
        if state.stop {
            break;
        }
        let next = match (next, state.poke.take()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let wait = match next {
            Some(at) => Duration::from_millis(at.saturating_sub(now_millis())),
            None => IDLE_WAIT,
        };
        if !wait.is_zero() {
            let _ = shared.cv.wait_for(&mut state, wait.min(IDLE_WAIT));
            if state.stop {
                break;
            }
            drop(state);
            continue; // re-derive the deadline; a poke may have moved it
        }
        drop(state);

        let Some(coll) = collection.upgrade() else { break };
        if let Err(e) = coll.purge_expired() {
            warn!(error = %e, "expiration purge failed");
            // Back off instead of spinning on a persistent error.
            let mut state = shared.state.lock();
            if state.stop {
                break;
            }
            let _ = shared
                .cv
                .wait_for(&mut state, Duration::from_millis(250));
        }
    }
    debug!("housekeeper stopped");
}
