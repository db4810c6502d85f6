//! Live queries.
//!
//! A [`LiveQuerier`] is a single-consumer actor: one worker thread owns all
//! querier state and external callers communicate through an enqueued
//! message channel. Queries are compiled and run against the database's
//! background data-file handle, so foreground writes are never blocked by
//! query execution.
//!
//! Re-runs are debounced adaptively: when commits arrive in rapid
//! succession they are coalesced behind a long delay, while an isolated
//! commit after a quiet interval triggers an immediate re-run.

use crate::background::{BackgroundDb, TransactionObserver};
use crate::database::Database;
use crate::error::{Error, Result};
use burrow_storage::{Query, QueryEnumerator, QueryLanguage, QueryOptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Threshold for rapidity of database changes. If it has been at least this
/// long since the previous change, the query re-runs after the short delay;
/// otherwise the long delay coalesces the burst.
const RAPID_CHANGES: Duration = Duration::from_millis(250);

const SHORT_DELAY: Duration = Duration::ZERO;
const LONG_DELAY: Duration = Duration::from_millis(500);

/// Receiver of live-query results.
pub trait LiveQuerierDelegate: Send + Sync {
    /// Called with a fresh result snapshot, or with the error that the run
    /// produced. Never called when a re-run yields unchanged results in
    /// continuous mode.
    fn live_query_updated(&self, result: Option<Arc<QueryEnumerator>>, error: Option<Error>);
}

enum Message {
    Start { options: QueryOptions },
    DbChanged { when: Instant },
    Stop,
}

struct Inner {
    background: Arc<BackgroundDb>,
    expression: String,
    language: QueryLanguage,
    continuous: bool,
    delegate: Weak<dyn LiveQuerierDelegate>,
    sender: Mutex<Sender<Message>>,
    /// Written and read only while holding the background-DB lock, which
    /// gives `stop()` a happens-before edge with the visibility check in a
    /// run already in progress.
    stopping: AtomicBool,
}

impl TransactionObserver for Inner {
    fn transaction_committed(&self) {
        let _ = self.sender.lock().send(Message::DbChanged {
            when: Instant::now(),
        });
    }
}

/// A background query that tracks its results over time.
pub struct LiveQuerier {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LiveQuerier {
    /// Creates a querier for `expression` on the database's background
    /// handle.
    ///
    /// The query itself is compiled lazily on the worker thread the first
    /// time it runs. With `continuous`, the querier observes transaction
    /// commits and re-runs automatically until stopped.
    pub fn new(
        db: &Arc<Database>,
        expression: &str,
        language: QueryLanguage,
        continuous: bool,
        delegate: Weak<dyn LiveQuerierDelegate>,
    ) -> Result<Self> {
        let background = db.background_db()?;
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            background,
            expression: expression.to_string(),
            language,
            continuous,
            delegate,
            sender: Mutex::new(sender),
            stopping: AtomicBool::new(false),
        });
        info!(query = expression, continuous, "created live querier");

        let actor_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("burrow-live-query".into())
            .spawn(move || Actor::new(actor_inner).run(&receiver))
            .map_err(Error::Io)?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Starts (or restarts) query execution with the given options.
    pub fn start(&self, options: QueryOptions) {
        self.inner.stopping.store(false, Ordering::SeqCst);
        let _ = self.inner.sender.lock().send(Message::Start { options });
    }

    /// Notifies the querier that a transaction committed.
    ///
    /// Called from the foreground commit path (directly or via the
    /// background handle's transaction observer).
    pub fn transaction_committed(&self) {
        self.inner.transaction_committed();
    }

    /// Stops the querier.
    ///
    /// Idempotent and cooperative: a run already in progress completes its
    /// critical section but suppresses its delegate callback.
    pub fn stop(&self) {
        debug!(query = %self.inner.expression, "stopping live querier");
        // Set the flag under the background-DB lock so an in-progress run
        // cannot observe a stale value (see Inner::stopping).
        self.inner.background.use_locked(|_| {
            self.inner.stopping.store(true, Ordering::SeqCst);
        });
        let _ = self.inner.sender.lock().send(Message::Stop);
    }
}

impl Drop for LiveQuerier {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Actor (single-threaded)

struct Actor {
    inner: Arc<Inner>,
    query: Option<Box<dyn Query>>,
    current: Option<Arc<QueryEnumerator>>,
    last_time: Instant,
    waiting_to_run: bool,
    scheduled: Option<(Instant, QueryOptions)>,
}

impl Actor {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            query: None,
            current: None,
            last_time: Instant::now(),
            waiting_to_run: false,
            scheduled: None,
        }
    }

    fn run(mut self, receiver: &Receiver<Message>) {
        loop {
            // Fire a due scheduled run; otherwise wait for the next message
            // (bounded by the scheduled deadline, if any).
            let message = if let Some((due, _)) = self.scheduled {
                let now = Instant::now();
                if due <= now {
                    let (_, options) = self.scheduled.take().expect("scheduled run present");
                    self.run_query(options);
                    continue;
                }
                match receiver.recv_timeout(due - now) {
                    Ok(m) => m,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match receiver.recv() {
                    Ok(m) => m,
                    Err(_) => break,
                }
            };

            match message {
                Message::Start { options } => {
                    self.last_time = Instant::now();
                    self.run_query(options);
                }
                Message::DbChanged { when } => self.db_changed(when),
                Message::Stop => {
                    self.handle_stop();
                    break;
                }
            }
        }
        debug!("live querier actor exited");
    }

    fn db_changed(&mut self, when: Instant) {
        // The change timestamp advances even when this call does nothing
        // else; a burst that straddles a pending run then still counts as
        // rapid on the next change processed.
        let idle = when.saturating_duration_since(self.last_time);
        self.last_time = when;

        // Nothing to do if a run is already pending, we were told to stop,
        // or the query has not produced an initial result yet.
        if self.waiting_to_run
            || self.inner.stopping.load(Ordering::SeqCst)
            || self.current.is_none()
        {
            return;
        }

        let delay = if idle <= RAPID_CHANGES {
            LONG_DELAY
        } else {
            SHORT_DELAY
        };
        debug!(?idle, ?delay, "database changed; scheduling re-run");
        let options = self
            .current
            .as_ref()
            .map(|qe| qe.options().clone())
            .unwrap_or_default();
        self.scheduled = Some((Instant::now() + delay, options));
        self.waiting_to_run = true;
    }

    fn run_query(&mut self, options: QueryOptions) {
        self.waiting_to_run = false;

        let inner = Arc::clone(&self.inner);
        let mut query = self.query.take();
        let mut new_qe: Option<QueryEnumerator> = None;
        let mut error: Option<Error> = None;
        let mut suppressed = false;

        inner.background.use_locked(|df| {
            if inner.stopping.load(Ordering::SeqCst) {
                suppressed = true;
                return;
            }
            let Some(df) = df else {
                error = Some(Error::NotOpen);
                return;
            };
            if query.is_none() {
                match df.compile_query(&inner.expression, inner.language) {
                    Ok(compiled) => {
                        query = Some(compiled);
                        if inner.continuous {
                            let observer: Arc<dyn TransactionObserver> =
                                Arc::clone(&inner) as Arc<dyn TransactionObserver>;
                            inner.background.add_transaction_observer(&observer);
                        }
                    }
                    Err(e) => {
                        error = Some(e.into());
                        return;
                    }
                }
            }
            if let Some(q) = query.as_deref() {
                match q.create_enumerator(&options) {
                    Ok(qe) => new_qe = Some(qe),
                    Err(e) => error = Some(e.into()),
                }
            }
        });
        self.query = query;

        if suppressed {
            return;
        }
        if let Some(e) = &error {
            warn!(query = %self.inner.expression, error = %e, "query run failed");
        }

        let result = if self.inner.continuous {
            match new_qe {
                Some(qe) => {
                    let qe = Arc::new(qe);
                    if let Some(current) = &self.current {
                        if !current.obsoleted_by(&qe) {
                            debug!(
                                sequence = qe.last_sequence(),
                                "results unchanged; delegate not called"
                            );
                            return;
                        }
                    }
                    debug!(sequence = qe.last_sequence(), "results changed");
                    self.current = Some(Arc::clone(&qe));
                    Some(qe)
                }
                None => None,
            }
        } else {
            new_qe.map(Arc::new)
        };

        if self.inner.stopping.load(Ordering::SeqCst) {
            return;
        }
        if let Some(delegate) = self.inner.delegate.upgrade() {
            delegate.live_query_updated(result, error);
        }
    }

    fn handle_stop(&mut self) {
        self.inner.background.use_locked(|_| {
            self.query = None;
            self.current = None;
            if self.inner.continuous {
                let observer: Arc<dyn TransactionObserver> =
                    Arc::clone(&self.inner) as Arc<dyn TransactionObserver>;
                self.inner.background.remove_transaction_observer(&observer);
            }
        });
        debug!("live querier stopped");
    }
}
