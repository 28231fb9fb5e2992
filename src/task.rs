//! Drivers that carry submitted hosts to a terminal state.
//!
//! [`Driver::Polling`] steps the host on the calling thread until it
//! resolves or fails. [`Driver::Background`] owns a thread that re-drives
//! every pending cache entry on a fixed delay; blocking callers park on a
//! per-host [`Completion`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cache::{CacheStore, HostKey, Request, Status};
use crate::config::TaskConfig;
use crate::error::{ResolverError, Result};
use crate::resolver::Shared;

/// Longest wait on the submission semaphore while nothing is in flight.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Slice a blocked caller waits before re-checking that the driver is alive.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Waiting,
    Done,
    Abandoned,
}

/// One-shot completion flag shared by every caller waiting on a host.
#[derive(Debug)]
pub(crate) struct Completion {
    state: Mutex<Signal>,
    cv: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(Signal::Waiting),
            cv: Condvar::new(),
        }
    }

    /// A completion that has already fired.
    pub(crate) fn finished() -> Self {
        Self {
            state: Mutex::new(Signal::Done),
            cv: Condvar::new(),
        }
    }

    /// The host reached a terminal state.
    pub(crate) fn signal(&self) {
        self.set(Signal::Done);
    }

    /// The host was torn down before reaching a terminal state.
    pub(crate) fn abandon(&self) {
        self.set(Signal::Abandoned);
    }

    fn set(&self, to: Signal) {
        let mut state = self.state.lock();
        if *state == Signal::Waiting {
            *state = to;
        }
        self.cv.notify_all();
    }

    /// Blocks until the completion fires.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::TaskSignal`] if the host was abandoned or the
    /// driver thread is gone.
    pub(crate) fn wait(&self, driver_alive: &AtomicBool) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                Signal::Done => return Ok(()),
                Signal::Abandoned => return Err(ResolverError::TaskSignal),
                Signal::Waiting => {}
            }
            if !driver_alive.load(Ordering::Acquire) {
                return Err(ResolverError::TaskSignal);
            }
            self.cv.wait_for(&mut state, WAIT_SLICE);
        }
    }
}

/// Counting semaphore posted once per submission.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub(crate) fn post(&self) {
        *self.count.lock() += 1;
        self.cv.notify_one();
    }

    pub(crate) fn try_pend(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub(crate) fn pend_for(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            self.cv.wait_for(&mut count, timeout);
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

/// A host linked into the cache and handed to a driver.
pub(crate) struct Submission {
    key: HostKey,
    /// Created or rewound by this lookup rather than found in flight.
    fresh: bool,
    waiter: Option<Arc<Completion>>,
}

impl Submission {
    pub(crate) const fn key(&self) -> HostKey {
        self.key
    }
}

/// How submitted hosts are driven.
pub(crate) enum Driver {
    /// Step on the caller's thread.
    Polling,
    /// Step on a dedicated thread.
    Background(Background),
}

impl Driver {
    pub(crate) const fn supports_no_block(&self) -> bool {
        matches!(self, Self::Background(_))
    }

    /// Links `key` into the cache, under the same guard that found or
    /// created it.
    ///
    /// A fresh host that cannot be linked is released again. A fresh
    /// background submission wakes the driver thread, and a blocking one
    /// takes the host's completion.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::MemAlloc`] if the entry pool is exhausted.
    pub(crate) fn enqueue(
        &self,
        store: &mut CacheStore,
        key: HostKey,
        request: &Request,
        fresh: bool,
    ) -> Result<Submission> {
        if let Err(e) = store.insert(key) {
            if fresh {
                store.discard(key);
            }
            return Err(e);
        }
        let waiter = match self {
            Self::Background(_) if !request.flags.is_no_block() => Some(store.waiter(key)?),
            Self::Background(_) | Self::Polling => None,
        };
        if let Self::Background(bg) = self {
            if fresh {
                bg.signal.post();
            }
        }
        Ok(Submission { key, fresh, waiter })
    }

    /// Drives a submission according to the strategy.
    ///
    /// Returns `Pending` only for a non-blocking background submission. A
    /// failed host is removed and its error returned.
    pub(crate) fn submit(
        &self,
        shared: &Shared,
        submission: Submission,
        request: &Request,
    ) -> Result<Status> {
        let Submission { key, fresh, waiter } = submission;
        match self {
            Self::Polling => {
                let delay = Duration::from_millis(request.effective.task_delay_ms);
                loop {
                    match shared.resolve_host(key) {
                        Ok(Status::Pending) => shared.platform.clock.sleep(delay),
                        Ok(status) => return settle(shared, key, status),
                        Err(e) => {
                            // A host this lookup created would stay in flight undriven.
                            if fresh {
                                release(shared, key);
                            }
                            return Err(e);
                        }
                    }
                }
            }
            Self::Background(bg) => {
                let Some(waiter) = waiter else {
                    return Ok(Status::Pending);
                };
                if let Err(e) = waiter.wait(&bg.alive) {
                    shared.cache.lock()?.discard(key);
                    tracing::warn!(error = %e, "Lost the background driver while waiting");
                    return Err(e);
                }
                let status = shared.cache.lock()?.state(key)?.status();
                settle(shared, key, status)
            }
        }
    }
}

fn release(shared: &Shared, key: HostKey) {
    match shared.cache.lock() {
        Ok(mut store) => store.discard(key),
        Err(e) => tracing::warn!(error = %e, "Could not release an undriven host"),
    }
}

fn settle(shared: &Shared, key: HostKey, status: Status) -> Result<Status> {
    if status != Status::Failed {
        return Ok(status);
    }
    let mut store = shared.cache.lock()?;
    let error = store
        .take_error(key)
        .unwrap_or(ResolverError::Fault("host failed without an error"));
    store.discard(key);
    Err(error)
}

/// Handle to the background driver thread. Dropping it stops and joins the
/// thread.
pub(crate) struct Background {
    signal: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Background {
    /// Starts the driver thread.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::FaultInit`] if the thread cannot be spawned.
    pub(crate) fn spawn(shared: Arc<Shared>, config: &TaskConfig) -> Result<Self> {
        let signal = Arc::new(Semaphore::default());
        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        let mut builder = std::thread::Builder::new().name(config.name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        let handle = {
            let signal = Arc::clone(&signal);
            let stop = Arc::clone(&stop);
            let alive = Arc::clone(&alive);
            builder
                .spawn(move || run(&shared, &signal, &stop, &alive))
                .map_err(|e| ResolverError::FaultInit(format!("spawn driver thread: {e}")))?
        };

        tracing::info!(thread = %config.name, "Background resolver started");
        Ok(Self {
            signal,
            stop,
            alive,
            handle: Some(handle),
        })
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.signal.post();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Background resolver thread panicked");
            }
        }
    }
}

/// Clears the alive flag however the driver loop exits.
struct AliveGuard<'a>(&'a AtomicBool);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn run(shared: &Shared, signal: &Semaphore, stop: &AtomicBool, alive: &AtomicBool) {
    let _guard = AliveGuard(alive);
    let delay = Duration::from_millis(shared.config.task_delay_ms);
    let mut active: usize = 0;

    while !stop.load(Ordering::Acquire) {
        let posted = if active > 0 {
            signal.try_pend()
        } else {
            signal.pend_for(IDLE_WAIT)
        };
        if posted {
            active += 1;
        }

        match shared.resolve_all() {
            Ok(done) => active = active.saturating_sub(done),
            Err(e) => tracing::warn!(error = %e, "Background pass skipped"),
        }

        shared.platform.clock.sleep(delay);
    }

    if let Ok(mut store) = shared.cache.lock() {
        store.abandon_waiters();
    }
    tracing::info!("Background resolver stopped");
}
