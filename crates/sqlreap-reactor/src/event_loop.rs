//! The readiness loop.
//!
//! Each polling iteration waits on `mio::Poll`, dispatches the callback of
//! every ready handle once, runs the timeout and finish hooks, and only then
//! applies the registration changes those callbacks queued on their
//! [`Registrar`]. A callback that re-watches its own handle therefore cannot
//! run twice in one iteration.
//!
//! Registrations are level-triggered: a handle that stays watched after
//! being dispatched is re-armed, so unread data is reported again on the
//! next iteration.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token, Waker};
use sqlreap_core::{Error, Result};
use tracing::{debug, trace, warn};

use crate::handle::{Handle, Interest};

/// Reserved for the stop waker; descriptors never reach it.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Readiness callback. It receives the handle that became ready and a
/// registrar for changes that apply after the current dispatch pass.
pub type Callback = Box<dyn FnMut(&mut Registrar, Handle)>;

/// Hook run once per iteration (timeout or finish).
pub type Hook = Box<dyn FnMut(&mut Registrar)>;

enum Op {
    Watch(Handle, Interest, Callback),
    Unwatch(Handle),
}

/// Registration changes queued during a dispatch pass.
#[derive(Default)]
pub struct Registrar {
    ops: Vec<Op>,
    stop: bool,
}

impl Registrar {
    /// Watch `handle` for readability, replacing any earlier registration.
    pub fn watch<F>(&mut self, handle: Handle, callback: F)
    where
        F: FnMut(&mut Registrar, Handle) + 'static,
    {
        self.watch_with(handle, Interest::Readable, callback);
    }

    pub fn watch_with<F>(&mut self, handle: Handle, interest: Interest, callback: F)
    where
        F: FnMut(&mut Registrar, Handle) + 'static,
    {
        self.ops.push(Op::Watch(handle, interest, Box::new(callback)));
    }

    pub fn unwatch(&mut self, handle: Handle) {
        self.ops.push(Op::Unwatch(handle));
    }

    /// Stop the loop once the current iteration finishes.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Number of queued changes.
    pub fn pending(&self) -> usize {
        self.ops.len()
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("pending", &self.ops.len())
            .field("stop", &self.stop)
            .finish()
    }
}

/// Requests a loop to stop, from any thread.
///
/// A request made while the loop is not running is kept, and the next
/// [`EventLoop::run`] returns before polling.
#[derive(Clone)]
pub struct StopHandle {
    stop_requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake event loop");
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stop_requested", &self.stop_requested.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct Entry {
    interest: Interest,
    callback: Callback,
}

/// Single-threaded readiness event loop.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    entries: HashMap<Handle, Entry>,
    timeout: Option<Duration>,
    on_timeout: Option<Hook>,
    on_finish: Option<Hook>,
    running: bool,
    stop_requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handles: Vec<_> = self.entries.keys().copied().collect();
        handles.sort();
        f.debug_struct("EventLoop")
            .field("handles", &handles)
            .field("timeout", &self.timeout)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    #[allow(clippy::result_large_err)]
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            entries: HashMap::new(),
            timeout: None,
            on_timeout: None,
            on_finish: None,
            running: false,
            stop_requested: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Watch `handle` for readability.
    ///
    /// Replaces any earlier registration for the same handle. A handle the
    /// OS refuses to register is logged and left unwatched.
    pub fn watch<F>(&mut self, handle: Handle, callback: F)
    where
        F: FnMut(&mut Registrar, Handle) + 'static,
    {
        self.install(handle, Interest::Readable, Box::new(callback));
    }

    pub fn watch_with<F>(&mut self, handle: Handle, interest: Interest, callback: F)
    where
        F: FnMut(&mut Registrar, Handle) + 'static,
    {
        self.install(handle, interest, Box::new(callback));
    }

    /// Remove the registration for `handle`. Unknown handles are ignored.
    pub fn unwatch(&mut self, handle: Handle) {
        self.remove(handle);
    }

    pub fn is_watched(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Number of watched handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How long [`run`](Self::run) waits for events before calling the
    /// timeout hook. Without one it waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn on_timeout<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Registrar) + 'static,
    {
        self.on_timeout = Some(Box::new(hook));
    }

    /// Run `hook` at the end of every iteration, before queued changes apply.
    pub fn on_finish<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Registrar) + 'static,
    {
        self.on_finish = Some(Box::new(hook));
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Make [`run`](Self::run) return after the current iteration.
    ///
    /// Called while the loop is not running, the request is kept and the
    /// next `run` returns without polling.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_requested: Arc::clone(&self.stop_requested),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Poll and dispatch until stopped or until nothing is watched.
    ///
    /// Each stop request ends exactly one `run`.
    #[allow(clippy::result_large_err)]
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        debug!(handles = self.entries.len(), "event loop started");

        let outcome = loop {
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                debug!("stop requested");
                break Ok(());
            }
            if self.entries.is_empty() {
                debug!("no handles left to watch");
                break Ok(());
            }
            if let Err(e) = self.run_once(self.timeout) {
                break Err(e);
            }
        };

        self.running = false;
        debug!("event loop stopped");
        outcome
    }

    /// One polling iteration. Returns the number of callbacks dispatched.
    #[allow(clippy::result_large_err)]
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let timed_out = self.events.is_empty() && timeout.is_some();
        let mut ready: Vec<Handle> = Vec::new();
        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let handle = Handle::from_token(event.token());
            if !ready.contains(&handle) {
                ready.push(handle);
            }
        }

        let mut registrar = Registrar::default();
        let mut dispatched = 0;
        for &handle in &ready {
            // events for handles unwatched before this poll are stale
            let Some(entry) = self.entries.get_mut(&handle) else {
                continue;
            };
            trace!(fd = handle.raw(), "dispatching");
            (entry.callback)(&mut registrar, handle);
            dispatched += 1;
        }

        if timed_out {
            if let Some(hook) = self.on_timeout.as_mut() {
                hook(&mut registrar);
            }
        }
        if let Some(hook) = self.on_finish.as_mut() {
            hook(&mut registrar);
        }

        self.apply(registrar, &ready);
        Ok(dispatched)
    }

    fn apply(&mut self, registrar: Registrar, dispatched: &[Handle]) {
        let Registrar { ops, stop } = registrar;

        let mut touched = HashSet::new();
        for op in ops {
            match op {
                Op::Watch(handle, interest, callback) => {
                    self.install(handle, interest, callback);
                    touched.insert(handle);
                }
                Op::Unwatch(handle) => {
                    self.remove(handle);
                    touched.insert(handle);
                }
            }
        }

        for &handle in dispatched {
            if !touched.contains(&handle) {
                self.rearm(handle);
            }
        }

        if stop {
            self.stop();
        }
    }

    fn install(&mut self, handle: Handle, interest: Interest, callback: Callback) {
        if handle.raw() < 0 {
            warn!(fd = handle.raw(), "refusing to watch an invalid handle");
            return;
        }

        let fd = handle.raw();
        let mut source = SourceFd(&fd);
        let registry = self.poll.registry();
        let registered = if self.entries.contains_key(&handle) {
            registry.reregister(&mut source, handle.token(), interest.into())
        } else {
            registry.register(&mut source, handle.token(), interest.into())
        };

        match registered {
            Ok(()) => {
                debug!(fd, ?interest, "watching handle");
                self.entries.insert(handle, Entry { interest, callback });
            }
            Err(e) => {
                warn!(fd, error = %e, "failed to watch handle");
                self.entries.remove(&handle);
            }
        }
    }

    fn remove(&mut self, handle: Handle) {
        if self.entries.remove(&handle).is_none() {
            debug!(fd = handle.raw(), "unwatch of a handle that is not watched");
            return;
        }
        let fd = handle.raw();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!(fd, error = %e, "deregister failed");
        }
        debug!(fd, "unwatched handle");
    }

    fn rearm(&mut self, handle: Handle) {
        let Some(entry) = self.entries.get(&handle) else {
            return;
        };
        let fd = handle.raw();
        let interest: mio::Interest = entry.interest.into();
        let registry = self.poll.registry();
        if let Err(e) = registry.reregister(&mut SourceFd(&fd), handle.token(), interest) {
            warn!(fd, error = %e, "failed to re-arm handle; dropping it");
            self.entries.remove(&handle);
        }
    }
}
