//! A level-triggered I/O event loop for non-blocking sockets.
//!
//! The [`Reactor`] drives readiness-based dispatch for a set of file
//! descriptors, a deferred-callback queue, and a timeout min-heap, all on a
//! single thread. It wraps the OS notification facility (epoll on Linux,
//! kqueue on BSD/macOS) through [`mio::Poll`].
//!
//! A reactor is constructed explicitly and passed by [`Rc`] handle to every
//! component that needs it; there is no process-wide singleton. The only
//! operation that may be invoked from another thread is
//! [`ReactorHandle::defer`], which hands a closure to the reactor's thread
//! and interrupts a blocking poll via [`mio::Waker`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use std::time::{Duration, Instant};
//! use squall::reactor::Reactor;
//!
//! let reactor = Rc::new(Reactor::new()?);
//! let r = Rc::clone(&reactor);
//! reactor.schedule_timeout(Instant::now() + Duration::from_secs(1), move || {
//!     println!("one second elapsed");
//!     r.stop();
//! });
//! reactor.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token, Waker};
use thiserror::Error;
use tracing::{error, trace, warn};

pub use mio::Interest;

/// Token reserved for the cross-thread waker; fd tokens use the fd value.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Upper bound on how long a single poll may block with nothing scheduled.
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Errors produced by reactor registration calls.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("fd {0} is already registered with this reactor")]
    AlreadyRegistered(RawFd),

    #[error("fd {0} is not registered with this reactor")]
    NotRegistered(RawFd),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Readiness bits delivered to an fd handler.
///
/// Error/hangup conditions are always reported by the OS poller regardless
/// of the registered interest, so `ERROR` may appear even when only read or
/// write interest was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b001);
    pub const WRITABLE: Ready = Ready(0b010);
    pub const ERROR: Ready = Ready(0b100);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

/// Callback invoked when an fd becomes ready.
pub type IoCallback = Box<dyn FnMut(RawFd, Ready)>;

/// A one-shot closure queued for execution on the reactor thread.
type Task = Box<dyn FnOnce()>;

/// Nullable callback cell shared between the heap entry and its handle.
/// Cancellation empties the cell; the heap entry is discarded at pop time.
type TimerSlot = Rc<RefCell<Option<Task>>>;

struct Handler {
    callback: Rc<RefCell<IoCallback>>,
    interest: Interest,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    slot: TimerSlot,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the std max-heap pops the earliest (deadline, seq) first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle returned by [`Reactor::schedule_timeout`], used to cancel it.
pub struct TimeoutHandle {
    slot: std::rc::Weak<RefCell<Option<Task>>>,
}

/// Cross-thread state: the remote task queue, poll waker, and stop flags.
struct Shared {
    tasks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    waker: Waker,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl Shared {
    fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor for stop");
        }
    }
}

/// Cloneable, `Send` handle for queueing work onto a reactor from other
/// threads.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Queues `callback` to run on the reactor's thread at its next loop
    /// iteration. Wakes the reactor if it is blocked in poll.
    ///
    /// This is the only reactor operation that is safe to call from any
    /// thread.
    pub fn defer(&self, callback: impl FnOnce() + Send + 'static) {
        let was_empty = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.push(Box::new(callback));
            was_empty
        };
        // Waking a polling reactor is relatively expensive, so only signal
        // on the empty-to-non-empty transition; an occasional extra wake is
        // harmless.
        if was_empty {
            if let Err(e) = self.shared.waker.wake() {
                warn!(error = %e, "failed to wake reactor");
            }
        }
    }

    /// Requests the reactor's loop exit after its current iteration.
    /// Safe to call from any thread; idempotent.
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

/// A single-threaded, level-triggered I/O event loop.
///
/// See the [module documentation](self) for an overview.
pub struct Reactor {
    poll: RefCell<Poll>,
    handlers: RefCell<HashMap<RawFd, Handler>>,
    /// Readiness reported by the current poll, drained one fd at a time so
    /// handlers may re-enter the reactor (register, unregister, close) while
    /// dispatch is in progress.
    ready: RefCell<HashMap<RawFd, Ready>>,
    local_tasks: RefCell<VecDeque<Task>>,
    shared: Arc<Shared>,
    timeouts: RefCell<BinaryHeap<TimerEntry>>,
    next_seq: Cell<u64>,
}

impl Reactor {
    /// Creates a reactor backed by the platform poller.
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Reactor {
            poll: RefCell::new(poll),
            handlers: RefCell::new(HashMap::new()),
            ready: RefCell::new(HashMap::new()),
            local_tasks: RefCell::new(VecDeque::new()),
            shared: Arc::new(Shared {
                tasks: Mutex::new(Vec::new()),
                waker,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            timeouts: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
        })
    }

    /// Returns a `Send` handle for queueing callbacks from other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers `callback` to receive readiness events for `fd`.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::AlreadyRegistered`] if `fd` already has a
    /// handler on this reactor.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(RawFd, Ready) + 'static,
    ) -> Result<(), ReactorError> {
        let mut handlers = self.handlers.borrow_mut();
        if handlers.contains_key(&fd) {
            return Err(ReactorError::AlreadyRegistered(fd));
        }
        self.poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        handlers.insert(
            fd,
            Handler {
                callback: Rc::new(RefCell::new(Box::new(callback))),
                interest,
            },
        );
        Ok(())
    }

    /// Changes the events we listen for on `fd`.
    pub fn update(&self, fd: RawFd, interest: Interest) -> Result<(), ReactorError> {
        let mut handlers = self.handlers.borrow_mut();
        let handler = handlers
            .get_mut(&fd)
            .ok_or(ReactorError::NotRegistered(fd))?;
        if handler.interest != interest {
            self.poll
                .borrow()
                .registry()
                .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
            handler.interest = interest;
        }
        Ok(())
    }

    /// Stops listening for events on `fd` and drops its handler.
    ///
    /// Any readiness already reported for `fd` in the current loop iteration
    /// is discarded, so a handler that unregisters another fd mid-dispatch
    /// never causes a stale delivery.
    pub fn unregister(&self, fd: RawFd) -> Result<(), ReactorError> {
        let handler = self
            .handlers
            .borrow_mut()
            .remove(&fd)
            .ok_or(ReactorError::NotRegistered(fd))?;
        drop(handler);
        self.ready.borrow_mut().remove(&fd);
        self.poll
            .borrow()
            .registry()
            .deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    /// Returns `true` if `fd` currently has a registered handler.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.borrow().contains_key(&fd)
    }

    /// Runs `callback` at `deadline`. Returns a handle that may be passed to
    /// [`cancel_timeout`](Self::cancel_timeout).
    ///
    /// Timeouts with equal deadlines fire in registration order. Not safe to
    /// call from other threads; use [`ReactorHandle::defer`] to transfer
    /// control first.
    pub fn schedule_timeout(
        &self,
        deadline: Instant,
        callback: impl FnOnce() + 'static,
    ) -> TimeoutHandle {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let slot: TimerSlot = Rc::new(RefCell::new(Some(Box::new(callback) as Task)));
        let handle = TimeoutHandle {
            slot: Rc::downgrade(&slot),
        };
        self.timeouts.borrow_mut().push(TimerEntry {
            deadline,
            seq,
            slot,
        });
        handle
    }

    /// Cancels a pending timeout.
    ///
    /// The callback slot is emptied immediately (the callback will never
    /// run); the heap entry itself is discarded lazily at a later pop, since
    /// arbitrary removal from a binary heap is O(n).
    pub fn cancel_timeout(&self, handle: &TimeoutHandle) {
        if let Some(slot) = handle.slot.upgrade() {
            slot.borrow_mut().take();
        }
    }

    /// Queues `callback` to run on the next loop iteration.
    ///
    /// Same-thread counterpart of [`ReactorHandle::defer`]; accepts
    /// non-`Send` closures.
    pub fn defer(&self, callback: impl FnOnce() + 'static) {
        self.local_tasks.borrow_mut().push_back(Box::new(callback));
    }

    /// Runs the loop until [`stop`](Self::stop) is requested.
    ///
    /// Each iteration runs deferred callbacks queued before the iteration
    /// began, then due timeouts in deadline order, then polls once and
    /// services every fd reported ready. Interrupted polls are retried;
    /// any other poll error terminates the loop and is returned.
    pub fn run(&self) -> io::Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            // stop() before run(): consume the request and return at once.
            self.shared.stopped.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let mut events = Events::with_capacity(1024);
        while self.shared.running.load(Ordering::SeqCst) {
            self.run_deferred();

            let now = Instant::now();
            while let Some(task) = self.pop_due_timeout(now) {
                self.run_task(task);
            }

            let poll_timeout = if self.has_pending_tasks() {
                // A callback or timeout queued more work; don't block.
                Duration::ZERO
            } else {
                self.next_timeout_delay(Instant::now())
                    .map_or(MAX_POLL_TIMEOUT, |d| d.min(MAX_POLL_TIMEOUT))
            };

            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            events.clear();
            if let Err(e) = self.poll.borrow_mut().poll(&mut events, Some(poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.stopped.store(false, Ordering::SeqCst);
                return Err(e);
            }

            {
                let mut ready = self.ready.borrow_mut();
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    let fd = event.token().0 as RawFd;
                    let mut bits = Ready::EMPTY;
                    if event.is_readable() || event.is_read_closed() {
                        bits |= Ready::READABLE;
                    }
                    if event.is_writable() {
                        bits |= Ready::WRITABLE;
                    }
                    if event.is_error() {
                        bits |= Ready::ERROR;
                    }
                    if !bits.is_empty() {
                        *ready.entry(fd).or_default() |= bits;
                    }
                }
            }

            // Pop one fd at a time: handlers may register or unregister
            // other fds, which mutates both maps under us.
            loop {
                let next = {
                    let mut ready = self.ready.borrow_mut();
                    let fd = ready.keys().next().copied();
                    fd.map(|fd| (fd, ready.remove(&fd).unwrap()))
                };
                let Some((fd, bits)) = next else { break };
                let callback = self
                    .handlers
                    .borrow()
                    .get(&fd)
                    .map(|h| Rc::clone(&h.callback));
                match callback {
                    Some(callback) => {
                        let result =
                            catch_unwind(AssertUnwindSafe(|| (callback.borrow_mut())(fd, bits)));
                        if result.is_err() {
                            error!(fd, "panic in I/O handler");
                        }
                    }
                    None => trace!(fd, "readiness for unregistered fd"),
                }
            }
        }
        // Reset so another run/stop pair can be issued.
        self.shared.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Requests the loop exit after the current iteration. Idempotent; a
    /// `stop` issued before `run` makes the next `run` return immediately.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Returns `true` while `run` is executing.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn run_deferred(&self) {
        // Swap both queues out before running anything so callbacks queued
        // during this batch wait for the next iteration instead of starving
        // I/O dispatch.
        let remote: Vec<_> = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        let local: Vec<_> = self.local_tasks.borrow_mut().drain(..).collect();
        for task in remote {
            self.run_task(Box::new(task));
        }
        for task in local {
            self.run_task(task);
        }
    }

    fn run_task(&self, task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("panic in reactor callback");
        }
    }

    fn has_pending_tasks(&self) -> bool {
        !self.local_tasks.borrow().is_empty() || !self.shared.tasks.lock().unwrap().is_empty()
    }

    /// Pops the earliest timeout due at `now`, discarding cancelled entries.
    fn pop_due_timeout(&self, now: Instant) -> Option<Task> {
        let mut heap = self.timeouts.borrow_mut();
        while let Some(entry) = heap.peek() {
            if entry.slot.borrow().is_none() {
                heap.pop();
                continue;
            }
            if entry.deadline > now {
                return None;
            }
            let entry = heap.pop().expect("peeked entry vanished");
            if let Some(task) = entry.slot.borrow_mut().take() {
                return Some(task);
            }
        }
        None
    }

    /// Time until the next live timeout, discarding cancelled entries.
    fn next_timeout_delay(&self, now: Instant) -> Option<Duration> {
        let mut heap = self.timeouts.borrow_mut();
        while let Some(entry) = heap.peek() {
            if entry.slot.borrow().is_none() {
                heap.pop();
                continue;
            }
            return Some(entry.deadline.saturating_duration_since(now));
        }
        None
    }
}

/// Schedules a callback to run at a fixed interval on a reactor.
///
/// If an invocation overruns past the next scheduled deadline, the missed
/// firings are skipped: the next deadline is advanced by whole intervals
/// until it lies in the future, so a slow callback delays but never
/// compounds drift.
pub struct PeriodicTimer {
    inner: Rc<RefCell<PeriodicInner>>,
}

struct PeriodicInner {
    reactor: Rc<Reactor>,
    // Taken out of the slot while running so the callback may call stop().
    callback: Option<Box<dyn FnMut()>>,
    interval: Duration,
    next_deadline: Instant,
    running: bool,
    timeout: Option<TimeoutHandle>,
}

impl PeriodicTimer {
    pub fn new(reactor: Rc<Reactor>, interval: Duration, callback: impl FnMut() + 'static) -> Self {
        assert!(interval > Duration::ZERO, "interval must be non-zero");
        PeriodicTimer {
            inner: Rc::new(RefCell::new(PeriodicInner {
                reactor,
                callback: Some(Box::new(callback)),
                interval,
                next_deadline: Instant::now(),
                running: false,
                timeout: None,
            })),
        }
    }

    /// Starts the timer; the first firing is scheduled immediately.
    pub fn start(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.running = true;
            inner.next_deadline = Instant::now();
        }
        Self::schedule_next(&self.inner);
    }

    /// Stops the timer and cancels the pending firing.
    pub fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.running = false;
        if let Some(handle) = inner.timeout.take() {
            inner.reactor.cancel_timeout(&handle);
        }
    }

    fn fire(inner: &Rc<RefCell<PeriodicInner>>) {
        let callback = {
            let mut guard = inner.borrow_mut();
            if !guard.running {
                return;
            }
            guard.callback.take()
        };
        if let Some(mut callback) = callback {
            callback();
            inner.borrow_mut().callback = Some(callback);
        }
        Self::schedule_next(inner);
    }

    fn schedule_next(inner: &Rc<RefCell<PeriodicInner>>) {
        let mut guard = inner.borrow_mut();
        if !guard.running {
            return;
        }
        // Catch up after an overrun by skipping whole intervals rather than
        // re-basing from the overrun time.
        let now = Instant::now();
        let interval = guard.interval;
        while guard.next_deadline <= now {
            guard.next_deadline += interval;
        }
        let deadline = guard.next_deadline;
        let weak = Rc::downgrade(inner);
        let handle = guard.reactor.schedule_timeout(deadline, move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                PeriodicTimer::fire(&inner);
            }
        });
        guard.timeout = Some(handle);
    }
}
