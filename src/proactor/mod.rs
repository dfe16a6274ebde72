use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use io_uring::{cqueue, opcode, squeue, types};
use parking_lot::{Mutex, MutexGuard};

use crate::callable::Callable;
use crate::error::{Error, Result};
use crate::eventfd::EventFd;
use crate::notify::NotifyQueue;
use crate::ring::Ring;
use crate::service::{Completed, Continuation, CqeEvent, IoHandle, Readiness, Service};

// Exports
mod executor;
pub use executor::Executor;

#[cfg(test)]
mod tests;

/// Fixed file indices of the three internal event descriptors.
const QUEUE_SLOT: u32 = 0;
const STOP_SLOT: u32 = 1;
const ZERO_SLOT: u32 = 2;

/// `user_data` cookies reserved for the internal readiness pollers.
/// Completion-record cookies are slab keys counting up from zero and can
/// never collide with these.
const fn token(slot: u32) -> u64 {
    u64::MAX - slot as u64
}

/// A proactor-style execution context multiplexing many outstanding
/// kernel operations on a single driver thread.
///
/// The proactor owns an `io_uring` instance plus three internal event
/// descriptors registered as fixed files: a cross-thread notification
/// queue, a stop counter and an out-of-work counter. One readiness poll
/// per descriptor is kept armed while a driver runs, so a driver blocked
/// in the kernel wakes up for external posts, [`Proactor::stop`] and the
/// work counter reaching zero, without any timeout polling.
///
/// Exactly one thread may drive the loop at a time through
/// [`Proactor::run`], [`Proactor::run_one`], [`Proactor::poll`] or
/// [`Proactor::poll_one`]; this is asserted. Everything reachable from
/// [`Proactor::executor`], as well as `stop`, is safe from any thread.
///
/// Every driver invocation leaves the context in the stopped state when
/// it returns; call [`Proactor::restart`] before driving again.
pub struct Proactor {
    shared: Arc<Shared>,
}

impl Proactor {
    /// Creates a context whose submission ring holds `entries` slots.
    pub fn new(entries: u32) -> Result<Proactor> {
        let ring = Ring::try_new(entries)?;
        let queue = NotifyQueue::new()?;
        let stop_event = EventFd::new(0, false)?;
        let zero_event = EventFd::new(0, false)?;
        ring.register_files(&[
            queue.as_raw_fd(),
            stop_event.as_raw_fd(),
            zero_event.as_raw_fd(),
        ])?;

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                ring,
                svc: Service::new(),
                pending: 0,
                queue_armed: false,
                stop_armed: false,
                zero_armed: false,
            }),
            queue,
            stop_event,
            zero_event,
            work: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            tid: AtomicU64::new(0),
        });
        shared.restart()?;
        Ok(Proactor { shared })
    }

    /// An executor submitting work to this context.
    pub fn executor(&self) -> Executor {
        Executor::new(Arc::clone(&self.shared))
    }

    /// Runs handlers until the context runs out of work or is stopped.
    /// Returns the number of handlers run.
    ///
    /// A panic from a handler propagates; driver state stays consistent
    /// and the call may be repeated.
    pub fn run(&self) -> Result<usize> {
        self.shared.drive_all(true)
    }

    /// Runs at most one handler, blocking for it if necessary.
    pub fn run_one(&self) -> Result<usize> {
        self.shared.drive_one(true)
    }

    /// Runs handlers that are ready without blocking in the kernel.
    pub fn poll(&self) -> Result<usize> {
        self.shared.drive_all(false)
    }

    /// Runs at most one ready handler without blocking in the kernel.
    pub fn poll_one(&self) -> Result<usize> {
        self.shared.drive_one(false)
    }

    /// Signals any current and future driver invocation to return
    /// promptly. Safe from any thread.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Prepares the context for a subsequent driver invocation by
    /// re-arming whichever internal pollers completed during the
    /// previous one and clearing the stopped flag. Idempotent.
    pub fn restart(&self) -> Result<()> {
        self.shared.restart()
    }

    /// Whether a driver is currently executing on the calling thread.
    pub fn running_in_this_thread(&self) -> bool {
        self.shared.running_in_this_thread()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Proactor {
    /// Shuts the I/O services down: stored continuations are destroyed
    /// without being invoked so the work counter can drain. Outstanding
    /// kernel operations complete into stripped records.
    fn drop(&mut self) {
        self.shared.shutdown_services();
    }
}

/// State shared between the owning [`Proactor`], its executors and the
/// continuations of in-flight operations.
pub(crate) struct Shared {
    /// Driver-side state. Held while touching the ring or the record
    /// pool, released across every continuation invocation so handlers
    /// can initiate further operations.
    core: Mutex<Core>,
    queue: NotifyQueue,
    stop_event: EventFd,
    zero_event: EventFd,
    work: AtomicUsize,
    stopped: AtomicBool,
    /// Tag of the thread currently inside a driver, zero when idle.
    tid: AtomicU64,
}

struct Core {
    ring: Ring,
    svc: Service,
    /// Queue items announced by the notification descriptor but not yet
    /// consumed by a driver.
    pending: u64,
    queue_armed: bool,
    stop_armed: bool,
    zero_armed: bool,
}

impl Core {
    fn armed(&self, slot: u32) -> bool {
        match slot {
            QUEUE_SLOT => self.queue_armed,
            STOP_SLOT => self.stop_armed,
            _ => self.zero_armed,
        }
    }

    fn set_armed(&mut self, slot: u32, armed: bool) {
        match slot {
            QUEUE_SLOT => self.queue_armed = armed,
            STOP_SLOT => self.stop_armed = armed,
            _ => self.zero_armed = armed,
        }
    }
}

struct CqeOutcome {
    handlers: usize,
    stopped: bool,
}

impl CqeOutcome {
    fn none() -> Self {
        CqeOutcome {
            handlers: 0,
            stopped: false,
        }
    }

    fn stopped() -> Self {
        CqeOutcome {
            handlers: 0,
            stopped: true,
        }
    }
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

/// Marks the current thread as the driver thread for the guard's scope.
struct TidGuard<'a> {
    tid: &'a AtomicU64,
}

impl<'a> TidGuard<'a> {
    fn enter(tid: &'a AtomicU64) -> Self {
        let prev = tid.swap(current_thread_tag(), Ordering::Relaxed);
        assert_eq!(prev, 0, "drivers are not re-entrant");
        TidGuard { tid }
    }
}

impl Drop for TidGuard<'_> {
    fn drop(&mut self) {
        self.tid.store(0, Ordering::Relaxed);
    }
}

/// Releases one unit of work when dropped, surviving handler panics.
struct WorkGuard<'a>(&'a Shared);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.work_finished();
    }
}

impl Shared {
    pub(crate) fn work_started(&self) {
        self.work.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn work_finished(&self) {
        let prev = self.work.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "work counter underflow");
        if prev == 1 {
            if let Err(e) = self.zero_event.add(1) {
                tracing::warn!(error = %e, "failed to bump the out-of-work counter");
            }
        }
    }

    fn out_of_work(&self) -> bool {
        self.work.load(Ordering::Acquire) == 0
    }

    pub(crate) fn running_in_this_thread(&self) -> bool {
        self.tid.load(Ordering::Relaxed) == current_thread_tag()
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.stop_event.add(1) {
            tracing::warn!(error = %e, "failed to bump the stop counter");
        }
    }

    pub(crate) fn restart(&self) -> Result<()> {
        let mut core = self.core.lock();
        self.rearm_if(&mut core, QUEUE_SLOT)?;
        self.rearm_if(&mut core, STOP_SLOT)?;
        self.rearm_if(&mut core, ZERO_SLOT)?;
        self.stopped.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn post(&self, f: Callable<()>) -> Result<()> {
        self.work_started();
        match self.queue.push(f) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.work_finished();
                Err(Error::Io(e))
            }
        }
    }

    pub(crate) fn construct_handle(&self) -> IoHandle {
        self.core.lock().svc.construct()
    }

    pub(crate) fn destroy_handle(&self, handle: IoHandle) {
        self.core.lock().svc.destroy(handle);
    }

    pub(crate) fn handle_user_data(&self, handle: &IoHandle) -> Vec<u64> {
        self.core.lock().svc.user_data(handle)
    }

    pub(crate) fn shutdown_services(&self) {
        let released = self.core.lock().svc.shutdown();
        for _ in 0..released {
            self.work_finished();
        }
    }

    /// Stages one operation: acquires a completion record carrying
    /// `handler`, lets `prepare` populate a submission entry around the
    /// record's cookie and rented scatter-gather vector, and submits.
    /// Work accounting and the record are rolled back on failure.
    pub(crate) fn initiate<P>(
        &self,
        object: u64,
        iov_count: usize,
        prepare: P,
        handler: Continuation,
    ) -> Result<u64>
    where
        P: FnOnce(&mut [libc::iovec], u64) -> squeue::Entry,
    {
        let mut core = self.core.lock();
        if core.svc.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let key = core.svc.stage(object, iov_count, handler);
        debug_assert!(key < token(ZERO_SLOT));
        self.work_started();
        let entry = prepare(core.svc.iovecs_mut(key), key).user_data(key);
        let submitted = core
            .ring
            .push(&entry)
            .and_then(|()| core.ring.submit().map(drop).map_err(Error::Io));
        match submitted {
            Ok(()) => Ok(key),
            Err(e) => {
                core.svc.unstage(key);
                drop(core);
                self.work_finished();
                Err(e)
            }
        }
    }

    /// True when a driver must return immediately: an internal poller
    /// was consumed without a restart, the context was stopped, or there
    /// is no work to wait for.
    fn enter_stopped(&self) -> bool {
        let armed = {
            let core = self.core.lock();
            core.queue_armed && core.stop_armed && core.zero_armed
        };
        !armed || self.stopped.load(Ordering::Acquire) || self.out_of_work()
    }

    fn drive_all(&self, blocking: bool) -> Result<usize> {
        if self.enter_stopped() {
            self.stopped.store(true, Ordering::Relaxed);
            return Ok(0);
        }
        let _tid = TidGuard::enter(&self.tid);
        let mut handlers = 0;
        loop {
            let batch = self.core.lock().pending;
            let (ran, hit_zero) = self.service_queue(batch);
            handlers += ran;
            if hit_zero {
                break;
            }
            let outcome = self.reap_one(blocking)?;
            handlers += outcome.handlers;
            if outcome.stopped {
                break;
            }
            let mut core = self.core.lock();
            self.rearm_if(&mut core, QUEUE_SLOT)?;
        }
        self.stopped.store(true, Ordering::Relaxed);
        Ok(handlers)
    }

    fn drive_one(&self, blocking: bool) -> Result<usize> {
        if self.enter_stopped() {
            self.stopped.store(true, Ordering::Relaxed);
            return Ok(0);
        }
        let _tid = TidGuard::enter(&self.tid);
        let mut handlers = 0;
        loop {
            let has_pending = { self.core.lock().pending > 0 };
            if has_pending {
                handlers = self.service_queue(1).0;
                break;
            }
            let outcome = self.reap_one(blocking)?;
            handlers = outcome.handlers;
            if handlers > 0 || outcome.stopped {
                break;
            }
            // An internal poller completed and was re-armed; keep going
            // until a user-visible handler runs.
        }
        self.stopped.store(true, Ordering::Relaxed);
        Ok(handlers)
    }

    /// Invokes up to `max` queued continuations, each with the core
    /// unlocked. Returns how many ran and whether the work counter
    /// stood at zero after the last invocation. The zero check happens
    /// after the invoke, never on the transient dip before it, so a
    /// continuation that posts or initiates further work from its body
    /// keeps the driver alive. Accounting is updated before each
    /// invocation, so a panic leaves the queue consistent for a later
    /// driver call.
    fn service_queue(&self, max: u64) -> (usize, bool) {
        let mut ran = 0;
        let mut hit_zero = false;
        for _ in 0..max {
            {
                let mut core = self.core.lock();
                if core.pending == 0 {
                    break;
                }
                core.pending -= 1;
            }
            let Some(func) = self.queue.pop() else {
                tracing::warn!("notification queue ran dry below its announced count");
                break;
            };
            let prev = self.work.fetch_sub(1, Ordering::Release);
            assert!(prev > 0, "work counter underflow");
            ran += 1;
            func.invoke(());
            if prev == 1 && self.out_of_work() {
                hit_zero = true;
            }
        }
        (ran, hit_zero)
    }

    /// Obtains one completion event, blocking in the kernel if asked,
    /// and dispatches it. The non-blocking flavor reports "stopped" when
    /// nothing is ready.
    fn reap_one(&self, blocking: bool) -> Result<CqeOutcome> {
        let mut core = self.core.lock();
        let cqe = loop {
            if let Some(cqe) = core.ring.next_cqe() {
                break cqe;
            }
            if !blocking {
                return Ok(CqeOutcome::stopped());
            }
            core.ring.submit_and_wait(1)?;
        };
        self.handle_cqe(core, cqe)
    }

    fn handle_cqe(
        &self,
        mut core: MutexGuard<'_, Core>,
        cqe: cqueue::Entry,
    ) -> Result<CqeOutcome> {
        match cqe.user_data() {
            data if data == token(STOP_SLOT) => {
                core.stop_armed = false;
                self.stop_event.consume()?;
                if self.stopped.load(Ordering::Acquire) {
                    return Ok(CqeOutcome::stopped());
                }
                self.rearm(&mut core, STOP_SLOT)?;
                Ok(CqeOutcome::none())
            }
            data if data == token(ZERO_SLOT) => {
                core.zero_armed = false;
                self.zero_event.consume()?;
                if self.out_of_work() {
                    return Ok(CqeOutcome::stopped());
                }
                self.rearm(&mut core, ZERO_SLOT)?;
                Ok(CqeOutcome::none())
            }
            data if data == token(QUEUE_SLOT) => {
                core.queue_armed = false;
                let announced = self.queue.pending()?;
                core.pending += announced;
                if core.pending == 0 {
                    return Ok(CqeOutcome::none());
                }
                drop(core);
                let (ran, hit_zero) = self.service_queue(1);
                Ok(CqeOutcome {
                    handlers: ran,
                    stopped: hit_zero,
                })
            }
            key => match core.svc.complete(key) {
                Completed::Unknown => {
                    tracing::warn!(user_data = key, "completion for unknown cookie, dropped");
                    Ok(CqeOutcome::none())
                }
                Completed::Stripped => Ok(CqeOutcome::none()),
                Completed::Run(handler) => {
                    drop(core);
                    let _work = WorkGuard(self);
                    handler.invoke(CqeEvent {
                        res: cqe.result(),
                        flags: cqe.flags(),
                    });
                    Ok(CqeOutcome {
                        handlers: 1,
                        stopped: false,
                    })
                }
            },
        }
    }

    /// Arms the readiness poller of one internal descriptor. Failing to
    /// obtain a submission slot here is fatal for the driver.
    fn rearm(&self, core: &mut Core, slot: u32) -> Result<()> {
        debug_assert!(!core.armed(slot));
        let entry = opcode::PollAdd::new(types::Fixed(slot), Readiness::IN.bits())
            .build()
            .user_data(token(slot));
        core.ring.push(&entry).map_err(|e| match e {
            Error::SqFull => Error::SqFullInternal,
            other => other,
        })?;
        core.ring.submit()?;
        core.set_armed(slot, true);
        Ok(())
    }

    fn rearm_if(&self, core: &mut Core, slot: u32) -> Result<()> {
        if core.armed(slot) {
            return Ok(());
        }
        self.rearm(core, slot)
    }
}
