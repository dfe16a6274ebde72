use std::fmt;
use std::sync::Arc;

use crate::callable::Callable;
use crate::error::Result;
use crate::proactor::Shared;

/// A handle through which work is scheduled onto a [`Proactor`].
///
/// Executors are cheap to clone and safe to use from any thread. Two
/// executors compare equal exactly when they submit to the same
/// proactor.
///
/// [`Proactor`]: crate::Proactor
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Executor { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Registers one outstanding reason for the driver to keep running.
    pub fn on_work_started(&self) {
        self.shared.work_started();
    }

    /// Releases one outstanding reason. When the last one is released
    /// the proactor signals itself out of work, which returns any driver
    /// blocked in the kernel.
    pub fn on_work_finished(&self) {
        self.shared.work_finished();
    }

    /// Runs `f` immediately when the caller is already on the driver
    /// thread, otherwise enqueues it like [`Executor::post`].
    pub fn dispatch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.running_in_this_thread() {
            f();
            return Ok(());
        }
        self.post(f)
    }

    /// Enqueues `f` for execution on the driver thread. Never invokes it
    /// from the calling frame. On failure the work accounting is rolled
    /// back and the error propagates.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Callable::new(move |_: ()| f()))
    }

    /// Identical to [`Executor::post`] in this execution context.
    pub fn defer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(f)
    }

    /// Whether a driver of the backing proactor is currently executing
    /// on the calling thread.
    pub fn running_in_this_thread(&self) -> bool {
        self.shared.running_in_this_thread()
    }
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Executor {}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("proactor", &Arc::as_ptr(&self.shared))
            .finish()
    }
}
