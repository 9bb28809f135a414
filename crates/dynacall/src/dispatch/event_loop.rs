//! Per-thread event loop for completion delivery
//!
//! Every thread that issues asynchronous calls gets its own current-thread
//! tokio runtime and `LocalSet`. Callback-style completions are queued here
//! and only run on the issuing thread, when it calls [`run_until_idle`] or
//! [`block_on`]. The runtime is built lazily, so queueing never fails.

use crate::error::RuntimeError;
use futures_util::future::join_all;
use std::cell::{Cell, OnceCell, RefCell};
use std::future::Future;
use tokio::runtime::{Builder, Runtime};
use tokio::task::{JoinHandle, LocalSet};

thread_local! {
    static EVENT_LOOP: EventLoop = EventLoop::new();
}

// Fields drop in order: queued tasks go before the runtime.
struct EventLoop {
    completions: RefCell<Vec<JoinHandle<()>>>,
    local: LocalSet,
    runtime: OnceCell<Runtime>,
    running: Cell<bool>,
}

/// Clears the running flag even if the driven future panics
struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl EventLoop {
    fn new() -> Self {
        Self {
            completions: RefCell::new(Vec::new()),
            local: LocalSet::new(),
            runtime: OnceCell::new(),
            running: Cell::new(false),
        }
    }

    fn runtime(&self) -> Result<&Runtime, RuntimeError> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| RuntimeError::EventLoop(e.to_string()))?;
        Ok(self.runtime.get_or_init(|| runtime))
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, RuntimeError> {
        if self.running.replace(true) {
            return Err(RuntimeError::EventLoop(
                "already running on this thread".to_string(),
            ));
        }
        let _guard = RunningGuard(&self.running);
        let runtime = self.runtime()?;
        Ok(runtime.block_on(self.local.run_until(future)))
    }
}

/// Queue a completion on this thread's loop
pub(crate) fn defer<F>(task: F)
where
    F: Future<Output = ()> + 'static,
{
    EVENT_LOOP.with(|lp| {
        let handle = lp.local.spawn_local(task);
        lp.completions.borrow_mut().push(handle);
    });
}

/// Drive `future` to completion on this thread
///
/// Completions queued on this thread run while it waits. Fails if the loop is
/// already running, e.g. when called from inside a completion.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, RuntimeError> {
    EVENT_LOOP.with(|lp| lp.block_on(future))
}

/// Run queued completions until none are left
///
/// Completions that issue further asynchronous calls are waited for as well.
/// Returns how many completions ran.
pub fn run_until_idle() -> Result<usize, RuntimeError> {
    EVENT_LOOP.with(|lp| {
        let mut ran = 0;
        loop {
            let batch = lp.completions.take();
            if batch.is_empty() {
                return Ok(ran);
            }
            ran += batch.len();
            for joined in lp.block_on(join_all(batch))? {
                if let Err(e) = joined {
                    log::error!("completion failed: {}", e);
                }
            }
        }
    })
}

/// Completions queued on this thread that have not run yet
pub fn pending_completions() -> usize {
    EVENT_LOOP.with(|lp| {
        lp.completions
            .borrow()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    })
}
