//! Invocation dispatcher
//!
//! A [`ForeignFunction`] is one bound native function. It can be called
//! three ways:
//!
//! - [`ForeignFunction::call`] runs the native function on this thread.
//! - [`ForeignFunction::call_async`] runs it on the worker pool and hands the
//!   result to a completion closure on this thread's event loop.
//! - [`ForeignFunction::call_promise`] runs it on the worker pool and returns
//!   a [`CallFuture`].
//!
//! Arguments are always marshaled on the calling thread, so marshaling errors
//! of asynchronous calls travel through the same completion as results do.
//! Every asynchronous call completes exactly once.

pub mod event_loop;
pub mod future;
pub mod pool;

pub use event_loop::{block_on, pending_completions, run_until_idle};
pub use future::CallFuture;
pub use pool::{worker_threads, JobStatus};

use crate::error::{Result, RuntimeError};
use crate::library::binding::PreparedCall;
use crate::library::{Binding, Lease, Library, LibraryOptions, LibraryShared, Signature, SignatureMap, SymbolTable};
use crate::types::TypeSpec;
use crate::value::{Pointer, Value};
use future::Completion;
use pool::Ticket;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A bound native function
#[derive(Clone)]
pub struct ForeignFunction {
    library: Arc<LibraryShared>,
    binding: Arc<Binding>,
}

/// Result of [`ForeignFunction::invoke`], synchronous or not
#[derive(Debug)]
pub enum Invocation {
    Ready(Result<Value>),
    Pending(CallFuture),
}

impl Invocation {
    pub fn is_pending(&self) -> bool {
        matches!(self, Invocation::Pending(_))
    }

    /// The result, blocking for a pending call
    pub fn wait(self) -> Result<Value> {
        match self {
            Invocation::Ready(result) => result,
            Invocation::Pending(future) => future.wait(),
        }
    }

    /// Hand the result to `done`
    ///
    /// A ready result is handed over immediately; a pending one when this
    /// thread's event loop runs.
    pub fn then<F>(self, done: F)
    where
        F: FnOnce(Result<Value>) + 'static,
    {
        match self {
            Invocation::Ready(result) => done(result),
            Invocation::Pending(future) => event_loop::defer(async move { done(future.await) }),
        }
    }
}

/// Everything a worker needs to run one call
struct Job {
    binding: Arc<Binding>,
    prepared: PreparedCall,
    lease: Lease,
    ticket: Arc<Ticket>,
    completion: Completion,
}

impl Job {
    fn run(self) {
        let Job {
            binding,
            prepared,
            lease,
            ticket,
            completion,
        } = self;

        if !ticket.start() {
            log::debug!("job {} for '{}' cancelled before dispatch", ticket.id(), binding.name());
            // Dropping the completion resolves the future as aborted.
            drop(lease);
            drop(completion);
            return;
        }

        log::trace!("job {} calling '{}'", ticket.id(), binding.name());
        // SAFETY: the lease keeps the image mapped until after the call.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { binding.invoke(prepared) }));
        drop(lease);

        match outcome {
            Ok(result) => completion.complete(result),
            Err(_) => {
                log::error!("job {} for '{}' panicked", ticket.id(), binding.name());
                completion.complete(Err(RuntimeError::Aborted(binding.name().to_string()).into()));
            }
        }
    }
}

impl ForeignFunction {
    pub(crate) fn new(library: Arc<LibraryShared>, binding: Arc<Binding>) -> Self {
        Self { library, binding }
    }

    /// Bind a raw function address
    ///
    /// The function gets a private library handle of its own, named after
    /// `name`.
    ///
    /// # Safety
    ///
    /// `address` must point to a function with the given signature, and stay
    /// valid for as long as the returned value is called.
    pub unsafe fn from_pointer<R, A, I>(name: &str, address: Pointer, ret: R, args: I) -> Result<ForeignFunction>
    where
        R: Into<TypeSpec>,
        A: Into<TypeSpec>,
        I: IntoIterator<Item = A>,
    {
        let image = SymbolTable::new(name).with(name, address.as_ptr::<()>());
        let signatures = SignatureMap::new().with_signature(name, Signature::new(ret, args));
        let library = Library::bind(Box::new(image), &signatures, LibraryOptions::default())?;
        Ok(library.func(name)?)
    }

    pub fn name(&self) -> &str {
        self.binding.name()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Name of the library this function was bound from
    pub fn library_name(&self) -> &str {
        self.library.name()
    }

    /// Call on this thread, blocking until the native function returns
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        let lease = self.library.acquire()?;
        let prepared = self.binding.prepare(args)?;
        // SAFETY: the lease keeps the image mapped until after the call.
        let result = unsafe { self.binding.invoke(prepared) };
        drop(lease);
        result
    }

    /// Call on the worker pool; `done` runs on this thread's event loop
    ///
    /// `done` receives exactly one result, including errors from argument
    /// marshaling. Drive the loop with [`run_until_idle`] or [`block_on`].
    pub fn call_async<F>(&self, args: &[Value], done: F)
    where
        F: FnOnce(Result<Value>) + 'static,
    {
        let future = self.call_promise(args);
        event_loop::defer(async move { done(future.await) });
    }

    /// Call on the worker pool, returning a future for the result
    pub fn call_promise(&self, args: &[Value]) -> CallFuture {
        match self.submit(args) {
            Ok(future) => future,
            Err(e) => {
                log::debug!("call to '{}' failed before dispatch: {}", self.name(), e);
                CallFuture::settled(self.name(), Err(e))
            }
        }
    }

    /// Call the way the library defaults to
    pub fn invoke(&self, args: &[Value]) -> Invocation {
        if self.library.async_default() {
            Invocation::Pending(self.call_promise(args))
        } else {
            Invocation::Ready(self.call(args))
        }
    }

    fn submit(&self, args: &[Value]) -> Result<CallFuture> {
        let lease = self.library.acquire()?;
        let prepared = self.binding.prepare(args)?;
        let pool = pool::worker_pool()?;

        let ticket = Arc::new(Ticket::new());
        let (completion, future) = CallFuture::channel(self.name(), Arc::clone(&ticket));
        log::debug!("queueing job {} for '{}'", ticket.id(), self.name());
        let job = Job {
            binding: Arc::clone(&self.binding),
            prepared,
            lease,
            ticket,
            completion,
        };
        pool.submit(move || job.run());
        Ok(future)
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("library", &self.library.name())
            .field("binding", &self.binding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, MarshalError, TypeError};
    use std::cell::RefCell;
    use std::os::raw::c_int;
    use std::rc::Rc;

    extern "C" fn mul(a: c_int, b: c_int) -> c_int {
        a * b
    }

    fn mul_fn() -> ForeignFunction {
        unsafe { ForeignFunction::from_pointer("mul", Pointer::from_ptr(mul as *const ()), "int", ["int", "int"]) }.unwrap()
    }

    #[test]
    fn test_sync_call() {
        assert_eq!(mul_fn().call(&[21.into(), 2.into()]).unwrap(), 42);
    }

    #[test]
    fn test_promise_call() {
        assert_eq!(mul_fn().call_promise(&[21.into(), 2.into()]).wait().unwrap(), 42);
    }

    #[test]
    fn test_callback_call_waits_for_the_loop() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        mul_fn().call_async(&[21.into(), 2.into()], move |r| sink.borrow_mut().push(r));

        assert!(seen.borrow().is_empty());
        run_until_idle().unwrap();
        assert_eq!(*seen.borrow(), vec![Ok(Value::from(42))]);
    }

    #[test]
    fn test_marshal_error_goes_through_completion() {
        let future = mul_fn().call_promise(&[Value::from("x"), 2.into()]);
        assert!(matches!(
            future.wait(),
            Err(Error::Marshal(MarshalError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_arity_error_goes_through_completion() {
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        mul_fn().call_async(&[1.into()], move |r| *sink.borrow_mut() = Some(r));
        run_until_idle().unwrap();
        assert!(matches!(
            seen.borrow_mut().take(),
            Some(Err(Error::Type(TypeError::ArityMismatch { expected: 2, got: 1, .. })))
        ));
    }

    #[test]
    fn test_invoke_is_sync_by_default() {
        let invocation = mul_fn().invoke(&[3.into(), 3.into()]);
        assert!(!invocation.is_pending());
        assert_eq!(invocation.wait().unwrap(), 9);
    }
}
