//! Promise-style completion of asynchronous calls
//!
//! A [`CallFuture`] resolves exactly once, with the call's result or the
//! error that stopped it. A job that disappears without answering (cancelled,
//! or its worker panicked) resolves it with [`RuntimeError::Aborted`].

use super::event_loop;
use super::pool::{JobStatus, Ticket};
use crate::error::{Error, Result, RuntimeError};
use crate::value::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Sending half, held by the job
pub(crate) struct Completion {
    tx: oneshot::Sender<Result<Value>>,
}

impl Completion {
    pub(crate) fn complete(self, result: Result<Value>) {
        // The receiver may be gone; the result is then unobserved.
        let _ = self.tx.send(result);
    }
}

/// Pending result of an asynchronous call
pub struct CallFuture {
    function: String,
    rx: oneshot::Receiver<Result<Value>>,
    ticket: Option<Arc<Ticket>>,
}

impl CallFuture {
    /// Future for a job that has yet to be submitted
    pub(crate) fn channel(function: &str, ticket: Arc<Ticket>) -> (Completion, CallFuture) {
        let (tx, rx) = oneshot::channel();
        let future = CallFuture {
            function: function.to_string(),
            rx,
            ticket: Some(ticket),
        };
        (Completion { tx }, future)
    }

    /// Future that is already settled, for calls that failed before dispatch
    pub(crate) fn settled(function: &str, result: Result<Value>) -> CallFuture {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        CallFuture {
            function: function.to_string(),
            rx,
            ticket: None,
        }
    }

    /// Name of the called function
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Where the job stands, or `None` if it never reached the pool
    pub fn status(&self) -> Option<JobStatus> {
        self.ticket.as_ref().map(|t| t.status())
    }

    /// Withdraw the call if no worker has started it
    ///
    /// Returns false once native code is running; the call then completes
    /// normally. A cancelled call resolves with [`RuntimeError::Aborted`].
    pub fn cancel(&self) -> bool {
        match &self.ticket {
            Some(ticket) if ticket.cancel() => {
                log::debug!("cancelled call to '{}' (job {})", self.function, ticket.id());
                true
            }
            _ => false,
        }
    }

    /// The result, if it has arrived
    pub fn try_result(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(self.aborted())),
        }
    }

    /// Block this thread until the result arrives
    ///
    /// Completions queued on this thread keep running while it waits.
    pub fn wait(self) -> Result<Value> {
        event_loop::block_on(self)?
    }

    fn aborted(&self) -> Error {
        RuntimeError::Aborted(self.function.clone()).into()
    }
}

impl Future for CallFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(self.aborted())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for CallFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFuture")
            .field("function", &self.function)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MarshalError;

    #[test]
    fn test_settled_future() {
        let future = CallFuture::settled("f", Ok(Value::from(7)));
        assert_eq!(future.status(), None);
        assert_eq!(future.wait().unwrap(), 7);
    }

    #[test]
    fn test_completion_delivers() {
        let (completion, mut future) = CallFuture::channel("f", Arc::new(Ticket::new()));
        assert!(future.try_result().is_none());
        completion.complete(Err(MarshalError::NullPointer.into()));
        assert_eq!(
            future.try_result(),
            Some(Err(Error::Marshal(MarshalError::NullPointer)))
        );
    }

    #[test]
    fn test_dropped_completion_aborts() {
        let (completion, future) = CallFuture::channel("f", Arc::new(Ticket::new()));
        drop(completion);
        assert_eq!(
            future.wait().unwrap_err(),
            Error::Runtime(RuntimeError::Aborted("f".to_string()))
        );
    }

    #[test]
    fn test_cancel_only_before_start() {
        let ticket = Arc::new(Ticket::new());
        let (_completion, future) = CallFuture::channel("f", Arc::clone(&ticket));
        assert!(ticket.start());
        assert!(!future.cancel());
        assert_eq!(future.status(), Some(JobStatus::Running));
    }
}
