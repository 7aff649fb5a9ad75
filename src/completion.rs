//! Single-shot completion handles.
//!
//! Every operation that cannot finish instantly returns a [`Completion`]. The
//! same handle answers four calling conventions:
//!
//! - polling with [`Completion::ready`],
//! - blocking with [`Completion::wait`] / [`Completion::timed_wait`],
//! - a callback registered with [`Completion::set_callback`],
//! - `async` awaiting with [`Completion::outcome`].
//!
//! The producing side holds the matching [`Resolver`]. A resolver that is
//! dropped without resolving resolves its handle with [`Error::Aborted`], so a
//! handle can never be left pending forever. Dropping the handle itself is
//! always safe: the resolver keeps writing into the unobserved cell.
//!
//! # Callback registration
//!
//! Registering a callback on an already resolved handle invokes it
//! immediately on the calling thread. A handle carries at most one callback;
//! a second registration while the first is still pending is rejected with
//! [`Error::InvalidState`].

use std::fmt;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::core::{Error, Result};

type Callback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

struct Slot<T> {
    outcome: Option<Result<()>>,
    output: Option<T>,
    callback: Option<Callback>,
}

struct Cell<T> {
    slot: Mutex<Slot<T>>,
    resolved: Condvar,
    notify: Notify,
}

impl<T> Cell<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                outcome: None,
                output: None,
                callback: None,
            }),
            resolved: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn resolve(&self, outcome: Result<()>, output: Option<T>) {
        let callback = {
            let mut slot = self.slot.lock();
            if slot.outcome.is_some() {
                return;
            }
            // Output lands under the same lock that publishes the outcome.
            slot.output = output;
            slot.outcome = Some(outcome);
            slot.callback.take()
        };
        self.resolved.notify_all();
        self.notify.notify_waiters();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

/// Caller-side handle to the result of an asynchronous operation.
///
/// `T` is the output the operation fills in (bytes read, a discovered
/// device, ...). Operations without output use `Completion<()>`.
pub struct Completion<T = ()> {
    cell: Arc<Cell<T>>,
}

impl<T> Completion<T> {
    /// Create a pending handle and the resolver that completes it.
    pub fn pending() -> (Completion<T>, Resolver<T>) {
        let cell = Arc::new(Cell::new());
        (
            Completion {
                cell: Arc::clone(&cell),
            },
            Resolver { cell: Some(cell) },
        )
    }

    /// Create a handle that is already resolved with `outcome`.
    pub fn immediate(outcome: Result<()>) -> Self {
        Self::immediate_with(outcome, None)
    }

    /// Create a handle that is already resolved with `outcome` and `output`.
    pub fn immediate_with(outcome: Result<()>, output: Option<T>) -> Self {
        let cell = Arc::new(Cell::new());
        cell.resolve(outcome, output);
        Self { cell }
    }

    /// Non-blocking query. Always legal and idempotent.
    pub fn ready(&self) -> Poll<Result<()>> {
        match self.cell.slot.lock().outcome {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }

    /// Whether the handle has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.ready().is_ready()
    }

    /// Block the calling thread until the handle resolves.
    ///
    /// Must not be called from inside the dispatcher runtime; use
    /// [`Completion::outcome`] there.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self.cell.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome {
                return outcome;
            }
            self.cell.resolved.wait(&mut slot);
        }
    }

    /// Block for at most `duration`.
    ///
    /// Returns `Poll::Pending` when the deadline passes first. The underlying
    /// operation keeps running and the handle can be waited on again.
    pub fn timed_wait(&self, duration: Duration) -> Poll<Result<()>> {
        let deadline = Instant::now() + duration;
        let mut slot = self.cell.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome {
                return Poll::Ready(outcome);
            }
            if self.cell.resolved.wait_until(&mut slot, deadline).timed_out() {
                return match slot.outcome {
                    Some(outcome) => Poll::Ready(outcome),
                    None => Poll::Pending,
                };
            }
        }
    }

    /// Register the callback invoked once with the outcome.
    ///
    /// The callback runs on the dispatcher thread that resolves the handle,
    /// or immediately on this thread if the handle is already resolved.
    pub fn set_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let mut slot = self.cell.slot.lock();
        match slot.outcome {
            Some(outcome) => {
                drop(slot);
                callback(outcome);
                Ok(())
            }
            None => {
                if slot.callback.is_some() {
                    return Err(Error::InvalidState);
                }
                slot.callback = Some(Box::new(callback));
                Ok(())
            }
        }
    }

    /// Await the outcome from async code.
    pub async fn outcome(&self) -> Result<()> {
        loop {
            let notified = self.cell.notify.notified();
            if let Poll::Ready(outcome) = self.ready() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Copy of the output, once resolved.
    pub fn output(&self) -> Option<T>
    where
        T: Clone,
    {
        self.cell.slot.lock().output.clone()
    }

    /// Take the output out of the handle.
    ///
    /// Outputs may accompany an error outcome: a `read_all` that hits end of
    /// file resolves with [`Error::Eof`] and the short data as output.
    pub fn into_output(self) -> Option<T> {
        self.cell.slot.lock().output.take()
    }

    /// Wait, then return the output on success.
    pub fn wait_output(self) -> Result<T> {
        self.wait()?;
        self.into_output().ok_or(Error::NoData)
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("outcome", &self.ready())
            .finish()
    }
}

/// Producer-side half of a [`Completion`].
///
/// Owned by whatever dispatcher task performs the operation.
pub struct Resolver<T = ()> {
    cell: Option<Arc<Cell<T>>>,
}

impl<T> Resolver<T> {
    /// Resolve with `outcome` and optional `output`.
    pub fn resolve(mut self, outcome: Result<()>, output: Option<T>) {
        if let Some(cell) = self.cell.take() {
            cell.resolve(outcome, output);
        }
    }

    /// Resolve successfully with `output`.
    pub fn succeed(self, output: T) {
        self.resolve(Ok(()), Some(output));
    }

    /// Resolve successfully without output.
    pub fn complete(self) {
        self.resolve(Ok(()), None);
    }

    /// Resolve with an error.
    pub fn fail(self, err: Error) {
        self.resolve(Err(err), None);
    }

    /// Whether the caller still holds the handle.
    pub fn is_observed(&self) -> bool {
        self.cell
            .as_ref()
            .map(|cell| Arc::strong_count(cell) > 1)
            .unwrap_or(false)
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.resolve(Err(Error::Aborted), None);
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("observed", &self.is_observed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_pending_until_resolved() {
        let (completion, resolver) = Completion::<()>::pending();
        assert_eq!(completion.ready(), Poll::Pending);

        resolver.complete();
        assert_eq!(completion.ready(), Poll::Ready(Ok(())));
    }

    #[test]
    fn test_ready_is_idempotent() {
        let completion = Completion::<()>::immediate(Err(Error::Eof));
        for _ in 0..5 {
            assert_eq!(completion.ready(), Poll::Ready(Err(Error::Eof)));
        }
        assert_eq!(completion.wait(), Err(Error::Eof));
        assert_eq!(completion.ready(), Poll::Ready(Err(Error::Eof)));
    }

    #[test]
    fn test_wait_across_threads() {
        let (completion, resolver) = Completion::pending();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.succeed(vec![1u8, 2, 3]);
        });

        assert_eq!(completion.wait(), Ok(()));
        assert_eq!(completion.output(), Some(vec![1, 2, 3]));
        worker.join().unwrap();
    }

    #[test]
    fn test_timed_wait_elapses() {
        let (completion, resolver) = Completion::<()>::pending();
        assert_eq!(completion.timed_wait(Duration::from_millis(10)), Poll::Pending);

        // Still usable after the deadline passed.
        resolver.fail(Error::Timeout);
        assert_eq!(
            completion.timed_wait(Duration::from_millis(10)),
            Poll::Ready(Err(Error::Timeout))
        );
    }

    #[test]
    fn test_callback_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (completion, resolver) = Completion::<()>::pending();

        let counter = Arc::clone(&calls);
        completion
            .set_callback(move |outcome| {
                assert_eq!(outcome, Ok(()));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        resolver.complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_callback_rejected() {
        let (completion, _resolver) = Completion::<()>::pending();
        completion.set_callback(|_| {}).unwrap();
        assert_eq!(completion.set_callback(|_| {}), Err(Error::InvalidState));
    }

    #[test]
    fn test_callback_on_resolved_runs_immediately() {
        let completion = Completion::<()>::immediate(Err(Error::NoData));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        completion
            .set_callback(move |outcome| {
                assert_eq!(outcome, Err(Error::NoData));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_resolver_aborts() {
        let (completion, resolver) = Completion::<Vec<u8>>::pending();
        drop(resolver);
        assert_eq!(completion.wait(), Err(Error::Aborted));
        assert_eq!(completion.into_output(), None);
    }

    #[test]
    fn test_dropped_handle_is_harmless() {
        let (completion, resolver) = Completion::<u32>::pending();
        assert!(resolver.is_observed());
        drop(completion);
        assert!(!resolver.is_observed());
        resolver.succeed(7);
    }

    #[test]
    fn test_output_with_error() {
        let (completion, resolver) = Completion::pending();
        resolver.resolve(Err(Error::Eof), Some(b"short".to_vec()));
        assert_eq!(completion.wait(), Err(Error::Eof));
        assert_eq!(completion.into_output(), Some(b"short".to_vec()));
    }

    #[test]
    fn test_wait_output() {
        let (completion, resolver) = Completion::pending();
        resolver.succeed(42u16);
        assert_eq!(completion.wait_output(), Ok(42));

        let (completion, resolver) = Completion::<u16>::pending();
        resolver.complete();
        assert_eq!(completion.wait_output(), Err(Error::NoData));
    }

    #[tokio::test]
    async fn test_outcome_async() {
        let (completion, resolver) = Completion::<()>::pending();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.fail(Error::Stopped);
        });
        assert_eq!(completion.outcome().await, Err(Error::Stopped));
    }
}
