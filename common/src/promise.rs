//! A thread-safe single-assignment future.
//!
//! A [`Promise`] moves from pending to fulfilled exactly once. Continuations
//! attached while pending are queued and replayed once at fulfillment;
//! continuations attached afterwards run immediately on the attaching
//! thread. The internal state is guarded by a mutex so that observing the
//! state and appending a continuation happen as one atomic step; there is
//! no window in which a fulfillment can race past a freshly attached
//! continuation.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use tracing::warn;

use crate::error::IpcError;
use crate::queue::WorkerQueue;

type Continuation<T> = Box<dyn FnOnce(&Result<T, IpcError>) + Send>;

struct State<T> {
    result: Option<Result<T, IpcError>>,
    continuations: Vec<Continuation<T>>,
}

/// A single-assignment value of type `T`, fulfilled from another thread.
pub struct Promise<T> {
    shared: Arc<(Mutex<State<T>>, Condvar)>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A pending promise with no result yet.
    pub fn new() -> Promise<T> {
        Promise {
            shared: Arc::new((
                Mutex::new(State {
                    result: None,
                    continuations: Vec::new(),
                }),
                Condvar::new(),
            )),
        }
    }

    /// A promise already carrying a result.
    pub fn fulfilled(result: Result<T, IpcError>) -> Promise<T> {
        let promise = Promise::new();
        promise.fulfill(result);
        promise
    }

    /// Runs `work` on a fresh thread and fulfills the promise with its
    /// outcome.
    pub fn spawn<F>(work: F) -> Promise<T>
    where
        F: FnOnce() -> Result<T, IpcError> + Send + 'static,
    {
        let promise = Promise::new();
        let inner = promise.clone();
        thread::spawn(move || inner.fulfill(work()));
        promise
    }

    /// Transitions to fulfilled and replays every queued continuation with
    /// the result. A second fulfillment is a no-op: the first result wins.
    pub fn fulfill(&self, result: Result<T, IpcError>) {
        let continuations = {
            let mut state = self.lock();
            if state.result.is_some() {
                warn!("promise fulfilled twice; keeping the first result");
                return;
            }
            state.result = Some(result.clone());
            self.shared.1.notify_all();
            mem::take(&mut state.continuations)
        };

        for continuation in continuations {
            continuation(&result);
        }
    }

    /// Chains `map` over a successful result, producing a new promise for
    /// its outcome; an error skips `map` and propagates unchanged.
    pub fn then<R, F>(&self, map: F) -> Promise<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Result<R, IpcError> + Send + 'static,
    {
        let next = Promise::new();
        let inner = next.clone();
        self.attach(Box::new(move |result| match result {
            Ok(value) => inner.fulfill(map(value.clone())),
            Err(error) => inner.fulfill(Err(error.clone())),
        }));
        next
    }

    /// Like [`then`](Promise::then), but runs the continuation on `queue`.
    pub fn then_on<R, F>(&self, queue: &WorkerQueue, map: F) -> Promise<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Result<R, IpcError> + Send + 'static,
    {
        let next = Promise::new();
        let inner = next.clone();
        let queue = queue.clone();
        self.attach(Box::new(move |result| {
            let result = result.clone();
            queue.submit(move || match result {
                Ok(value) => inner.fulfill(map(value)),
                Err(error) => inner.fulfill(Err(error)),
            });
        }));
        next
    }

    /// Observes the result without producing a new promise.
    pub fn handle<F>(&self, observer: F)
    where
        F: FnOnce(&Result<T, IpcError>) + Send + 'static,
    {
        self.attach(Box::new(observer));
    }

    /// Blocks the calling thread until the promise is fulfilled and returns
    /// the result.
    ///
    /// Must not be called from the thread that will perform the fulfilling
    /// work: doing so deadlocks.
    pub fn wait(&self) -> Result<T, IpcError> {
        let mut state = self.lock();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self
                .shared
                .1
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn attach(&self, continuation: Continuation<T>) {
        let ready = {
            let mut state = self.lock();
            match &state.result {
                Some(result) => Some(result.clone()),
                None => {
                    state.continuations.push(continuation);
                    return;
                }
            }
        };
        if let Some(result) = ready {
            continuation(&result);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.shared
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Promise<T> {
        Promise::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReceiveError, SendError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn continuation_attached_after_fulfillment_runs_exactly_once() {
        let promise = Promise::fulfilled(Ok(42));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let calls_inner = Arc::clone(&calls);
        let seen_inner = Arc::clone(&seen);
        promise.handle(move |result| {
            calls_inner.fetch_add(1, Ordering::SeqCst);
            *seen_inner.lock().unwrap() = Some(result.clone());
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(Ok(42)));
    }

    #[test]
    fn wait_blocks_until_fulfilled_from_another_thread() {
        let promise: Promise<i32> = Promise::new();
        let inner = promise.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.fulfill(Ok(7));
        });
        assert_eq!(promise.wait(), Ok(7));
        // Already fulfilled: returns immediately.
        assert_eq!(promise.wait(), Ok(7));
    }

    #[test]
    fn second_fulfillment_is_a_no_op() {
        let promise: Promise<i32> = Promise::new();
        promise.fulfill(Ok(1));
        promise.fulfill(Ok(2));
        assert_eq!(promise.wait(), Ok(1));
    }

    #[test]
    fn then_chains_success_and_propagates_errors() {
        let doubled = Promise::fulfilled(Ok(21)).then(|value| Ok(value * 2));
        assert_eq!(doubled.wait(), Ok(42));

        let failed: Promise<i32> =
            Promise::fulfilled(Err(IpcError::Send(SendError::Transport(9))));
        let mapped = failed.then(|value| Ok(value + 1));
        assert_eq!(mapped.wait(), Err(IpcError::Send(SendError::Transport(9))));
    }

    #[test]
    fn then_can_fail_the_chain() {
        let promise = Promise::fulfilled(Ok(1)).then(|_| -> Result<i32, IpcError> {
            Err(IpcError::Receive(ReceiveError::ProtocolMismatch))
        });
        assert_eq!(
            promise.wait(),
            Err(IpcError::Receive(ReceiveError::ProtocolMismatch))
        );
    }

    #[test]
    fn queued_continuations_replay_once_at_fulfillment() {
        let promise: Promise<i32> = Promise::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            promise.handle(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        promise.fulfill(Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        promise.fulfill(Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
