//! One-shot completion signal attached to every command buffer.
//!
//! The signal resolves once with a [`CompletionStatus`]. Any number of threads
//! may block on it, and registered handlers run exactly once, on the thread
//! that resolves the signal (or immediately, if registered after the fact).
//! Handlers registered before resolution have run by the time waiters wake.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::ExecutionError;

/// Outcome of a submitted command buffer.
pub type CompletionStatus = Result<(), ExecutionError>;

type Handler = Box<dyn FnOnce(&CompletionStatus) + Send + 'static>;

struct SignalState {
    status: Option<CompletionStatus>,
    resolving: bool,
    handlers: Vec<Handler>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    resolved: Condvar,
}

/// Shared handle to a command buffer's completion.
///
/// Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionSignal")
            .field("status", &state.status)
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    /// Creates an unresolved signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    status: None,
                    resolving: false,
                    handlers: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Whether the signal has resolved.
    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().status.is_some()
    }

    /// The resolved status, if any.
    pub fn status(&self) -> Option<CompletionStatus> {
        self.inner.state.lock().status.clone()
    }

    /// Registers a handler.
    ///
    /// Runs immediately on the calling thread when the signal has already
    /// resolved.
    pub fn on_completed(&self, handler: impl FnOnce(&CompletionStatus) + Send + 'static) {
        let mut state = self.inner.state.lock();
        if let Some(status) = state.status.clone() {
            drop(state);
            handler(&status);
            return;
        }
        state.handlers.push(Box::new(handler));
    }

    /// Blocks until the signal resolves.
    pub fn wait(&self) -> CompletionStatus {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(status) = &state.status {
                return status.clone();
            }
            self.inner.resolved.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`; `None` if still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompletionStatus> {
        let mut state = self.inner.state.lock();
        if state.status.is_none() {
            let _ = self
                .inner
                .resolved
                .wait_while_for(&mut state, |s| s.status.is_none(), timeout);
        }
        state.status.clone()
    }

    /// Resolves the signal. Returns `false` when it had already resolved, in
    /// which case nothing is delivered.
    pub(crate) fn complete(&self, status: CompletionStatus) -> bool {
        let handlers = {
            let mut state = self.inner.state.lock();
            if state.status.is_some() || state.resolving {
                return false;
            }
            state.resolving = true;
            std::mem::take(&mut state.handlers)
        };
        for handler in handlers {
            run_handler(handler, &status);
        }

        // Handlers registered while the first batch ran.
        let late = {
            let mut state = self.inner.state.lock();
            state.status = Some(status.clone());
            std::mem::take(&mut state.handlers)
        };
        self.inner.resolved.notify_all();
        for handler in late {
            run_handler(handler, &status);
        }
        true
    }
}

/// Runs one handler; a panic is logged and does not reach the resolver.
fn run_handler(handler: Handler, status: &CompletionStatus) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
        warn!("completion handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    #[test]
    fn handlers_fire_exactly_once() {
        let signal = CompletionSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        signal.on_completed(move |status| {
            assert!(status.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.complete(Ok(())));
        assert!(!signal.complete(Err(ExecutionError::DeviceLost {
            message: "late".into()
        })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.status(), Some(Ok(())));
    }

    #[test]
    fn late_handler_runs_immediately() {
        let signal = CompletionSignal::new();
        signal.complete(Err(ExecutionError::Rejected {
            message: "bad".into(),
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        signal.on_completed(move |status| {
            assert!(status.is_err());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_still_resolves_the_signal() {
        let signal = CompletionSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        signal.on_completed(|_| panic!("handler failure"));
        {
            let calls = calls.clone();
            signal.on_completed(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait())
        };

        let resolver = {
            let signal = signal.clone();
            thread::spawn(move || signal.complete(Ok(())))
        };
        assert!(resolver.join().unwrap());
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(signal.status(), Some(Ok(())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!signal.complete(Ok(())));
    }

    #[test]
    fn waiters_wake_after_handlers_ran() {
        let signal = CompletionSignal::new();
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            signal.on_completed(move |_| {
                thread::sleep(Duration::from_millis(20));
                ran.store(true, Ordering::SeqCst);
            });
        }
        let waiter = {
            let signal = signal.clone();
            let ran = ran.clone();
            thread::spawn(move || {
                signal.wait().unwrap();
                ran.load(Ordering::SeqCst)
            })
        };
        signal.complete(Ok(()));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn concurrent_waiters_all_observe_the_same_status() {
        let signal = CompletionSignal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || signal.wait())
            })
            .collect();

        let resolver = {
            let signal = signal.clone();
            thread::spawn(move || signal.complete(Ok(())))
        };
        let racing = {
            let signal = signal.clone();
            thread::spawn(move || {
                signal.complete(Err(ExecutionError::DeviceLost {
                    message: "race".into(),
                }))
            })
        };

        let wins = [resolver.join().unwrap(), racing.join().unwrap()];
        assert_eq!(wins.iter().filter(|won| **won).count(), 1);

        let expected = signal.status().unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), expected);
        }
    }

    #[test]
    fn wait_after_completion_does_not_block() {
        let signal = CompletionSignal::new();
        assert_eq!(signal.wait_timeout(Duration::from_millis(10)), None);
        signal.complete(Ok(()));
        for _ in 0..3 {
            assert_eq!(signal.wait(), Ok(()));
        }
        assert_eq!(signal.wait_timeout(Duration::ZERO), Some(Ok(())));
    }
}
