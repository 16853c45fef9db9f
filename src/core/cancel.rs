//! Shared cancellation for one run.
//!
//! A run moves through `Armed -> Triggered -> Cleaned`. The first trigger
//! wins, whether it comes from natural completion or a termination signal.
//! Triggering closes the `done` channel, which wakes every `select!` waiting
//! on it. Later triggers are absorbed, and `Cleaned` is entered once.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Armed,
    Triggered,
    Cleaned,
}

impl CancelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Armed,
            1 => Self::Triggered,
            _ => Self::Cleaned,
        }
    }
}

/// Why the run left `Armed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The fuzz process finished on its own (including timeouts)
    Completed,
    /// A termination signal arrived
    Signal(i32),
}

struct Inner {
    state: AtomicU8,
    /// 0 for completion, otherwise the signal number
    cause: AtomicI32,
    /// Dropped on trigger; receivers then see a disconnected channel
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(0),
                cause: AtomicI32::new(0),
                done_tx: Mutex::new(Some(tx)),
                done_rx: rx,
            }),
        }
    }

    pub fn state(&self) -> CancelState {
        CancelState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_triggered(&self) -> bool {
        self.state() != CancelState::Armed
    }

    /// Leave `Armed`. Returns false when another path already triggered.
    pub fn trigger(&self, cause: CancelCause) -> bool {
        if self
            .inner
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let code = match cause {
            CancelCause::Completed => 0,
            CancelCause::Signal(sig) => sig,
        };
        self.inner.cause.store(code, Ordering::SeqCst);

        let sender = match self.inner.done_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        true
    }

    /// Move `Triggered -> Cleaned`. Returns false if not triggered yet or
    /// already cleaned.
    pub fn mark_cleaned(&self) -> bool {
        self.inner
            .state
            .compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `None` while armed.
    pub fn cause(&self) -> Option<CancelCause> {
        if !self.is_triggered() {
            return None;
        }
        match self.inner.cause.load(Ordering::SeqCst) {
            0 => Some(CancelCause::Completed),
            sig => Some(CancelCause::Signal(sig)),
        }
    }

    /// Signal that cancelled the run, if it was cancelled by one.
    pub fn signal(&self) -> Option<i32> {
        match self.cause() {
            Some(CancelCause::Signal(sig)) => Some(sig),
            _ => None,
        }
    }

    /// Channel that becomes disconnected once the token is triggered.
    /// Never carries a message; use it in `select!` as `recv(token.done())`.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{select, RecvTimeoutError};
    use std::time::Duration;

    #[test]
    fn first_trigger_wins() {
        let token = CancelToken::new();
        assert_eq!(token.state(), CancelState::Armed);
        assert_eq!(token.cause(), None);

        assert!(token.trigger(CancelCause::Signal(libc::SIGINT)));
        assert!(!token.trigger(CancelCause::Completed), "second trigger is absorbed");
        assert!(!token.trigger(CancelCause::Signal(libc::SIGTERM)));

        assert_eq!(token.state(), CancelState::Triggered);
        assert_eq!(token.signal(), Some(libc::SIGINT));
    }

    #[test]
    fn cleaned_exactly_once() {
        let token = CancelToken::new();
        assert!(!token.mark_cleaned(), "cannot clean an armed run");
        token.trigger(CancelCause::Completed);
        assert!(token.mark_cleaned());
        assert!(!token.mark_cleaned());
        assert_eq!(token.state(), CancelState::Cleaned);
        assert_eq!(token.cause(), Some(CancelCause::Completed));
    }

    #[test]
    fn trigger_wakes_waiters() {
        let token = CancelToken::new();
        assert_eq!(
            token.done().recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );

        let waiter = {
            let token = token.clone();
            std::thread::spawn(move || {
                select! {
                    recv(token.done()) -> msg => msg.is_err(),
                    default(Duration::from_secs(5)) => false,
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        token.trigger(CancelCause::Signal(libc::SIGTERM));
        assert!(waiter.join().unwrap(), "waiter should observe disconnection");
    }
}
