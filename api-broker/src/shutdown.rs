//! Shared cancellation signal observed by every lane.
//!
//! Thread lanes check the flag at each iteration boundary and can block on
//! [`ShutdownSignal::closed`] inside a `crossbeam_channel::select!`; the relay
//! awaits [`ShutdownSignal::triggered`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    // Dropped on trigger so `closed` disconnects and wakes blocked selects.
    closer: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
    notify: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (closer, closed) = crossbeam_channel::bounded(0);
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                closer: Mutex::new(Some(closer)),
                closed,
                notify,
            }),
        }
    }

    /// Raises the flag. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.closer.lock().take();
        self.inner.notify.send_replace(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Channel that disconnects once the signal fires. Never carries a value.
    pub fn closed(&self) -> &Receiver<()> {
        &self.inner.closed
    }

    /// Sleeps up to `timeout`, waking early on shutdown. Returns `true` if the
    /// signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.closed.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_triggered(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    pub async fn triggered(&self) {
        let mut rx = self.inner.notify.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn trigger_is_reported_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[test]
    fn wait_timeout_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));

        let remote = signal.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let fired = remote.wait_timeout(Duration::from_secs(10));
            (fired, started.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        signal.trigger();

        let (fired, waited) = waiter.join().expect("waiter thread");
        assert!(fired);
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn async_waiters_resolve_after_trigger() {
        let signal = ShutdownSignal::new();
        let remote = signal.clone();
        let waiter = tokio::spawn(async move { remote.triggered().await });
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resolved")
            .expect("waiter task");

        // Late subscribers see the already-raised flag.
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("late waiter resolved");
    }
}
