//! Transaction execution pool.
//!
//! Submitted transactions run on a dedicated rayon pool whose size comes from
//! configuration. Each submission hands back a channel that yields the task's
//! result once it has run.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to build broadcast pool: {0}")]
    Build(String),
    #[error("broadcaster is shut down")]
    ShutDown,
}

pub struct TxBroadcaster {
    pool: rayon::ThreadPool,
    accepting: AtomicBool,
}

impl TxBroadcaster {
    pub fn new(threads: usize) -> Result<Self, BroadcastError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tx-broadcast-{i}"))
            .panic_handler(|_| error!("transaction task panicked"))
            .build()
            .map_err(|err| BroadcastError::Build(err.to_string()))?;
        Ok(Self {
            pool,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queues `task` on the pool. The returned channel yields its output, or
    /// disconnects without a value if the task panicked.
    pub fn submit<T, F>(&self, task: F) -> Result<Receiver<T>, BroadcastError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BroadcastError::ShutDown);
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pool.spawn(move || {
            let _ = tx.send(task());
        });
        Ok(rx)
    }

    /// Refuses further submissions. Tasks already queued still run.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            debug!("tx broadcaster stopped accepting work");
        }
    }
}
