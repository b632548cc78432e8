use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Command;
use crate::timer::{TimerHandle, TimerService};

/// TimerService backed by one sleeping tokio task per scheduled expiry.
/// An expiry is posted as [`Command::Timeout`] on the association's command
/// queue.
#[derive(Clone)]
pub(crate) struct TokioTimerService {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    sleepers: Arc<Mutex<HashMap<TimerHandle, JoinHandle<()>>>>,
}

impl TokioTimerService {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        TokioTimerService {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            sleepers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drops the bookkeeping of a handle whose expiry was delivered.
    pub(crate) fn forget(&self, handle: TimerHandle) {
        if let Ok(mut sleepers) = self.sleepers.lock() {
            sleepers.remove(&handle);
        }
    }

    pub(crate) fn cancel_all(&self) {
        if let Ok(mut sleepers) = self.sleepers.lock() {
            for (_, sleeper) in sleepers.drain() {
                sleeper.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sleepers.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl TimerService for TokioTimerService {
    fn now(&self) -> Instant {
        // follows tokio's clock so paused-time tests see consistent values
        tokio::time::Instant::now().into_std()
    }

    fn schedule_after(&mut self, delay: Duration) -> TimerHandle {
        let handle = TimerHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cmd_tx = self.cmd_tx.clone();
        let sleeper = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::Timeout(handle));
        });

        if let Ok(mut sleepers) = self.sleepers.lock() {
            sleepers.insert(handle, sleeper);
        }
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        let sleeper = self
            .sleepers
            .lock()
            .ok()
            .and_then(|mut sleepers| sleepers.remove(&handle));
        if let Some(sleeper) = sleeper {
            sleeper.abort();
        }
    }
}
