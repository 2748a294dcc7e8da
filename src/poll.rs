//! Timer-driven polling with change detection.
//!
//! "Live" views are a poll loop: fetch every `interval`, compare with the previous snapshot, and
//! emit only when it differs. The interval is configuration, not a delivery guarantee.

use crate::sleeper::{Sleeper, TokioSleeper};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    sleeper: Arc<dyn Sleeper>,
    buffer: usize,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self { interval, sleeper: Arc::new(TokioSleeper), buffer: 16 }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling `fetch`. `None` results are skipped without resetting the snapshot.
    ///
    /// The loop ends when the returned [`PollStream`] is dropped.
    pub fn spawn<F, Fut>(self, mut fetch: F) -> PollStream
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<Value>> + Send,
    {
        let (tx, rx) = mpsc::channel(self.buffer.max(1));
        let handle = tokio::spawn(async move {
            let mut last: Option<Value> = None;
            loop {
                if let Some(current) = fetch().await {
                    if last.as_ref() != Some(&current) {
                        tracing::trace!(target: "lifeline::poll", "snapshot changed");
                        if tx.send(current.clone()).await.is_err() {
                            break;
                        }
                        last = Some(current);
                    }
                }
                if tx.is_closed() {
                    break;
                }
                self.sleeper.sleep(self.interval).await;
            }
        });
        PollStream { rx, handle }
    }
}

/// Changed snapshots from a running poll loop.
#[derive(Debug)]
pub struct PollStream {
    rx: mpsc::Receiver<Value>,
    handle: JoinHandle<()>,
}

impl PollStream {
    /// Next changed snapshot; `None` once the loop has stopped.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for PollStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
