//! Heartbeat probes that run next to an open configuration stream.
//!
//! A half-open TCP connection can leave the stream silent for a long time.
//! The heartbeat probes a URI on its own interval and reports the first
//! failure, at which point the listener drops the stream and fails over.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::error::ListenerError;
use crate::traits::ConfigSource;

pub(crate) struct Heartbeat {
    uri: String,
    failed: oneshot::Receiver<ListenerError>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts probing `uri` every `interval`. The first probe runs after one
    /// interval.
    pub fn start(source: Arc<dyn ConfigSource>, uri: String, interval: Duration) -> Self {
        let (tx, failed) = oneshot::channel();
        let probe_uri = uri.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match source.probe(&probe_uri).await {
                    Ok(()) => trace!(uri = %probe_uri, "heartbeat ok"),
                    Err(e) => {
                        warn!(uri = %probe_uri, error = %e, "heartbeat failed");
                        let _ = tx.send(e);
                        return;
                    }
                }
            }
        });
        Self { uri, failed, task }
    }

    /// Resolves with the first probe failure.
    pub async fn failed(&mut self) -> ListenerError {
        match (&mut self.failed).await {
            Ok(e) => e,
            Err(_) => ListenerError::HeartbeatFailed(self.uri.clone()),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Like [`Heartbeat::failed`], but never resolves without a heartbeat.
pub(crate) async fn failure(heartbeat: &mut Option<Heartbeat>) -> ListenerError {
    match heartbeat {
        Some(heartbeat) => heartbeat.failed().await,
        None => std::future::pending().await,
    }
}
