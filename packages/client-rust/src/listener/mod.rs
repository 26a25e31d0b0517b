//! Streaming configuration listener.
//!
//! One task per pool keeps a long-lived HTTP stream open against one of the
//! candidate URIs and forwards every configuration it carries as a
//! [`ConfigEvent`].
//!
//! Each pass shuffles the candidates and tries them in order. A candidate
//! whose resolution or stream fails is retried in place up to
//! `listener_retry_count` times, `listener_retry_timeout` apart, before the
//! listener moves on. Reading any data resets the retry counter. When a whole
//! pass fails the listener emits [`ConfigEvent::Empty`], sleeps
//! `dead_timeout` and starts over with every candidate.
//!
//! - [`framing`]: splits the feed into messages
//! - [`heartbeat`]: probes that abort a silent stream
//! - [`source`]: the HTTP implementation of [`ConfigSource`]

pub mod framing;
mod heartbeat;
pub mod source;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use keyroute_core::ClusterConfig;
use rand::seq::SliceRandom;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use source::HttpConfigSource;

use self::framing::MessageFramer;
use self::heartbeat::Heartbeat;
use crate::config::ClientConfig;
use crate::error::ListenerError;
use crate::traits::ConfigSource;

// ---------------------------------------------------------------------------
// ConfigEvent
// ---------------------------------------------------------------------------

/// What the listener tells the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    Updated(Box<ClusterConfig>),
    /// An empty message, or no candidate reachable.
    Empty,
}

// ---------------------------------------------------------------------------
// ListenerHandle
// ---------------------------------------------------------------------------

/// Owner side of a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Signals the listener to stop and waits for it. The open stream, any
    /// pending request and the heartbeat are dropped.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "configuration listener panicked");
            }
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts a listener that sends its events into `sink`.
///
/// Must be called from within a Tokio runtime.
pub fn spawn<T>(config: ClientConfig, source: Arc<dyn ConfigSource>, sink: mpsc::Sender<T>) -> ListenerHandle
where
    T: From<ConfigEvent> + Send + 'static,
{
    let (stop, stopped) = watch::channel(false);
    let listener = StreamListener {
        candidates: config.bootstrap_uris.clone(),
        config,
        source,
        sink,
        stopped,
        resolved: HashMap::new(),
    };
    ListenerHandle {
        stop,
        task: tokio::spawn(listener.run()),
    }
}

// ---------------------------------------------------------------------------
// StreamListener
// ---------------------------------------------------------------------------

enum Outcome {
    Stopped,
    Failed(ListenerError),
}

enum ReadOutcome {
    Stopped,
    Failed { error: ListenerError, progressed: bool },
}

struct StreamListener<T> {
    config: ClientConfig,
    source: Arc<dyn ConfigSource>,
    sink: mpsc::Sender<T>,
    stopped: watch::Receiver<bool>,
    candidates: Vec<String>,
    /// bootstrap URI → streaming URI
    resolved: HashMap<String, String>,
}

impl<T> StreamListener<T>
where
    T: From<ConfigEvent> + Send + 'static,
{
    async fn run(mut self) {
        info!(candidates = self.candidates.len(), "configuration listener started");
        loop {
            let mut pass = self.candidates.clone();
            pass.shuffle(&mut rand::rng());

            let mut dead: HashMap<String, ListenerError> = HashMap::new();
            for uri in pass {
                match self.listen_on(&uri).await {
                    Outcome::Stopped => {
                        info!("configuration listener stopped");
                        return;
                    }
                    Outcome::Failed(e) => {
                        warn!(uri = %uri, error = %e, "configuration endpoint marked dead for this pass");
                        self.resolved.remove(&uri);
                        dead.insert(uri, e);
                    }
                }
            }

            error!(dead = dead.len(), "no configuration endpoint reachable");
            if !self.emit(ConfigEvent::Empty).await {
                return;
            }
            if !self.pause(self.config.dead_timeout()).await {
                info!("configuration listener stopped");
                return;
            }
        }
    }

    async fn listen_on(&mut self, uri: &str) -> Outcome {
        let mut attempts = 0_u32;
        loop {
            if self.is_stopped() {
                return Outcome::Stopped;
            }
            let error = match self.attempt(uri).await {
                ReadOutcome::Stopped => return Outcome::Stopped,
                ReadOutcome::Failed { error, progressed } => {
                    if progressed {
                        attempts = 0;
                    }
                    error
                }
            };

            if attempts >= self.config.listener_retry_count {
                return Outcome::Failed(error);
            }
            attempts += 1;
            debug!(uri, attempt = attempts, error = %error, "retrying configuration stream");
            if !self.pause(self.config.listener_retry_timeout()).await {
                return Outcome::Stopped;
            }
        }
    }

    /// Resolves (once), opens the stream and reads it until it fails.
    async fn attempt(&mut self, uri: &str) -> ReadOutcome {
        let streaming = match self.resolved.get(uri) {
            Some(streaming) => streaming.clone(),
            None => {
                let mut stop = self.stopped.clone();
                let resolved = tokio::select! {
                    () = wait_stopped(&mut stop) => return ReadOutcome::Stopped,
                    resolved = self.source.resolve(uri) => resolved,
                };
                match resolved {
                    Ok(streaming) => {
                        self.resolved.insert(uri.to_string(), streaming.clone());
                        streaming
                    }
                    Err(error) => {
                        return ReadOutcome::Failed {
                            error,
                            progressed: false,
                        }
                    }
                }
            }
        };
        self.read_stream(uri, &streaming).await
    }

    async fn read_stream(&mut self, uri: &str, streaming: &str) -> ReadOutcome {
        let mut stop = self.stopped.clone();
        let opened = tokio::select! {
            () = wait_stopped(&mut stop) => return ReadOutcome::Stopped,
            opened = self.source.open_stream(streaming) => opened,
        };
        let mut chunks = match opened {
            Ok(chunks) => chunks,
            Err(error) => {
                return ReadOutcome::Failed {
                    error,
                    progressed: false,
                }
            }
        };
        info!(uri, streaming, "configuration stream open");

        let mut heartbeat = self.config.heartbeat.enabled.then(|| {
            let target = self
                .config
                .heartbeat
                .uri
                .clone()
                .unwrap_or_else(|| uri.to_string());
            Heartbeat::start(Arc::clone(&self.source), target, self.config.heartbeat.interval())
        });

        let mut framer = MessageFramer::new();
        loop {
            let lines_before = framer.lines();
            let chunk = tokio::select! {
                () = wait_stopped(&mut stop) => return ReadOutcome::Stopped,
                error = heartbeat::failure(&mut heartbeat) => {
                    return ReadOutcome::Failed { error, progressed: false };
                }
                chunk = chunks.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(error)) => {
                    return ReadOutcome::Failed {
                        error,
                        progressed: framer.lines() > 0,
                    }
                }
                None => {
                    return ReadOutcome::Failed {
                        error: ListenerError::StreamClosed,
                        progressed: framer.lines() > 0,
                    }
                }
            };

            for message in framer.push(&bytes) {
                if !self.deliver(uri, &message).await {
                    return ReadOutcome::Stopped;
                }
            }
            if framer.lines() > lines_before {
                debug!(uri, lines = framer.lines() - lines_before, "configuration stream data");
            }
        }
    }

    /// Parses and forwards one message. Returns `false` once nobody listens.
    async fn deliver(&mut self, uri: &str, message: &str) -> bool {
        if message.trim().is_empty() {
            return self.emit(ConfigEvent::Empty).await;
        }
        match ClusterConfig::from_json(message) {
            Ok(config) => {
                debug!(uri, rev = config.rev, nodes = config.nodes.len(), "configuration received");
                self.candidates = augment_candidates(&self.config.bootstrap_uris, uri, &config);
                self.emit(ConfigEvent::Updated(Box::new(config))).await
            }
            Err(e) => {
                warn!(uri, error = %e, "discarding malformed configuration");
                true
            }
        }
    }

    async fn emit(&self, event: ConfigEvent) -> bool {
        if self.sink.send(T::from(event)).await.is_err() {
            debug!("configuration consumer is gone");
            return false;
        }
        true
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Sleeps unless stopped first. Returns `false` when stopped.
    async fn pause(&self, duration: Duration) -> bool {
        let mut stop = self.stopped.clone();
        tokio::select! {
            () = wait_stopped(&mut stop) => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// User-supplied URIs plus one URI per healthy node, built from `current`
/// with the node's host swapped in.
fn augment_candidates(user: &[String], current: &str, config: &ClusterConfig) -> Vec<String> {
    let mut candidates = user.to_vec();
    let Ok(base) = Url::parse(current) else {
        return candidates;
    };
    for node in config.healthy_nodes() {
        let mut url = base.clone();
        if url.set_host(Some(node.host())).is_err() {
            continue;
        }
        let uri = url.to_string();
        if !candidates.contains(&uri) {
            candidates.push(uri);
        }
    }
    candidates
}
