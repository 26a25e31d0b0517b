//! TCP data node speaking the binary protocol.
//!
//! A node owns at most one framed connection. Requests are serialized over
//! it: the connection lock is held for a whole request/response exchange,
//! and responses are matched to requests by opaque. The connection is opened
//! lazily on first use.
//!
//! Any transport error (connect failure, I/O error, timeout, closed socket)
//! drops the connection, marks the node dead and reports the failure to the
//! pool. A dead node fails fast until a successful [`Node::ping`] revives it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::protocol::{BinaryCodec, Frame, ObserveResult, Request, Response};
use super::{FailureSink, NodeSpec};
use crate::error::TransportError;
use crate::traits::{Node, NodeFactory, NodeHandle};

type Connection = Framed<TcpStream, BinaryCodec>;

// ---------------------------------------------------------------------------
// TcpNode
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TcpNode {
    spec: NodeSpec,
    send_timeout: Duration,
    alive: AtomicBool,
    closed: AtomicBool,
    opaque: AtomicU32,
    connection: Mutex<Option<Connection>>,
    failures: FailureSink,
}

impl TcpNode {
    #[must_use]
    pub fn new(spec: NodeSpec, send_timeout: Duration, failures: FailureSink) -> Self {
        Self {
            spec,
            send_timeout,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            opaque: AtomicU32::new(1),
            connection: Mutex::new(None),
            failures,
        }
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::Timeout {
            endpoint: self.spec.endpoint.clone(),
            timeout_ms: u64::try_from(self.send_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((self.spec.host.trim_matches(['[', ']']), self.spec.port))
                .await
                .map_err(|e| TransportError::io(&self.spec.endpoint, &e))?
                .collect();

        // IPv4 first; a host mapped only to IPv6 falls back to its first address.
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TransportError::Io {
                endpoint: self.spec.endpoint.clone(),
                message: format!("could not resolve {}", self.spec.host),
            })
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let addr = self.resolve().await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::io(&self.spec.endpoint, &e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io(&self.spec.endpoint, &e))?;
        debug!(endpoint = %self.spec.endpoint, %addr, "connected");
        Ok(Framed::new(stream, BinaryCodec::new()))
    }

    async fn round_trip(&self, conn: &mut Connection, request: Request) -> Result<Frame, TransportError> {
        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed);
        conn.send(request.into_frame(opaque))
            .await
            .map_err(|e| TransportError::io(&self.spec.endpoint, &e))?;

        loop {
            match conn.next().await {
                Some(Ok(frame)) if frame.opaque == opaque => return Ok(frame),
                // Late response to an attempt that already timed out.
                Some(Ok(frame)) => {
                    debug!(endpoint = %self.spec.endpoint, opaque = frame.opaque, "discarding stale response");
                }
                Some(Err(e)) => return Err(TransportError::io(&self.spec.endpoint, &e)),
                None => {
                    return Err(TransportError::ConnectionClosed {
                        endpoint: self.spec.endpoint.clone(),
                    })
                }
            }
        }
    }

    async fn exchange(&self, request: Request) -> Result<Frame, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed {
                endpoint: self.spec.endpoint.clone(),
            });
        }
        if !self.alive.load(Ordering::Acquire) {
            return Err(TransportError::NodeDead {
                endpoint: self.spec.endpoint.clone(),
            });
        }

        let mut guard = self.connection.lock().await;
        let attempt = async {
            if guard.is_none() {
                *guard = Some(self.connect().await?);
            }
            let Some(conn) = guard.as_mut() else {
                return Err(TransportError::ConnectionClosed {
                    endpoint: self.spec.endpoint.clone(),
                });
            };
            self.round_trip(conn, request).await
        };

        let result = match tokio::time::timeout(self.send_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        };

        if let Err(e) = &result {
            *guard = None;
            drop(guard);
            self.mark_dead(e);
        }
        result
    }

    fn mark_dead(&self, cause: &TransportError) {
        if self.alive.swap(false, Ordering::AcqRel) {
            warn!(endpoint = %self.spec.endpoint, error = %cause, "node marked dead");
            self.failures.report(&self.spec.endpoint);
        }
    }
}

#[async_trait]
impl Node for TcpNode {
    fn endpoint(&self) -> &str {
        &self.spec.endpoint
    }

    fn host(&self) -> &str {
        &self.spec.host
    }

    fn view_base(&self) -> Option<&str> {
        self.spec.view_base.as_deref()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    async fn ping(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let probe = async {
            let mut conn = self.connect().await?;
            self.round_trip(&mut conn, Request::noop()).await?;
            Ok::<_, TransportError>(conn)
        };
        match tokio::time::timeout(self.send_timeout, probe).await {
            Ok(Ok(conn)) => {
                *self.connection.lock().await = Some(conn);
                if !self.alive.swap(true, Ordering::AcqRel) {
                    info!(endpoint = %self.spec.endpoint, "node is alive again");
                }
                true
            }
            Ok(Err(e)) => {
                debug!(endpoint = %self.spec.endpoint, error = %e, "ping failed");
                false
            }
            Err(_) => {
                debug!(endpoint = %self.spec.endpoint, "ping timed out");
                false
            }
        }
    }

    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        self.exchange(request).await.map(Response::from_frame)
    }

    async fn observe(&self, key: &str, vbucket: u16) -> Result<ObserveResult, TransportError> {
        let frame = self.exchange(Request::observe(key, vbucket)?).await?;
        let response = Response::from_frame(frame);
        if !response.status.is_success() {
            return Err(TransportError::Protocol(format!(
                "observe on {} returned {}",
                self.spec.endpoint, response.status
            )));
        }
        ObserveResult::parse(response.value)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut conn) = self.connection.lock().await.take() {
            if let Err(e) = conn.close().await {
                debug!(endpoint = %self.spec.endpoint, error = %e, "error closing connection");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TcpNodeFactory
// ---------------------------------------------------------------------------

/// Creates [`TcpNode`]s with a fixed per-attempt timeout.
#[derive(Debug, Clone)]
pub struct TcpNodeFactory {
    send_timeout: Duration,
}

impl TcpNodeFactory {
    #[must_use]
    pub fn new(send_timeout: Duration) -> Self {
        Self { send_timeout }
    }
}

impl NodeFactory for TcpNodeFactory {
    fn create(&self, spec: NodeSpec, failures: FailureSink) -> Result<NodeHandle, TransportError> {
        Ok(Arc::new(TcpNode::new(spec, self.send_timeout, failures)))
    }
}
