//! Bidirectional RPC bus between the fleet orchestrator and worker runners.
//!
//! Transport is newline-delimited JSON over a Unix domain socket --
//! the same "JSON over a process boundary" shape
//! [`crate::harness::claude_code`] already parses for the agent's own
//! stream-json protocol, reused here for the master<->worker leg so both
//! legs of this system speak one wire idiom.

pub mod reporter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, oneshot};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc call to method {0:?} timed out")]
    Timeout(String),
    #[error("peer disconnected before responding")]
    Disconnected,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("no handler registered for method {0:?}")]
    NoHandler(String),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("rpc frame failed HMAC verification, dropping")]
    TamperedFrame,
}

/// Shared secret for the bus's optional authenticated-signing mode.
///
/// This is HMAC-SHA256 over the wire, the same idiom as
/// [`crate::token`]'s scoped tokens: every envelope is wrapped in a
/// [`SignedFrame`] and signed before it goes out, and verified before the
/// inner envelope is parsed on receipt. It authenticates the frame against
/// tampering by anything that doesn't hold the key; it does not encrypt the
/// payload, since the fleet's own Unix socket is already local-only and the
/// threat this guards against is a stray or malicious local process writing
/// to the socket, not eavesdropping. Handshake and key distribution are out
/// of scope: both ends are expected to already hold the same key.
#[derive(Clone)]
pub struct EncryptionKey(Vec<u8>);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EncryptionKey").field(&"<redacted>").finish()
    }
}

impl EncryptionKey {
    pub fn new(secret: Vec<u8>) -> Self {
        Self(secret)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, RpcError> {
        let bytes = hex::decode(hex_str).map_err(|e| RpcError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Read the shared key out of `GATOR_BUS_ENCRYPTION_KEY` as hex, the
    /// out-of-band channel the bus assumes the key arrives through. Returns
    /// `None` when unset, so callers treat it like any other optional
    /// config knob rather than a hard requirement.
    pub fn from_env() -> Option<Self> {
        let hex_str = std::env::var("GATOR_BUS_ENCRYPTION_KEY").ok()?;
        Self::from_hex(&hex_str).ok()
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, body: &[u8], tag_hex: &str) -> Result<(), RpcError> {
        let tag = hex::decode(tag_hex).map_err(|_| RpcError::TamperedFrame)?;
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(body);
        mac.verify_slice(&tag).map_err(|_| RpcError::TamperedFrame)
    }
}

/// On-wire shape of a signed envelope when `encryption` is configured: the
/// inner envelope JSON carried verbatim as `body`, plus its hex HMAC tag.
#[derive(Debug, Serialize, Deserialize)]
struct SignedFrame {
    body: String,
    tag: String,
}

/// Wire envelope. One JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Envelope {
    RpcRequest {
        id: Uuid,
        method: String,
        params: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    RpcResponse {
        id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Event {
        channel: String,
        worker_id: String,
        task_id: Option<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// An async handler for an incoming RPC method call.
pub type Handler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, String>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, method: impl Into<String>, handler: Handler) {
        self.handlers.write().await.insert(method.into(), handler);
    }

    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, String> {
        let handler = self.handlers.read().await.get(method).cloned();
        match handler {
            Some(f) => f(params).await,
            None => Err(format!("method not found: {method}")),
        }
    }
}

type PendingTable = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<serde_json::Value, String>>>>>;

/// One side of the bus bound to a single connection. Both the master
/// (listening) and worker (connecting) side use this same type.
pub struct Bus {
    writer: Arc<Mutex<tokio::io::WriteHalf<UnixStream>>>,
    pending: PendingTable,
    handlers: HandlerRegistry,
    events_tx: tokio::sync::mpsc::UnboundedSender<Envelope>,
    encryption: Option<EncryptionKey>,
}

impl Bus {
    /// Wrap an already-connected stream, spawning its read loop. `encryption`
    /// must match on both ends of the connection; a mismatch just means
    /// every frame fails to parse or verify and gets dropped.
    pub fn from_stream(
        stream: UnixStream,
        handlers: HandlerRegistry,
        encryption: Option<EncryptionKey>,
    ) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let bus = Arc::new(Self {
            writer: Arc::new(Mutex::new(write_half)),
            pending: Arc::clone(&pending),
            handlers: handlers.clone(),
            events_tx: events_tx.clone(),
            encryption,
        });

        let read_bus = Arc::clone(&bus);
        tokio::spawn(async move {
            read_bus.read_loop(read_half).await;
        });

        (bus, events_rx)
    }

    async fn read_loop(self: Arc<Self>, read_half: tokio::io::ReadHalf<UnixStream>) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(l)) => l,
                Ok(None) | Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let body = match &self.encryption {
                Some(key) => match serde_json::from_str::<SignedFrame>(&line) {
                    Ok(frame) => match key.verify(frame.body.as_bytes(), &frame.tag) {
                        Ok(()) => frame.body,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping rpc frame with bad HMAC tag");
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unparseable signed rpc frame");
                        continue;
                    }
                },
                None => line,
            };
            let envelope: Envelope = match serde_json::from_str(&body) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparseable rpc envelope");
                    continue;
                }
            };
            match envelope {
                Envelope::RpcResponse { id, result, error, .. } => {
                    if let Some(sender) = self.pending.lock().await.remove(&id) {
                        let outcome = match error {
                            Some(e) => Err(e),
                            None => Ok(result.unwrap_or(serde_json::Value::Null)),
                        };
                        let _ = sender.send(outcome);
                    }
                }
                Envelope::RpcRequest { id, method, params, .. } => {
                    let handlers = self.handlers.clone();
                    let writer = Arc::clone(&self.writer);
                    let encryption = self.encryption.clone();
                    tokio::spawn(async move {
                        let outcome = handlers.dispatch(&method, params).await;
                        let response = match outcome {
                            Ok(result) => Envelope::RpcResponse {
                                id,
                                result: Some(result),
                                error: None,
                                timestamp: Utc::now(),
                            },
                            Err(e) => Envelope::RpcResponse {
                                id,
                                result: None,
                                error: Some(e),
                                timestamp: Utc::now(),
                            },
                        };
                        let _ = write_envelope(&writer, &encryption, &response).await;
                    });
                }
                other => {
                    let _ = self.events_tx.send(other);
                }
            }
        }
        // Connection closed: reject every outstanding call so the pending
        // table never leaks past this point.
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err("peer disconnected".to_string()));
        }
    }

    /// Call a remote method and await its response, or time out.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Envelope::RpcRequest {
            id,
            method: method.to_string(),
            params,
            timestamp: Utc::now(),
        };
        write_envelope(&self.writer, &self.encryption, &request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(remote))) => Err(RpcError::Remote(remote)),
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Timeout(method.to_string()))
            }
        }
    }

    /// Fire-and-forget an event onto the wire (no response expected).
    pub async fn emit(&self, channel: &str, worker_id: &str, task_id: Option<&str>, payload: serde_json::Value) {
        let envelope = Envelope::Event {
            channel: channel.to_string(),
            worker_id: worker_id.to_string(),
            task_id: task_id.map(|s| s.to_string()),
            payload,
            timestamp: Utc::now(),
        };
        if let Err(e) = write_envelope(&self.writer, &self.encryption, &envelope).await {
            tracing::warn!(error = %e, channel, "failed to emit rpc event");
        }
    }

    pub async fn heartbeat(&self, worker_id: &str) {
        let envelope = Envelope::Heartbeat {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
        };
        let _ = write_envelope(&self.writer, &self.encryption, &envelope).await;
    }

    /// Reject every outstanding call; called on deliberate shutdown.
    pub async fn shutdown(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err("bus shut down".to_string()));
        }
    }
}

async fn write_envelope(
    writer: &Arc<Mutex<tokio::io::WriteHalf<UnixStream>>>,
    encryption: &Option<EncryptionKey>,
    envelope: &Envelope,
) -> Result<(), RpcError> {
    let body = serde_json::to_string(envelope)?;
    let mut line = match encryption {
        Some(key) => {
            let tag = key.sign(body.as_bytes());
            serde_json::to_string(&SignedFrame { body, tag })?
        }
        None => body,
    };
    line.push('\n');
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Master-side listener: accepts one connection per worker.
pub struct BusServer {
    listener: UnixListener,
    handlers: HandlerRegistry,
    encryption: Option<EncryptionKey>,
}

impl BusServer {
    pub fn bind(
        socket_path: &std::path::Path,
        handlers: HandlerRegistry,
        encryption: Option<EncryptionKey>,
    ) -> Result<Self, RpcError> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        Ok(Self { listener, handlers, encryption })
    }

    /// Accept the next incoming connection, returning a bus for it plus its
    /// raw event stream (the caller typically forwards parsed `Event`s into
    /// the fleet's own mpsc channel).
    pub async fn accept(&self) -> Result<(Arc<Bus>, tokio::sync::mpsc::UnboundedReceiver<Envelope>), RpcError> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(Bus::from_stream(stream, self.handlers.clone(), self.encryption.clone()))
    }
}

/// Worker-side client: connects out to the master's socket.
pub async fn connect(
    socket_path: &std::path::Path,
    handlers: HandlerRegistry,
    encryption: Option<EncryptionKey>,
) -> Result<(Arc<Bus>, tokio::sync::mpsc::UnboundedReceiver<Envelope>), RpcError> {
    let stream = UnixStream::connect(socket_path).await?;
    Ok(Bus::from_stream(stream, handlers, encryption))
}
