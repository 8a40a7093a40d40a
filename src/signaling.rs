//! The client side of the signaling service.
//!
//! The service itself is reached through an implementation of
//! [`SignalingTransport`], which models a reliable ordered message bus with
//! request/ack semantics. This module owns everything above that seam:
//! authentication, the server-list failover policy, and a single writer task
//! that serializes fire-and-forget emits so concurrent callers cannot
//! reorder each other's events.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use url::Url;

use crate::{
    conf::{NodeIdentity, ACK_TIMEOUT, CONNECT_RETRY_DELAY},
    error::{Error, Result},
    PeerId,
};

/// The wire event names. They are opaque tokens shared with the service.
pub mod event {
    pub const SIGN_UP: &str = "sign_up";
    pub const SIGN_IN: &str = "sign_in";
    pub const DEVICE_UPDATE: &str = "device_update";
    pub const HASH_VERIFY: &str = "hash_verify";
    pub const HASH_EMPTY: &str = "hash_empty";
    pub const COMMAND: &str = "command";
    pub const COMMAND_ACK: &str = "command_ack";
    pub const COMMAND_VERIFY: &str = "command_verify";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice_candidate";
    pub const PEER_STATS: &str = "peer_stats";
    pub const CLIENT_REQUEST_STATS: &str = "client_request_stats";
    pub const FRAGMENT_STATUS: &str = "fragment_status";
}

/// An event received from the bus: its name and raw payload.
pub type BusEvent = (String, Value);

/// The `{success, data?, error?}` envelope of request acknowledgements.
#[derive(Clone, Debug, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Connects to one signaling server.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// On success returns the sending half and the ordered stream of
    /// incoming events. The stream ending means the connection was lost.
    async fn connect(
        &self,
        server: &Url,
    ) -> Result<(Box<dyn SignalingSink>, UnboundedReceiver<BusEvent>)>;
}

/// The sending half of a signaling connection.
#[async_trait]
pub trait SignalingSink: Send + Sync + 'static {
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;
    /// Sends a request and resolves with the raw acknowledgement payload.
    async fn request(&self, event: &str, payload: Value) -> Result<Value>;
}

/// An offer or answer relayed through signaling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SdpEvent {
    pub peer_id: PeerId,
    pub sdp: String,
}

/// A trickled ICE candidate relayed through signaling. Senders may emit a
/// null candidate at end-of-candidates; receivers ignore it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CandidateEvent {
    pub peer_id: PeerId,
    #[serde(default)]
    pub candidate: Option<String>,
}

/// The shared client the rest of the node emits through.
pub struct SignalingClient {
    sink: Arc<dyn SignalingSink>,
    out_chan: UnboundedSender<(&'static str, Value)>,
}

impl SignalingClient {
    pub fn new(sink: Arc<dyn SignalingSink>) -> Arc<Self> {
        let (out_chan, out_port) = mpsc::unbounded_channel();
        tokio::spawn(Self::write_loop(Arc::clone(&sink), out_port));
        Arc::new(Self { sink, out_chan })
    }

    /// Drains queued emits one at a time so their order on the bus matches
    /// the order they were handed to the client.
    async fn write_loop(
        sink: Arc<dyn SignalingSink>,
        mut out_port: UnboundedReceiver<(&'static str, Value)>,
    ) {
        while let Some((event, payload)) = out_port.recv().await {
            if let Err(e) = sink.emit(event, payload).await {
                log::debug!("Dropping {} event: {}", event, e);
            }
        }
    }

    /// Fire-and-forget send. Safe to call from any task; failures are logged
    /// and swallowed.
    pub fn emit<T: Serialize>(&self, event: &'static str, payload: &T) {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to encode {} payload: {}", event, e);
                return;
            }
        };
        if self.out_chan.send((event, value)).is_err() {
            log::debug!("Signaling writer gone, dropping {} event", event);
        }
    }

    /// Request/response with the ack envelope, bounded by `timeout`.
    pub async fn emit_with_ack(
        &self,
        event: &'static str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Ack> {
        let reply = time::timeout(timeout, self.sink.request(event, payload))
            .await
            .map_err(|_| Error::AckTimeout(event.to_string()))??;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn sign_in(&self, identity: &NodeIdentity) -> Result<()> {
        let ack = self
            .emit_with_ack(event::SIGN_IN, serde_json::to_value(identity)?, ACK_TIMEOUT)
            .await?;
        if ack.success {
            Ok(())
        } else {
            Err(Error::SignInRejected(
                ack.error.unwrap_or_else(|| "unspecified".into()),
            ))
        }
    }

    /// Registers the node and returns the credentials the service assigned.
    pub async fn sign_up(&self) -> Result<NodeIdentity> {
        let ack = self
            .emit_with_ack(event::SIGN_UP, Value::Object(Default::default()), ACK_TIMEOUT)
            .await?;
        if !ack.success {
            return Err(Error::SignUpRejected(
                ack.error.unwrap_or_else(|| "unspecified".into()),
            ));
        }
        let data = ack
            .data
            .ok_or_else(|| Error::SignUpRejected("ack carried no credentials".into()))?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Walks the configured server list until one accepts the connection,
/// pausing between attempts. Once every server has refused, the error is
/// fatal to the process.
pub(crate) async fn connect_any(
    transport: &Arc<dyn SignalingTransport>,
    servers: &[Url],
) -> Result<(Arc<SignalingClient>, UnboundedReceiver<BusEvent>)> {
    for (i, server) in servers.iter().enumerate() {
        log::info!("Connecting to signaling server {}", server);
        match transport.connect(server).await {
            Ok((sink, events)) => {
                log::info!("Connected to signaling server {}", server);
                return Ok((SignalingClient::new(Arc::from(sink)), events));
            }
            Err(e) => {
                log::warn!("Signaling server {} unreachable: {}", server, e);
                if i + 1 < servers.len() {
                    time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(Error::SignalingExhausted)
}
