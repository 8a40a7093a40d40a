//! The seam to the peer transport stack (ICE/DTLS/SCTP).
//!
//! The node does not implement transport negotiation itself; it drives an
//! implementation of these traits. Each connection delivers its lifecycle
//! through an event channel so that the session manager can run one receive
//! loop per peer. [`mem`] provides an in-memory implementation used by the
//! test-suite and by embedders that stub the network.

pub mod mem;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{conf::IceServerConf, error::Result};

/// The lifecycle of a peer connection as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Events a connection pushes to its owning peer session.
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A locally gathered ICE candidate that should be relayed to the remote
    /// peer through signaling.
    IceCandidate(String),
    /// A data channel opened. Fired both for channels the remote peer created
    /// and, once they finish opening, for channels created locally through
    /// [`PeerConnection::open_data_channel`].
    DataChannelOpen(Arc<dyn DataChannel>),
    /// A text frame arrived on the open data channel.
    ChannelText(String),
    ChannelClosed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => write!(f, "StateChanged({:?})", state),
            TransportEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c),
            TransportEvent::DataChannelOpen(_) => write!(f, "DataChannelOpen"),
            TransportEvent::ChannelText(t) => write!(f, "ChannelText({})", t),
            TransportEvent::ChannelClosed => write!(f, "ChannelClosed"),
        }
    }
}

/// Factory for peer connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Creates a connection and the event channel it reports on.
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConf],
    ) -> Result<(Arc<dyn PeerConnection>, UnboundedReceiver<TransportEvent>)>;
}

/// One ICE/DTLS/SCTP session with a remote peer.
///
/// `create_offer` and `create_answer` install the produced description as
/// the local description before returning it, so callers only need to relay
/// the SDP through signaling.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;
    /// Creates a data channel. The channel is not usable until the transport
    /// reports [`TransportEvent::DataChannelOpen`] for it.
    async fn open_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    /// A snapshot of the transport's statistics report.
    async fn stats(&self) -> TransportStats;
    /// Closing is idempotent.
    async fn close(&self);
}

/// An ordered, reliable data channel multiplexed over a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;
    /// Bytes queued in the transport's send buffer but not yet handed to the
    /// network. The streamer throttles on this.
    fn buffered_amount(&self) -> usize;
    async fn send_binary(&self, frame: Bytes) -> Result<()>;
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self);
}

/// Counters and endpoints sampled from a connection.
#[derive(Clone, Debug, Default)]
pub struct TransportStats {
    /// Current round-trip time of the selected candidate pair, in seconds,
    /// if a pair has succeeded.
    pub rtt: Option<f64>,
    /// Cumulative bytes sent over the data channel.
    pub bytes_sent: u64,
    /// Cumulative bytes received over the data channel.
    pub bytes_received: u64,
    /// IP literals of the local candidates.
    pub local_candidates: Vec<String>,
    /// IP literals of the remote candidates.
    pub remote_candidates: Vec<String>,
}
