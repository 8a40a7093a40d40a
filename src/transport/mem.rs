//! An in-memory transport.
//!
//! Connections negotiate instantly and data channels collect the frames sent
//! through them. The channel's buffer level can be pinned to exercise the
//! streamer's flow control. The test-suite drives peer lifecycles by pushing
//! [`TransportEvent`]s through the handle returned for each connection.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{
    DataChannel, PeerConnection, SdpKind, Transport, TransportEvent, TransportStats,
};
use crate::{
    conf::IceServerConf,
    error::{Error, Result},
};

/// Creates [`MemConnection`]s and keeps a handle to each so tests can drive
/// them from the outside.
#[derive(Default)]
pub struct MemTransport {
    handles: Mutex<Vec<MemHandle>>,
}

/// The test side of one connection: the event sender feeding the peer
/// session's receive loop plus the connection itself.
#[derive(Clone)]
pub struct MemHandle {
    pub events: UnboundedSender<TransportEvent>,
    pub conn: Arc<MemConnection>,
}

impl MemTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handles of all connections created so far, in creation order.
    pub fn handles(&self) -> Vec<MemHandle> {
        self.handles.lock().unwrap().clone()
    }

    pub fn handle(&self, index: usize) -> Option<MemHandle> {
        self.handles.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn create_connection(
        &self,
        _ice_servers: &[IceServerConf],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (events, events_port) = mpsc::unbounded_channel();
        let conn = Arc::new(MemConnection::default());
        self.handles.lock().unwrap().push(MemHandle {
            events,
            conn: Arc::clone(&conn),
        });
        Ok((conn as Arc<dyn PeerConnection>, events_port))
    }
}

/// A connection that records the descriptions and candidates applied to it.
#[derive(Default)]
pub struct MemConnection {
    offer_count: AtomicUsize,
    closed: AtomicBool,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    candidates: Mutex<Vec<String>>,
    stats: Mutex<TransportStats>,
    channel: OnceChannel,
}

/// Lazily created channel shared by `open_data_channel` and the tests.
#[derive(Default)]
struct OnceChannel(Mutex<Option<Arc<MemDataChannel>>>);

impl OnceChannel {
    fn get(&self) -> Arc<MemDataChannel> {
        let mut slot = self.0.lock().unwrap();
        match &*slot {
            Some(channel) => Arc::clone(channel),
            None => {
                let channel = Arc::new(MemDataChannel::default());
                *slot = Some(Arc::clone(&channel));
                channel
            }
        }
    }
}

impl MemConnection {
    /// The connection's data channel, creating it if necessary. Tests use
    /// this to deliver `DataChannelOpen` and to inspect sent frames.
    pub fn channel(&self) -> Arc<MemDataChannel> {
        self.channel.get()
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for MemConnection {
    async fn create_offer(&self) -> Result<String> {
        let n = self.offer_count.fetch_add(1, Ordering::Relaxed);
        Ok(format!("offer-{}", n))
    }

    async fn create_answer(&self) -> Result<String> {
        let n = self.offer_count.fetch_add(1, Ordering::Relaxed);
        Ok(format!("answer-{}", n))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        if sdp.starts_with("invalid") {
            return Err(Error::Transport("unparseable description".into()));
        }
        self.remote_descriptions
            .lock()
            .unwrap()
            .push((kind, sdp.to_string()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        if candidate.starts_with("invalid") {
            return Err(Error::Transport("unparseable candidate".into()));
        }
        self.candidates.lock().unwrap().push(candidate.to_string());
        Ok(())
    }

    async fn open_data_channel(&self, _label: &str) -> Result<Arc<dyn DataChannel>> {
        Ok(self.channel.get() as Arc<dyn DataChannel>)
    }

    async fn stats(&self) -> TransportStats {
        self.stats.lock().unwrap().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.channel.get().set_open(false);
    }
}

/// A data channel that collects sent frames.
///
/// By default the buffer drains instantly. [`MemDataChannel::pin_buffered`]
/// freezes the buffer level at a fixed value to simulate a congested
/// transport.
#[derive(Default)]
pub struct MemDataChannel {
    open: AtomicBool,
    buffered: AtomicUsize,
    pinned: AtomicBool,
    close_count: AtomicUsize,
    binary: Mutex<Vec<Bytes>>,
    text: Mutex<Vec<String>>,
}

impl MemDataChannel {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }

    pub fn pin_buffered(&self, amount: usize) {
        self.pinned.store(true, Ordering::Relaxed);
        self.buffered.store(amount, Ordering::Relaxed);
    }

    pub fn release_buffered(&self) {
        self.pinned.store(false, Ordering::Relaxed);
        self.buffered.store(0, Ordering::Relaxed);
    }

    pub fn sent_binary(&self) -> Vec<Bytes> {
        self.binary.lock().unwrap().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.text.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DataChannel for MemDataChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    async fn send_binary(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        if self.pinned.load(Ordering::Relaxed) {
            self.buffered.fetch_add(frame.len(), Ordering::Relaxed);
        }
        self.binary.lock().unwrap().push(frame);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        self.text.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::Relaxed);
        self.open.store(false, Ordering::Relaxed);
    }
}
