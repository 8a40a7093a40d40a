//! Per-session fragment streaming with adaptive back-pressure and
//! cooperative cancellation.
//!
//! One streamer task runs per READY_NODE request. It owns its transfer's
//! file handle and byte counters; the only cross-task write into a transfer
//! is the cancellation flag, which is checked before every chunk send and
//! while the streamer is paused waiting for the channel buffer to drain.

use {
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    bytes::BytesMut,
    tokio::{
        fs::File,
        io::AsyncReadExt,
        time::{self, Duration, Instant},
    },
};

use crate::{
    error::Result,
    peer::PeerManager,
    probe,
    protocol::{self, ControlMessage},
    signaling::event,
    transport::DataChannel,
    FragmentId, PeerId, SessionId, CHUNK_SIZE,
};

/// Error string of a transfer that waited too long for the channel buffer to
/// drain.
pub(crate) const THROTTLED_ERROR: &str = "Transfer throttled too long";

/// The lifecycle of a single transfer, as reported through `fragment_status`
/// events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum TransferStatus {
    /// The request was received and is being validated.
    Starting,
    InProgress,
    Completed,
    Failed,
    Canceled,
    /// The fragment is not in the index or its file is gone.
    FileNotFound,
    /// The data channel closed before streaming could begin.
    DataChannelClosed,
    /// The resource gate refused the transfer.
    LowMemory,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Starting | TransferStatus::InProgress)
    }
}

/// State of one in-flight transfer. Owned by its streamer task and
/// registered with the peer session so that teardown and remote cancels can
/// reach it.
pub(crate) struct TransferSession {
    pub fragment_id: FragmentId,
    pub session_id: SessionId,
    pub total_bytes: u64,
    sent_bytes: AtomicU64,
    canceled: AtomicBool,
    status: Mutex<TransferStatus>,
    started_at: Instant,
}

impl TransferSession {
    pub fn new(fragment_id: FragmentId, session_id: SessionId, total_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            fragment_id,
            session_id,
            total_bytes,
            sent_bytes: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
            status: Mutex::new(TransferStatus::Starting),
            started_at: Instant::now(),
        })
    }

    /// Requests cancellation. The streamer stops within one chunk.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.lock().unwrap()
    }

    fn add_sent(&self, n: u64) {
        self.sent_bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn set_in_progress(&self) {
        let mut status = self.status.lock().unwrap();
        if !status.is_terminal() {
            *status = TransferStatus::InProgress;
        }
    }

    /// Records the terminal status. Returns false if another terminal status
    /// won the race, in which case the caller must not report again.
    fn finish(&self, terminal: TransferStatus) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut status = self.status.lock().unwrap();
        if status.is_terminal() {
            return false;
        }
        *status = terminal;
        true
    }
}

/// The payload of a `fragment_status` event.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct FragmentStatusEvent {
    pub peer_id: PeerId,
    pub fragment_id: FragmentId,
    pub session_id: SessionId,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sent_bytes: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_sec: Option<u64>,
}

/// Reports a transfer that could not get past validation (no
/// [`TransferSession`] exists yet).
pub(crate) fn emit_rejected(
    manager: &PeerManager,
    peer_id: &str,
    fragment_id: &str,
    session_id: &str,
    status: TransferStatus,
) {
    manager.signaling().emit(
        event::FRAGMENT_STATUS,
        &FragmentStatusEvent {
            peer_id: peer_id.to_string(),
            fragment_id: fragment_id.to_string(),
            session_id: session_id.to_string(),
            status,
            error: None,
            sent_bytes: 0,
            total_bytes: 0,
            duration_ms: None,
            bytes_per_sec: None,
        },
    );
}

/// Streams one fragment to one peer. Spawned by the session manager for
/// every READY_NODE request.
pub(crate) async fn run(
    manager: Arc<PeerManager>,
    peer_id: PeerId,
    channel: Arc<dyn DataChannel>,
    fragment_id: FragmentId,
    session_id: SessionId,
) {
    let streamer = Streamer {
        manager,
        peer_id,
        channel,
        fragment_id,
        session_id,
    };
    streamer.run().await;
}

enum Outcome {
    Completed,
    Canceled,
    Throttled,
    ChannelClosed,
}

enum Drain {
    Drained,
    TimedOut,
    Canceled,
}

struct Streamer {
    manager: Arc<PeerManager>,
    peer_id: PeerId,
    channel: Arc<dyn DataChannel>,
    fragment_id: FragmentId,
    session_id: SessionId,
}

impl Streamer {
    async fn run(self) {
        log::info!(
            "Peer {} requested fragment {} (session {})",
            self.peer_id,
            self.fragment_id,
            self.session_id
        );
        self.emit_early(TransferStatus::Starting);

        // the fragment must be indexed and its file present
        let path = match self.manager.store().lookup(&self.fragment_id) {
            Some(path) => path,
            None => {
                log::warn!("Fragment {} is not in the index", self.fragment_id);
                self.emit_early(TransferStatus::FileNotFound);
                return;
            }
        };
        let total_bytes = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                log::warn!("Fragment {} file unreadable: {}", self.fragment_id, e);
                self.emit_early(TransferStatus::FileNotFound);
                return;
            }
        };

        if !self.channel.is_open() {
            log::warn!(
                "Data channel to peer {} closed before streaming began",
                self.peer_id
            );
            self.emit_early(TransferStatus::DataChannelClosed);
            return;
        }

        if self.is_under_pressure() {
            // tell the peer we're not serving this one before reporting it
            self.send_cancel_frame().await;
            self.emit_early(TransferStatus::LowMemory);
            return;
        }

        let session = TransferSession::new(
            self.fragment_id.clone(),
            self.session_id.clone(),
            total_bytes,
        );
        if !self
            .manager
            .register_transfer(&self.peer_id, Arc::clone(&session))
        {
            log::warn!(
                "Peer {} went away before transfer {} started",
                self.peer_id,
                self.session_id
            );
            return;
        }

        session.set_in_progress();
        self.emit(&session, TransferStatus::InProgress, None);

        let outcome = self.stream_file(&path, &session).await;
        match outcome {
            Ok(Outcome::Completed) => {
                if session.finish(TransferStatus::Completed) {
                    let duration = session.started_at.elapsed();
                    let millis = duration.as_millis() as u64;
                    let rate = session.sent_bytes() * 1000 / millis.max(1);
                    log::info!(
                        "Completed fragment {} to peer {}: {} bytes in {} ms",
                        self.fragment_id,
                        self.peer_id,
                        session.sent_bytes(),
                        millis
                    );
                    self.emit_completed(&session, millis, rate);
                }
            }
            Ok(Outcome::Canceled) => {
                if session.finish(TransferStatus::Canceled) {
                    log::info!(
                        "Transfer {} to peer {} canceled after {} bytes",
                        self.session_id,
                        self.peer_id,
                        session.sent_bytes()
                    );
                    self.emit(&session, TransferStatus::Canceled, None);
                }
            }
            Ok(Outcome::Throttled) => {
                if session.finish(TransferStatus::Failed) {
                    log::warn!(
                        "Transfer {} to peer {} throttled too long, giving up",
                        self.session_id,
                        self.peer_id
                    );
                    self.emit(
                        &session,
                        TransferStatus::Failed,
                        Some(THROTTLED_ERROR.to_string()),
                    );
                }
            }
            Ok(Outcome::ChannelClosed) => {
                if session.finish(TransferStatus::Failed) {
                    log::warn!(
                        "Data channel to peer {} died mid-transfer {}",
                        self.peer_id,
                        self.session_id
                    );
                    self.emit(
                        &session,
                        TransferStatus::Failed,
                        Some("data channel closed".to_string()),
                    );
                }
            }
            Err(e) => {
                if session.finish(TransferStatus::Failed) {
                    log::warn!(
                        "Transfer {} to peer {} failed: {}",
                        self.session_id,
                        self.peer_id,
                        e
                    );
                    self.emit(&session, TransferStatus::Failed, Some(e.to_string()));
                }
            }
        }

        // the file handle dropped with stream_file; drop the bookkeeping
        self.manager
            .remove_transfer(&self.peer_id, &self.session_id);
    }

    /// Reads the fragment in chunk-sized slices and frames each onto the
    /// data channel, pausing while the transport buffer is saturated.
    async fn stream_file(&self, path: &std::path::Path, session: &Arc<TransferSession>) -> Result<Outcome> {
        let conf = self.manager.conf();
        let mut file = File::open(path).await?;
        let mut last_refresh = Instant::now();

        // a zero-length fragment still needs its end-of-fragment frame
        if session.total_bytes == 0 {
            let frame = protocol::encode_chunk(&session.session_id, true, &[])?;
            if self.channel.send_binary(frame).await.is_err() {
                return Ok(Outcome::ChannelClosed);
            }
            return Ok(Outcome::Completed);
        }

        loop {
            if session.is_canceled() {
                return Ok(Outcome::Canceled);
            }

            if self.channel.buffered_amount() > conf.max_buffer_threshold {
                match self.wait_for_drain(session).await {
                    Drain::Drained => {}
                    Drain::TimedOut => return Ok(Outcome::Throttled),
                    Drain::Canceled => return Ok(Outcome::Canceled),
                }
            }

            let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
            let n = file.read_buf(&mut buf).await?;
            if n == 0 {
                // hitting EOF early means the file shrank under us
                if session.sent_bytes() == session.total_bytes {
                    return Ok(Outcome::Completed);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "fragment shorter than its recorded size",
                )
                .into());
            }

            let chunk = buf.freeze();
            let last = session.sent_bytes() + chunk.len() as u64 >= session.total_bytes;
            let frame = protocol::encode_chunk(&session.session_id, last, &chunk)?;
            if self.channel.send_binary(frame).await.is_err() {
                return Ok(Outcome::ChannelClosed);
            }
            session.add_sent(chunk.len() as u64);

            // keep the watchdog off a peer that is busy receiving
            if last_refresh.elapsed() >= conf.activity_refresh_interval {
                self.manager.update_last_activity(&self.peer_id);
                last_refresh = Instant::now();
            }

            if last {
                return Ok(Outcome::Completed);
            }
        }
    }

    /// Polls the channel buffer until it drains below the resume level or
    /// the deadline passes. The deadline scales with the backlog, one
    /// millisecond per buffered KiB, clamped to the configured bounds, and
    /// is computed once per pause.
    async fn wait_for_drain(&self, session: &TransferSession) -> Drain {
        let conf = self.manager.conf();
        let buffered = self.channel.buffered_amount();
        let wait = Duration::from_millis((buffered / 1024) as u64)
            .clamp(conf.min_throttle_wait, conf.max_throttle_wait);
        let deadline = Instant::now() + wait;
        log::debug!(
            "Pausing transfer {}: {} bytes buffered, waiting up to {:?}",
            self.session_id,
            buffered,
            wait
        );

        loop {
            if session.is_canceled() {
                return Drain::Canceled;
            }
            if self.channel.buffered_amount() <= conf.resume_buffer_level {
                return Drain::Drained;
            }
            if Instant::now() >= deadline {
                return Drain::TimedOut;
            }
            time::sleep(conf.throttle_check_interval).await;
        }
    }

    fn is_under_pressure(&self) -> bool {
        let conf = self.manager.conf();
        let buffered = self.channel.buffered_amount();
        if buffered > conf.max_channel_buffer {
            log::warn!(
                "Channel to peer {} already buffers {} bytes, refusing transfer",
                self.peer_id,
                buffered
            );
            return true;
        }
        match probe::memory() {
            Ok(memory) => {
                if memory.free_percent() < conf.min_free_ram_percent {
                    log::warn!(
                        "Free RAM at {}%, refusing transfer {}",
                        memory.free_percent(),
                        self.session_id
                    );
                    return true;
                }
                false
            }
            Err(e) => {
                log::warn!("Memory probe failed, letting transfer through: {}", e);
                false
            }
        }
    }

    async fn send_cancel_frame(&self) {
        let message = ControlMessage::Canceled {
            session_id: self.session_id.clone(),
            fragment_id: Some(self.fragment_id.clone()),
            error: Some("insufficient resources".to_string()),
        };
        match message.to_json() {
            Ok(json) => {
                if let Err(e) = self.channel.send_text(&json).await {
                    log::warn!("Failed to send cancel to peer {}: {}", self.peer_id, e);
                }
            }
            Err(e) => log::warn!("Failed to encode cancel message: {}", e),
        }
    }

    fn emit_early(&self, status: TransferStatus) {
        emit_rejected(
            &self.manager,
            &self.peer_id,
            &self.fragment_id,
            &self.session_id,
            status,
        );
    }

    fn emit(&self, session: &TransferSession, status: TransferStatus, error: Option<String>) {
        self.manager.signaling().emit(
            event::FRAGMENT_STATUS,
            &FragmentStatusEvent {
                peer_id: self.peer_id.clone(),
                fragment_id: self.fragment_id.clone(),
                session_id: self.session_id.clone(),
                status,
                error,
                sent_bytes: session.sent_bytes(),
                total_bytes: session.total_bytes,
                duration_ms: None,
                bytes_per_sec: None,
            },
        );
    }

    fn emit_completed(&self, session: &TransferSession, duration_ms: u64, bytes_per_sec: u64) {
        self.manager.signaling().emit(
            event::FRAGMENT_STATUS,
            &FragmentStatusEvent {
                peer_id: self.peer_id.clone(),
                fragment_id: self.fragment_id.clone(),
                session_id: self.session_id.clone(),
                status: TransferStatus::Completed,
                error: None,
                sent_bytes: session.sent_bytes(),
                total_bytes: session.total_bytes,
                duration_ms: Some(duration_ms),
                bytes_per_sec: Some(bytes_per_sec),
            },
        );
    }
}
