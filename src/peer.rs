//! The peer session manager.
//!
//! One session exists per remote peer id. The manager is the only writer of
//! the session map; every other component (streamers, the stats sampler, the
//! watchdogs) goes through its accessors and re-checks session presence on
//! each entry, so a torn-down peer can never be revived by a stale
//! reference.

use {
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc::UnboundedReceiver, watch},
        task::JoinHandle,
        time::{self, Instant},
    },
};

use crate::{
    conf::{IceServerConf, PeerConf},
    error::Result,
    fragment::FragmentStore,
    protocol::{self, ControlMessage},
    signaling::{event, CandidateEvent, SdpEvent, SignalingClient},
    stats::{self, StatsTracker},
    transfer::{self, TransferSession, TransferStatus},
    transport::{
        ConnectionState, DataChannel, PeerConnection, SdpKind, Transport, TransportEvent,
    },
    PeerId, SessionId,
};

/// At any given time, a session with a remote peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerState {
    /// The session exists (incoming offer or local connect intent) but SDP
    /// negotiation has not produced a description yet.
    New,
    /// SDP and ICE exchange in flight.
    Negotiating,
    /// The transport is up; waiting for the data channel to open.
    Connected,
    /// The data channel is open and fragment requests may arrive.
    Ready,
}

/// The per-peer state owned by the manager.
struct PeerSession {
    state: PeerState,
    conn: Arc<dyn PeerConnection>,
    /// Set once the transport reports the data channel open.
    channel: Option<Arc<dyn DataChannel>>,
    /// Refreshed on every signaling or channel event; the sweeper reaps
    /// sessions this tells it are stale.
    last_activity: Instant,
    /// In-flight transfers by session id. Entries are removed by their
    /// streamer task when they reach a terminal status.
    transfers: HashMap<SessionId, Arc<TransferSession>>,
    /// Pushing a new deadline re-arms the session's watchdog; dropping the
    /// sender stops it.
    deadline_chan: watch::Sender<Instant>,
    /// Flipping this releases the session's event pump.
    shutdown_chan: watch::Sender<bool>,
    stats_task: JoinHandle<()>,
    stats_tracker: Arc<StatsTracker>,
}

pub(crate) struct PeerManager {
    conf: PeerConf,
    ice_servers: Vec<IceServerConf>,
    transport: Arc<dyn Transport>,
    signaling: Arc<SignalingClient>,
    store: Arc<FragmentStore>,
    peers: Mutex<HashMap<PeerId, PeerSession>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Creates the manager and starts the global inactivity sweeper.
    ///
    /// The signaling handlers (`on_offer`, `on_answer`, `on_ice_candidate`)
    /// expect to be invoked sequentially per peer, which the signaling
    /// dispatch loop guarantees by processing bus events in arrival order.
    pub fn new(
        conf: PeerConf,
        ice_servers: Vec<IceServerConf>,
        transport: Arc<dyn Transport>,
        signaling: Arc<SignalingClient>,
        store: Arc<FragmentStore>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            conf,
            ice_servers,
            transport,
            signaling,
            store,
            peers: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        });
        let sweeper = tokio::spawn(Self::sweep(Arc::clone(&manager)));
        *manager.sweeper.lock().unwrap() = Some(sweeper);
        manager
    }

    pub fn conf(&self) -> &PeerConf {
        &self.conf
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.signaling
    }

    pub fn store(&self) -> &Arc<FragmentStore> {
        &self.store
    }

    /// Handles a remote offer: creates the session if absent, answers on the
    /// existing connection while negotiation is still in flight, and ignores
    /// the offer if a live session exists (it has to close first). Any
    /// negotiation failure tears the session down and is otherwise dropped
    /// silently.
    pub async fn on_offer(self: &Arc<Self>, peer_id: PeerId, sdp: String) {
        let existing = {
            let peers = self.peers.lock().unwrap();
            peers
                .get(&peer_id)
                .map(|session| (session.state, Arc::clone(&session.conn)))
        };
        let conn = match existing {
            Some((PeerState::New, conn)) | Some((PeerState::Negotiating, conn)) => {
                log::info!("Peer {} renegotiating on the existing session", peer_id);
                conn
            }
            Some((state, _)) => {
                log::warn!(
                    "Ignoring offer from peer {} while session is {:?}",
                    peer_id,
                    state
                );
                return;
            }
            None => match self.create_session(&peer_id).await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Failed to create session for peer {}: {}", peer_id, e);
                    return;
                }
            },
        };
        if let Err(e) = self.answer_offer(&peer_id, &conn, &sdp).await {
            log::warn!("Negotiation with peer {} failed: {}", peer_id, e);
            self.cleanup_peer(&peer_id).await;
        }
    }

    async fn answer_offer(
        &self,
        peer_id: &PeerId,
        conn: &Arc<dyn PeerConnection>,
        sdp: &str,
    ) -> Result<()> {
        conn.set_remote_description(SdpKind::Offer, sdp).await?;
        let answer = conn.create_answer().await?;
        self.set_state(peer_id, PeerState::Negotiating);
        self.signaling.emit(
            event::ANSWER,
            &SdpEvent {
                peer_id: peer_id.clone(),
                sdp: answer,
            },
        );
        self.update_last_activity(peer_id);
        Ok(())
    }

    /// Applies a remote answer. An answer for an unknown peer is logged and
    /// dropped.
    pub async fn on_answer(&self, peer_id: &PeerId, sdp: &str) {
        let conn = {
            let peers = self.peers.lock().unwrap();
            peers.get(peer_id).map(|session| Arc::clone(&session.conn))
        };
        let conn = match conn {
            Some(conn) => conn,
            None => {
                log::warn!("Answer from unknown peer {}", peer_id);
                return;
            }
        };
        match conn.set_remote_description(SdpKind::Answer, sdp).await {
            Ok(()) => self.update_last_activity(peer_id),
            Err(e) => {
                log::warn!("Failed to apply answer from peer {}: {}", peer_id, e);
                self.cleanup_peer(peer_id).await;
            }
        }
    }

    /// Applies a trickled ICE candidate. Null or empty candidates are
    /// ignored; candidates for unknown peers are logged and dropped.
    pub async fn on_ice_candidate(&self, peer_id: &PeerId, candidate: Option<&str>) {
        let candidate = match candidate {
            Some(candidate) if !candidate.is_empty() => candidate,
            _ => {
                log::debug!("Ignoring empty ICE candidate from peer {}", peer_id);
                return;
            }
        };
        let conn = {
            let peers = self.peers.lock().unwrap();
            peers.get(peer_id).map(|session| Arc::clone(&session.conn))
        };
        let conn = match conn {
            Some(conn) => conn,
            None => {
                log::warn!("ICE candidate from unknown peer {}", peer_id);
                return;
            }
        };
        match conn.add_ice_candidate(candidate).await {
            Ok(()) => self.update_last_activity(peer_id),
            Err(e) => {
                log::warn!("Failed to apply candidate from peer {}: {}", peer_id, e);
                self.cleanup_peer(peer_id).await;
            }
        }
    }

    /// Initiates a connection to a peer. A no-op if a session already
    /// exists.
    pub async fn connect(self: &Arc<Self>, peer_id: PeerId) {
        if self.peers.lock().unwrap().contains_key(&peer_id) {
            log::debug!("Already connected to peer {}", peer_id);
            return;
        }
        let conn = match self.create_session(&peer_id).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to create session for peer {}: {}", peer_id, e);
                return;
            }
        };
        if let Err(e) = self.send_offer(&peer_id, &conn).await {
            log::warn!("Failed to send offer to peer {}: {}", peer_id, e);
            self.cleanup_peer(&peer_id).await;
        }
    }

    async fn send_offer(&self, peer_id: &PeerId, conn: &Arc<dyn PeerConnection>) -> Result<()> {
        // the offer must carry a channel for the remote peer to answer on;
        // it becomes usable once the transport reports it open
        conn.open_data_channel("fragments").await?;
        let offer = conn.create_offer().await?;
        self.set_state(peer_id, PeerState::Negotiating);
        self.signaling.emit(
            event::OFFER,
            &SdpEvent {
                peer_id: peer_id.clone(),
                sdp: offer,
            },
        );
        Ok(())
    }

    pub async fn disconnect(&self, peer_id: &PeerId) {
        self.cleanup_peer(peer_id).await;
    }

    /// Tears down every session.
    pub async fn cleanup_all(&self) {
        let peer_ids: Vec<PeerId> = self.peers.lock().unwrap().keys().cloned().collect();
        for peer_id in peer_ids {
            self.cleanup_peer(&peer_id).await;
        }
    }

    /// Tears down every session and stops the sweeper.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
        self.cleanup_all().await;
    }

    /// Resets the peer's inactivity clock and re-arms its watchdog.
    pub fn update_last_activity(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(session) = peers.get_mut(peer_id) {
            session.last_activity = Instant::now();
            let _ = session
                .deadline_chan
                .send(Instant::now() + self.conf.inactivity_timeout);
        }
    }

    /// Peers whose transport is up (connected or with an open channel).
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, session)| {
                matches!(session.state, PeerState::Connected | PeerState::Ready)
            })
            .map(|(peer_id, _)| peer_id.clone())
            .collect()
    }

    /// Registers an in-flight transfer with its peer. Fails if the peer is
    /// gone or the session id is already taken, in which case the caller
    /// must abort the transfer.
    pub fn register_transfer(&self, peer_id: &PeerId, transfer: Arc<TransferSession>) -> bool {
        let mut peers = self.peers.lock().unwrap();
        let session = match peers.get_mut(peer_id) {
            Some(session) => session,
            None => return false,
        };
        if session.transfers.contains_key(&transfer.session_id) {
            log::warn!(
                "Peer {} reused session id {} while it is in flight",
                peer_id,
                transfer.session_id
            );
            return false;
        }
        session
            .transfers
            .insert(transfer.session_id.clone(), transfer);
        true
    }

    pub fn remove_transfer(&self, peer_id: &PeerId, session_id: &str) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(session) = peers.get_mut(peer_id) {
            session.transfers.remove(session_id);
        }
    }

    /// Flags a transfer for cancellation on behalf of the remote peer or a
    /// local teardown. The streamer observes the flag within one chunk.
    pub fn cancel_transfer(&self, peer_id: &PeerId, session_id: &str) {
        let peers = self.peers.lock().unwrap();
        match peers
            .get(peer_id)
            .and_then(|session| session.transfers.get(session_id))
        {
            Some(transfer) => transfer.cancel(),
            None => log::warn!(
                "Cancel for unknown session {} from peer {}",
                session_id,
                peer_id
            ),
        }
    }

    /// Publishes an out-of-cycle stats sample for every live peer, on
    /// request of the signaling service.
    pub async fn publish_stats_now(&self) {
        let snapshots: Vec<(PeerId, Arc<dyn PeerConnection>, Arc<StatsTracker>)> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .map(|(peer_id, session)| {
                    (
                        peer_id.clone(),
                        Arc::clone(&session.conn),
                        Arc::clone(&session.stats_tracker),
                    )
                })
                .collect()
        };
        for (peer_id, conn, tracker) in snapshots {
            let report = conn.stats().await;
            let sample = stats::derive_sample(&peer_id, &report, &tracker, false);
            self.signaling.emit(event::PEER_STATS, &sample);
        }
    }

    /// Creates the transport connection and all per-session tasks, then
    /// inserts the session into the map in `New` state.
    async fn create_session(self: &Arc<Self>, peer_id: &PeerId) -> Result<Arc<dyn PeerConnection>> {
        log::info!("Creating session for peer {}", peer_id);
        let (conn, events) = self.transport.create_connection(&self.ice_servers).await?;

        let (deadline_chan, deadline_port) =
            watch::channel(Instant::now() + self.conf.inactivity_timeout);
        let (shutdown_chan, shutdown_port) = watch::channel(false);
        let stats_tracker = Arc::new(StatsTracker::new());

        self.spawn_watchdog(peer_id.clone(), deadline_port);
        self.spawn_pump(peer_id.clone(), events, shutdown_port);
        let stats_task = stats::spawn_sampler(
            Arc::clone(&self.signaling),
            peer_id.clone(),
            Arc::clone(&conn),
            Arc::clone(&stats_tracker),
            self.conf.stats_interval,
        );

        let session = PeerSession {
            state: PeerState::New,
            conn: Arc::clone(&conn),
            channel: None,
            last_activity: Instant::now(),
            transfers: HashMap::new(),
            deadline_chan,
            shutdown_chan,
            stats_task,
            stats_tracker,
        };
        self.peers.lock().unwrap().insert(peer_id.clone(), session);
        Ok(conn)
    }

    /// The per-peer single-shot inactivity timer. Re-armed through the
    /// deadline channel; exits when the session (and with it the sender) is
    /// dropped.
    fn spawn_watchdog(self: &Arc<Self>, peer_id: PeerId, mut deadline_port: watch::Receiver<Instant>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = *deadline_port.borrow();
                tokio::select! {
                    _ = time::sleep_until(deadline) => {
                        log::info!("Peer {} inactive for too long, closing", peer_id);
                        manager.cleanup_peer(&peer_id).await;
                        break;
                    }
                    changed = deadline_port.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// The session's receive loop: transport events in, manager calls out.
    fn spawn_pump(
        self: &Arc<Self>,
        peer_id: PeerId,
        mut events: UnboundedReceiver<TransportEvent>,
        mut shutdown_port: watch::Receiver<bool>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_port.changed() => break,
                    transport_event = events.recv() => match transport_event {
                        Some(transport_event) => {
                            manager.on_transport_event(&peer_id, transport_event).await
                        }
                        None => {
                            manager.cleanup_peer(&peer_id).await;
                            break;
                        }
                    }
                }
            }
            log::debug!("Peer {} event pump stopped", peer_id);
        });
    }

    async fn on_transport_event(self: &Arc<Self>, peer_id: &PeerId, ev: TransportEvent) {
        match ev {
            TransportEvent::StateChanged(state) => {
                log::info!("Peer {} transport state: {:?}", peer_id, state);
                match state {
                    ConnectionState::Connected => {
                        self.set_state(peer_id, PeerState::Connected);
                        self.update_last_activity(peer_id);
                    }
                    ConnectionState::Failed
                    | ConnectionState::Disconnected
                    | ConnectionState::Closed => {
                        self.cleanup_peer(peer_id).await;
                    }
                    _ => {}
                }
            }
            TransportEvent::IceCandidate(candidate) => {
                self.signaling.emit(
                    event::ICE_CANDIDATE,
                    &CandidateEvent {
                        peer_id: peer_id.clone(),
                        candidate: Some(candidate),
                    },
                );
            }
            TransportEvent::DataChannelOpen(channel) => {
                log::info!("Peer {} data channel open", peer_id);
                {
                    let mut peers = self.peers.lock().unwrap();
                    match peers.get_mut(peer_id) {
                        Some(session) => {
                            session.channel = Some(channel);
                            session.state = PeerState::Ready;
                        }
                        None => return,
                    }
                }
                self.update_last_activity(peer_id);
            }
            TransportEvent::ChannelText(text) => {
                self.on_channel_message(peer_id, &text).await;
            }
            TransportEvent::ChannelClosed => {
                log::info!("Peer {} data channel closed by remote", peer_id);
                self.cleanup_peer(peer_id).await;
            }
        }
    }

    /// Dispatches one inbound control message.
    async fn on_channel_message(self: &Arc<Self>, peer_id: &PeerId, text: &str) {
        self.update_last_activity(peer_id);
        match ControlMessage::parse(text) {
            Ok(Some(ControlMessage::Ready {
                fragment_id,
                session_id,
            })) => {
                if protocol::validate_session_id(&session_id).is_err() {
                    log::warn!(
                        "Peer {} requested fragment {} with unframeable session id",
                        peer_id,
                        fragment_id
                    );
                    return;
                }
                let channel = {
                    let peers = self.peers.lock().unwrap();
                    peers
                        .get(peer_id)
                        .and_then(|session| session.channel.clone())
                };
                match channel {
                    Some(channel) => {
                        tokio::spawn(transfer::run(
                            Arc::clone(self),
                            peer_id.clone(),
                            channel,
                            fragment_id,
                            session_id,
                        ));
                    }
                    None => {
                        log::warn!(
                            "Peer {} requested fragment {} without an open channel",
                            peer_id,
                            fragment_id
                        );
                        transfer::emit_rejected(
                            self,
                            peer_id,
                            &fragment_id,
                            &session_id,
                            TransferStatus::DataChannelClosed,
                        );
                    }
                }
            }
            Ok(Some(ControlMessage::Canceled {
                session_id,
                fragment_id: _,
                error,
            })) => {
                log::info!(
                    "Peer {} canceled session {}{}",
                    peer_id,
                    session_id,
                    error
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
                self.cancel_transfer(peer_id, &session_id);
            }
            Ok(None) => {
                log::warn!("Peer {} sent unknown control message: {}", peer_id, text)
            }
            Err(e) => {
                log::warn!("Peer {} sent malformed control message: {}", peer_id, e)
            }
        }
    }

    fn set_state(&self, peer_id: &PeerId, state: PeerState) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(session) = peers.get_mut(peer_id) {
            if session.state != state {
                log::info!("Peer {} session state: {:?}", peer_id, state);
                session.state = state;
            }
        }
    }

    /// The global sweeper. It backstops the per-peer watchdogs by reaping
    /// any session whose activity clock went stale, including sessions
    /// stuck in negotiation.
    async fn sweep(manager: Arc<Self>) {
        let mut ticker = time::interval(manager.conf.sweep_interval);
        loop {
            ticker.tick().await;
            let stale: Vec<PeerId> = {
                let peers = manager.peers.lock().unwrap();
                peers
                    .iter()
                    .filter(|(_, session)| {
                        session.last_activity.elapsed() >= manager.conf.inactivity_timeout
                    })
                    .map(|(peer_id, _)| peer_id.clone())
                    .collect()
            };
            for peer_id in stale {
                log::info!("Sweeping inactive peer {}", peer_id);
                manager.cleanup_peer(&peer_id).await;
            }
        }
    }

    /// Tears a peer down. Idempotent: the session leaves the map first, so
    /// repeat calls (watchdog, sweeper, transport failure racing each other)
    /// find nothing to do.
    ///
    /// Order matters: the stats ticker stops before the final disconnected
    /// sample, transfers are canceled before their channel closes under
    /// them, and the event pump is released last.
    pub async fn cleanup_peer(&self, peer_id: &PeerId) {
        let session = { self.peers.lock().unwrap().remove(peer_id) };
        let session = match session {
            Some(session) => session,
            None => return,
        };
        log::info!("Closing peer {}", peer_id);

        session.stats_task.abort();
        stats::publish_final(&self.signaling, peer_id, &session.conn, &session.stats_tracker)
            .await;

        for transfer in session.transfers.values() {
            log::debug!(
                "Canceling transfer {} of fragment {}",
                transfer.session_id,
                transfer.fragment_id
            );
            transfer.cancel();
        }

        drop(session.deadline_chan);

        if let Some(channel) = session.channel {
            channel.close().await;
        }
        session.conn.close().await;

        let _ = session.shutdown_chan.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use std::time::Duration;

    use serde_json::Value;

    use crate::{
        conf::PeerConf,
        protocol::{decode_chunk, ControlMessage},
        testutil::{self, wait_until, RecordingSink},
        transfer::THROTTLED_ERROR,
        transport::{
            mem::{MemDataChannel, MemHandle, MemTransport},
            TransportStats,
        },
        CHUNK_SIZE,
    };

    struct Fixture {
        // the tempdir owns the fragment files for the fixture's lifetime
        _dir: tempfile::TempDir,
        sink: Arc<RecordingSink>,
        transport: Arc<MemTransport>,
        manager: Arc<PeerManager>,
    }

    async fn setup(conf: PeerConf, fragments: &[(&str, &[u8])]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(testutil::store_in(dir.path(), fragments));
        store.scan().unwrap();
        let sink = RecordingSink::new();
        let signaling = SignalingClient::new(sink.clone_as_sink());
        let transport = MemTransport::new();
        let manager = PeerManager::new(
            conf,
            Vec::new(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            signaling,
            store,
        );
        Fixture {
            _dir: dir,
            sink,
            transport,
            manager,
        }
    }

    /// A conf that keeps the watchdog out of tests that don't exercise it.
    fn patient_conf() -> PeerConf {
        PeerConf {
            inactivity_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            stats_interval: Duration::from_secs(3600),
            min_free_ram_percent: 0,
            ..PeerConf::default()
        }
    }

    /// Walks a remote-initiated session to the `Ready` state and returns the
    /// transport handle and open channel.
    async fn open_peer(fixture: &Fixture, peer_id: &str) -> (MemHandle, Arc<MemDataChannel>) {
        let before = fixture.transport.handles().len();
        fixture
            .manager
            .on_offer(peer_id.to_string(), "v=0 remote".into())
            .await;
        let handle = fixture.transport.handle(before).expect("session created");

        handle
            .events
            .send(TransportEvent::StateChanged(ConnectionState::Connected))
            .unwrap();
        let channel = handle.conn.channel();
        channel.set_open(true);
        handle
            .events
            .send(TransportEvent::DataChannelOpen(
                Arc::clone(&channel) as Arc<dyn DataChannel>
            ))
            .unwrap();

        let manager = Arc::clone(&fixture.manager);
        let id = peer_id.to_string();
        assert!(
            wait_until(move || manager.connected_peers().contains(&id)).await,
            "peer never became ready"
        );
        (handle, channel)
    }

    fn ready_request(fragment_id: &str, session_id: &str) -> TransportEvent {
        TransportEvent::ChannelText(
            ControlMessage::Ready {
                fragment_id: fragment_id.into(),
                session_id: session_id.into(),
            }
            .to_json()
            .unwrap(),
        )
    }

    fn statuses(sink: &RecordingSink) -> Vec<String> {
        sink.events_named(event::FRAGMENT_STATUS)
            .iter()
            .map(|v| v["status"].as_str().unwrap().to_string())
            .collect()
    }

    fn terminal_status(sink: &RecordingSink) -> Option<Value> {
        sink.events_named(event::FRAGMENT_STATUS)
            .into_iter()
            .filter(|v| {
                !matches!(
                    v["status"].as_str(),
                    Some("STARTING") | Some("IN_PROGRESS")
                )
            })
            .last()
    }

    #[tokio::test]
    async fn test_offer_produces_answer() {
        let fixture = setup(patient_conf(), &[]).await;
        fixture
            .manager
            .on_offer("peer-a".into(), "v=0 remote".into())
            .await;

        let handle = fixture.transport.handle(0).unwrap();
        assert_eq!(handle.conn.remote_descriptions().len(), 1);
        assert_eq!(handle.conn.remote_descriptions()[0].0, SdpKind::Offer);

        assert!(fixture.sink.wait_for(event::ANSWER, 1).await);
        let answers = fixture.sink.events_named(event::ANSWER);
        assert_eq!(answers[0]["peer_id"], "peer-a");
    }

    #[tokio::test]
    async fn test_repeat_offer_reuses_negotiating_session() {
        let fixture = setup(patient_conf(), &[]).await;
        fixture
            .manager
            .on_offer("peer-a".into(), "v=0 first".into())
            .await;
        fixture
            .manager
            .on_offer("peer-a".into(), "v=0 second".into())
            .await;

        // both offers were answered on one connection
        assert_eq!(fixture.transport.handles().len(), 1);
        let handle = fixture.transport.handle(0).unwrap();
        assert_eq!(handle.conn.remote_descriptions().len(), 2);
        assert!(fixture.sink.wait_for(event::ANSWER, 2).await);
    }

    #[tokio::test]
    async fn test_offer_ignored_while_session_live() {
        let fixture = setup(patient_conf(), &[]).await;
        let _ = open_peer(&fixture, "peer-a").await;

        fixture
            .manager
            .on_offer("peer-a".into(), "v=0 again".into())
            .await;

        assert_eq!(fixture.transport.handles().len(), 1);
        let handle = fixture.transport.handle(0).unwrap();
        // only the original offer was applied
        assert_eq!(handle.conn.remote_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let fixture = setup(patient_conf(), &[]).await;
        fixture.manager.connect("peer-a".into()).await;
        fixture.manager.connect("peer-a".into()).await;

        assert_eq!(fixture.transport.handles().len(), 1);
        assert!(fixture.sink.wait_for(event::OFFER, 1).await);
        assert_eq!(fixture.sink.events_named(event::OFFER).len(), 1);
    }

    #[tokio::test]
    async fn test_answer_and_candidate_for_unknown_peer_are_dropped() {
        let fixture = setup(patient_conf(), &[]).await;
        fixture.manager.on_answer(&"ghost".to_string(), "v=0").await;
        fixture
            .manager
            .on_ice_candidate(&"ghost".to_string(), Some("candidate:1"))
            .await;
        assert!(fixture.transport.handles().is_empty());
    }

    #[tokio::test]
    async fn test_empty_ice_candidate_is_ignored() {
        let fixture = setup(patient_conf(), &[]).await;
        let (handle, _channel) = open_peer(&fixture, "peer-a").await;

        fixture
            .manager
            .on_ice_candidate(&"peer-a".to_string(), None)
            .await;
        fixture
            .manager
            .on_ice_candidate(&"peer-a".to_string(), Some(""))
            .await;
        fixture
            .manager
            .on_ice_candidate(&"peer-a".to_string(), Some("candidate:host 10.0.0.2"))
            .await;

        assert_eq!(handle.conn.candidates(), vec!["candidate:host 10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_bad_sdp_tears_the_peer_down() {
        let fixture = setup(patient_conf(), &[]).await;
        // the mem transport refuses descriptions starting with "invalid"
        fixture
            .manager
            .on_offer("peer-a".into(), "invalid sdp".into())
            .await;

        let handle = fixture.transport.handle(0).unwrap();
        assert!(
            wait_until(move || handle.conn.is_closed()).await,
            "connection not closed after failed negotiation"
        );
        assert!(fixture.manager.connected_peers().is_empty());
        assert!(fixture.sink.events_named(event::ANSWER).is_empty());
    }

    #[tokio::test]
    async fn test_happy_path_streams_fragment_in_frames() {
        // 160 KiB streams as 3 full chunks and one 1024 byte tail
        let payload: Vec<u8> = (0..160 * 1024).map(|i| (i % 251) as u8).collect();
        let fixture = setup(patient_conf(), &[("frag-1", payload.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        handle.events.send(ready_request("frag-1", "S1")).unwrap();

        let watched = Arc::clone(&channel);
        assert!(
            wait_until(move || {
                watched
                    .sent_binary()
                    .last()
                    .and_then(|frame| decode_chunk(frame).ok())
                    .map(|frame| frame.last)
                    .unwrap_or(false)
            })
            .await,
            "stream never finished"
        );

        let frames: Vec<_> = channel
            .sent_binary()
            .iter()
            .map(|frame| decode_chunk(frame).unwrap())
            .collect();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|frame| frame.session_id == "S1"));
        // the last-chunk flag is set exactly on the final frame
        let flags: Vec<bool> = frames.iter().map(|frame| frame.last).collect();
        assert_eq!(flags, vec![false, false, false, true]);
        assert_eq!(frames[0].payload.len(), CHUNK_SIZE);
        // reassembled payload matches the fragment byte for byte
        let streamed: Vec<u8> = frames
            .iter()
            .flat_map(|frame| frame.payload.to_vec())
            .collect();
        assert_eq!(streamed, payload);

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 3).await);
        assert_eq!(
            statuses(&fixture.sink),
            vec!["STARTING", "IN_PROGRESS", "COMPLETED"]
        );
        let completed = terminal_status(&fixture.sink).unwrap();
        assert_eq!(completed["sent_bytes"], payload.len() as u64);
        assert_eq!(completed["total_bytes"], payload.len() as u64);
        assert!(completed["bytes_per_sec"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_missing_fragment_is_reported() {
        let fixture = setup(patient_conf(), &[]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        handle
            .events
            .send(ready_request("frag-missing", "S1"))
            .unwrap();

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 2).await);
        assert_eq!(statuses(&fixture.sink), vec!["STARTING", "FILE_NOT_FOUND"]);
        // no data frames were sent
        assert!(channel.sent_binary().is_empty());
    }

    #[tokio::test]
    async fn test_remote_cancel_stops_stream() {
        let payload = vec![7u8; 8 * CHUNK_SIZE];
        let conf = patient_conf();
        let fixture = setup(conf.clone(), &[("frag-1", payload.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        // pin the buffer above the pause threshold so the streamer parks in
        // its drain loop, then cancel from the remote side
        channel.pin_buffered(conf.max_buffer_threshold + 1);
        handle.events.send(ready_request("frag-1", "S1")).unwrap();
        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 2).await);

        handle
            .events
            .send(TransportEvent::ChannelText(
                ControlMessage::Canceled {
                    session_id: "S1".into(),
                    fragment_id: Some("frag-1".into()),
                    error: None,
                }
                .to_json()
                .unwrap(),
            ))
            .unwrap();

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 3).await);
        let terminal = terminal_status(&fixture.sink).unwrap();
        assert_eq!(terminal["status"], "CANCELED");
        // the peer itself stays up
        assert_eq!(fixture.manager.connected_peers(), vec!["peer-a"]);

        // no further frames after the flag was observed
        let frames = channel.sent_binary().len();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.sent_binary().len(), frames);
    }

    #[tokio::test]
    async fn test_backpressure_timeout_fails_transfer_keeps_peer() {
        let payload = vec![7u8; 2 * CHUNK_SIZE];
        let mut conf = patient_conf();
        // keep the drain deadline short so the test doesn't sit out 10s
        conf.min_throttle_wait = Duration::from_millis(100);
        conf.max_throttle_wait = Duration::from_millis(200);
        let fixture = setup(conf.clone(), &[("frag-1", payload.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        channel.pin_buffered(conf.max_buffer_threshold + 1);
        handle.events.send(ready_request("frag-1", "S1")).unwrap();

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 3).await);
        let terminal = terminal_status(&fixture.sink).unwrap();
        assert_eq!(terminal["status"], "FAILED");
        assert_eq!(terminal["error"], THROTTLED_ERROR);
        // no data frame made it out and the peer remains alive
        assert!(channel.sent_binary().is_empty());
        assert_eq!(fixture.manager.connected_peers(), vec!["peer-a"]);
    }

    #[tokio::test]
    async fn test_saturated_channel_refuses_transfer_with_cancel_frame() {
        let payload = vec![7u8; CHUNK_SIZE];
        let conf = patient_conf();
        let fixture = setup(conf.clone(), &[("frag-1", payload.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        // saturate past the resource gate, not just the pause threshold
        channel.pin_buffered(conf.max_channel_buffer + 1);
        handle.events.send(ready_request("frag-1", "S1")).unwrap();

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 2).await);
        assert_eq!(statuses(&fixture.sink), vec!["STARTING", "LOW_MEMORY"]);
        // the peer was told with a CANCELED control frame, and no data frames
        let texts = channel.sent_text();
        assert_eq!(texts.len(), 1);
        match ControlMessage::parse(&texts[0]).unwrap() {
            Some(ControlMessage::Canceled { session_id, .. }) => {
                assert_eq!(session_id, "S1")
            }
            other => panic!("expected CANCELED frame, got {:?}", other),
        }
        assert!(channel.sent_binary().is_empty());
    }

    #[tokio::test]
    async fn test_low_ram_refuses_transfer() {
        let payload = vec![7u8; CHUNK_SIZE];
        // a node that wants all RAM free will always be under pressure
        let conf = PeerConf {
            min_free_ram_percent: 100,
            ..patient_conf()
        };
        let fixture = setup(conf, &[("frag-1", payload.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        handle.events.send(ready_request("frag-1", "S1")).unwrap();

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 2).await);
        assert_eq!(statuses(&fixture.sink), vec!["STARTING", "LOW_MEMORY"]);
        assert_eq!(channel.sent_text().len(), 1);
        assert!(channel.sent_binary().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_control_message_is_ignored() {
        let fixture = setup(patient_conf(), &[]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        handle
            .events
            .send(TransportEvent::ChannelText(
                r#"{"type": "PING", "nonce": 4}"#.into(),
            ))
            .unwrap();
        handle
            .events
            .send(TransportEvent::ChannelText("not json".into()))
            .unwrap();

        // the peer survives nonsense
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.manager.connected_peers(), vec!["peer-a"]);
        assert!(channel.sent_binary().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_reaps_peer() {
        let conf = PeerConf {
            stats_interval: Duration::from_secs(3600),
            ..PeerConf::default()
        };
        let fixture = setup(conf, &[]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        // silence for longer than the inactivity timeout
        time::sleep(Duration::from_secs(11)).await;

        assert!(fixture.manager.connected_peers().is_empty());
        assert!(handle.conn.is_closed());
        assert_eq!(channel.close_count(), 1);

        // the post-teardown sample (after the sampler's first tick) is
        // flagged disconnected
        assert!(fixture.sink.wait_for(event::PEER_STATS, 2).await);
        let samples = fixture.sink.events_named(event::PEER_STATS);
        assert_eq!(samples.last().unwrap()["isDisconnected"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_the_watchdog() {
        let conf = PeerConf {
            stats_interval: Duration::from_secs(3600),
            ..PeerConf::default()
        };
        let fixture = setup(conf, &[]).await;
        let (handle, _channel) = open_peer(&fixture, "peer-a").await;

        // keep poking the peer at a cadence below the timeout
        for _ in 0..3 {
            time::sleep(Duration::from_secs(6)).await;
            handle
                .events
                .send(TransportEvent::ChannelText(
                    r#"{"type": "PING"}"#.into(),
                ))
                .unwrap();
            // let the pump process the message before sleeping on
            time::sleep(Duration::from_millis(10)).await;
            assert_eq!(fixture.manager.connected_peers(), vec!["peer-a"]);
        }

        time::sleep(Duration::from_secs(11)).await;
        assert!(fixture.manager.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_ordered() {
        let fixture = setup(patient_conf(), &[]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;
        handle.conn.set_stats(TransportStats {
            bytes_sent: 42,
            ..TransportStats::default()
        });

        fixture.manager.cleanup_peer(&"peer-a".to_string()).await;
        fixture.manager.cleanup_peer(&"peer-a".to_string()).await;
        fixture.manager.cleanup_all().await;

        assert!(fixture.manager.connected_peers().is_empty());
        // the channel was closed exactly once despite repeat invocations
        assert_eq!(channel.close_count(), 1);
        assert!(handle.conn.is_closed());

        // exactly one disconnected sample was published, after the
        // sampler's initial tick
        assert!(fixture.sink.wait_for(event::PEER_STATS, 2).await);
        let disconnected: Vec<Value> = fixture
            .sink
            .events_named(event::PEER_STATS)
            .into_iter()
            .filter(|sample| sample["isDisconnected"] == true)
            .collect();
        assert_eq!(disconnected.len(), 1);
        assert_eq!(disconnected[0]["bytesSent"], 42);
    }

    #[tokio::test]
    async fn test_teardown_cancels_inflight_transfers() {
        let payload = vec![7u8; 8 * CHUNK_SIZE];
        let conf = patient_conf();
        let fixture = setup(conf.clone(), &[("frag-1", payload.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        // park the streamer in its drain loop, then tear the peer down
        channel.pin_buffered(conf.max_buffer_threshold + 1);
        handle.events.send(ready_request("frag-1", "S1")).unwrap();
        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 2).await);

        fixture.manager.disconnect(&"peer-a".to_string()).await;

        assert!(fixture.sink.wait_for(event::FRAGMENT_STATUS, 3).await);
        let terminal = terminal_status(&fixture.sink).unwrap();
        assert_eq!(terminal["status"], "CANCELED");
        assert!(fixture.manager.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_transfers_interleave_by_session() {
        let a = vec![1u8; 2 * CHUNK_SIZE];
        let b = vec![2u8; 2 * CHUNK_SIZE];
        let fixture =
            setup(patient_conf(), &[("frag-a", a.as_slice()), ("frag-b", b.as_slice())]).await;
        let (handle, channel) = open_peer(&fixture, "peer-a").await;

        handle.events.send(ready_request("frag-a", "SA")).unwrap();
        handle.events.send(ready_request("frag-b", "SB")).unwrap();

        let watched = Arc::clone(&channel);
        assert!(
            wait_until(move || {
                let frames = watched.sent_binary();
                let done: Vec<String> = frames
                    .iter()
                    .filter_map(|frame| decode_chunk(frame).ok())
                    .filter(|frame| frame.last)
                    .map(|frame| frame.session_id)
                    .collect();
                done.contains(&"SA".to_string()) && done.contains(&"SB".to_string())
            })
            .await,
            "both streams should finish"
        );

        // each session's frames reassemble independently of interleaving
        for (session_id, payload) in [("SA", &a), ("SB", &b)].iter() {
            let streamed: Vec<u8> = channel
                .sent_binary()
                .iter()
                .filter_map(|frame| decode_chunk(frame).ok())
                .filter(|frame| frame.session_id == *session_id)
                .flat_map(|frame| frame.payload.to_vec())
                .collect();
            assert_eq!(&streamed, *payload, "session {}", session_id);
        }
    }
}
