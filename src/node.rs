//! The node engine: loads settings, authenticates against the signaling
//! service, reports the fragment inventory, and dispatches signaling events
//! into the peer session manager and the command handler.

use std::{path::PathBuf, sync::Arc};

use serde_json::Value;
use tokio::{task::JoinHandle, time};

use crate::{
    command::CommandHandler,
    conf::{PeerConf, Settings, DEVICE_UPDATE_INTERVAL},
    error::Result,
    fragment::{self, FragmentStore, HashEntry, StorageReport},
    origin::OriginClient,
    peer::PeerManager,
    probe,
    signaling::{self, event, CandidateEvent, SdpEvent, SignalingClient, SignalingTransport},
    transport::Transport,
};

/// The storage-node agent.
///
/// Constructed with the two stacks the crate does not implement itself: the
/// signaling bus and the peer transport. [`Node::run`] only returns on a
/// fatal error; the embedding binary maps that to an exit code via
/// [`crate::error::Error::exit_code`].
pub struct Node {
    settings_path: PathBuf,
    signaling_transport: Arc<dyn SignalingTransport>,
    transport: Arc<dyn Transport>,
    peer_conf: PeerConf,
}

impl Node {
    pub fn new(
        settings_path: impl Into<PathBuf>,
        signaling_transport: Arc<dyn SignalingTransport>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings_path: settings_path.into(),
            signaling_transport,
            transport,
            peer_conf: PeerConf::default(),
        }
    }

    /// Overrides the peer subsystem tuning, mostly for tests.
    pub fn with_peer_conf(mut self, peer_conf: PeerConf) -> Self {
        self.peer_conf = peer_conf;
        self
    }

    /// Runs the node until a fatal error occurs.
    ///
    /// Each iteration of the outer loop is one signaling connection epoch:
    /// connect (walking the server list), sign in, report the inventory,
    /// then pump bus events until the connection drops. Losing the
    /// connection tears down all peers and starts over; failing to reach
    /// any server is fatal.
    pub async fn run(self) -> Result<()> {
        let mut settings = Settings::load(&self.settings_path)?;
        let servers = settings.signaling_urls()?;

        let store = Arc::new(FragmentStore::open(&settings.paths)?);
        store.scan()?;

        loop {
            let (client, mut bus_port) =
                signaling::connect_any(&self.signaling_transport, &servers).await?;

            if !settings.has_identity() {
                let identity = client.sign_up().await?;
                log::info!("Signed up as node {}", identity.id);
                settings.info = identity;
                settings.store(&self.settings_path)?;
            }
            client.sign_in(&settings.info).await?;
            log::info!("Signed in as node {}", settings.info.id);

            report_inventory(&client, &store).await;

            let manager = PeerManager::new(
                self.peer_conf.clone(),
                settings.webrtc.ice_servers.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&client),
                Arc::clone(&store),
            );
            let device_task = spawn_device_updates(
                Arc::clone(&client),
                Arc::clone(&store),
                Arc::clone(&manager),
            );
            let commands = Arc::new(CommandHandler::new(
                Arc::clone(&store),
                OriginClient::new(&settings.info),
                Arc::clone(&client),
            ));

            // bus events are processed in arrival order; this is what keeps
            // per-peer signaling sequential (offer before its candidates)
            while let Some((name, payload)) = bus_port.recv().await {
                dispatch(&manager, &commands, &name, payload).await;
            }

            log::warn!("Signaling connection lost, reconnecting");
            device_task.abort();
            manager.shutdown().await;
        }
    }
}

async fn dispatch(
    manager: &Arc<PeerManager>,
    commands: &Arc<CommandHandler>,
    name: &str,
    payload: Value,
) {
    match name {
        event::OFFER => match serde_json::from_value::<SdpEvent>(payload) {
            Ok(offer) => manager.on_offer(offer.peer_id, offer.sdp).await,
            Err(e) => log::warn!("Malformed offer event: {}", e),
        },
        event::ANSWER => match serde_json::from_value::<SdpEvent>(payload) {
            Ok(answer) => manager.on_answer(&answer.peer_id, &answer.sdp).await,
            Err(e) => log::warn!("Malformed answer event: {}", e),
        },
        event::ICE_CANDIDATE => match serde_json::from_value::<CandidateEvent>(payload) {
            Ok(candidate) => {
                manager
                    .on_ice_candidate(&candidate.peer_id, candidate.candidate.as_deref())
                    .await
            }
            Err(e) => log::warn!("Malformed ice_candidate event: {}", e),
        },
        event::COMMAND => {
            // commands download from the origin and must not stall the
            // signaling dispatch loop
            let commands = Arc::clone(commands);
            tokio::spawn(async move { commands.handle(payload).await });
        }
        event::CLIENT_REQUEST_STATS => manager.publish_stats_now().await,
        other => log::debug!("Ignoring signaling event {}", other),
    }
}

/// Hashes every indexed fragment and reports the inventory: `hash_empty`
/// when there is nothing, otherwise `hash_verify` batches. Unreadable
/// fragments are skipped with a warning.
async fn report_inventory(client: &Arc<SignalingClient>, store: &Arc<FragmentStore>) {
    let mut ids = store.ids();
    if ids.is_empty() {
        client.emit(event::HASH_EMPTY, &serde_json::json!({}));
        return;
    }
    ids.sort();

    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let path = match store.lookup(&id) {
            Some(path) => path,
            None => continue,
        };
        match fragment::hash_file(&path).await {
            Ok(hash) => entries.push(HashEntry {
                fragment_id: id,
                hash,
            }),
            Err(e) => log::warn!("Failed to hash fragment {}: {}", id, e),
        }
    }
    for chunk in fragment::inventory_chunks(entries) {
        client.emit(event::HASH_VERIFY, &chunk);
    }
}

/// The periodic device capacity report.
#[derive(Clone, Debug, Serialize)]
struct DeviceUpdate {
    load_average: f64,
    ram_total: u64,
    ram_free: u64,
    storage: Vec<StorageReport>,
    storage_available: u64,
    peers: usize,
}

impl DeviceUpdate {
    fn collect(store: &FragmentStore, manager: &PeerManager) -> Self {
        let (ram_total, ram_free) = match probe::memory() {
            Ok(memory) => (memory.total, memory.unused),
            Err(e) => {
                log::warn!("Memory probe failed: {}", e);
                (0, 0)
            }
        };
        let storage = store.storage_report();
        let storage_available = storage.iter().map(|report| report.available).sum();
        Self {
            load_average: probe::load_average().unwrap_or(0.0),
            ram_total,
            ram_free,
            storage,
            storage_available,
            peers: manager.connected_peers().len(),
        }
    }
}

fn spawn_device_updates(
    client: Arc<SignalingClient>,
    store: Arc<FragmentStore>,
    manager: Arc<PeerManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(DEVICE_UPDATE_INTERVAL);
        loop {
            ticker.tick().await;
            let update = DeviceUpdate::collect(&store, &manager);
            client.emit(event::DEVICE_UPDATE, &update);
        }
    })
}
