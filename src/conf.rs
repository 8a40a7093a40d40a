//! This module defines types used to configure the node and its parts.
//!
//! The on-disk settings file is a JSON document (see [`Settings`]) that the
//! operator edits; everything else in here are tuning knobs with defaults
//! that embedders and tests may override.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use url::Url;

use crate::{
    error::{Error, Result},
    CHUNK_SIZE,
};

/// The name of the settings file, looked up in the node's working directory
/// unless an explicit path is given.
pub const SETTINGS_FILE: &str = "node-settings.json";

/// How long a sign-in or sign-up request may wait for its acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// The pause before moving on to the next configured signaling server after
/// a connect error.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The interval of the periodic device capacity report.
pub const DEVICE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// The operator-edited settings file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Signaling servers tried in order until one accepts the connection.
    pub signaling_servers: Vec<String>,
    /// Transport negotiation parameters handed to the peer connection
    /// factory.
    #[serde(default)]
    pub webrtc: WebrtcConf,
    /// The node's credentials. Both fields may start out empty, in which
    /// case the node signs up on first connect and persists the credentials
    /// the service assigned.
    #[serde(default)]
    pub info: NodeIdentity,
    /// The storage volumes fragments are kept on. Each must live on its own
    /// filesystem mount.
    pub paths: Vec<StoragePathConf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WebrtcConf {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServerConf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IceServerConf {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// The `urls` field of an ICE server entry may be a single URL or a list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

/// The node's identity: assigned at sign-up, presented at sign-in and as the
/// bearer for origin downloads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoragePathConf {
    /// Absolute path of the storage volume.
    pub path: PathBuf,
    /// Percentage of the volume the node is allowed to fill, in `[0, 100]`.
    pub threshold: u8,
}

impl Settings {
    /// Reads and validates the settings file.
    ///
    /// If the file does not exist, a default skeleton is written in its place
    /// and [`Error::ConfigurationRequired`] is returned so that the embedder
    /// exits and the operator can fill it in.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!("Settings file {:?} not found, writing defaults", path);
            Self::default_skeleton().store(path)?;
            return Err(Error::ConfigurationRequired(path.to_path_buf()));
        }
        let raw = fs::read(path)?;
        let settings: Settings = serde_json::from_slice(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Writes the settings atomically (temp file and rename) so a crash
    /// mid-write can't lose the node's credentials.
    pub fn store(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling_servers.is_empty() {
            return Err(Error::InvalidSettings(
                "at least one signaling server is required".into(),
            ));
        }
        for server in &self.signaling_servers {
            Url::parse(server).map_err(|e| {
                Error::InvalidSettings(format!(
                    "signaling server {:?} is not a valid URL: {}",
                    server, e
                ))
            })?;
        }
        if self.paths.is_empty() {
            return Err(Error::InvalidSettings(
                "at least one storage path is required".into(),
            ));
        }
        for conf in &self.paths {
            if !conf.path.is_absolute() {
                return Err(Error::InvalidSettings(format!(
                    "storage path {:?} is not absolute",
                    conf.path
                )));
            }
            if conf.threshold > 100 {
                return Err(Error::InvalidSettings(format!(
                    "storage threshold {} is outside [0, 100]",
                    conf.threshold
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the node has signed up before and can sign in
    /// directly.
    pub fn has_identity(&self) -> bool {
        !self.info.id.is_empty() && !self.info.auth_token.is_empty()
    }

    pub fn signaling_urls(&self) -> Result<Vec<Url>> {
        self.signaling_servers
            .iter()
            .map(|s| Url::parse(s).map_err(Error::from))
            .collect()
    }

    fn default_skeleton() -> Self {
        Self {
            signaling_servers: vec!["http://localhost:3000".into()],
            webrtc: WebrtcConf {
                ice_servers: vec![IceServerConf {
                    urls: IceUrls::One("stun:stun.l.google.com:19302".into()),
                    username: None,
                    credential: None,
                }],
            },
            info: NodeIdentity::default(),
            paths: Vec::new(),
        }
    }
}

/// Tuning knobs for the peer session and fragment streaming subsystem.
///
/// The defaults are the values the node runs with in production; tests
/// construct instances directly to tighten timeouts or force the resource
/// gates.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// A peer whose session shows no activity for this long is closed.
    pub inactivity_timeout: Duration,

    /// How often the global sweeper looks for peers whose inactivity timer
    /// never fired (e.g. a session that never left negotiation).
    pub sweep_interval: Duration,

    /// How often transport statistics are sampled, per peer.
    pub stats_interval: Duration,

    /// How often an active transfer refreshes the peer's activity so the
    /// watchdog does not reap a busy peer.
    pub activity_refresh_interval: Duration,

    /// Reads pause once the channel buffers more than this many bytes.
    pub max_buffer_threshold: usize,

    /// Reads resume once the channel buffer has drained to this level.
    pub resume_buffer_level: usize,

    /// How often the paused streamer polls the channel buffer level.
    pub throttle_check_interval: Duration,

    /// Bounds for the per-pause drain deadline, which otherwise scales with
    /// the amount of buffered data (1 ms per KiB).
    pub min_throttle_wait: Duration,
    pub max_throttle_wait: Duration,

    /// A transfer is refused outright while the channel already buffers more
    /// than this many bytes.
    pub max_channel_buffer: usize,

    /// A transfer is refused while free RAM is below this percentage of
    /// total RAM.
    pub min_free_ram_percent: u64,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(1),
            activity_refresh_interval: Duration::from_secs(5),
            max_buffer_threshold: CHUNK_SIZE * 5,
            resume_buffer_level: CHUNK_SIZE,
            throttle_check_interval: Duration::from_millis(50),
            min_throttle_wait: Duration::from_secs(1),
            max_throttle_wait: Duration::from_secs(10),
            max_channel_buffer: 10 * 1024 * 1024,
            min_free_ram_percent: 15,
        }
    }
}
