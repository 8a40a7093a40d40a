//! Consumption of delete and download commands from the signaling channel.

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::{
    error::{Error, Result},
    fragment::{self, FragmentStore, HashEntry},
    origin::OriginClient,
    signaling::{event, SignalingClient},
    FragmentId,
};

/// A command received on the `command` event.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CommandEvent {
    /// Correlation id echoed back in the acknowledgement, when present.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub command: NodeCommand,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum NodeCommand {
    /// Remove fragments from the index and unlink their files.
    #[serde(rename = "delete")]
    Delete {
        #[serde(default)]
        fragments: Vec<FragmentId>,
    },
    /// Pull fragments from the origin into the most-free storage path.
    #[serde(rename = "download")]
    Download {
        #[serde(default)]
        urls: Vec<String>,
    },
}

#[derive(Clone, Debug, Serialize)]
struct CommandAck {
    id: String,
    success: bool,
}

pub(crate) struct CommandHandler {
    store: Arc<FragmentStore>,
    origin: OriginClient,
    signaling: Arc<SignalingClient>,
}

impl CommandHandler {
    pub fn new(
        store: Arc<FragmentStore>,
        origin: OriginClient,
        signaling: Arc<SignalingClient>,
    ) -> Self {
        Self {
            store,
            origin,
            signaling,
        }
    }

    /// Runs one command payload to completion. Malformed payloads and
    /// per-item failures are logged; neither aborts the node.
    pub async fn handle(&self, payload: Value) {
        let event: CommandEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Ignoring malformed command: {}", e);
                return;
            }
        };
        match event.command {
            NodeCommand::Delete { fragments } => self.delete(&fragments),
            NodeCommand::Download { urls } => self.download(&urls).await,
        }
        if let Some(id) = event.id {
            self.signaling
                .emit(event::COMMAND_ACK, &CommandAck { id, success: true });
        }
    }

    fn delete(&self, ids: &[FragmentId]) {
        for id in ids {
            match self.store.remove(id) {
                Some(path) => match std::fs::remove_file(&path) {
                    Ok(()) => log::info!("Deleted fragment {}", id),
                    Err(e) => {
                        log::warn!("Failed to unlink fragment {} at {:?}: {}", id, path, e)
                    }
                },
                None => log::warn!("Delete for unknown fragment {}", id),
            }
        }
    }

    /// Downloads each URL in turn and reports the id and content hash of
    /// every fragment that made it to disk. Failed URLs are skipped.
    async fn download(&self, urls: &[String]) {
        let mut verified = Vec::with_capacity(urls.len());
        for raw in urls {
            match self.download_one(raw).await {
                Ok(entry) => verified.push(entry),
                Err(e) => log::warn!("Download of {} failed: {}", raw, e),
            }
        }
        if !verified.is_empty() {
            self.signaling.emit(event::COMMAND_VERIFY, &verified);
        }
    }

    async fn download_one(&self, raw: &str) -> Result<HashEntry> {
        let url = Url::parse(raw)?;
        let origin_file = self.origin.resolve(&url).await?;

        let (remote_dir, available) = self.store.most_free().ok_or(Error::NoStoragePath)?;
        if available < origin_file.len {
            return Err(Error::InsufficientSpace(origin_file.len));
        }

        let dest = remote_dir.join(&origin_file.filename);
        self.origin.download(&url, &dest).await?;
        self.store
            .insert(origin_file.filename.clone(), dest.clone());

        let hash = fragment::hash_file(&dest).await?;
        Ok(HashEntry {
            fragment_id: origin_file.filename,
            hash,
        })
    }
}
