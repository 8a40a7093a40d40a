//! Pulling fragments from the origin over HTTP.
//!
//! The origin expects the node's credentials in the `Node-Id` and
//! `Node-Token` headers. A download is resolved with a HEAD request first,
//! which must announce the payload size and file name, and is then streamed
//! straight to disk.

use std::path::Path;

use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use tokio::{fs::File, io::AsyncWriteExt};
use url::Url;

use crate::{
    conf::NodeIdentity,
    error::{Error, Result},
};

const NODE_ID_HEADER: &str = "Node-Id";
const NODE_TOKEN_HEADER: &str = "Node-Token";

static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"filename="([^"]+)""#).expect("filename pattern"));

/// Size and file name of an origin resource, resolved before downloading.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OriginFile {
    pub len: u64,
    pub filename: String,
}

pub(crate) struct OriginClient {
    http: reqwest::Client,
    node_id: String,
    auth_token: String,
}

impl OriginClient {
    pub fn new(identity: &NodeIdentity) -> Self {
        Self {
            http: reqwest::Client::new(),
            node_id: identity.id.clone(),
            auth_token: identity.auth_token.clone(),
        }
    }

    /// Issues a HEAD request and extracts the required `Content-Length` and
    /// `Content-Disposition` file name.
    pub async fn resolve(&self, url: &Url) -> Result<OriginFile> {
        let response = self
            .http
            .head(url.clone())
            .header(NODE_ID_HEADER, &self.node_id)
            .header(NODE_TOKEN_HEADER, &self.auth_token)
            .send()
            .await?
            .error_for_status()?;

        let len = match response.headers().get(CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.parse().ok())
                .ok_or(Error::MalformedHeader("Content-Length"))?,
            None => return Err(Error::MissingHeader("Content-Length")),
        };
        let filename = match response.headers().get(CONTENT_DISPOSITION) {
            Some(value) => {
                let raw = value
                    .to_str()
                    .map_err(|_| Error::MalformedHeader("Content-Disposition"))?;
                FILENAME_RE
                    .captures(raw)
                    .and_then(|captures| captures.get(1))
                    .map(|m| m.as_str().to_string())
                    .ok_or(Error::MalformedHeader("Content-Disposition"))?
            }
            None => return Err(Error::MissingHeader("Content-Disposition")),
        };
        Ok(OriginFile { len, filename })
    }

    /// Streams the resource to `dest`, chunk by chunk, without buffering the
    /// whole payload in memory.
    pub async fn download(&self, url: &Url, dest: &Path) -> Result<()> {
        log::info!("Downloading {} to {:?}", url, dest);
        let response = self
            .http
            .get(url.clone())
            .header(NODE_ID_HEADER, &self.node_id)
            .header(NODE_TOKEN_HEADER, &self.auth_token)
            .send()
            .await?
            .error_for_status()?;

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
