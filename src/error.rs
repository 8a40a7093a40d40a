use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type used by all components of the node agent.
///
/// Propagation is scoped: transport errors tear down a single peer, transfer
/// errors fail a single session, and only configuration and signaling
/// exhaustion errors are allowed to abort the whole process.
#[derive(Debug, Error)]
pub enum Error {
    /// The settings file did not exist; a default skeleton was written in its
    /// place that the operator needs to fill in.
    #[error("settings file {0:?} was missing, wrote a default that needs to be filled in")]
    ConfigurationRequired(PathBuf),

    /// The settings file exists but its contents don't pass validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Two configured storage paths resolve to the same filesystem mount.
    #[error("storage paths {0:?} and {1:?} are on the same filesystem")]
    MountCollision(PathBuf, PathBuf),

    /// No storage path is configured (or none is usable).
    #[error("no usable storage path")]
    NoStoragePath,

    /// Every configured signaling server was tried and none accepted the
    /// connection.
    #[error("all signaling servers exhausted")]
    SignalingExhausted,

    /// A signaling request did not receive its acknowledgement in time.
    #[error("signaling ack timed out for event {0}")]
    AckTimeout(String),

    #[error("sign-in rejected: {0}")]
    SignInRejected(String),

    #[error("sign-up rejected: {0}")]
    SignUpRejected(String),

    /// An error reported by the underlying peer transport.
    #[error("transport: {0}")]
    Transport(String),

    /// The data channel was closed while it was still needed.
    #[error("data channel closed")]
    ChannelClosed,

    /// An origin response lacked a header the download flow requires.
    #[error("origin response is missing the {0} header")]
    MissingHeader(&'static str),

    /// An origin response header was present but could not be interpreted.
    #[error("origin response has a malformed {0} header")]
    MalformedHeader(&'static str),

    /// The most-free storage path cannot hold the announced download size.
    #[error("not enough free storage for {0} bytes")]
    InsufficientSpace(u64),

    /// A session id that cannot be framed (empty, non-ASCII or longer than
    /// 255 bytes).
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    /// A chunk frame that does not follow the wire format.
    #[error("malformed chunk frame")]
    MalformedFrame,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("system probe failed: {0}")]
    Probe(#[from] nix::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl Error {
    /// The process exit code an embedding binary should use when this error
    /// aborts startup. Errors that are not fatal by themselves map to the
    /// generic failure code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigurationRequired(_) => 2,
            Error::InvalidSettings(_) => 2,
            Error::MountCollision(_, _) => 3,
            Error::SignalingExhausted => 4,
            Error::SignInRejected(_) => 5,
            Error::SignUpRejected(_) => 5,
            _ => 1,
        }
    }
}
