#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod error;
pub mod node;
pub mod signaling;
pub mod transport;

mod command;
mod fragment;
mod ipaddr;
mod origin;
mod peer;
mod probe;
mod protocol;
mod stats;
mod transfer;

#[cfg(test)]
mod testutil;

/// The identifier of a remote peer, assigned by the signaling service.
pub type PeerId = String;

/// The identifier of a fragment, assigned by the origin. It doubles as the
/// fragment's file name inside the remote directory of a storage path.
pub type FragmentId = String;

/// The identifier of a single fragment transfer, chosen by the requesting
/// peer. It is echoed back in every chunk frame so that receivers can
/// demultiplex concurrent transfers on one data channel.
pub type SessionId = String;

/// The number of payload bytes carried by a single chunk frame (except for
/// possibly the last frame of a fragment).
pub(crate) const CHUNK_SIZE: usize = 53 * 1024;

/// A session id on the wire is length-prefixed with a single byte.
pub(crate) const MAX_SESSION_ID_LEN: usize = 255;

/// The subdirectory of each configured storage path in which fragments are
/// kept. Its regular files are named after the fragment ids they hold.
pub(crate) const REMOTE_DIR_NAME: &str = "p2p-node-remote";

/// The fragment inventory report is partitioned into batches of at most this
/// many id/hash entries.
pub(crate) const HASH_REPORT_CHUNK: usize = 5;
