//! Probes for the resources the node self-limits on: per-volume free space
//! and system memory.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::MetadataExt,
    path::PathBuf,
};

use nix::sys::{statvfs::statvfs, sysinfo::sysinfo};

use crate::{
    conf::StoragePathConf,
    error::{Error, Result},
    REMOTE_DIR_NAME,
};

/// A configured storage volume with its derived remote directory.
#[derive(Clone, Debug)]
pub(crate) struct StoragePath {
    /// The configured mount point.
    pub root: PathBuf,
    /// `<root>/p2p-node-remote`, where this volume's fragments live.
    pub remote_dir: PathBuf,
    /// Percentage of the volume the node may fill.
    pub threshold: u8,
}

/// Resolves the configured storage paths: creates the remote directory of
/// each if absent and verifies that no two paths share a filesystem mount.
pub(crate) fn prepare_paths(confs: &[StoragePathConf]) -> Result<Vec<StoragePath>> {
    let mut mounts: HashMap<u64, PathBuf> = HashMap::new();
    let mut paths = Vec::with_capacity(confs.len());
    for conf in confs {
        let remote_dir = conf.path.join(REMOTE_DIR_NAME);
        if !remote_dir.is_dir() {
            log::info!("Creating remote directory {:?}", remote_dir);
            fs::create_dir_all(&remote_dir)?;
        }
        let device = fs::metadata(&conf.path)?.dev();
        if let Some(previous) = mounts.insert(device, conf.path.clone()) {
            return Err(Error::MountCollision(previous, conf.path.clone()));
        }
        paths.push(StoragePath {
            root: conf.path.clone(),
            remote_dir,
            threshold: conf.threshold,
        });
    }
    Ok(paths)
}

/// Returns the bytes the node may still place on the volume: the smaller of
/// what the filesystem reports available and what the configured threshold
/// leaves of the total size.
pub(crate) fn available_bytes(path: &StoragePath) -> Result<u64> {
    let stat = statvfs(path.remote_dir.as_path())?;
    let fragment_size = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * fragment_size;
    let available = stat.blocks_available() as u64 * fragment_size;
    let capped = total / 100 * path.threshold as u64;
    Ok(available.min(capped))
}

/// Picks the volume with the most capped free space. Volumes whose probe
/// fails are skipped with a warning so one unhealthy mount doesn't take the
/// node down.
pub(crate) fn most_free(paths: &[StoragePath]) -> Option<(&StoragePath, u64)> {
    let mut best: Option<(&StoragePath, u64)> = None;
    for path in paths {
        let available = match available_bytes(path) {
            Ok(available) => available,
            Err(e) => {
                log::warn!("Skipping storage path {:?}: {}", path.root, e);
                continue;
            }
        };
        if best.map(|(_, most)| available > most).unwrap_or(true) {
            best = Some((path, available));
        }
    }
    best
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct MemoryReport {
    pub total: u64,
    pub unused: u64,
}

impl MemoryReport {
    pub fn free_percent(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.unused * 100 / self.total
        }
    }
}

pub(crate) fn memory() -> Result<MemoryReport> {
    let info = sysinfo()?;
    Ok(MemoryReport {
        total: info.ram_total(),
        unused: info.ram_unused(),
    })
}

/// The one minute load average, reported in device updates.
pub(crate) fn load_average() -> Result<f64> {
    Ok(sysinfo()?.load_average().0)
}
