//! The fragment store: a process-wide index mapping fragment ids to their
//! absolute paths, plus the content hashing used to verify the inventory
//! against the signaling service.

use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::Mutex,
};

use blake2::{digest::consts::U32, Blake2b, Digest};
use tokio::task;

use crate::{
    conf::StoragePathConf,
    error::Result,
    probe::{self, StoragePath},
    FragmentId, HASH_REPORT_CHUNK,
};

type Blake2b256 = Blake2b<U32>;

/// Owns the configured storage volumes and the id → path index.
///
/// Lookups are the only hot-path operation; insertions and removals happen on
/// rare download/delete commands, so a single mutex around the map is enough.
pub(crate) struct FragmentStore {
    paths: Vec<StoragePath>,
    index: Mutex<HashMap<FragmentId, PathBuf>>,
}

impl FragmentStore {
    /// Prepares the storage volumes (creating remote directories, rejecting
    /// paths that share a mount) and returns an empty store.
    pub fn open(confs: &[StoragePathConf]) -> Result<Self> {
        let paths = probe::prepare_paths(confs)?;
        Ok(Self {
            paths,
            index: Mutex::new(HashMap::new()),
        })
    }

    /// Rebuilds the index by scanning every remote directory for regular
    /// files. The file name is the fragment id. Returns the number of
    /// indexed fragments.
    pub fn scan(&self) -> Result<usize> {
        let mut index = self.index.lock().unwrap();
        index.clear();
        for path in &self.paths {
            for entry in fs::read_dir(&path.remote_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                match entry.file_name().into_string() {
                    Ok(name) => {
                        index.insert(name, entry.path());
                    }
                    Err(name) => {
                        log::warn!("Skipping non-UTF-8 fragment file {:?}", name)
                    }
                }
            }
        }
        log::info!("Fragment scan found {} fragments", index.len());
        Ok(index.len())
    }

    pub fn lookup(&self, id: &str) -> Option<PathBuf> {
        self.index.lock().unwrap().get(id).cloned()
    }

    pub fn insert(&self, id: FragmentId, path: PathBuf) {
        self.index.lock().unwrap().insert(id, path);
    }

    /// Removes the id from the index, returning the path it mapped to.
    pub fn remove(&self, id: &str) -> Option<PathBuf> {
        self.index.lock().unwrap().remove(id)
    }

    pub fn ids(&self) -> Vec<FragmentId> {
        self.index.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().unwrap().is_empty()
    }

    /// The remote directory with the most capped free space, for placing a
    /// new download.
    pub fn most_free(&self) -> Option<(PathBuf, u64)> {
        probe::most_free(&self.paths)
            .map(|(path, available)| (path.remote_dir.clone(), available))
    }

    /// Per-volume capped free space, for the periodic device update.
    pub fn storage_report(&self) -> Vec<StorageReport> {
        self.paths
            .iter()
            .map(|path| StorageReport {
                path: path.root.clone(),
                available: probe::available_bytes(path).unwrap_or(0),
            })
            .collect()
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct StorageReport {
    pub path: PathBuf,
    pub available: u64,
}

/// A fragment id together with the BLAKE2b-256 hex digest of its contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct HashEntry {
    pub fragment_id: FragmentId,
    pub hash: String,
}

/// One batch of the startup inventory report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct InventoryChunk {
    /// Index of the first entry of this batch in the overall report.
    pub index: usize,
    /// Total number of batches in the report.
    pub total: usize,
    pub resources: Vec<HashEntry>,
}

/// Computes the BLAKE2b-256 digest of a file, hex-encoded.
///
/// Hashing a multi-gigabyte fragment is slow, so the work runs on the
/// blocking pool rather than the reactor.
pub(crate) async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || {
        let mut file = fs::File::open(&path)?;
        let mut hasher = Blake2b256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .expect("hash task panicked")
}

/// Partitions the inventory into batches of at most `HASH_REPORT_CHUNK`
/// entries, each tagged with its first entry's index and the batch count.
pub(crate) fn inventory_chunks(entries: Vec<HashEntry>) -> Vec<InventoryChunk> {
    let total = (entries.len() + HASH_REPORT_CHUNK - 1) / HASH_REPORT_CHUNK;
    entries
        .chunks(HASH_REPORT_CHUNK)
        .enumerate()
        .map(|(i, chunk)| InventoryChunk {
            index: i * HASH_REPORT_CHUNK,
            total,
            resources: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::testutil;

    #[tokio::test]
    async fn test_hash_file_known_vector() {
        // BLAKE2b-256 of a single zero byte
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero");
        fs::write(&path, [0u8]).unwrap();

        assert_eq!(
            hash_file(&path).await.unwrap(),
            "03170a2e7597b7b7e3d84c05391d139a62b157e78786d8c082f29dcf4c111314"
        );
    }

    #[tokio::test]
    async fn test_hash_file_empty_input() {
        // BLAKE2b-256 of the empty string
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        assert_eq!(
            hash_file(&path).await.unwrap(),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn test_scan_indexes_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            testutil::store_in(dir.path(), &[("frag-1", b"aa" as &[u8]), ("frag-2", b"bb")]);
        // subdirectories in the remote dir must not show up in the index
        let remote = dir.path().join(crate::REMOTE_DIR_NAME);
        fs::create_dir(remote.join("not-a-fragment")).unwrap();

        assert_eq!(store.scan().unwrap(), 2);
        let mut ids = store.ids();
        ids.sort();
        assert_eq!(ids, vec!["frag-1".to_string(), "frag-2".to_string()]);
        assert!(store.lookup("frag-1").unwrap().is_file());
        assert_eq!(store.lookup("not-a-fragment"), None);
    }

    #[test]
    fn test_index_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = testutil::store_in(dir.path(), &[("frag-1", b"aa" as &[u8])]);
        store.scan().unwrap();

        let path = store.remove("frag-1").unwrap();
        assert!(store.is_empty());
        store.insert("frag-1".into(), path.clone());
        assert_eq!(store.lookup("frag-1"), Some(path));
    }

    #[test]
    fn test_inventory_chunks_partitioning() {
        let entries: Vec<_> = (0..12)
            .map(|i| HashEntry {
                fragment_id: format!("frag-{}", i),
                hash: "00".into(),
            })
            .collect();

        let chunks = inventory_chunks(entries);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].index, 5);
        assert_eq!(chunks[2].index, 10);
        assert!(chunks.iter().all(|c| c.total == 3));
        assert_eq!(chunks[0].resources.len(), 5);
        assert_eq!(chunks[2].resources.len(), 2);
    }

    #[test]
    fn test_inventory_chunks_empty() {
        assert!(inventory_chunks(Vec::new()).is_empty());
    }
}
