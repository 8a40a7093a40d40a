//! Shared helpers for the test-suite.

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time;

use crate::{
    conf::StoragePathConf, error::Result, fragment::FragmentStore, signaling::SignalingSink,
    REMOTE_DIR_NAME,
};

/// Builds a fragment store rooted at `dir` with the given fragment files
/// already on disk. Call `scan` on the result to index them.
pub(crate) fn store_in(dir: &Path, fragments: &[(&str, &[u8])]) -> FragmentStore {
    let store = FragmentStore::open(&[StoragePathConf {
        path: dir.to_path_buf(),
        threshold: 90,
    }])
    .unwrap();
    let remote = dir.join(REMOTE_DIR_NAME);
    for (id, contents) in fragments {
        fs::write(remote.join(id), contents).unwrap();
    }
    store
}

/// A signaling sink that records every emitted event and answers requests
/// from a table of scripted acks.
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
    acks: Mutex<HashMap<String, Value>>,
    stall: Mutex<bool>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            acks: Mutex::new(HashMap::new()),
            stall: Mutex::new(false),
        })
    }

    pub fn clone_as_sink(self: &Arc<Self>) -> Arc<dyn SignalingSink> {
        Arc::clone(self) as Arc<dyn SignalingSink>
    }

    /// Sets the ack returned for the next requests of `event`.
    pub fn script_ack(&self, event: &str, ack: Value) {
        self.acks.lock().unwrap().insert(event.to_string(), ack);
    }

    /// Makes requests hang forever, for exercising ack timeouts.
    pub fn stall_requests(&self) {
        *self.stall.lock().unwrap() = true;
    }

    /// Payloads of all recorded events with the given name, in emission
    /// order.
    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Waits until at least `count` events with the given name have been
    /// recorded. Returns false if that doesn't happen within the grace
    /// period.
    pub async fn wait_for(&self, name: &str, count: usize) -> bool {
        wait_until(|| self.events_named(name).len() >= count).await
    }
}

#[async_trait]
impl SignalingSink for RecordingSink {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
        Ok(())
    }

    async fn request(&self, event: &str, _payload: Value) -> Result<Value> {
        let stalled = *self.stall.lock().unwrap();
        if stalled {
            futures::future::pending::<()>().await;
        }
        match self.acks.lock().unwrap().get(event) {
            Some(ack) => Ok(ack.clone()),
            None => Ok(json!({ "success": true })),
        }
    }
}

/// A boxable [`SignalingSink`] view of a shared [`RecordingSink`], for
/// transports whose connections must all record into one place.
pub(crate) struct SharedSink(pub Arc<RecordingSink>);

#[async_trait]
impl SignalingSink for SharedSink {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        SignalingSink::emit(&*self.0, event, payload).await
    }

    async fn request(&self, event: &str, payload: Value) -> Result<Value> {
        SignalingSink::request(&*self.0, event, payload).await
    }
}

/// Polls `cond` until it holds or a generous deadline passes. Returns the
/// final verdict so callers can assert on it.
pub(crate) async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
