//! Persistence collaborator contracts.
//!
//! The document-store technology itself is external; this module only
//! defines the read/write contract the core drives: the per-subject
//! "latest sample" and time-bucketed aggregates ([`VitalsStore`]), and the
//! remembered device identity used for silent reconnection
//! ([`KnownDeviceStore`]). Both are fire-and-forget from the core's
//! perspective: failures are observed only for logging and never unwind
//! into the connection state machine.
//!
//! In-memory implementations are provided for tests and for hosts that
//! wire their own backend later.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use lifeband_types::{AggregatedVitals, VitalsSample};

use crate::error::{Error, Result};

/// Vitals persistence collaborator.
#[async_trait]
pub trait VitalsStore: Send + Sync {
    /// Persist the most recent raw sample for a subject.
    async fn save_latest(&self, subject_id: &str, sample: &VitalsSample) -> Result<()>;

    /// Persist an aggregate snapshot, keyed by its bucket start.
    async fn save_aggregate(&self, subject_id: &str, aggregate: &AggregatedVitals) -> Result<()>;

    /// Push feed of the most recent persisted sample for a subject.
    ///
    /// Used to hydrate the live projection on (re)mount, independent of
    /// any local radio connection.
    fn subscribe_latest(&self, subject_id: &str) -> broadcast::Receiver<VitalsSample>;
}

/// Persisted known-device-identity store, keyed by subject.
#[async_trait]
pub trait KnownDeviceStore: Send + Sync {
    /// Read the remembered device id for a subject, if any.
    async fn load(&self, subject_id: &str) -> Result<Option<String>>;

    /// Remember a device id for a subject.
    async fn save(&self, subject_id: &str, device_id: &str) -> Result<()>;

    /// Forget the remembered device id for a subject.
    async fn clear(&self, subject_id: &str) -> Result<()>;
}

/// In-memory [`VitalsStore`].
pub struct MemoryVitalsStore {
    latest: Mutex<HashMap<String, VitalsSample>>,
    aggregates: Mutex<HashMap<(String, i64), AggregatedVitals>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<VitalsSample>>>,
    fail_saves: AtomicBool,
}

impl Default for MemoryVitalsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVitalsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(HashMap::new()),
            aggregates: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Make every subsequent save fail, for failure-path tests.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// The stored latest sample for a subject.
    pub fn latest(&self, subject_id: &str) -> Option<VitalsSample> {
        self.latest.lock().unwrap().get(subject_id).cloned()
    }

    /// One stored aggregate by bucket start.
    pub fn aggregate(&self, subject_id: &str, bucket_start: i64) -> Option<AggregatedVitals> {
        self.aggregates
            .lock()
            .unwrap()
            .get(&(subject_id.to_string(), bucket_start))
            .cloned()
    }

    /// All stored aggregates for a subject, ordered by bucket start.
    pub fn aggregates_for(&self, subject_id: &str) -> Vec<AggregatedVitals> {
        let map = self.aggregates.lock().unwrap();
        let mut out: Vec<AggregatedVitals> = map
            .iter()
            .filter(|((subject, _), _)| subject == subject_id)
            .map(|(_, agg)| agg.clone())
            .collect();
        out.sort_by_key(|agg| agg.bucket_start);
        out
    }

    /// Publish a sample on the hydration feed without going through
    /// `save_latest`, simulating a write from another device or backend.
    pub fn publish_latest(&self, subject_id: &str, sample: VitalsSample) {
        self.latest
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), sample.clone());
        let _ = self.feed_sender(subject_id).send(sample);
    }

    fn feed_sender(&self, subject_id: &str) -> broadcast::Sender<VitalsSample> {
        self.feeds
            .lock()
            .unwrap()
            .entry(subject_id.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(Error::Store("injected save failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VitalsStore for MemoryVitalsStore {
    async fn save_latest(&self, subject_id: &str, sample: &VitalsSample) -> Result<()> {
        self.check_fail()?;
        self.latest
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), sample.clone());
        let _ = self.feed_sender(subject_id).send(sample.clone());
        Ok(())
    }

    async fn save_aggregate(&self, subject_id: &str, aggregate: &AggregatedVitals) -> Result<()> {
        self.check_fail()?;
        self.aggregates
            .lock()
            .unwrap()
            .insert((subject_id.to_string(), aggregate.bucket_start), aggregate.clone());
        Ok(())
    }

    fn subscribe_latest(&self, subject_id: &str) -> broadcast::Receiver<VitalsSample> {
        self.feed_sender(subject_id).subscribe()
    }
}

/// In-memory [`KnownDeviceStore`].
#[derive(Default)]
pub struct MemoryKnownDeviceStore {
    devices: Mutex<HashMap<String, String>>,
}

impl MemoryKnownDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a remembered device.
    pub fn with_device(subject_id: &str, device_id: &str) -> Self {
        let store = Self::new();
        store
            .devices
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), device_id.to_string());
        store
    }
}

#[async_trait]
impl KnownDeviceStore for MemoryKnownDeviceStore {
    async fn load(&self, subject_id: &str) -> Result<Option<String>> {
        Ok(self.devices.lock().unwrap().get(subject_id).cloned())
    }

    async fn save(&self, subject_id: &str, device_id: &str) -> Result<()> {
        self.devices
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), device_id.to_string());
        Ok(())
    }

    async fn clear(&self, subject_id: &str) -> Result<()> {
        self.devices.lock().unwrap().remove(subject_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_roundtrip_and_feed() {
        let store = MemoryVitalsStore::new();
        let mut feed = store.subscribe_latest("alice");

        let sample = VitalsSample::new(1_690_000_000_000, 72.0, 120.0, 80.0);
        store.save_latest("alice", &sample).await.unwrap();

        assert_eq!(store.latest("alice"), Some(sample.clone()));
        assert_eq!(feed.recv().await.unwrap(), sample);
        assert_eq!(store.latest("bob"), None);
    }

    #[tokio::test]
    async fn aggregates_keyed_by_bucket_start() {
        let store = MemoryVitalsStore::new();
        let agg = AggregatedVitals {
            bucket_start: 1_690_000_200_000,
            bucket_end: 1_690_002_000_000,
            sample_count: 2,
            averages: Default::default(),
            timestamp: 1_690_000_300_000,
        };
        store.save_aggregate("alice", &agg).await.unwrap();

        assert_eq!(store.aggregate("alice", agg.bucket_start), Some(agg));
        assert!(store.aggregates_for("bob").is_empty());
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_store_error() {
        let store = MemoryVitalsStore::new();
        store.set_fail_saves(true);
        let sample = VitalsSample::new(1_690_000_000_000, 72.0, 120.0, 80.0);
        assert!(store.save_latest("alice", &sample).await.is_err());
    }

    #[tokio::test]
    async fn known_device_store_roundtrip() {
        let store = MemoryKnownDeviceStore::new();
        assert_eq!(store.load("alice").await.unwrap(), None);

        store.save("alice", "AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(
            store.load("alice").await.unwrap().as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );

        store.clear("alice").await.unwrap();
        assert_eq!(store.load("alice").await.unwrap(), None);
    }
}
