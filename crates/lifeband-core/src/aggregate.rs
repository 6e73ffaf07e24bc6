//! Vitals ingestion and rolling aggregation.
//!
//! The aggregator consumes the accepted sample stream and maintains two
//! projections: the "latest sample" watch channel, updated synchronously
//! on every sample, and a single live [`AggregationBucket`] keyed by
//! wall-clock window. Persistence of both the latest raw sample and the
//! averaged bucket snapshot is scheduled fire-and-forget; a store failure
//! is logged and never blocks or fails ingestion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lifeband_types::{normalize_timestamp, now_ms, AggregatedVitals, VitalsSample};

use crate::store::VitalsStore;

/// The live aggregation bucket.
///
/// Exactly one bucket is live per active device link. A sample whose
/// floored timestamp differs from `bucket_start` supersedes the bucket
/// wholesale; there is no explicit flush event because every fold already
/// persisted a snapshot.
#[derive(Debug, Clone)]
pub struct AggregationBucket {
    /// Bucket start, floored to the window width (Unix ms).
    pub bucket_start: i64,
    /// Bucket end, `bucket_start + window` (Unix ms).
    pub bucket_end: i64,
    /// Number of samples folded in since `bucket_start`.
    pub count: u32,
    /// Running per-field sums. Invariant: every field was summed over
    /// exactly `count` opportunities (absent optionals simply don't add).
    sums: BTreeMap<&'static str, f64>,
    /// The most recent sample folded into this bucket.
    pub latest: VitalsSample,
}

impl AggregationBucket {
    fn open(bucket_start: i64, window_ms: i64, sample: &VitalsSample) -> Self {
        let mut bucket = Self {
            bucket_start,
            bucket_end: bucket_start + window_ms,
            count: 0,
            sums: BTreeMap::new(),
            latest: sample.clone(),
        };
        bucket.fold(sample);
        bucket
    }

    fn fold(&mut self, sample: &VitalsSample) {
        self.count += 1;
        for (field, value) in sample.numeric_fields() {
            *self.sums.entry(field).or_insert(0.0) += value;
        }
        self.latest = sample.clone();
    }

    /// Snapshot the bucket as the persisted aggregate shape: per-field
    /// `sum / count` rounded to one decimal place.
    pub fn snapshot(&self) -> AggregatedVitals {
        let averages = self
            .sums
            .iter()
            .map(|(field, sum)| (field.to_string(), round1(sum / f64::from(self.count))))
            .collect();
        AggregatedVitals {
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            sample_count: self.count,
            averages,
            timestamp: self.latest.timestamp,
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Consumes the live sample stream and maintains both projections.
pub struct VitalsAggregator {
    subject_id: String,
    window_ms: i64,
    store: Arc<dyn VitalsStore>,
    bucket: Option<AggregationBucket>,
    latest_tx: watch::Sender<Option<VitalsSample>>,
    /// Outstanding persistence tasks, drained by [`flush`](Self::flush).
    pending: Vec<JoinHandle<()>>,
}

impl VitalsAggregator {
    /// Create an aggregator for one subject.
    pub fn new(
        subject_id: impl Into<String>,
        store: Arc<dyn VitalsStore>,
        window: Duration,
        latest_tx: watch::Sender<Option<VitalsSample>>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            window_ms: window.as_millis() as i64,
            store,
            bucket: None,
            latest_tx,
            pending: Vec::new(),
        }
    }

    /// Ingest one accepted sample, normalizing its timestamp against the
    /// current wall clock.
    pub fn ingest(&mut self, sample: VitalsSample) {
        self.ingest_at(sample, now_ms());
    }

    /// Ingest with an explicit wall clock, for deterministic tests.
    pub fn ingest_at(&mut self, mut sample: VitalsSample, received_ms: i64) {
        sample.timestamp = normalize_timestamp(sample.timestamp, received_ms);

        // Live projection first: it must reflect the newest sample even if
        // the aggregate write is still in flight or fails.
        self.latest_tx.send_replace(Some(sample.clone()));

        let bucket_start = (sample.timestamp / self.window_ms) * self.window_ms;
        let bucket = match self.bucket.take() {
            Some(mut bucket) if bucket.bucket_start == bucket_start => {
                bucket.fold(&sample);
                bucket
            }
            Some(old) => {
                debug!(
                    "bucket rollover: {} -> {} ({} samples folded)",
                    old.bucket_start, bucket_start, old.count
                );
                AggregationBucket::open(bucket_start, self.window_ms, &sample)
            }
            None => AggregationBucket::open(bucket_start, self.window_ms, &sample),
        };

        let snapshot = bucket.snapshot();
        self.bucket = Some(bucket);
        self.schedule_persist(sample, snapshot);
    }

    /// Update the live projection without folding into the bucket.
    ///
    /// Used for samples hydrated from the store (written by another device
    /// or backend); they were already aggregated at their source.
    pub fn publish_latest(&self, sample: VitalsSample) {
        self.latest_tx.send_replace(Some(sample));
    }

    /// Discard the live bucket. Called on subject or session switch so an
    /// aggregate never spans two subjects.
    pub fn reset(&mut self) {
        self.bucket = None;
    }

    /// The live bucket, if one is open.
    pub fn live_bucket(&self) -> Option<&AggregationBucket> {
        self.bucket.as_ref()
    }

    /// Await all outstanding persistence tasks. Test and shutdown hook;
    /// ingestion never waits on this.
    pub async fn flush(&mut self) {
        for handle in self.pending.drain(..) {
            let _ = handle.await;
        }
    }

    fn schedule_persist(&mut self, sample: VitalsSample, snapshot: AggregatedVitals) {
        self.pending.retain(|handle| !handle.is_finished());

        let store = Arc::clone(&self.store);
        let subject_id = self.subject_id.clone();
        self.pending.push(tokio::spawn(async move {
            if let Err(e) = store.save_latest(&subject_id, &sample).await {
                warn!("failed to persist latest sample: {e}");
            }
            if let Err(e) = store.save_aggregate(&subject_id, &snapshot).await {
                warn!("failed to persist aggregate: {e}");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryVitalsStore;

    const WINDOW: Duration = Duration::from_secs(30 * 60);
    const WINDOW_MS: i64 = 30 * 60 * 1000;
    // 2023-07-22T05:06:40Z, safely above the plausible-epoch floor.
    const T0: i64 = 1_690_000_000_000;
    const NOW: i64 = 1_700_000_000_000;

    fn aggregator(
        store: &Arc<MemoryVitalsStore>,
    ) -> (VitalsAggregator, watch::Receiver<Option<VitalsSample>>) {
        let (latest_tx, latest_rx) = watch::channel(None);
        let store: Arc<dyn VitalsStore> = Arc::clone(store) as Arc<dyn VitalsStore>;
        (
            VitalsAggregator::new("alice", store, WINDOW, latest_tx),
            latest_rx,
        )
    }

    fn sample(ts: i64, hr: f64) -> VitalsSample {
        VitalsSample::new(ts, hr, 120.0, 80.0)
    }

    #[tokio::test]
    async fn bucket_rollover_produces_two_buckets() {
        let store = Arc::new(MemoryVitalsStore::new());
        let (mut agg, _latest) = aggregator(&store);

        let t = T0;
        agg.ingest_at(sample(t, 80.0), NOW);
        agg.ingest_at(sample(t + 5 * 60 * 1000, 90.0), NOW);
        agg.ingest_at(sample(t + 35 * 60 * 1000, 70.0), NOW);
        agg.flush().await;

        let buckets = store.aggregates_for("alice");
        assert_eq!(buckets.len(), 2);

        let first = &buckets[0];
        assert_eq!(first.sample_count, 2);
        assert_eq!(first.averages["hr"], 85.0);
        assert_eq!(first.averages["bp_sys"], 120.0);
        assert_eq!(first.bucket_end - first.bucket_start, WINDOW_MS);

        let second = &buckets[1];
        assert_eq!(second.sample_count, 1);
        assert_eq!(second.averages["hr"], 70.0);
        assert_ne!(first.bucket_start, second.bucket_start);

        // Only the second bucket is still live.
        assert_eq!(agg.live_bucket().unwrap().bucket_start, second.bucket_start);
    }

    #[tokio::test]
    async fn averages_rounded_to_one_decimal() {
        let store = Arc::new(MemoryVitalsStore::new());
        let (mut agg, _latest) = aggregator(&store);

        agg.ingest_at(sample(T0, 80.0), NOW);
        agg.ingest_at(sample(T0 + 1000, 81.0), NOW);
        agg.ingest_at(sample(T0 + 2000, 81.0), NOW);
        agg.flush().await;

        let bucket_start = (T0 / WINDOW_MS) * WINDOW_MS;
        let agg_stored = store.aggregate("alice", bucket_start).unwrap();
        // 242/3 = 80.666... -> 80.7
        assert_eq!(agg_stored.averages["hr"], 80.7);
        assert_eq!(agg_stored.sample_count, 3);
    }

    #[tokio::test]
    async fn seconds_timestamp_is_rescaled_before_bucketing() {
        let store = Arc::new(MemoryVitalsStore::new());
        let (mut agg, latest) = aggregator(&store);

        agg.ingest_at(sample(1_690_000_000, 82.0), NOW);
        agg.flush().await;

        let normalized = latest.borrow().as_ref().unwrap().timestamp;
        assert_eq!(normalized, 1_690_000_000_000);

        let bucket_start = (1_690_000_000_000 / WINDOW_MS) * WINDOW_MS;
        assert!(store.aggregate("alice", bucket_start).is_some());
    }

    #[tokio::test]
    async fn zeroed_clock_buckets_by_receive_time() {
        let store = Arc::new(MemoryVitalsStore::new());
        let (mut agg, latest) = aggregator(&store);

        agg.ingest_at(sample(0, 82.0), NOW);
        agg.flush().await;

        assert_eq!(latest.borrow().as_ref().unwrap().timestamp, NOW);
        let bucket_start = (NOW / WINDOW_MS) * WINDOW_MS;
        assert_eq!(store.aggregate("alice", bucket_start).unwrap().sample_count, 1);
    }

    #[tokio::test]
    async fn optional_fields_average_over_presence_only() {
        let store = Arc::new(MemoryVitalsStore::new());
        let (mut agg, _latest) = aggregator(&store);

        let mut with_spo2 = sample(T0, 80.0);
        with_spo2.spo2 = Some(98.0);
        agg.ingest_at(with_spo2, NOW);
        agg.ingest_at(sample(T0 + 1000, 90.0), NOW);
        agg.flush().await;

        let bucket_start = (T0 / WINDOW_MS) * WINDOW_MS;
        let stored = store.aggregate("alice", bucket_start).unwrap();
        assert_eq!(stored.averages["hr"], 85.0);
        // spo2 was present once; its sum is divided by the bucket count.
        assert_eq!(stored.averages["spo2"], 49.0);
    }

    #[tokio::test]
    async fn store_failure_does_not_break_ingestion() {
        let store = Arc::new(MemoryVitalsStore::new());
        store.set_fail_saves(true);
        let (mut agg, latest) = aggregator(&store);

        agg.ingest_at(sample(T0, 82.0), NOW);
        agg.flush().await;

        // Live projection updated despite the failing store.
        assert_eq!(latest.borrow().as_ref().unwrap().hr, 82.0);
        assert_eq!(agg.live_bucket().unwrap().count, 1);
    }

    #[tokio::test]
    async fn reset_discards_live_bucket() {
        let store = Arc::new(MemoryVitalsStore::new());
        let (mut agg, _latest) = aggregator(&store);

        agg.ingest_at(sample(T0, 82.0), NOW);
        agg.reset();
        assert!(agg.live_bucket().is_none());

        // The next sample opens a fresh bucket with count 1.
        agg.ingest_at(sample(T0 + 1000, 90.0), NOW);
        assert_eq!(agg.live_bucket().unwrap().count, 1);
    }
}
