//! Session orchestration.
//!
//! A [`Session`] ties the pieces together for one subject: the connection
//! manager, the reconnect policy, the aggregation pipeline and the
//! persistence collaborators. It owns the background tasks (sample
//! ingestion, store hydration, lifecycle event handling) and guards them
//! with a [`CancellationToken`] so [`shutdown`](Session::shutdown) stops
//! everything deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lifeband_types::{ConnectionState, DeviceIdentity, VitalsSample};

use crate::aggregate::VitalsAggregator;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::events::{event_channel, EventReceiver, EventSender, SessionEvent};
use crate::manager::ConnectionManager;
use crate::reconnect::ReconnectPolicy;
use crate::scan::{scan_for_bands, DiscoveredBand};
use crate::store::{KnownDeviceStore, VitalsStore};
use crate::transport::BandTransport;

/// A live monitoring session for one subject.
pub struct Session {
    transport: Arc<dyn BandTransport>,
    manager: Arc<ConnectionManager>,
    policy: Arc<ReconnectPolicy>,
    aggregator: Arc<Mutex<VitalsAggregator>>,
    device_store: Arc<dyn KnownDeviceStore>,
    subject_id: String,
    config: SessionConfig,
    events: EventSender,
    latest_rx: watch::Receiver<Option<VitalsSample>>,
    cancel: CancellationToken,
    started: AtomicBool,
    /// Moved out by the first `start` call.
    sample_rx: Mutex<Option<mpsc::Receiver<VitalsSample>>>,
    vitals_store: Arc<dyn VitalsStore>,
}

impl Session {
    /// Create a session. Validates the configuration; no background work
    /// starts until [`start`](Self::start).
    pub fn new(
        transport: Arc<dyn BandTransport>,
        vitals_store: Arc<dyn VitalsStore>,
        device_store: Arc<dyn KnownDeviceStore>,
        subject_id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let subject_id = subject_id.into();

        let (events, _) = event_channel(config.event_capacity);
        let (sample_tx, sample_rx) = mpsc::channel(config.sample_buffer);
        let (latest_tx, latest_rx) = watch::channel(None);

        let manager = ConnectionManager::new(
            Arc::clone(&transport),
            config.clone(),
            events.clone(),
            sample_tx,
        );
        let policy = ReconnectPolicy::new(
            Arc::clone(&manager),
            config.reconnect.clone(),
            events.clone(),
        );
        let aggregator = VitalsAggregator::new(
            subject_id.clone(),
            Arc::clone(&vitals_store),
            config.aggregate.window,
            latest_tx,
        );

        Ok(Arc::new(Self {
            transport,
            manager,
            policy,
            aggregator: Arc::new(Mutex::new(aggregator)),
            device_store,
            subject_id,
            config,
            events,
            latest_rx,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            sample_rx: Mutex::new(Some(sample_rx)),
            vitals_store,
        }))
    }

    /// Start the background tasks. Safe to call more than once; only the
    /// first call does anything.
    pub async fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let sample_rx = self
            .sample_rx
            .lock()
            .await
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1);

        self.spawn_ingest_loop(sample_rx);
        self.spawn_event_loop();
        info!("session started for subject {}", self.subject_id);
    }

    /// Scan, pick the strongest qualifying band, connect and stream.
    ///
    /// Arms automatic reconnection for subsequent device-initiated drops.
    pub async fn connect(&self) -> Result<()> {
        self.start().await;
        self.policy.set_desired(true);
        self.manager.connect().await
    }

    /// Connect to a specific band chosen from a scan list.
    pub async fn connect_to_device(&self, device: DeviceIdentity) -> Result<()> {
        self.start().await;
        self.policy.set_desired(true);
        self.manager.connect_to(device).await
    }

    /// Silently reconnect to the remembered band for this subject, if one
    /// is stored and reconnection is desired. Returns whether an attempt
    /// was made.
    pub async fn reconnect_if_known_device(&self) -> Result<bool> {
        self.start().await;
        if !self.policy.is_desired() {
            return Ok(false);
        }
        let Some(device_id) = self.device_store.load(&self.subject_id).await? else {
            debug!("no remembered device for subject {}", self.subject_id);
            return Ok(false);
        };
        info!("silently reconnecting to remembered device {device_id}");
        self.manager.connect_to(DeviceIdentity::new(device_id)).await?;
        Ok(true)
    }

    /// Disconnect manually. Suppresses automatic reconnection until the
    /// next explicit connect.
    pub async fn disconnect(&self) {
        self.policy.set_desired(false);
        self.manager.disconnect().await;
    }

    /// Forget the remembered band for this subject.
    pub async fn forget_device(&self) -> Result<()> {
        self.device_store.clear(&self.subject_id).await
    }

    /// Scan and classify everything in range, for a device pick list.
    pub async fn scan(&self) -> Result<Vec<DiscoveredBand>> {
        self.transport.ensure_permissions().await?;
        scan_for_bands(&self.transport, &self.config.scan).await
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    /// Whether a connect sequence is in flight.
    pub fn is_connecting(&self) -> bool {
        self.manager.is_connecting()
    }

    /// The live "latest sample" projection.
    pub fn latest(&self) -> watch::Receiver<Option<VitalsSample>> {
        self.latest_rx.clone()
    }

    /// Subscribe to session lifecycle events.
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Discard the live aggregation bucket.
    pub async fn reset_aggregation(&self) {
        self.aggregator.lock().await.reset();
    }

    /// Stop all background tasks, drop the link and flush outstanding
    /// persistence writes.
    pub async fn shutdown(&self) {
        self.policy.set_desired(false);
        self.cancel.cancel();
        self.manager.disconnect().await;
        self.aggregator.lock().await.flush().await;
        info!("session shut down");
    }

    /// Ingestion loop: live samples are aggregated and persisted; samples
    /// hydrated from the store only refresh the live projection.
    fn spawn_ingest_loop(&self, mut samples: mpsc::Receiver<VitalsSample>) {
        let aggregator = Arc::clone(&self.aggregator);
        let mut hydration = self.vitals_store.subscribe_latest(&self.subject_id);
        let cancel = self.cancel.clone();
        let mut hydration_open = true;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sample = samples.recv() => match sample {
                        Some(sample) => aggregator.lock().await.ingest(sample),
                        None => break,
                    },
                    hydrated = hydration.recv(), if hydration_open => match hydrated {
                        Ok(sample) => aggregator.lock().await.publish_latest(sample),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("hydration feed lagged, skipped {skipped}");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            hydration_open = false;
                        }
                    },
                }
            }
            debug!("ingest loop stopped");
        });
    }

    /// Event loop: remembers the device on connect and drives the
    /// reconnect policy on device-initiated loss.
    fn spawn_event_loop(&self) {
        let mut events = self.events.subscribe();
        let policy = Arc::clone(&self.policy);
        let device_store = Arc::clone(&self.device_store);
        let subject_id = self.subject_id.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SessionEvent::Connected { device }) => {
                            policy.remember(device.clone());
                            if let Err(e) = device_store.save(&subject_id, &device.id).await {
                                warn!("failed to remember device: {e}");
                            }
                        }
                        Ok(SessionEvent::ConnectionLost { .. }) => {
                            policy.on_connection_lost().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("event stream lagged, skipped {skipped}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("event loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingTransport;
    use crate::store::{MemoryKnownDeviceStore, MemoryVitalsStore};
    use std::time::Duration;

    fn session_with(
        transport: Arc<RecordingTransport>,
        vitals: Arc<MemoryVitalsStore>,
        devices: Arc<MemoryKnownDeviceStore>,
    ) -> Arc<Session> {
        let mut config = SessionConfig::new();
        config.scan.window = Duration::from_millis(50);
        Session::new(transport, vitals, devices, "alice", config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_remembers_device() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let devices = Arc::new(MemoryKnownDeviceStore::new());
        let session = session_with(
            Arc::clone(&transport),
            Arc::new(MemoryVitalsStore::new()),
            Arc::clone(&devices),
        );

        session.connect().await.unwrap();
        // Let the event loop process the Connected event.
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(devices.load("alice").await.unwrap().as_deref(), Some("AA"));
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_sample_reaches_projection_and_store() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let vitals = Arc::new(MemoryVitalsStore::new());
        let session = session_with(
            Arc::clone(&transport),
            Arc::clone(&vitals),
            Arc::new(MemoryKnownDeviceStore::new()),
        );

        session.connect().await.unwrap();
        let mut latest = session.latest();

        transport.push_notification(
            r#"{"timestamp":1690000000000,"hr":82,"bp_sys":118,"bp_dia":76}"#,
        );
        latest.changed().await.unwrap();
        assert_eq!(latest.borrow_and_update().as_ref().unwrap().hr, 82.0);

        session.shutdown().await;
        assert_eq!(vitals.latest("alice").unwrap().hr, 82.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hydrated_sample_updates_projection_without_aggregation() {
        let transport = Arc::new(RecordingTransport::new());
        let vitals = Arc::new(MemoryVitalsStore::new());
        let session = session_with(
            Arc::clone(&transport),
            Arc::clone(&vitals),
            Arc::new(MemoryKnownDeviceStore::new()),
        );
        session.start().await;
        let mut latest = session.latest();

        vitals.publish_latest("alice", VitalsSample::new(1_690_000_000_000, 75.0, 120.0, 80.0));

        latest.changed().await.unwrap();
        assert_eq!(latest.borrow_and_update().as_ref().unwrap().hr, 75.0);
        // No radio sample was ingested, so nothing was aggregated.
        assert!(vitals.aggregates_for("alice").is_empty());
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_suppresses_reconnect() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let session = session_with(
            Arc::clone(&transport),
            Arc::new(MemoryVitalsStore::new()),
            Arc::new(MemoryKnownDeviceStore::new()),
        );

        session.connect().await.unwrap();
        let connects_before = transport.call_count("connect");
        session.disconnect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.call_count("connect"), connects_before);
        assert!(matches!(
            session.state(),
            ConnectionState::Disconnected { .. }
        ));
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_to_remembered_device_without_scanning() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(
            Arc::clone(&transport),
            Arc::new(MemoryVitalsStore::new()),
            Arc::new(MemoryKnownDeviceStore::with_device("alice", "AA")),
        );

        let attempted = session.reconnect_if_known_device().await.unwrap();
        assert!(attempted);
        assert!(session.state().is_connected());
        assert_eq!(transport.call_count("scan"), 0);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_remembered_device_is_a_quiet_no_op() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(
            Arc::clone(&transport),
            Arc::new(MemoryVitalsStore::new()),
            Arc::new(MemoryKnownDeviceStore::new()),
        );

        let attempted = session.reconnect_if_known_device().await.unwrap();
        assert!(!attempted);
        assert_eq!(transport.call_count("connect"), 0);
        session.shutdown().await;
    }
}
