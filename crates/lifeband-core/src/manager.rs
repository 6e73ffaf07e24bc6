//! Connection lifecycle state machine.
//!
//! [`ConnectionManager`] owns the single authoritative
//! [`ConnectionState`] watch channel and drives the transport through the
//! connect sequence: scan, select, link, discover, subscribe, start
//! command. Observers read the watch; they never see a torn state because
//! every transition replaces the whole value.
//!
//! Concurrency is handled with two primitives:
//!
//! - a busy flag claimed with compare-and-swap, so a second connect
//!   arriving while one is in flight is a silent no-op rather than a
//!   second scan;
//! - a generation counter bumped on every teardown. In-flight connect
//!   steps and the notification pump snapshot the generation at start and
//!   stop as soon as it moves, so a disconnect issued mid-connect wins.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use lifeband_types::uuids::{
    CONTROL_CHARACTERISTIC, START_COMMAND, VITALS_CHARACTERISTIC, VITALS_SERVICE,
};
use lifeband_types::{decode, ConnectionState, Decoded, DeviceIdentity, VitalsSample};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::scan::select_candidate;
use crate::transport::{BandTransport, LinkId, TransportEvent};

/// State shared with the spawned pump and watcher tasks.
///
/// Split out so the tasks can hold an `Arc` to exactly what they touch
/// after a connect returns: the generation counter, the teardown surface
/// and the state channel.
struct Shared {
    transport: Arc<dyn BandTransport>,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped on every teardown; stale tasks compare and stop.
    generation: AtomicU64,
    link: Mutex<Option<LinkId>>,
    events: EventSender,
}

impl Shared {
    fn generation_changed(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    async fn teardown(&self) {
        let link = self.link.lock().unwrap().take();
        if let Some(link) = link {
            if let Err(e) = self.transport.unsubscribe(&link).await {
                debug!("unsubscribe during teardown failed: {e}");
            }
            // Close only links that still report themselves open; after a
            // device-initiated drop the radio side is already gone.
            if self.transport.is_connected(&link).await {
                if let Err(e) = self.transport.disconnect(&link).await {
                    debug!("disconnect during teardown failed: {e}");
                }
            }
        }
    }

    async fn handle_link_lost(&self, error: Option<String>) {
        warn!("link lost: {}", error.as_deref().unwrap_or("no detail"));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown().await;
        self.state_tx.send_replace(ConnectionState::Disconnected {
            last_error: error.clone(),
        });
        let _ = self.events.send(SessionEvent::ConnectionLost { error });
    }
}

/// Drives the connection lifecycle for one band at a time.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    config: SessionConfig,
    /// Claimed for the duration of one connect sequence.
    busy: AtomicBool,
    events: EventSender,
    samples: mpsc::Sender<VitalsSample>,
}

impl ConnectionManager {
    /// Create a manager. Accepted samples from the notification pump are
    /// delivered on `samples`; lifecycle events on `events`.
    pub fn new(
        transport: Arc<dyn BandTransport>,
        config: SessionConfig,
        events: EventSender,
        samples: mpsc::Sender<VitalsSample>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Arc::new(Self {
            shared: Arc::new(Shared {
                transport,
                state_tx,
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
                events: events.clone(),
            }),
            config,
            busy: AtomicBool::new(false),
            events,
            samples,
        })
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether a link is established and streaming.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether a connect sequence is currently in flight.
    pub fn is_connecting(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Scan, pick the strongest qualifying band, and connect to it.
    ///
    /// If a connect sequence is already in flight this returns `Ok(())`
    /// without doing anything. On failure the state degrades to
    /// `Disconnected { last_error }` and the error is returned.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        self.guarded_connect(None).await
    }

    /// Connect to a specific band, skipping the scan.
    ///
    /// Used by the "pick from list" path and by silent reconnection to a
    /// remembered identity. Same re-entrancy and failure semantics as
    /// [`connect`](Self::connect).
    #[instrument(skip(self), fields(device = %target.label()))]
    pub async fn connect_to(&self, target: DeviceIdentity) -> Result<()> {
        self.guarded_connect(Some(target)).await
    }

    async fn guarded_connect(&self, target: Option<DeviceIdentity>) -> Result<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("connect already in flight, ignoring");
            return Ok(());
        }

        let result = self.establish(target).await;
        self.busy.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => Ok(()),
            // A concurrent disconnect already owns the state; don't
            // overwrite what it published.
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!("connect failed: {e}");
                self.shared
                    .state_tx
                    .send_replace(ConnectionState::disconnected_with(e.state_message()));
                Err(e)
            }
        }
    }

    async fn establish(&self, target: Option<DeviceIdentity>) -> Result<()> {
        // Already streaming from this band: nothing to do.
        if let Some(current) = self.state().device() {
            match &target {
                Some(t) if t.id != current.id => {
                    info!("switching bands: {} -> {}", current.label(), t.label());
                    self.disconnect().await;
                }
                _ => return Ok(()),
            }
        }

        let transport = &self.shared.transport;
        let generation = self.shared.generation.load(Ordering::SeqCst);
        transport.ensure_permissions().await?;

        let candidate = match target {
            Some(identity) => identity,
            None => self.scan_for_candidate().await?,
        };

        // A disconnect during the scan already published Disconnected;
        // don't overwrite it with Connecting.
        if self.shared.generation_changed(generation) {
            return Err(Error::Cancelled);
        }

        // Open the loss feed before the link exists: a drop broadcast while
        // discovery or the start write is still settling stays buffered in
        // this receiver instead of vanishing unobserved.
        let transport_events = transport.events();

        self.shared
            .state_tx
            .send_replace(ConnectionState::Connecting {
                target: candidate.clone(),
            });
        info!("connecting to {}", candidate.label());

        let link = timeout(
            self.config.connect.timeout,
            transport.connect(&candidate, &self.config.connect),
        )
        .await
        .map_err(|_| Error::timeout("connect", self.config.connect.timeout))??;

        if self.shared.generation_changed(generation) {
            let _ = transport.disconnect(&link).await;
            return Err(Error::Cancelled);
        }

        timeout(
            self.config.connect.discovery_timeout,
            transport.discover_services(&link),
        )
        .await
        .map_err(|_| Error::timeout("service discovery", self.config.connect.discovery_timeout))??;

        // Subscribe before the start command so the first notification the
        // band emits after waking cannot slip past us.
        let notifications = transport
            .subscribe(&link, VITALS_SERVICE, VITALS_CHARACTERISTIC)
            .await?;

        if let Err(e) = transport
            .write(&link, VITALS_SERVICE, CONTROL_CHARACTERISTIC, START_COMMAND)
            .await
        {
            // Some firmware revisions stream unprompted; the subscription
            // is already live, so a failed start write is not fatal.
            warn!("start command write failed: {e}");
        }

        if self.shared.generation_changed(generation) {
            let _ = transport.unsubscribe(&link).await;
            let _ = transport.disconnect(&link).await;
            return Err(Error::Cancelled);
        }

        *self.shared.link.lock().unwrap() = Some(link.clone());
        self.spawn_sample_pump(notifications, generation);
        self.spawn_link_watcher(link, transport_events, generation);

        self.shared
            .state_tx
            .send_replace(ConnectionState::Connected {
                device: candidate.clone(),
            });
        let _ = self.events.send(SessionEvent::Connected { device: candidate });
        info!("connected and streaming");
        Ok(())
    }

    async fn scan_for_candidate(&self) -> Result<DeviceIdentity> {
        self.shared.state_tx.send_replace(ConnectionState::Scanning);
        let adverts = self.shared.transport.scan(self.config.scan.window).await?;

        for advert in &adverts {
            if crate::scan::is_lifeband(advert, &self.config.scan) {
                let _ = self.events.send(SessionEvent::Discovered {
                    device: advert.identity.clone(),
                });
            }
        }

        select_candidate(&adverts, &self.config.scan)
            .ok_or_else(|| Error::device_not_found("no device found"))
    }

    /// Tear down the active link and publish `Disconnected`.
    ///
    /// Idempotent: calling with no active link only re-publishes the
    /// disconnected state. A connect in flight observes the generation
    /// bump and aborts.
    pub async fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.teardown().await;
        self.shared
            .state_tx
            .send_replace(ConnectionState::disconnected());
    }

    /// Decode raw notifications and forward accepted samples. Summary
    /// records and malformed payloads are consumed here; neither reaches
    /// the ingestion pipeline or the connection state.
    fn spawn_sample_pump(&self, mut notifications: mpsc::Receiver<Vec<u8>>, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let samples = self.samples.clone();
        tokio::spawn(async move {
            while let Some(raw) = notifications.recv().await {
                if shared.generation_changed(generation) {
                    break;
                }
                match decode(&raw) {
                    Decoded::Sample(sample) => {
                        if samples.send(*sample).await.is_err() {
                            break;
                        }
                    }
                    Decoded::Discard => {
                        debug!("dropping device summary record");
                    }
                    Decoded::Malformed { raw } => {
                        warn!("malformed payload ({} bytes), skipping", raw.len());
                    }
                }
            }
            debug!("sample pump stopped");
        });
    }

    /// Watch the transport event stream for loss of this specific link.
    ///
    /// The receiver is handed in by `establish`, which opened it before
    /// the link, so losses reported mid-sequence are not missed.
    fn spawn_link_watcher(
        &self,
        link: LinkId,
        mut events: broadcast::Receiver<TransportEvent>,
        generation: u64,
    ) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::LinkLost { link: lost, error }) if lost == link => {
                        if !shared.generation_changed(generation) {
                            shared.handle_link_lost(error).await;
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::mock::RecordingTransport;
    use std::time::Duration;

    fn manager_with(
        transport: Arc<RecordingTransport>,
    ) -> (Arc<ConnectionManager>, mpsc::Receiver<VitalsSample>) {
        let mut config = SessionConfig::new();
        config.scan.window = Duration::from_millis(50);
        let (events, _) = event_channel(16);
        let (sample_tx, sample_rx) = mpsc::channel(16);
        let manager = ConnectionManager::new(transport, config, events, sample_tx);
        (manager, sample_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn full_state_sequence_on_connect() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        let mut states = manager.subscribe_state();
        let observer = {
            let mut states = states.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while states.changed().await.is_ok() {
                    let state = states.borrow_and_update().clone();
                    let connected = state.is_connected();
                    seen.push(state);
                    if connected {
                        break;
                    }
                }
                seen
            })
        };

        manager.connect().await.unwrap();
        let seen = observer.await.unwrap();

        assert!(matches!(seen[0], ConnectionState::Scanning));
        assert!(matches!(seen[1], ConnectionState::Connecting { .. }));
        assert!(matches!(seen[2], ConnectionState::Connected { .. }));

        states.borrow_and_update();
        assert_eq!(manager.state().device().unwrap().id, "AA");
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_before_start_command() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        manager.connect().await.unwrap();

        let calls = transport.calls();
        let subscribe = calls.iter().position(|c| c == "subscribe").unwrap();
        let write = calls.iter().position(|c| c.starts_with("write:")).unwrap();
        assert!(subscribe < write, "subscription must precede start write");
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_connect_is_silent_noop() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect().await })
        };
        // Let the first connect claim the busy flag and start scanning.
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager.connect().await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(transport.call_count("scan"), 1);
        assert_eq!(transport.call_count("connect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_write_is_not_fatal() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        transport.fail_writes(true);
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        manager.connect().await.unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scan_reports_no_device_found() {
        let transport = Arc::new(RecordingTransport::new());
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        match manager.state() {
            ConnectionState::Disconnected { last_error } => {
                assert_eq!(last_error.as_deref(), Some("no device found"));
            }
            other => panic!("unexpected state: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_connect_wins() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        let connect = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect().await })
        };
        // Interrupt while the scan window is still open.
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.disconnect().await;

        let result = connect.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        match manager.state() {
            ConnectionState::Disconnected { last_error } => assert!(last_error.is_none()),
            other => panic!("unexpected state: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        manager.connect().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(transport.call_count("disconnect"), 1);
        assert!(matches!(
            manager.state(),
            ConnectionState::Disconnected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_flow_and_summaries_do_not() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, mut samples) = manager_with(Arc::clone(&transport));

        manager.connect().await.unwrap();

        transport.push_notification(r#"{"type":"hourly_summary","avg_hr":75}"#);
        transport.push_notification(
            r#"{"timestamp":1690000000000,"hr":82,"bp_sys":118,"bp_dia":76}"#,
        );

        let sample = samples.recv().await.unwrap();
        assert_eq!(sample.hr, 82.0);
        // The summary was consumed, not forwarded: nothing else is queued.
        assert!(samples.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_publishes_error_and_event() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));
        let mut events = manager.events.subscribe();

        manager.connect().await.unwrap();
        // Drain the Discovered/Connected events.
        while let Ok(event) = events.try_recv() {
            drop(event);
        }

        transport.drop_link(&LinkId("AA".to_string()), Some("out of range"));
        // Yield until the watcher task has processed the loss.
        tokio::time::sleep(Duration::from_millis(5)).await;

        match manager.state() {
            ConnectionState::Disconnected { last_error } => {
                assert_eq!(last_error.as_deref(), Some("out of range"));
            }
            other => panic!("unexpected state: {other}"),
        }
        match events.recv().await.unwrap() {
            SessionEvent::ConnectionLost { error } => {
                assert_eq!(error.as_deref(), Some("out of range"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_during_connect_sequence_is_not_missed() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        let connect = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect().await })
        };
        // Past the scan window, inside the link establishment delay.
        tokio::time::sleep(Duration::from_millis(55)).await;
        transport.drop_link(&LinkId("AA".to_string()), Some("dropped during setup"));

        connect.await.unwrap().unwrap();
        // The buffered loss reaches the watcher once it is running.
        tokio::time::sleep(Duration::from_millis(5)).await;

        match manager.state() {
            ConnectionState::Disconnected { last_error } => {
                assert_eq!(last_error.as_deref(), Some("dropped during setup"));
            }
            other => panic!("unexpected state: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_is_not_disconnected_again() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        manager.connect().await.unwrap();
        transport.drop_link(&LinkId("AA".to_string()), Some("out of range"));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(matches!(
            manager.state(),
            ConnectionState::Disconnected { .. }
        ));
        // The radio side is already gone; teardown must not close it again.
        assert_eq!(transport.call_count("disconnect"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connected_to_same_band_is_noop() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (manager, _samples) = manager_with(Arc::clone(&transport));

        manager.connect().await.unwrap();
        manager
            .connect_to(DeviceIdentity::new("AA"))
            .await
            .unwrap();

        assert_eq!(transport.call_count("connect"), 1);
    }
}
