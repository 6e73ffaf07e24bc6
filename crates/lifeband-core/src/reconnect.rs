//! Bounded automatic reconnection.
//!
//! The policy reacts to device-initiated link loss only: a manual
//! disconnect clears the desired flag first, so no retry fires. Each loss
//! drives at most [`ReconnectConfig`] `max_attempts` consecutive connect
//! attempts; if none lands, the policy disarms itself and emits the one
//! terminal notice ([`SessionEvent::ReconnectExhausted`]) that a host UI
//! should surface as a dismissible alert. Silent infinite retry loops are
//! deliberately not supported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use lifeband_types::DeviceIdentity;

use crate::config::ReconnectConfig;
use crate::events::{EventSender, SessionEvent};
use crate::manager::ConnectionManager;

/// Pause between consecutive reconnect attempts, giving the band's radio
/// time to resume advertising after a drop.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Reconnection policy for device-initiated link loss.
pub struct ReconnectPolicy {
    manager: Arc<ConnectionManager>,
    config: ReconnectConfig,
    /// Whether automatic reconnection is armed. Cleared by manual
    /// disconnect and by budget exhaustion; re-armed on connect.
    desired: AtomicBool,
    /// Claimed while a retry burst is running.
    in_flight: AtomicBool,
    /// The band we were last connected to. Retries target this identity
    /// directly instead of rescanning, so a drop never silently switches
    /// the subject to a different band in range.
    last_device: Mutex<Option<DeviceIdentity>>,
    events: EventSender,
}

impl ReconnectPolicy {
    /// Create a policy, armed by default.
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: ReconnectConfig,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config,
            desired: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            last_device: Mutex::new(None),
            events,
        })
    }

    /// Record the band to target on the next retry burst.
    pub fn remember(&self, device: DeviceIdentity) {
        *self.last_device.lock().unwrap() = Some(device);
    }

    /// Arm or disarm automatic reconnection.
    pub fn set_desired(&self, desired: bool) {
        self.desired.store(desired, Ordering::SeqCst);
    }

    /// Whether automatic reconnection is currently armed.
    pub fn is_desired(&self) -> bool {
        self.desired.load(Ordering::SeqCst)
    }

    /// React to a device-initiated link loss.
    ///
    /// Runs up to `max_attempts` consecutive connect attempts. Success is
    /// judged by the manager's resulting state, not by the call result: a
    /// connect that no-ops against a concurrent attempt also returns `Ok`.
    pub async fn on_connection_lost(&self) {
        if !self.is_desired() {
            debug!("reconnect not desired, staying disconnected");
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnect burst already running");
            return;
        }

        let max_attempts = self.config.max_attempts;
        for attempt in 1..=max_attempts {
            // A manual disconnect mid-burst disarms us.
            if !self.is_desired() {
                self.in_flight.store(false, Ordering::SeqCst);
                return;
            }

            if attempt > 1 {
                sleep(RETRY_DELAY).await;
            }
            info!("reconnect attempt {attempt}/{max_attempts}");
            let _ = self.events.send(SessionEvent::ReconnectStarted {
                attempt,
                max_attempts,
            });

            let target = self.last_device.lock().unwrap().clone();
            let result = match target {
                Some(device) => self.manager.connect_to(device).await,
                None => self.manager.connect().await,
            };
            if let Err(e) = result {
                warn!("reconnect attempt {attempt} failed: {e}");
            }
            if self.manager.is_connected() {
                info!("reconnected on attempt {attempt}");
                self.in_flight.store(false, Ordering::SeqCst);
                return;
            }
        }

        warn!("reconnect budget exhausted after {max_attempts} attempts");
        self.desired.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::ReconnectExhausted {
            attempts: max_attempts,
        });
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::event_channel;
    use crate::mock::RecordingTransport;
    use lifeband_types::VitalsSample;
    use tokio::sync::mpsc;

    fn setup(
        transport: Arc<RecordingTransport>,
    ) -> (Arc<ReconnectPolicy>, crate::events::EventReceiver, mpsc::Receiver<VitalsSample>) {
        let mut config = SessionConfig::new();
        config.scan.window = Duration::from_millis(50);
        let (events, events_rx) = event_channel(32);
        let (sample_tx, sample_rx) = mpsc::channel(16);
        let manager = ConnectionManager::new(
            transport,
            config.clone(),
            events.clone(),
            sample_tx,
        );
        let policy = ReconnectPolicy::new(manager, config.reconnect, events);
        (policy, events_rx, sample_rx)
    }

    fn count_events(rx: &mut crate::events::EventReceiver) -> (usize, usize) {
        let mut started = 0;
        let mut exhausted = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::ReconnectStarted { .. } => started += 1,
                SessionEvent::ReconnectExhausted { .. } => exhausted += 1,
                _ => {}
            }
        }
        (started, exhausted)
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_three_failed_attempts() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        transport.fail_next_connects(u32::MAX);
        let (policy, mut events, _samples) = setup(Arc::clone(&transport));

        policy.on_connection_lost().await;

        assert_eq!(transport.call_count("connect"), 3);
        let (started, exhausted) = count_events(&mut events);
        assert_eq!(started, 3);
        assert_eq!(exhausted, 1);
        assert!(!policy.is_desired());

        // A further loss is a no-op until the policy is re-armed.
        policy.on_connection_lost().await;
        assert_eq!(transport.call_count("connect"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_once_reconnected() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        transport.fail_next_connects(1);
        let (policy, mut events, _samples) = setup(Arc::clone(&transport));

        policy.on_connection_lost().await;

        assert_eq!(transport.call_count("connect"), 2);
        let (started, exhausted) = count_events(&mut events);
        assert_eq!(started, 2);
        assert_eq!(exhausted, 0);
        assert!(policy.is_desired());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_target_the_remembered_band_without_scanning() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (policy, _events, _samples) = setup(Arc::clone(&transport));

        policy.remember(DeviceIdentity::with_name("AA", "LIFEBAND-S3"));
        policy.on_connection_lost().await;

        assert_eq!(transport.call_count("scan"), 0);
        assert_eq!(transport.call_count("connect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_suppresses_retry() {
        let transport = Arc::new(RecordingTransport::new());
        transport.add_device("AA", Some("LIFEBAND-S3"), Some(-50));
        let (policy, mut events, _samples) = setup(Arc::clone(&transport));

        policy.set_desired(false);
        policy.on_connection_lost().await;

        assert_eq!(transport.call_count("connect"), 0);
        let (started, _) = count_events(&mut events);
        assert_eq!(started, 0);
    }
}
