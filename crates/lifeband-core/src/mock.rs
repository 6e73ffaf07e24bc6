//! Scripted in-memory transport for tests and examples.
//!
//! [`RecordingTransport`] implements [`BandTransport`] without any radio:
//! advertisements are seeded up front, notifications are pushed by the
//! test, and every trait call is appended to an ordered log so tests can
//! assert on protocol ordering (for example that the subscription exists
//! before the start command is written).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use lifeband_types::DeviceIdentity;

use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::transport::{Advertisement, BandTransport, LinkId, TransportEvent};

const EVENT_CAPACITY: usize = 16;
const NOTIFY_CAPACITY: usize = 64;

/// A [`BandTransport`] that replays scripted devices and records calls.
pub struct RecordingTransport {
    calls: Mutex<Vec<String>>,
    adverts: Mutex<Vec<Advertisement>>,
    /// Remaining connect attempts that should fail. `u32::MAX` fails
    /// every attempt.
    connect_failures: AtomicU32,
    write_should_fail: AtomicBool,
    subscriptions: Mutex<HashMap<LinkId, mpsc::Sender<Vec<u8>>>>,
    connected: Mutex<HashMap<LinkId, bool>>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    /// Create a transport with no devices in range.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            calls: Mutex::new(Vec::new()),
            adverts: Mutex::new(Vec::new()),
            connect_failures: AtomicU32::new(0),
            write_should_fail: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    /// Put a device in radio range for subsequent scans.
    pub fn add_device(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        self.add_advert(Advertisement {
            identity: DeviceIdentity {
                id: id.to_string(),
                name: name.map(str::to_string),
                rssi,
            },
            services: Vec::new(),
        });
    }

    /// Put a full advertisement in radio range.
    pub fn add_advert(&self, advert: Advertisement) {
        self.adverts.lock().unwrap().push(advert);
    }

    /// Remove all devices from radio range.
    pub fn clear_devices(&self) {
        self.adverts.lock().unwrap().clear();
    }

    /// Make the next `n` connect attempts fail. Pass `u32::MAX` to fail
    /// every attempt.
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Make characteristic writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.write_should_fail.store(fail, Ordering::SeqCst);
    }

    /// Push a raw notification payload to the active subscription.
    ///
    /// Panics if nothing is subscribed; pushing without a subscriber is a
    /// test-sequencing bug.
    pub fn push_notification(&self, raw: impl Into<Vec<u8>>) {
        let subs = self.subscriptions.lock().unwrap();
        let tx = subs
            .values()
            .next()
            .expect("push_notification with no active subscription");
        tx.try_send(raw.into())
            .expect("notification channel full or closed");
    }

    /// Simulate a device-initiated link loss on the given link.
    pub fn drop_link(&self, link: &LinkId, error: Option<&str>) {
        self.connected.lock().unwrap().insert(link.clone(), false);
        self.subscriptions.lock().unwrap().remove(link);
        let _ = self.events_tx.send(TransportEvent::LinkLost {
            link: link.clone(),
            error: error.map(str::to_string),
        });
    }

    /// The ordered log of trait calls so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// How many times `name` appears in the call log.
    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == name || call.starts_with(&format!("{name}:")))
            .count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl BandTransport for RecordingTransport {
    async fn ensure_permissions(&self) -> Result<()> {
        self.record("ensure_permissions");
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>> {
        self.record("scan");
        // Consume the window so paused-clock tests observe the Scanning
        // state before the transition to Connecting.
        tokio::time::sleep(window).await;
        Ok(self.adverts.lock().unwrap().clone())
    }

    async fn connect(&self, identity: &DeviceIdentity, _config: &ConnectConfig) -> Result<LinkId> {
        self.record(format!("connect:{}", identity.id));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(Error::device_not_found("no device found"));
        }

        let link = LinkId(identity.id.clone());
        self.connected.lock().unwrap().insert(link.clone(), true);
        Ok(link)
    }

    async fn discover_services(&self, _link: &LinkId) -> Result<()> {
        self.record("discover_services");
        Ok(())
    }

    async fn subscribe(
        &self,
        link: &LinkId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.record("subscribe");
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        self.subscriptions.lock().unwrap().insert(link.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, link: &LinkId) -> Result<()> {
        self.record("unsubscribe");
        self.subscriptions.lock().unwrap().remove(link);
        Ok(())
    }

    async fn write(
        &self,
        _link: &LinkId,
        _service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()> {
        self.record(format!(
            "write:{}",
            String::from_utf8_lossy(payload)
        ));
        if self.write_should_fail.load(Ordering::SeqCst) {
            return Err(Error::write_failed(characteristic, "injected write failure"));
        }
        Ok(())
    }

    async fn is_connected(&self, link: &LinkId) -> bool {
        *self.connected.lock().unwrap().get(link).unwrap_or(&false)
    }

    async fn disconnect(&self, link: &LinkId) -> Result<()> {
        self.record("disconnect");
        self.connected.lock().unwrap().insert(link.clone(), false);
        self.subscriptions.lock().unwrap().remove(link);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
