//! btleplug-backed [`BandTransport`].
//!
//! This is the production transport: one adapter, one link at a time in
//! practice (the manager enforces that), with a central-event pump that
//! translates platform disconnect events into [`TransportEvent::LinkLost`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lifeband_types::DeviceIdentity;

use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::transport::{Advertisement, BandTransport, LinkId, TransportEvent};

const EVENT_CAPACITY: usize = 32;
const NOTIFY_CAPACITY: usize = 64;

/// Short rescan used when connecting to an identity that is not in the
/// adapter's peripheral cache (fresh process, remembered device).
const LOOKUP_SCAN: Duration = Duration::from_secs(2);

/// Derive the stable link identifier for a peripheral.
///
/// On macOS the Bluetooth address is all zeros and the peripheral ID is
/// the only stable handle; elsewhere the address is used.
fn link_identifier(address: &str, peripheral_id: &str) -> String {
    if address == "00:00:00:00:00:00" {
        peripheral_id.to_string()
    } else {
        address.to_string()
    }
}

fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{id:?}")
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Production BLE transport.
pub struct BleTransport {
    adapter: Adapter,
    /// Open links by identifier.
    links: Arc<Mutex<HashMap<String, Peripheral>>>,
    /// Reverse map used by the central-event pump.
    peripheral_links: Arc<Mutex<HashMap<PeripheralId, String>>>,
    notify_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl BleTransport {
    /// Acquire the first available adapter and start the event pump.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Permission("no Bluetooth adapter available".to_string()))?;

        let transport = Self {
            adapter,
            links: Arc::new(Mutex::new(HashMap::new())),
            peripheral_links: Arc::new(Mutex::new(HashMap::new())),
            notify_tasks: Mutex::new(HashMap::new()),
            events_tx: broadcast::channel(EVENT_CAPACITY).0,
        };
        transport.spawn_event_pump().await?;
        Ok(transport)
    }

    /// Forward platform disconnect events as link loss.
    async fn spawn_event_pump(&self) -> Result<()> {
        let mut events = self.adapter.events().await?;
        let links = Arc::clone(&self.links);
        let peripheral_links = Arc::clone(&self.peripheral_links);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let link = peripheral_links.lock().unwrap().remove(&id);
                    if let Some(link) = link {
                        debug!("platform reported disconnect for {link}");
                        links.lock().unwrap().remove(&link);
                        let _ = events_tx.send(TransportEvent::LinkLost {
                            link: LinkId(link),
                            error: None,
                        });
                    }
                }
            }
        });
        Ok(())
    }

    fn peripheral(&self, link: &LinkId) -> Result<Peripheral> {
        self.links
            .lock()
            .unwrap()
            .get(&link.0)
            .cloned()
            .ok_or(Error::NotConnected)
    }

    async fn advertisement_for(&self, peripheral: &Peripheral) -> Option<Advertisement> {
        let properties = peripheral.properties().await.ok()??;
        let identifier = link_identifier(
            &properties.address.to_string(),
            &format_peripheral_id(&peripheral.id()),
        );
        Some(Advertisement {
            identity: DeviceIdentity {
                id: identifier,
                name: properties.local_name,
                rssi: properties.rssi,
            },
            services: properties.services,
        })
    }

    /// Find a peripheral by identifier in the adapter's cache, rescanning
    /// briefly if it is not there yet.
    async fn lookup(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        if let Some(peripheral) = self.find_cached(identity).await? {
            return Ok(peripheral);
        }
        debug!("{} not in peripheral cache, rescanning", identity.label());
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(LOOKUP_SCAN).await;
        self.adapter.stop_scan().await?;

        self.find_cached(identity)
            .await?
            .ok_or_else(|| Error::device_not_found("no device found"))
    }

    async fn find_cached(&self, identity: &DeviceIdentity) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if let Some(advert) = self.advertisement_for(&peripheral).await {
                if advert.identity.id == identity.id {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::characteristic_not_found(uuid))
    }

    fn stop_notify_task(&self, link: &LinkId) {
        if let Some(handle) = self.notify_tasks.lock().unwrap().remove(&link.0) {
            handle.abort();
        }
    }
}

#[async_trait]
impl BandTransport for BleTransport {
    async fn ensure_permissions(&self) -> Result<()> {
        self.adapter
            .adapter_info()
            .await
            .map_err(|e| Error::Permission(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>> {
        info!("starting BLE scan for {}s", window.as_secs());
        // Unfiltered on purpose: the pick-list path needs to show every
        // device in range, not only LifeBands.
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(window).await;
        self.adapter.stop_scan().await?;

        let mut adverts = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(advert) = self.advertisement_for(&peripheral).await {
                adverts.push(advert);
            }
        }
        info!("scan complete, {} peripheral(s)", adverts.len());
        Ok(adverts)
    }

    async fn connect(&self, identity: &DeviceIdentity, _config: &ConnectConfig) -> Result<LinkId> {
        // MTU is negotiated by the platform stack; btleplug exposes no
        // request knob, so the configured value is advisory only.
        let peripheral = self.lookup(identity).await?;
        peripheral.connect().await?;

        let link = LinkId(identity.id.clone());
        self.peripheral_links
            .lock()
            .unwrap()
            .insert(peripheral.id(), link.0.clone());
        self.links
            .lock()
            .unwrap()
            .insert(link.0.clone(), peripheral);
        info!("link open to {}", identity.label());
        Ok(link)
    }

    async fn discover_services(&self, link: &LinkId) -> Result<()> {
        let peripheral = self.peripheral(link)?;
        peripheral.discover_services().await?;
        debug!(
            "discovered {} characteristic(s)",
            peripheral.characteristics().len()
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        link: &LinkId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let peripheral = self.peripheral(link)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await?;

        let mut stream = peripheral.notifications().await?;
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        self.stop_notify_task(link);
        self.notify_tasks
            .lock()
            .unwrap()
            .insert(link.0.clone(), handle);
        Ok(rx)
    }

    async fn unsubscribe(&self, link: &LinkId) -> Result<()> {
        self.stop_notify_task(link);
        let Ok(peripheral) = self.peripheral(link) else {
            return Ok(());
        };
        // Best effort: the link may already be gone on the radio side.
        for characteristic in peripheral.characteristics() {
            if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                debug!("unsubscribe failed for {}: {e}", characteristic.uuid);
            }
        }
        Ok(())
    }

    async fn write(
        &self,
        link: &LinkId,
        _service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(link)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(|e| Error::write_failed(characteristic, e.to_string()))
    }

    async fn is_connected(&self, link: &LinkId) -> bool {
        match self.peripheral(link) {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disconnect(&self, link: &LinkId) -> Result<()> {
        self.stop_notify_task(link);
        let peripheral = self.links.lock().unwrap().remove(&link.0);
        let Some(peripheral) = peripheral else {
            return Ok(());
        };
        self.peripheral_links
            .lock()
            .unwrap()
            .retain(|_, l| l != &link.0);
        if let Err(e) = peripheral.disconnect().await {
            warn!("disconnect failed (link probably already closed): {e}");
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
