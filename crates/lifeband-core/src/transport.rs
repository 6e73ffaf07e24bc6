//! Radio transport capability.
//!
//! [`BandTransport`] abstracts the BLE stack consumed by the connection
//! manager: scanning, link establishment, service discovery, notification
//! subscription, characteristic writes and disconnect detection. The
//! production implementation is [`crate::ble::BleTransport`]; tests use
//! [`crate::mock::RecordingTransport`].
//!
//! Notifications are a push domain, bridged into the request/response
//! domain through the bounded channel returned by
//! [`BandTransport::subscribe`]. Device-initiated link loss is reported
//! out-of-band through the [`BandTransport::events`] broadcast.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use lifeband_types::DeviceIdentity;

use crate::config::ConnectConfig;
use crate::error::Result;

/// Opaque handle for an open physical link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId(pub String);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One device observed during a scan window.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// The observed identity (address, name, RSSI).
    pub identity: DeviceIdentity,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// Out-of-band transport events.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TransportEvent {
    /// The band closed the link (radio drop, power-off, out-of-range).
    LinkLost {
        /// The affected link.
        link: LinkId,
        /// Error detail if the platform stack carried one.
        error: Option<String>,
    },
}

/// The radio capability consumed by the connection manager.
///
/// All methods are safe to call redundantly: `unsubscribe` on a link with
/// no subscription and `disconnect` on a closed link are no-ops, since
/// cleanup runs from multiple exit paths.
#[async_trait]
pub trait BandTransport: Send + Sync {
    /// Acquire radio permissions and verify an adapter is available.
    async fn ensure_permissions(&self) -> Result<()>;

    /// Scan without a service filter for `window`, returning every
    /// observed device. Discovery must also surface non-LifeBand devices
    /// for the external "pick from list" UI path; filtering is the
    /// caller's concern.
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>>;

    /// Open the physical link to a known identity.
    ///
    /// The MTU in `config` is a request; the platform stack performs the
    /// negotiation. Callers bound this with their own timeout.
    async fn connect(&self, identity: &DeviceIdentity, config: &ConnectConfig) -> Result<LinkId>;

    /// Discover services and characteristics on an open link.
    async fn discover_services(&self, link: &LinkId) -> Result<()>;

    /// Subscribe to notifications on a characteristic.
    ///
    /// Returns the bounded receiving end of the notification stream.
    /// Delivery order from the radio layer is preserved.
    async fn subscribe(
        &self,
        link: &LinkId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Remove the notification subscription on a link. Idempotent.
    async fn unsubscribe(&self, link: &LinkId) -> Result<()>;

    /// Write a payload to a characteristic.
    async fn write(
        &self,
        link: &LinkId,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()>;

    /// Whether the link currently reports itself connected.
    async fn is_connected(&self, link: &LinkId) -> bool;

    /// Close the physical link. Closing an already-closed link is a no-op.
    async fn disconnect(&self, link: &LinkId) -> Result<()>;

    /// Subscribe to out-of-band transport events (link loss).
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
