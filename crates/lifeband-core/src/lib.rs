//! Core BLE client library for LifeBand wearable vitals monitors.
//!
//! This crate drives the full client lifecycle for a LifeBand: scanning
//! for bands, establishing the link and the notification stream, decoding
//! vitals payloads, aggregating them into fixed time buckets and handing
//! both projections to a persistence backend.
//!
//! # Features
//!
//! - **Device discovery**: Unfiltered BLE scan with LifeBand
//!   classification and signal quality, for auto-connect or pick lists
//! - **Connection lifecycle**: One authoritative state machine
//!   (`Disconnected` → `Scanning` → `Connecting` → `Connected`) published
//!   on a watch channel
//! - **Vitals streaming**: Notification decoding tolerant of both raw
//!   JSON and base64-wrapped payloads
//! - **Aggregation**: 30-minute buckets with per-field averages,
//!   persisted fire-and-forget
//! - **Bounded auto-reconnection**: Retries device-initiated drops a
//!   fixed number of times, then surfaces one terminal notice
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use lifeband_core::{BleTransport, Session, SessionConfig};
//! use lifeband_core::store::{MemoryKnownDeviceStore, MemoryVitalsStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let session = Session::new(
//!         transport,
//!         Arc::new(MemoryVitalsStore::new()),
//!         Arc::new(MemoryKnownDeviceStore::new()),
//!         "subject-1",
//!         SessionConfig::new(),
//!     )?;
//!
//!     session.connect().await?;
//!
//!     let mut latest = session.latest();
//!     while latest.changed().await.is_ok() {
//!         if let Some(sample) = latest.borrow_and_update().clone() {
//!             println!("hr: {} bpm", sample.hr);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod ble;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod mock;
pub mod reconnect;
pub mod scan;
pub mod session;
pub mod store;
pub mod transport;

// Re-export the wire types crate under its familiar module names.
pub use lifeband_types::types;
pub use lifeband_types::uuids;

pub use aggregate::{AggregationBucket, VitalsAggregator};
pub use ble::BleTransport;
pub use config::{AggregateConfig, ConnectConfig, ReconnectConfig, ScanConfig, SessionConfig};
pub use error::{Error, Result};
pub use events::{event_channel, EventReceiver, EventSender, SessionEvent};
pub use manager::ConnectionManager;
pub use mock::RecordingTransport;
pub use reconnect::ReconnectPolicy;
pub use scan::{scan_for_bands, DiscoveredBand, SignalQuality};
pub use session::Session;
pub use store::{KnownDeviceStore, MemoryKnownDeviceStore, MemoryVitalsStore, VitalsStore};
pub use transport::{Advertisement, BandTransport, LinkId, TransportEvent};

pub use lifeband_types::{
    AggregatedVitals, ConnectionState, DeviceIdentity, RiskAssessment, RiskLevel, VitalsSample,
};
