//! Platform-agnostic types for LifeBand biometric sensor bands.
//!
//! This crate provides the shared data model and the pure telemetry
//! payload decoder used by the BLE client core (`lifeband-core`).
//!
//! # Features
//!
//! - Vitals sample and risk assessment types
//! - Connection lifecycle state
//! - Dual-shape payload decoding (direct JSON and legacy base64)
//! - Timestamp normalization for stale band clocks
//! - UUID constants for the band's BLE services
//!
//! # Example
//!
//! ```
//! use lifeband_types::payload::{decode, Decoded};
//!
//! let payload = br#"{"hr":82,"bp_sys":118,"bp_dia":76,"timestamp":1690000000}"#;
//! match decode(payload) {
//!     Decoded::Sample(sample) => assert_eq!(sample.hr, 82.0),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//! ```

pub mod payload;
pub mod types;
pub mod uuids;

pub use payload::{decode, Decoded, SUMMARY_RECORD_TYPE};
pub use types::{
    normalize_timestamp, now_ms, AggregatedVitals, ConnectionState, DeviceIdentity,
    RiskAssessment, RiskLevel, VitalsSample, MIN_PLAUSIBLE_EPOCH_MS, RISK_CONDITIONS,
};
