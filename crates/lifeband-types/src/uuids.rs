//! Bluetooth UUIDs for LifeBand devices.
//!
//! This module contains the UUIDs needed to communicate with LifeBand
//! sensor bands over Bluetooth Low Energy.

use uuid::{uuid, Uuid};

// --- LifeBand Service UUIDs ---

/// LifeBand vitals service UUID advertised by the band.
pub const VITALS_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

// --- LifeBand Characteristic UUIDs ---

/// Vitals telemetry characteristic (notify). Each notification carries
/// one JSON payload, optionally base64-wrapped on legacy firmware.
pub const VITALS_CHARACTERISTIC: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Control characteristic (write). Accepts the `START` handshake command.
pub const CONTROL_CHARACTERISTIC: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// Advertised local-name prefix for LifeBand devices (e.g. "LIFEBAND-S3").
pub const DEVICE_NAME_PREFIX: &str = "LIFEBAND";

/// Handshake command written to the control characteristic to request
/// streaming. A write failure is non-fatal: the firmware is permitted
/// to auto-stream without an explicit start.
pub const START_COMMAND: &[u8] = b"START";
