//! Core data types for LifeBand vitals telemetry.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Timestamps below this value are assumed to be Unix seconds and are
/// rescaled to milliseconds (10^10 ms is March 2286, 10^10 s is far past
/// any plausible sample time).
pub const SECONDS_THRESHOLD: i64 = 10_000_000_000;

/// Minimum plausible sample timestamp: 2020-01-01T00:00:00Z in ms.
/// Anything earlier means the band's clock was stale or zeroed and the
/// receive-time wall clock is used instead.
pub const MIN_PLAUSIBLE_EPOCH_MS: i64 = 1_577_836_800_000;

/// The fixed set of on-band risk assessment conditions.
pub const RISK_CONDITIONS: [&str; 3] = ["arrhythmia", "anemia", "preeclampsia"];

/// Identity of a discovered or remembered band.
///
/// Produced by scanning; persisted externally after the first successful
/// connection so reconnection can skip the scan phase.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    /// Opaque transport address (MAC address on Linux/Windows, UUID on macOS).
    pub id: String,
    /// Advertised display name, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    /// Signal strength observed at scan time, in dBm.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub rssi: Option<i16>,
}

impl DeviceIdentity {
    /// Create an identity from an opaque transport address.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
        }
    }

    /// Create an identity with a display name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            rssi: None,
        }
    }

    /// Human-readable label: the name when advertised, otherwise the address.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Connection lifecycle state.
///
/// Exactly one instance is live per session; every transition replaces the
/// value wholesale through a single channel so observers never see a torn
/// state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No active link. `last_error` is set when the previous link ended
    /// in a transport failure.
    Disconnected {
        #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
        last_error: Option<String>,
    },
    /// Scanning for candidate bands.
    Scanning,
    /// Physical link establishment in progress.
    Connecting { target: DeviceIdentity },
    /// Link established, subscribed, and streaming.
    Connected { device: DeviceIdentity },
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected { last_error: None }
    }
}

impl ConnectionState {
    /// Convenience constructor for a clean disconnected state.
    pub fn disconnected() -> Self {
        Self::Disconnected { last_error: None }
    }

    /// Convenience constructor for a disconnected state carrying an error.
    pub fn disconnected_with(error: impl Into<String>) -> Self {
        Self::Disconnected {
            last_error: Some(error.into()),
        }
    }

    /// Whether a link is currently established.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether a connect attempt (scan or link establishment) is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting { .. })
    }

    /// The device identity associated with the current state, if any.
    pub fn device(&self) -> Option<&DeviceIdentity> {
        match self {
            Self::Connecting { target } => Some(target),
            Self::Connected { device } => Some(device),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected { last_error: None } => write!(f, "disconnected"),
            Self::Disconnected {
                last_error: Some(e),
            } => write!(f, "disconnected ({e})"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting { target } => write!(f, "connecting to {}", target.label()),
            Self::Connected { device } => write!(f, "connected to {}", device.label()),
        }
    }
}

/// Risk severity reported by the band's on-device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RiskLevel {
    #[default]
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// Parse a level string as emitted by the firmware ("Low", "Moderate",
    /// "High", "Critical"). Unknown strings map to `Low`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "Critical" => Self::Critical,
            "High" => Self::High,
            "Moderate" => Self::Moderate,
            _ => Self::Low,
        }
    }
}

/// One risk assessment result for a named condition.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RiskAssessment {
    /// Severity category.
    pub level: RiskLevel,
    /// Model confidence, 0-100.
    pub confidence: f64,
    /// Safety alert flag. Derived strictly from a JSON boolean `true`;
    /// any other value (including the string "true") is treated as false.
    pub alert: bool,
}

/// A single decoded vitals sample.
///
/// Instances are transient: each is produced by the payload decoder,
/// consumed once by the aggregator and once by the live projection, and
/// discarded.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VitalsSample {
    /// Sample time in Unix milliseconds. Device-relative until normalized
    /// by [`normalize_timestamp`].
    pub timestamp: i64,
    /// Heart rate in bpm. Mandatory; decodes to 0 when missing.
    pub hr: f64,
    /// Systolic blood pressure in mmHg. Mandatory; decodes to 0 when missing.
    pub bp_sys: f64,
    /// Diastolic blood pressure in mmHg. Mandatory; decodes to 0 when missing.
    pub bp_dia: f64,
    /// Blood oxygen saturation, percent.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub spo2: Option<f64>,
    /// Heart rate variability (SDNN), ms.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub hrv: Option<f64>,
    /// Which sensor produced the heart rate ("ecg", "ppg", ...).
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub hr_source: Option<String>,
    /// Blood pressure estimation method.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub bp_method: Option<String>,
    /// ECG signal quality, 0-100.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub ecg_quality: Option<f64>,
    /// PPG signal quality, 0-100.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub ppg_quality: Option<f64>,
    /// On-band risk assessment results keyed by condition name
    /// (see [`RISK_CONDITIONS`]).
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "BTreeMap::is_empty"))]
    pub risks: BTreeMap<String, RiskAssessment>,
}

impl VitalsSample {
    /// Create a sample with mandatory fields only.
    pub fn new(timestamp: i64, hr: f64, bp_sys: f64, bp_dia: f64) -> Self {
        Self {
            timestamp,
            hr,
            bp_sys,
            bp_dia,
            spo2: None,
            hrv: None,
            hr_source: None,
            bp_method: None,
            ecg_quality: None,
            ppg_quality: None,
            risks: BTreeMap::new(),
        }
    }

    /// Iterate over the numeric vitals fields present in this sample,
    /// excluding `timestamp`. This is the fold surface for aggregation.
    pub fn numeric_fields(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        [
            ("hr", Some(self.hr)),
            ("bp_sys", Some(self.bp_sys)),
            ("bp_dia", Some(self.bp_dia)),
            ("spo2", self.spo2),
            ("hrv", self.hrv),
            ("ecg_quality", self.ecg_quality),
            ("ppg_quality", self.ppg_quality),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }

    /// Whether any risk assessment carries an active alert.
    pub fn has_alert(&self) -> bool {
        self.risks.values().any(|r| r.alert)
    }
}

/// Normalize a device-relative timestamp to Unix milliseconds.
///
/// Values below [`SECONDS_THRESHOLD`] are Unix seconds and are rescaled to
/// milliseconds. Values still below [`MIN_PLAUSIBLE_EPOCH_MS`] after
/// rescaling come from a stale or zeroed band clock and are replaced by
/// `now_ms`, so they never silently aggregate into the wrong calendar
/// bucket.
pub fn normalize_timestamp(timestamp: i64, now_ms: i64) -> i64 {
    let scaled = if timestamp < SECONDS_THRESHOLD {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    };
    if scaled < MIN_PLAUSIBLE_EPOCH_MS {
        now_ms
    } else {
        scaled
    }
}

/// Current wall clock in Unix milliseconds.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// A persisted snapshot of one aggregation bucket.
///
/// Per-field values are `sum / count` rounded to one decimal place.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AggregatedVitals {
    /// Bucket start, floored to the window width (Unix ms).
    pub bucket_start: i64,
    /// Bucket end, `bucket_start + window` (Unix ms).
    pub bucket_end: i64,
    /// Number of samples folded into this bucket.
    pub sample_count: u32,
    /// Per-field averages, one decimal place.
    pub averages: BTreeMap<String, f64>,
    /// Timestamp of the most recent sample in the bucket (provenance).
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_seconds_rescaled_to_millis() {
        assert_eq!(
            normalize_timestamp(1_690_000_000, 1_700_000_000_000),
            1_690_000_000_000
        );
    }

    #[test]
    fn normalize_millis_passed_through() {
        assert_eq!(
            normalize_timestamp(1_690_000_000_000, 1_700_000_000_000),
            1_690_000_000_000
        );
    }

    #[test]
    fn normalize_zero_replaced_by_wall_clock() {
        let now = 1_700_000_000_000;
        assert_eq!(normalize_timestamp(0, now), now);
    }

    #[test]
    fn normalize_stale_clock_replaced_by_wall_clock() {
        // 2001-09-09 in seconds: rescales to ms but stays implausibly old.
        let now = 1_700_000_000_000;
        assert_eq!(normalize_timestamp(1_000_000_000, now), now);
    }

    #[test]
    fn numeric_fields_skips_absent_optionals() {
        let mut sample = VitalsSample::new(0, 72.0, 120.0, 80.0);
        sample.spo2 = Some(98.0);

        let fields: Vec<_> = sample.numeric_fields().collect();
        assert_eq!(
            fields,
            vec![
                ("hr", 72.0),
                ("bp_sys", 120.0),
                ("bp_dia", 80.0),
                ("spo2", 98.0),
            ]
        );
    }

    #[test]
    fn state_predicates() {
        assert!(!ConnectionState::disconnected().is_connected());
        assert!(ConnectionState::Scanning.is_busy());

        let device = DeviceIdentity::with_name("AA:BB", "LIFEBAND-S3");
        let state = ConnectionState::Connected {
            device: device.clone(),
        };
        assert!(state.is_connected());
        assert_eq!(state.device(), Some(&device));
    }

    #[test]
    fn state_display() {
        let state = ConnectionState::disconnected_with("no device found");
        assert_eq!(state.to_string(), "disconnected (no device found)");

        let state = ConnectionState::Connecting {
            target: DeviceIdentity::with_name("AA:BB", "LIFEBAND-S3"),
        };
        assert_eq!(state.to_string(), "connecting to LIFEBAND-S3");
    }

    #[test]
    fn risk_level_from_wire() {
        assert_eq!(RiskLevel::from_wire("Critical"), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_wire("High"), RiskLevel::High);
        assert_eq!(RiskLevel::from_wire("Moderate"), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_wire("Low"), RiskLevel::Low);
        assert_eq!(RiskLevel::from_wire("???"), RiskLevel::Low);
    }
}
