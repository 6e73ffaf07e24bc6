//! Telemetry payload decoding.
//!
//! Each BLE notification carries one payload in one of two wire shapes:
//! a UTF-8 JSON object literal (current firmware), or a base64-encoded
//! blob whose decoded body is the same JSON object (legacy firmware).
//! Direct JSON is tried first; base64 is only a fallback, so a valid
//! modern payload is never misclassified.
//!
//! Periodic summary records (`"type": "hourly_summary"`) are a distinct
//! record type that must never reach the live stream; they decode to
//! [`Decoded::Discard`], which callers drop without forwarding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::types::{RiskAssessment, RiskLevel, VitalsSample, RISK_CONDITIONS};

/// Reserved `type` value for the band's periodic summary records.
pub const SUMMARY_RECORD_TYPE: &str = "hourly_summary";

/// Outcome of decoding one notification payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A live vitals sample.
    Sample(Box<VitalsSample>),
    /// A well-formed payload that is not a live sample (periodic summary).
    /// Must not be forwarded to the aggregator or the live projection.
    Discard,
    /// Neither wire shape parsed. Carries the original bytes for
    /// diagnostics; protocol noise, not a connection failure.
    Malformed {
        /// The raw payload as received.
        raw: Vec<u8>,
    },
}

/// Decode a raw notification payload.
pub fn decode(raw: &[u8]) -> Decoded {
    let value = match parse_either_shape(raw) {
        Some(v) => v,
        None => {
            return Decoded::Malformed { raw: raw.to_vec() };
        }
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => {
            return Decoded::Malformed { raw: raw.to_vec() };
        }
    };

    if obj.get("type").and_then(Value::as_str) == Some(SUMMARY_RECORD_TYPE) {
        return Decoded::Discard;
    }

    Decoded::Sample(Box::new(sample_from_object(obj)))
}

/// Parse as direct JSON first, then as base64-wrapped JSON.
fn parse_either_shape(raw: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(raw) {
        return Some(value);
    }

    let text = std::str::from_utf8(raw).ok()?;
    let decoded = BASE64.decode(text.trim()).ok()?;
    serde_json::from_slice(&decoded).ok()
}

fn sample_from_object(obj: &serde_json::Map<String, Value>) -> VitalsSample {
    let mut sample = VitalsSample::new(
        obj.get("timestamp").and_then(coerce_i64).unwrap_or(0),
        required_numeric(obj, "hr"),
        required_numeric(obj, "bp_sys"),
        required_numeric(obj, "bp_dia"),
    );

    sample.spo2 = optional_numeric(obj, "spo2");
    sample.hrv = optional_numeric(obj, "hrv");
    sample.ecg_quality = optional_numeric(obj, "ecg_quality");
    sample.ppg_quality = optional_numeric(obj, "ppg_quality");
    sample.hr_source = optional_string(obj, "hr_source");
    sample.bp_method = optional_string(obj, "bp_method");

    for condition in RISK_CONDITIONS {
        if let Some(risk) = obj.get(condition).and_then(parse_risk) {
            sample.risks.insert(condition.to_string(), risk);
        }
    }

    sample
}

/// Mandatory numeric field: missing or non-numeric coerces to 0.
fn required_numeric(obj: &serde_json::Map<String, Value>, key: &str) -> f64 {
    obj.get(key).and_then(coerce_f64).unwrap_or(0.0)
}

/// Optional numeric field: missing or non-numeric stays absent.
fn optional_numeric(obj: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(coerce_f64)
}

fn optional_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Coerce a JSON value to f64, accepting numeric strings the firmware
/// occasionally emits. A present-but-non-numeric value yields None.
fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_risk(value: &Value) -> Option<RiskAssessment> {
    let obj = value.as_object()?;
    Some(RiskAssessment {
        level: obj
            .get("risk_level")
            .and_then(Value::as_str)
            .map(RiskLevel::from_wire)
            .unwrap_or_default(),
        confidence: obj
            .get("confidence")
            .and_then(coerce_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0),
        // Alerts are safety-relevant: only a JSON boolean `true` counts,
        // never the string "true" or a truthy number.
        alert: obj.get("alert") == Some(&Value::Bool(true)),
    })
}
