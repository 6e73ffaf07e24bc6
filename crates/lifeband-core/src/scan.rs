//! Band discovery and candidate selection.

use std::sync::Arc;

use tracing::{debug, info};

use lifeband_types::DeviceIdentity;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::transport::{Advertisement, BandTransport};

/// Signal strength quality levels based on RSSI values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignalQuality {
    /// Signal too weak for reliable streaming (< -85 dBm).
    Poor,
    /// Usable but may drop (-85 to -75 dBm).
    Fair,
    /// Good signal strength (-75 to -60 dBm).
    Good,
    /// Excellent signal strength (> -60 dBm).
    Excellent,
}

impl SignalQuality {
    /// Determine signal quality from an RSSI value in dBm.
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r > -60 => SignalQuality::Excellent,
            r if r > -75 => SignalQuality::Good,
            r if r > -85 => SignalQuality::Fair,
            _ => SignalQuality::Poor,
        }
    }

    /// Get a human-readable description of the signal quality.
    pub fn description(&self) -> &'static str {
        match self {
            SignalQuality::Excellent => "Excellent signal",
            SignalQuality::Good => "Good signal",
            SignalQuality::Fair => "Fair signal - streaming may be unstable",
            SignalQuality::Poor => "Poor signal - consider moving closer",
        }
    }
}

/// Information about a discovered band, for the "pick from list" UI path.
#[derive(Debug, Clone)]
pub struct DiscoveredBand {
    /// The device identity (address, name, RSSI).
    pub identity: DeviceIdentity,
    /// Whether this device qualifies as a LifeBand.
    pub is_lifeband: bool,
    /// Signal quality classification, when RSSI was observed.
    pub quality: Option<SignalQuality>,
}

/// Whether an advertisement qualifies as a LifeBand: advertised name
/// matches the known prefix, or the advertised service list includes the
/// vitals service.
pub fn is_lifeband(advert: &Advertisement, config: &ScanConfig) -> bool {
    if let Some(name) = &advert.identity.name {
        if name.starts_with(&config.name_prefix) {
            return true;
        }
    }
    advert.services.contains(&config.service)
}

/// Select the connection candidate among scanned advertisements.
///
/// Qualifying candidates are ranked by strongest observed RSSI; a missing
/// RSSI ranks weakest, and ties are broken by first-seen order.
pub fn select_candidate(
    adverts: &[Advertisement],
    config: &ScanConfig,
) -> Option<DeviceIdentity> {
    let mut best: Option<&Advertisement> = None;
    for advert in adverts {
        if !is_lifeband(advert, config) {
            debug!("ignoring non-LifeBand device: {}", advert.identity.label());
            continue;
        }
        let rssi = advert.identity.rssi.unwrap_or(i16::MIN);
        let best_rssi = best.and_then(|b| b.identity.rssi).unwrap_or(i16::MIN);
        // Strictly greater keeps the first-seen candidate on ties.
        if best.is_none() || rssi > best_rssi {
            best = Some(advert);
        }
    }
    best.map(|advert| advert.identity.clone())
}

/// Scan for all nearby devices and classify them.
///
/// Returns every observed device (not only LifeBands) sorted strongest
/// signal first, so a UI can offer a full pick list.
pub async fn scan_for_bands(
    transport: &Arc<dyn BandTransport>,
    config: &ScanConfig,
) -> Result<Vec<DiscoveredBand>> {
    info!("scanning for {}s", config.window.as_secs());
    let adverts = transport.scan(config.window).await?;

    let mut bands: Vec<DiscoveredBand> = adverts
        .iter()
        .map(|advert| DiscoveredBand {
            identity: advert.identity.clone(),
            is_lifeband: is_lifeband(advert, config),
            quality: advert.identity.rssi.map(SignalQuality::from_rssi),
        })
        .collect();
    bands.sort_by_key(|b| std::cmp::Reverse(b.identity.rssi.unwrap_or(i16::MIN)));

    info!("scan complete, {} device(s) observed", bands.len());
    Ok(bands)
}
