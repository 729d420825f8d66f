//! Activation-spot API client
//!
//! Fetches the current activator spots as JSON and turns the usable ones into
//! cluster spots.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use super::{BridgeError, Result};
use crate::config::BridgeConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest location text carried into a spot comment
const LOCATION_CHARS: usize = 20;

/// One record of the activator feed. Fields the bridge does not use are
/// ignored; missing or null fields are `None`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationSpot {
    #[serde(default, deserialize_with = "lenient_string")]
    pub spot_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub activator: Option<String>,
    /// kHz
    #[serde(default, deserialize_with = "lenient_string")]
    pub frequency: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location_desc: Option<String>,
}

/// Strings stay strings, numbers become their decimal text, anything else
/// is treated as absent
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// A spot ready to be sent to the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpot {
    /// Dedup key
    pub id: String,
    pub freq_mhz: f64,
    pub callsign: String,
    pub comment: String,
}

impl ClusterSpot {
    /// `dx` command line as typed at the cluster prompt
    pub fn command(&self) -> String {
        format!(
            "dx {:.4} {} {}\r\n",
            self.freq_mhz, self.callsign, self.comment
        )
    }
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).unwrap_or("")
}

impl ActivationSpot {
    /// Convert to a cluster spot, or `None` if a required field is missing,
    /// the frequency does not parse or it is outside the configured band
    /// range
    pub fn to_cluster_spot(&self, config: &BridgeConfig) -> Option<ClusterSpot> {
        let activator = field(&self.activator);
        let frequency = field(&self.frequency);
        let reference = field(&self.reference);
        if activator.is_empty() || frequency.is_empty() || reference.is_empty() {
            return None;
        }

        let freq_mhz = match frequency.parse::<f64>() {
            Ok(khz) => khz / 1000.0,
            Err(_) => {
                debug!(activator, frequency, "Unparsable frequency");
                return None;
            }
        };
        if !(config.min_freq_mhz..=config.max_freq_mhz).contains(&freq_mhz) {
            return None;
        }

        let mut comment = format!("POTA {}", reference);
        let location = field(&self.location_desc);
        if !location.is_empty() {
            comment.push(' ');
            comment.extend(location.chars().take(LOCATION_CHARS));
        }

        let id = match field(&self.spot_id) {
            "" => format!("{}:{}:{}", activator, frequency, reference),
            id => id.to_string(),
        };

        Some(ClusterSpot {
            id,
            freq_mhz,
            callsign: activator.to_string(),
            comment,
        })
    }
}

/// Parse a feed response body
pub fn parse_spots(body: &str) -> Result<Vec<ActivationSpot>> {
    Ok(serde_json::from_str(body)?)
}

/// HTTP client for the activator feed
pub struct SpotApi {
    url: String,
}

impl SpotApi {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    pub fn fetch(&self) -> Result<Vec<ActivationSpot>> {
        let response = ureq::get(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .call()
            .map_err(|e| BridgeError::Http(Box::new(e)))?;
        let body = response.into_string().map_err(BridgeError::Body)?;
        parse_spots(&body)
    }
}
