//! Wire-format models for the upstream EEW API.
//!
//! These structures match the JSON bodies served by `GET /eq/eew` and the
//! frames exchanged over the WebSocket subscription.

use serde::{Deserialize, Serialize};

use crate::errors::EewcastError;

/// One EEW bulletin as returned by the HTTP endpoint or wrapped inside a
/// WebSocket `data` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBulletin {
    /// Provider-assigned alert identifier (stable across revisions)
    pub id: String,

    /// Revision counter, monotonic per id
    pub serial: u32,

    /// 1 when this is the last bulletin of the alert
    #[serde(rename = "final", default)]
    pub final_flag: u8,

    /// Provider code: "cwa", "trem", ...
    pub author: String,

    /// Publish time (ms since epoch)
    pub time: i64,

    /// Hypocenter parameters
    pub eq: RawQuake,
}

/// Hypocenter block of a bulletin.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuake {
    /// Epicenter latitude (degrees)
    pub lat: f64,

    /// Epicenter longitude (degrees)
    pub lon: f64,

    /// Hypocenter depth (km, positive down)
    pub depth: f64,

    /// Magnitude
    pub mag: f64,

    /// Origin time (ms since epoch)
    pub time: i64,

    /// Human-readable epicenter description
    #[serde(default)]
    pub loc: Option<String>,

    /// Reported maximum intensity bucket, if the provider supplies one
    #[serde(default)]
    pub max: Option<u8>,
}

impl RawBulletin {
    /// Validate the bulletin structure.
    ///
    /// # Errors
    ///
    /// Returns an error when a field is outside its physical range. Invalid
    /// bulletins are dropped without affecting the rest of the batch.
    pub fn validate(&self) -> Result<(), EewcastError> {
        if self.id.is_empty() {
            return Err(EewcastError::Validation("empty alert ID".into()));
        }
        if !(-90.0..=90.0).contains(&self.eq.lat) {
            return Err(EewcastError::Validation(format!(
                "latitude {} out of range [-90, 90]",
                self.eq.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.eq.lon) {
            return Err(EewcastError::Validation(format!(
                "longitude {} out of range [-180, 180]",
                self.eq.lon
            )));
        }
        if self.eq.depth < 0.0 {
            return Err(EewcastError::Validation(format!(
                "negative depth {}",
                self.eq.depth
            )));
        }
        if !(0.0..=12.0).contains(&self.eq.mag) {
            return Err(EewcastError::Validation(format!(
                "magnitude {} out of range [0, 12]",
                self.eq.mag
            )));
        }
        Ok(())
    }

    /// Whether this bulletin is marked as the final report.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.final_flag != 0
    }
}

/// Subscribable upstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Service {
    /// Realtime ground-motion data
    #[serde(rename = "trem.rts")]
    RealtimeStation,
    /// Realtime waveform data
    #[serde(rename = "trem.rtw")]
    RealtimeWave,
    /// CWA earthquake early warnings
    #[serde(rename = "websocket.eew")]
    Eew,
    /// TREM earthquake early warnings
    #[serde(rename = "trem.eew")]
    TremEew,
    /// CWA earthquake reports
    #[serde(rename = "websocket.report")]
    Report,
    /// CWA tsunami information
    #[serde(rename = "websocket.tsunami")]
    Tsunami,
    /// CWA intensity bulletins
    #[serde(rename = "cwa.intensity")]
    CwaIntensity,
    /// TREM intensity bulletins
    #[serde(rename = "trem.intensity")]
    TremIntensity,
}

impl Service {
    /// Get the wire identifier for this service.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RealtimeStation => "trem.rts",
            Self::RealtimeWave => "trem.rtw",
            Self::Eew => "websocket.eew",
            Self::TremEew => "trem.eew",
            Self::Report => "websocket.report",
            Self::Tsunami => "websocket.tsunami",
            Self::CwaIntensity => "cwa.intensity",
            Self::TremIntensity => "trem.intensity",
        }
    }
}

impl std::str::FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trem.rts" => Ok(Self::RealtimeStation),
            "trem.rtw" => Ok(Self::RealtimeWave),
            "websocket.eew" => Ok(Self::Eew),
            "trem.eew" => Ok(Self::TremEew),
            "websocket.report" => Ok(Self::Report),
            "websocket.tsunami" => Ok(Self::Tsunami),
            "cwa.intensity" => Ok(Self::CwaIntensity),
            "trem.intensity" => Ok(Self::TremIntensity),
            _ => Err(format!("unknown service: {s}")),
        }
    }
}

/// Client-to-server subscribe frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeFrame {
    #[serde(rename = "type")]
    type_: &'static str,
    pub key: String,
    pub service: Vec<Service>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl SubscribeFrame {
    /// Build a subscribe frame for `key` and `services`.
    #[must_use]
    pub fn new(key: String, service: Vec<Service>) -> Self {
        Self {
            type_: "start",
            key,
            service,
            config: None,
        }
    }
}

/// Server-to-client frames, categorized by top-level `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Authorization and service-state notices
    Info { data: InfoBody },
    /// Subscribed payloads; the outer `time` is merged into the inner object
    /// before routing
    Data {
        #[serde(default)]
        time: Option<i64>,
        data: serde_json::Value,
    },
    /// Server clock sample for skew observers
    Ntp {
        #[serde(default)]
        time: Option<i64>,
        #[serde(default)]
        version: Option<i64>,
    },
    /// Request to re-send the subscribe frame
    Verify {},
}

/// Body of an `info` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoBody {
    pub code: u16,
    #[serde(default)]
    pub message: Option<String>,
    /// Accepted service names on a code-200 response
    #[serde(default)]
    pub list: Option<Vec<String>>,
}
