//! EEW alert domain types.
//!
//! An [`Alert`] is one immutable bulletin snapshot; a sequence of alerts with
//! the same id represents revisions of one earthquake event. The background
//! intensity computation publishes its result through a watch latch so
//! notifiers can await it without blocking ingest.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use crate::errors::EewcastError;
use crate::intensity::{Intensity, IntensityMap};
use crate::location::EarthquakeLocation;
use crate::models::RawBulletin;

/// Human-readable name for a provider code.
#[must_use]
pub fn provider_display(name: &str) -> &str {
    match name {
        "cwa" => "中央氣象署",
        "trem" => "TREM",
        other => other,
    }
}

/// Immutable hypocenter snapshot carried by one bulletin serial.
#[derive(Debug, Clone)]
pub struct Earthquake {
    pub epicenter: EarthquakeLocation,
    pub magnitude: f64,
    pub depth_km: f64,
    pub origin_time: DateTime<Utc>,
    /// Intensity bucket reported by the provider, if any
    pub max_intensity: Option<Intensity>,
}

/// State of the per-alert intensity computation.
#[derive(Debug, Clone)]
pub enum ComputeState {
    Pending,
    Done(Arc<IntensityMap>),
    Failed(String),
}

/// One earthquake early warning bulletin.
#[derive(Debug)]
pub struct Alert {
    /// Provider-assigned identifier, stable across revisions
    pub id: String,
    /// Revision counter, monotonic per id
    pub serial: u32,
    /// Whether this is the final report
    pub final_report: bool,
    /// Provider code ("cwa", "trem", ...)
    pub provider: String,
    pub publish_time: DateTime<Utc>,
    pub earthquake: Earthquake,
    computed: watch::Receiver<ComputeState>,
}

impl Alert {
    /// Build an alert from a validated raw bulletin.
    ///
    /// Returns the alert together with the latch the computation task uses to
    /// publish its result.
    ///
    /// # Errors
    ///
    /// Returns an error if a timestamp is outside the representable range.
    pub fn from_raw(
        raw: &RawBulletin,
    ) -> Result<(Self, watch::Sender<ComputeState>), EewcastError> {
        let publish_time = millis_to_datetime(raw.time, "publish time")?;
        let origin_time = millis_to_datetime(raw.eq.time, "origin time")?;
        let (tx, rx) = watch::channel(ComputeState::Pending);

        let alert = Self {
            id: raw.id.clone(),
            serial: raw.serial,
            final_report: raw.is_final(),
            provider: raw.author.clone(),
            publish_time,
            earthquake: Earthquake {
                epicenter: EarthquakeLocation::new(raw.eq.lon, raw.eq.lat, raw.eq.loc.clone()),
                magnitude: raw.eq.mag,
                depth_km: raw.eq.depth,
                origin_time,
                max_intensity: raw.eq.max.map(Intensity::from_bucket),
            },
            computed: rx,
        };
        Ok((alert, tx))
    }

    /// Human-readable provider name.
    #[must_use]
    pub fn provider_display(&self) -> &str {
        provider_display(&self.provider)
    }

    /// Current computation state without waiting.
    #[must_use]
    pub fn compute_state(&self) -> ComputeState {
        self.computed.borrow().clone()
    }

    /// The computed intensity map, if the computation has finished.
    #[must_use]
    pub fn expected(&self) -> Option<Arc<IntensityMap>> {
        match self.compute_state() {
            ComputeState::Done(map) => Some(map),
            ComputeState::Pending | ComputeState::Failed(_) => None,
        }
    }

    /// Wait for the computation to finish.
    ///
    /// Resolves to `Failed` if the computation was cancelled before it could
    /// publish a result (its latch dropped without a value).
    pub async fn computed(&self) -> ComputeState {
        let mut rx = self.computed.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ComputeState::Pending => {}
                done => return done,
            }
            if rx.changed().await.is_err() {
                return ComputeState::Failed("computation cancelled".into());
            }
        }
    }

    /// Multi-line description used by the alert log blocks.
    #[must_use]
    pub fn describe(&self) -> String {
        let eq = &self.earthquake;
        format!(
            "       ID: {} (Serial {})\n Location: {}({}, {})\nMagnitude: {}\n    Depth: {}km\n     Time: {}",
            self.id,
            self.serial,
            eq.epicenter.describe(),
            eq.epicenter.location.lon,
            eq.epicenter.location.lat,
            eq.magnitude,
            eq.depth_km,
            eq.origin_time.format("%Y/%m/%d %H:%M:%S"),
        )
    }
}

fn millis_to_datetime(ms: i64, what: &str) -> Result<DateTime<Utc>, EewcastError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EewcastError::Validation(format!("{what} {ms} out of range")))
}
