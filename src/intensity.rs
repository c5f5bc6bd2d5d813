//! Expected-intensity and wave-arrival computation.
//!
//! For one earthquake this produces, per administrative region, the expected
//! JMA-style intensity together with P/S-wave arrival times. The computation
//! is side-effect-free and runs on a worker task; it observes a cancellation
//! token between regions so a superseding bulletin can stop it early.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::eew::Earthquake;
use crate::location::{EARTH_RADIUS_KM, Region, RegionIndex};
use crate::wave::WaveModel;

/// A PGA/PGV-derived intensity score with its rounded display bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intensity {
    value: f64,
}

impl Intensity {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self { value }
    }

    /// Construct from an already-bucketed report (provider `max` field).
    #[must_use]
    pub fn from_bucket(bucket: u8) -> Self {
        Self {
            value: f64::from(bucket.min(9)),
        }
    }

    /// The raw floating-point intensity score.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The rounded 0..9 intensity bucket.
    #[must_use]
    pub fn bucket(&self) -> u8 {
        round_intensity(self.value)
    }

    /// Display string on the CWA scale, e.g. `5弱` for bucket 5.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.bucket() {
            0 => "0",
            1 => "1",
            2 => "2",
            3 => "3",
            4 => "4",
            5 => "5弱",
            6 => "5強",
            7 => "6弱",
            8 => "6強",
            _ => "7",
        }
    }
}

impl std::fmt::Display for Intensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Map a floating-point intensity onto the 0..9 display bucket.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_intensity(intensity: f64) -> u8 {
    if intensity < 0.0 {
        0
    } else if intensity < 4.5 {
        intensity.round() as u8
    } else if intensity < 5.0 {
        5
    } else if intensity < 5.5 {
        6
    } else if intensity < 6.0 {
        7
    } else if intensity < 6.5 {
        8
    } else {
        9
    }
}

/// Distances and wave arrivals from the hypocenter to one region.
#[derive(Debug, Clone, PartialEq)]
pub struct Distance {
    /// Hypocentral distance (km)
    pub km: f64,
    /// Epicentral distance (degrees)
    pub deg: f64,
    /// P-wave travel time (seconds)
    pub p_travel_s: f64,
    /// S-wave travel time (seconds)
    pub s_travel_s: f64,
    /// Absolute P-wave arrival time
    pub p_arrival: DateTime<Utc>,
    /// Absolute S-wave arrival time
    pub s_arrival: DateTime<Utc>,
}

/// Expected intensity and wave arrivals for one region.
#[derive(Debug, Clone)]
pub struct RegionExpectedIntensity {
    pub region: Region,
    pub intensity: Intensity,
    pub distance: Distance,
}

/// The full result of one per-alert computation.
#[derive(Debug)]
pub struct IntensityMap {
    /// Region code → expected intensity
    pub by_region: BTreeMap<u32, RegionExpectedIntensity>,
    /// City → its strongest region, by float intensity
    pub city_max: BTreeMap<String, RegionExpectedIntensity>,
    /// The wave model the arrivals were derived from
    pub model: Arc<WaveModel>,
}

impl IntensityMap {
    /// The single strongest region overall, if any.
    #[must_use]
    pub fn max(&self) -> Option<&RegionExpectedIntensity> {
        self.by_region
            .values()
            .max_by(|a, b| a.intensity.value().total_cmp(&b.intensity.value()))
    }
}

/// Why a computation produced no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// A newer serial replaced this alert mid-computation
    Cancelled,
    /// The computation itself failed
    Failed(String),
}

/// Compute expected intensity and arrival times for every region.
///
/// `subset` restricts the evaluation to the named region codes; `None`
/// evaluates all regions in the index. Regions whose travel-time lookup
/// yields no finite solution get arrivals from a linear fit over the
/// populated (degree, time) pairs instead of being dropped.
///
/// # Errors
///
/// Returns [`ComputeError::Cancelled`] when the token fires, or
/// [`ComputeError::Failed`] when no region can be evaluated.
pub fn expected_intensity(
    quake: &Earthquake,
    regions: &RegionIndex,
    subset: Option<&[u32]>,
    model: &Arc<WaveModel>,
    cancel: &CancellationToken,
) -> Result<IntensityMap, ComputeError> {
    let mut by_region = BTreeMap::new();
    let mut unresolved: Vec<u32> = Vec::new();

    let codes: Vec<u32> = match subset {
        Some(codes) => codes.to_vec(),
        None => regions.all().map(|r| r.code).collect(),
    };
    if codes.is_empty() {
        return Err(ComputeError::Failed("no regions to evaluate".into()));
    }

    for code in codes {
        if cancel.is_cancelled() {
            return Err(ComputeError::Cancelled);
        }
        let Some(region) = regions.get(code) else {
            continue;
        };

        let angle = quake.epicenter.location.central_angle(&region.location);
        let deg = angle.to_degrees();
        let surface_km = angle * EARTH_RADIUS_KM;
        let hypocentral_km = surface_km.hypot(quake.depth_km).max(1e-3);

        let score = region_intensity(
            hypocentral_km,
            quake.magnitude,
            quake.depth_km,
            region.site_effect,
        );

        let (p_travel, s_travel) = model.travel_time(angle);
        let distance = Distance {
            km: hypocentral_km,
            deg,
            p_travel_s: p_travel,
            s_travel_s: s_travel,
            p_arrival: quake.origin_time,
            s_arrival: quake.origin_time,
        };
        if !(p_travel.is_finite() && s_travel.is_finite() && p_travel >= 0.0) {
            unresolved.push(code);
        }

        by_region.insert(
            code,
            RegionExpectedIntensity {
                region: region.clone(),
                intensity: Intensity::new(score),
                distance,
            },
        );
    }

    if by_region.is_empty() {
        return Err(ComputeError::Failed("no known regions to evaluate".into()));
    }

    repair_travel_times(&mut by_region, &unresolved);

    // Finalize absolute arrivals from the (possibly repaired) travel times.
    for entry in by_region.values_mut() {
        let d = &mut entry.distance;
        d.s_travel_s = d.s_travel_s.max(d.p_travel_s);
        d.p_arrival = quake.origin_time + travel_delta(d.p_travel_s);
        d.s_arrival = quake.origin_time + travel_delta(d.s_travel_s);
    }

    let mut city_max: BTreeMap<String, RegionExpectedIntensity> = BTreeMap::new();
    for entry in by_region.values() {
        match city_max.get(&entry.region.city) {
            Some(best) if best.intensity.value() >= entry.intensity.value() => {}
            _ => {
                city_max.insert(entry.region.city.clone(), entry.clone());
            }
        }
    }

    Ok(IntensityMap {
        by_region,
        city_max,
        model: Arc::clone(model),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn travel_delta(seconds: f64) -> TimeDelta {
    TimeDelta::milliseconds((seconds * 1000.0) as i64)
}

/// Expected intensity at one site.
///
/// PGA attenuation first; sites that come out above intensity 3 are refined
/// through the PGV path.
fn region_intensity(hypocentral_km: f64, magnitude: f64, depth_km: f64, site_effect: f64) -> f64 {
    let pga =
        1.657 * (1.533 * magnitude).exp() * hypocentral_km.powf(-1.607) * site_effect;
    let mut intensity = 2.0 * pga.log10() + 0.7;

    if intensity > 3.0 {
        let long = 10.0_f64.powf(0.5 * magnitude - 1.85) / 2.0;
        let x = (hypocentral_km - long).max(3.0);
        let gpv600 = 10.0_f64.powf(
            0.58 * magnitude + 0.0038 * depth_km
                - 1.29
                - (x + 0.0028 * 10.0_f64.powf(0.5 * magnitude)).log10()
                - 0.002 * x,
        );
        let arv = 1.0;
        let pgv = gpv600 * 1.31 * arv;
        intensity = 2.68 + 1.72 * pgv.log10();
    }

    intensity
}

/// Fill unresolved travel times from a linear fit over the populated
/// (degree, time) pairs.
fn repair_travel_times(
    by_region: &mut BTreeMap<u32, RegionExpectedIntensity>,
    unresolved: &[u32],
) {
    if unresolved.is_empty() {
        return;
    }

    let populated: Vec<(f64, f64, f64)> = by_region
        .iter()
        .filter(|(code, _)| !unresolved.contains(*code))
        .map(|(_, e)| (e.distance.deg, e.distance.p_travel_s, e.distance.s_travel_s))
        .collect();

    let p_fit = linear_fit(populated.iter().map(|&(deg, p, _)| (deg, p)));
    let s_fit = linear_fit(populated.iter().map(|&(deg, _, s)| (deg, s)));

    for code in unresolved {
        let Some(entry) = by_region.get_mut(code) else {
            continue;
        };
        let d = &mut entry.distance;
        match (p_fit, s_fit) {
            (Some((ap, bp)), Some((as_, bs))) => {
                d.p_travel_s = (ap + bp * d.deg).max(0.0);
                d.s_travel_s = (as_ + bs * d.deg).max(0.0);
            }
            // Too few populated pairs to fit; fall back to floor velocities.
            _ => {
                d.p_travel_s = d.km / 7.0;
                d.s_travel_s = d.km / 4.0;
            }
        }
    }
}

/// Least-squares line `y = a + b·x`; `None` with fewer than two points.
fn linear_fit(points: impl Iterator<Item = (f64, f64)>) -> Option<(f64, f64)> {
    let points: Vec<(f64, f64)> = points.collect();
    let n = points.len();
    if n < 2 {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let count = n as f64;
    let sum_x: f64 = points.iter().map(|&(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|&(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|&(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|&(x, y)| x * y).sum();

    let denom = count * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (count * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / count;
    Some((intercept, slope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::EarthquakeLocation;
    use crate::wave::WaveModelCache;

    fn sample_regions() -> RegionIndex {
        RegionIndex::parse(
            r#"{
                "花蓮縣": {
                    "花蓮市": {"code": 970, "lon": 121.6067, "lat": 23.9824},
                    "玉里鎮": {"code": 981, "lon": 121.3117, "lat": 23.3323}
                },
                "臺北市": {
                    "中正區": {"code": 100, "lon": 121.5198, "lat": 25.0324}
                }
            }"#,
        )
        .expect("sample regions")
    }

    fn sample_quake() -> Earthquake {
        Earthquake {
            epicenter: EarthquakeLocation::new(121.65, 23.9, Some("花蓮縣近海".into())),
            magnitude: 6.0,
            depth_km: 40.0,
            origin_time: Utc::now(),
            max_intensity: None,
        }
    }

    #[test]
    fn test_round_intensity_buckets() {
        assert_eq!(round_intensity(-0.5), 0);
        assert_eq!(round_intensity(0.2), 0);
        assert_eq!(round_intensity(1.4), 1);
        assert_eq!(round_intensity(3.6), 4);
        assert_eq!(round_intensity(4.4), 4);
        assert_eq!(round_intensity(4.6), 5);
        assert_eq!(round_intensity(5.2), 6);
        assert_eq!(round_intensity(5.7), 7);
        assert_eq!(round_intensity(6.2), 8);
        assert_eq!(round_intensity(6.5), 9);
        assert_eq!(round_intensity(8.0), 9);
    }

    #[test]
    fn test_intensity_labels() {
        assert_eq!(Intensity::new(4.7).label(), "5弱");
        assert_eq!(Intensity::new(5.2).label(), "5強");
        assert_eq!(Intensity::new(5.8).label(), "6弱");
        assert_eq!(Intensity::new(6.2).label(), "6強");
        assert_eq!(Intensity::new(7.5).label(), "7");
        assert_eq!(Intensity::from_bucket(3).label(), "3");
    }

    #[test]
    fn test_intensity_attenuates_with_distance() {
        let cache = WaveModelCache::new();
        let quake = sample_quake();
        let regions = sample_regions();
        let model = cache.get(quake.depth_km);
        let cancel = CancellationToken::new();

        let map = expected_intensity(&quake, &regions, None, &model, &cancel)
            .expect("computation should succeed");

        let near = map.by_region.get(&970).expect("hualien city");
        let far = map.by_region.get(&100).expect("taipei");
        // Compare rounded buckets, not floats.
        assert!(near.intensity.bucket() >= far.intensity.bucket());
        assert!(near.distance.km < far.distance.km);
    }

    #[test]
    fn test_arrivals_ordered() {
        let cache = WaveModelCache::new();
        let quake = sample_quake();
        let regions = sample_regions();
        let model = cache.get(quake.depth_km);
        let cancel = CancellationToken::new();

        let map = expected_intensity(&quake, &regions, None, &model, &cancel)
            .expect("computation should succeed");

        for entry in map.by_region.values() {
            assert!(entry.distance.s_arrival >= entry.distance.p_arrival);
            assert!(entry.distance.p_arrival >= quake.origin_time);
        }
    }

    #[test]
    fn test_city_max_selects_strongest() {
        let cache = WaveModelCache::new();
        let quake = sample_quake();
        let regions = sample_regions();
        let model = cache.get(quake.depth_km);
        let cancel = CancellationToken::new();

        let map = expected_intensity(&quake, &regions, None, &model, &cancel)
            .expect("computation should succeed");

        assert_eq!(map.city_max.len(), 2);
        let hualien = map.city_max.get("花蓮縣").expect("hualien max");
        // The epicenter sits next to Hualien City, which must win its county.
        assert_eq!(hualien.region.code, 970);

        let overall = map.max().expect("overall max");
        assert_eq!(overall.region.code, 970);
    }

    #[test]
    fn test_subset_restricts_regions() {
        let cache = WaveModelCache::new();
        let quake = sample_quake();
        let regions = sample_regions();
        let model = cache.get(quake.depth_km);
        let cancel = CancellationToken::new();

        let map = expected_intensity(&quake, &regions, Some(&[100]), &model, &cancel)
            .expect("computation should succeed");
        assert_eq!(map.by_region.len(), 1);
        assert!(map.by_region.contains_key(&100));
    }

    #[test]
    fn test_cancellation_observed() {
        let cache = WaveModelCache::new();
        let quake = sample_quake();
        let regions = sample_regions();
        let model = cache.get(quake.depth_km);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = expected_intensity(&quake, &regions, None, &model, &cancel);
        assert_eq!(result.unwrap_err(), ComputeError::Cancelled);
    }

    #[test]
    fn test_empty_subset_fails() {
        let cache = WaveModelCache::new();
        let quake = sample_quake();
        let regions = sample_regions();
        let model = cache.get(quake.depth_km);
        let cancel = CancellationToken::new();

        let result = expected_intensity(&quake, &regions, Some(&[]), &model, &cancel);
        assert!(matches!(result, Err(ComputeError::Failed(_))));
    }

    #[test]
    fn test_linear_fit_recovers_line() {
        let fit = linear_fit([(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)].into_iter())
            .expect("fit should exist");
        assert!((fit.0 - 1.0).abs() < 1e-9);
        assert!((fit.1 - 2.0).abs() < 1e-9);

        assert!(linear_fit([(1.0, 1.0)].into_iter()).is_none());
    }
}
