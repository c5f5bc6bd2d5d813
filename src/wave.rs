//! P/S-wave travel-time model and the per-depth model cache.
//!
//! For each hypocenter depth a pair of monotonic distance↔time tables is
//! sampled from the two-layer gradient velocity model. The tables answer both
//! directions: travel time at a given epicentral distance, and the epicentral
//! distance the wavefront has reached at a given time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::location::EARTH_RADIUS_KM;

/// Depths (km) whose models are built eagerly at startup.
pub const PRESEED_DEPTHS: [u32; 10] = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];

/// Number of sampled epicentral distances per model.
const SAMPLE_COUNT: usize = 100;

/// Sampling step in degrees; the table covers [0°, 1°).
const SAMPLE_STEP_DEG: f64 = 0.01;

/// Crustal floor velocities (km/s) used as clamps by the velocity model.
const P_FLOOR_KMS: f64 = 7.0;
const S_FLOOR_KMS: f64 = 4.0;

/// P and S travel times (seconds) for a hypocentral distance at a given depth.
///
/// Two-layer gradient model: the velocity gradient constants switch at 40 km
/// depth, and the S-wave field is the P-wave field scaled by √3. Ray travel
/// times faster than the floor velocities are clamped to them.
#[must_use]
pub fn speed_model(depth_km: f64, hypocentral_km: f64) -> (f64, f64) {
    let za = depth_km;
    let (g0, g) = if depth_km <= 40.0 {
        (5.102_98, 0.066_59)
    } else {
        (7.804_799, 0.004_573)
    };
    let xb = hypocentral_km.max(1e-3);

    let mut p_time = gradient_ray_time(g0, g, za, xb);
    let mut s_time = gradient_ray_time(g0 / 1.732, g / 1.732, za, xb);

    if xb / p_time > P_FLOOR_KMS {
        p_time = xb / P_FLOOR_KMS;
    }
    if xb / s_time > S_FLOOR_KMS {
        s_time = xb / S_FLOOR_KMS;
    }
    (p_time, s_time)
}

/// Travel time of a ray through a linear velocity gradient `v(z) = g0 + g·z`.
fn gradient_ray_time(g0: f64, g: f64, za: f64, xb: f64) -> f64 {
    let zc = -(g0 / g);
    let xc = (xb * xb - 2.0 * (g0 / g) * za - za * za) / (2.0 * xb);

    let mut theta_a = ((za - zc) / xc).atan();
    if theta_a < 0.0 {
        theta_a += std::f64::consts::PI;
    }
    theta_a = std::f64::consts::PI - theta_a;
    let theta_b = ((-zc) / (xb - xc)).atan();

    (1.0 / g) * ((theta_a / 2.0).tan() / (theta_b / 2.0).tan()).ln()
}

/// Monotonic distance↔time interpolation tables for one integer depth.
#[derive(Debug)]
pub struct WaveModel {
    depth_km: f64,
    distance_deg: Vec<f64>,
    p_time_s: Vec<f64>,
    s_time_s: Vec<f64>,
}

impl WaveModel {
    /// Sample the velocity model at `SAMPLE_COUNT` epicentral distances.
    #[must_use]
    pub fn build(depth_km: u32) -> Self {
        let depth = f64::from(depth_km);
        let mut distance_deg = Vec::with_capacity(SAMPLE_COUNT);
        let mut p_time_s = Vec::with_capacity(SAMPLE_COUNT);
        let mut s_time_s = Vec::with_capacity(SAMPLE_COUNT);

        let mut prev_p = 0.0_f64;
        let mut prev_s = 0.0_f64;
        for i in 0..SAMPLE_COUNT {
            #[allow(clippy::cast_precision_loss)]
            let deg = i as f64 * SAMPLE_STEP_DEG;
            let surface_km = deg.to_radians() * EARTH_RADIUS_KM;
            let hypocentral_km = surface_km.hypot(depth);

            let (mut p, mut s) = speed_model(depth, hypocentral_km);
            // Degenerate ray geometry falls back to the floor velocities.
            if !p.is_finite() || p <= 0.0 {
                p = hypocentral_km / P_FLOOR_KMS;
            }
            if !s.is_finite() || s <= 0.0 {
                s = hypocentral_km / S_FLOOR_KMS;
            }
            // Tables must stay strictly increasing for the inverse lookup.
            p = p.max(prev_p + 1e-9);
            s = s.max(prev_s + 1e-9);
            prev_p = p;
            prev_s = s;

            distance_deg.push(deg);
            p_time_s.push(p);
            s_time_s.push(s);
        }

        Self {
            depth_km: depth,
            distance_deg,
            p_time_s,
            s_time_s,
        }
    }

    #[must_use]
    pub fn depth_km(&self) -> f64 {
        self.depth_km
    }

    /// P and S travel times (seconds) at an epicentral distance in radians.
    #[must_use]
    pub fn travel_time(&self, distance_rad: f64) -> (f64, f64) {
        let deg = distance_rad.to_degrees();
        (
            interpolate(&self.distance_deg, &self.p_time_s, deg),
            interpolate(&self.distance_deg, &self.s_time_s, deg),
        )
    }

    /// Epicentral distances (degrees) the P and S fronts have reached after
    /// `time_s` seconds. Negative solutions are clamped to 0.
    #[must_use]
    pub fn arrival_distance(&self, time_s: f64) -> (f64, f64) {
        (
            interpolate(&self.p_time_s, &self.distance_deg, time_s).max(0.0),
            interpolate(&self.s_time_s, &self.distance_deg, time_s).max(0.0),
        )
    }
}

/// Piecewise-linear interpolation over strictly increasing knots, with linear
/// extrapolation beyond either end so forward and inverse lookups agree.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    debug_assert!(xs.len() == ys.len() && xs.len() >= 2);
    let i = xs.partition_point(|&v| v < x).clamp(1, xs.len() - 1);
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// Process-wide cache of wave models keyed by integer depth.
///
/// Preseeded depths are built eagerly; any other depth is built on first use.
/// Concurrent misses on the same depth may both build, but only the first
/// completed model is kept.
#[derive(Debug)]
pub struct WaveModelCache {
    models: Mutex<HashMap<u32, Arc<WaveModel>>>,
}

impl WaveModelCache {
    #[must_use]
    pub fn new() -> Self {
        let mut models = HashMap::with_capacity(PRESEED_DEPTHS.len());
        for depth in PRESEED_DEPTHS {
            models.insert(depth, Arc::new(WaveModel::build(depth)));
        }
        Self {
            models: Mutex::new(models),
        }
    }

    /// The wave model for a hypocenter depth, building it if required.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn get(&self, depth_km: f64) -> Arc<WaveModel> {
        let key = depth_km.round().max(0.0) as u32;

        if let Some(model) = self.lock().get(&key) {
            return Arc::clone(model);
        }

        // Built outside the lock; first insert wins, later builds are dropped.
        let built = Arc::new(WaveModel::build(key));
        Arc::clone(self.lock().entry(key).or_insert(built))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<WaveModel>>> {
        self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for WaveModelCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_model_orders_waves() {
        for depth in [10.0_f64, 40.0, 70.0, 100.0] {
            for distance in [5.0_f64, 50.0, 150.0, 400.0] {
                let hypocentral = (distance * distance + depth * depth).sqrt();
                let (p, s) = speed_model(depth, hypocentral);
                assert!(p > 0.0, "p not positive at depth {depth} dist {distance}");
                assert!(s > p, "s must trail p at depth {depth} dist {distance}");
            }
        }
    }

    #[test]
    fn test_tables_monotonic() {
        for depth in PRESEED_DEPTHS {
            let model = WaveModel::build(depth);
            for window in model.p_time_s.windows(2) {
                assert!(window[1] > window[0], "p table not increasing at {depth}km");
            }
            for window in model.s_time_s.windows(2) {
                assert!(window[1] > window[0], "s table not increasing at {depth}km");
            }
        }
    }

    #[test]
    fn test_travel_time_increases_with_distance() {
        let model = WaveModel::build(40);
        let (p_near, s_near) = model.travel_time(0.1_f64.to_radians());
        let (p_far, s_far) = model.travel_time(0.8_f64.to_radians());
        assert!(p_far > p_near);
        assert!(s_far > s_near);
    }

    #[test]
    fn test_arrival_distance_round_trip() {
        for depth in [10, 40, 100] {
            let model = WaveModel::build(depth);
            // Below the zero-distance travel time the lookup clamps to 0; the
            // round-trip property holds above it.
            let s_floor = model.s_time_s[0].ceil();
            let mut t = s_floor;
            while t <= 120.0 {
                let (p_deg, s_deg) = model.arrival_distance(t);
                assert!(p_deg >= 0.0 && s_deg >= 0.0);
                let (_, s_back) = model.travel_time(s_deg.to_radians());
                let error = (s_back - t).abs() / t;
                assert!(error < 0.01, "round trip off by {error} at {depth}km t={t}");
                t += 1.0;
            }
        }
    }

    #[test]
    fn test_arrival_distance_clamps_negative() {
        let model = WaveModel::build(40);
        let (p_deg, s_deg) = model.arrival_distance(0.0);
        assert!(p_deg >= 0.0);
        assert!(s_deg >= 0.0);
    }

    #[test]
    fn test_cache_preseeded_and_reused() {
        let cache = WaveModelCache::new();
        let first = cache.get(40.0);
        let second = cache.get(40.2); // rounds to the same key
        assert!(Arc::ptr_eq(&first, &second));

        let lazy = cache.get(23.0);
        assert!((lazy.depth_km() - 23.0).abs() < 1e-9);
        assert!(Arc::ptr_eq(&lazy, &cache.get(23.0)));
    }
}
