//! Geographic locations and the administrative region index.
//!
//! Regions are loaded once at startup from `region.json` under the configured
//! asset directory and never mutated afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::EewcastError;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.008;

/// Site amplification factor applied when a region does not define its own.
pub const DEFAULT_SITE_EFFECT: f64 = 1.751;

/// A point on the Earth's surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    /// Longitude (degrees)
    pub lon: f64,
    /// Latitude (degrees)
    pub lat: f64,
}

impl Location {
    #[must_use]
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Central angle to `other` in radians, by the haversine formula.
    #[must_use]
    pub fn central_angle(&self, other: &Self) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * a.sqrt().atan2((1.0 - a).sqrt())
    }

    /// Great-circle distance to `other` in kilometers.
    #[must_use]
    pub fn surface_distance_km(&self, other: &Self) -> f64 {
        self.central_angle(other) * EARTH_RADIUS_KM
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.lon, self.lat)
    }
}

/// An epicenter with its optional human-readable description.
#[derive(Debug, Clone, PartialEq)]
pub struct EarthquakeLocation {
    pub location: Location,
    pub display_name: Option<String>,
}

impl EarthquakeLocation {
    #[must_use]
    pub fn new(lon: f64, lat: f64, display_name: Option<String>) -> Self {
        Self {
            location: Location::new(lon, lat),
            display_name,
        }
    }

    /// Description if present, otherwise the bare coordinates.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.location.to_string(),
        }
    }
}

/// An administrative region with its seismic site parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Unique region code
    pub code: u32,
    /// Region (town/district) name
    pub name: String,
    /// City or county the region belongs to
    pub city: String,
    /// Sub-area grouping, if defined
    pub area: Option<String>,
    pub location: Location,
    /// Site amplification factor
    pub site_effect: f64,
}

/// One entry of the `region.json` asset.
#[derive(Debug, Deserialize)]
struct RawRegion {
    code: u32,
    lon: f64,
    lat: f64,
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    site: Option<f64>,
}

/// Immutable lookup tables over all known regions.
#[derive(Debug, Default)]
pub struct RegionIndex {
    by_code: BTreeMap<u32, Region>,
    by_city: BTreeMap<String, Vec<u32>>,
}

impl RegionIndex {
    /// Load the region asset from `asset_dir/region.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed. This is fatal at
    /// startup.
    pub fn load(asset_dir: &Path) -> Result<Self, EewcastError> {
        let path = asset_dir.join("region.json");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            EewcastError::InvalidAsset(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// Parse the region asset from its JSON text.
    ///
    /// The schema is `{city: {name: {code, lon, lat, area?, site?}}}`.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON, duplicate codes or an empty asset.
    pub fn parse(raw: &str) -> Result<Self, EewcastError> {
        let data: BTreeMap<String, BTreeMap<String, RawRegion>> =
            serde_json::from_str(raw)
                .map_err(|e| EewcastError::InvalidAsset(format!("region.json: {e}")))?;

        let mut index = Self::default();
        for (city, regions) in data {
            for (name, raw) in regions {
                let code = raw.code;
                let region = Region {
                    code,
                    name,
                    city: city.clone(),
                    area: raw.area,
                    location: Location::new(raw.lon, raw.lat),
                    site_effect: raw.site.unwrap_or(DEFAULT_SITE_EFFECT),
                };
                if index.by_code.insert(code, region).is_some() {
                    return Err(EewcastError::InvalidAsset(format!(
                        "duplicate region code {code} in region.json"
                    )));
                }
                index.by_city.entry(city.clone()).or_default().push(code);
            }
        }

        if index.by_code.is_empty() {
            return Err(EewcastError::InvalidAsset("region.json holds no regions".into()));
        }
        Ok(index)
    }

    #[must_use]
    pub fn get(&self, code: u32) -> Option<&Region> {
        self.by_code.get(&code)
    }

    /// All regions in ascending code order.
    pub fn all(&self) -> impl Iterator<Item = &Region> {
        self.by_code.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Cities in the index, each with its member region codes.
    pub fn cities(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.by_city.iter().map(|(city, codes)| (city.as_str(), codes.as_slice()))
    }

    /// Region codes belonging to `city`.
    #[must_use]
    pub fn city_regions(&self, city: &str) -> &[u32] {
        self.by_city.get(city).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "臺北市": {
            "中正區": {"code": 100, "lon": 121.5198, "lat": 25.0324, "site": 1.87},
            "大安區": {"code": 106, "lon": 121.5434, "lat": 25.0263}
        },
        "花蓮縣": {
            "花蓮市": {"code": 970, "lon": 121.6067, "lat": 23.9824, "area": "East"}
        }
    }"#;

    #[test]
    fn test_parse_region_asset() {
        let index = RegionIndex::parse(SAMPLE).expect("failed to parse region asset");
        assert_eq!(index.len(), 3);

        let region = index.get(100).expect("region 100");
        assert_eq!(region.name, "中正區");
        assert_eq!(region.city, "臺北市");
        assert!((region.site_effect - 1.87).abs() < 1e-9);

        // Missing site falls back to the default factor.
        let region = index.get(106).expect("region 106");
        assert!((region.site_effect - DEFAULT_SITE_EFFECT).abs() < 1e-9);

        let region = index.get(970).expect("region 970");
        assert_eq!(region.area.as_deref(), Some("East"));
    }

    #[test]
    fn test_city_grouping() {
        let index = RegionIndex::parse(SAMPLE).expect("failed to parse region asset");
        assert_eq!(index.city_regions("臺北市"), &[100, 106]);
        assert_eq!(index.city_regions("花蓮縣"), &[970]);
        assert!(index.city_regions("高雄市").is_empty());
        assert_eq!(index.cities().count(), 2);
    }

    #[test]
    fn test_empty_asset_rejected() {
        assert!(RegionIndex::parse("{}").is_err());
        assert!(RegionIndex::parse("not json").is_err());
    }

    #[test]
    fn test_haversine() {
        // Taipei to Hualien is roughly 120 km.
        let taipei = Location::new(121.5198, 25.0324);
        let hualien = Location::new(121.6067, 23.9824);
        let distance = taipei.surface_distance_km(&hualien);
        assert!(distance > 110.0 && distance < 130.0, "got {distance}");
    }

    #[test]
    fn test_describe_epicenter() {
        let with_name = EarthquakeLocation::new(121.6, 23.9, Some("花蓮縣外海".into()));
        assert_eq!(with_name.describe(), "花蓮縣外海");

        let bare = EarthquakeLocation::new(121.6, 23.9, None);
        assert_eq!(bare.describe(), "(121.6, 23.9)");
    }
}
