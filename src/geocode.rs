//! Reverse geocoding of photo GPS coordinates into city, region and country.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::GeocodingConfig;

/// A resolved (or explicitly unresolved) location
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Place {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

impl Place {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.city.is_some() || self.region.is_some() || self.country.is_some()
    }

    /// "City, Region, Country" without repeated parts
    pub fn display_name(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in [&self.city, &self.region, &self.country].into_iter().flatten() {
            if !parts.contains(&part.as_str()) {
                parts.push(part);
            }
        }
        if parts.is_empty() {
            "Unknown".to_string()
        } else {
            parts.join(", ")
        }
    }
}

pub trait Geocoder: Send + Sync {
    fn reverse(&self, latitude: f64, longitude: f64) -> Result<Place>;
}

/// Used when geocoding is turned off
pub struct DisabledGeocoder;

impl Geocoder for DisabledGeocoder {
    fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<Place> {
        Ok(Place::unresolved())
    }
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    #[serde(default)]
    address: serde_json::Map<String, serde_json::Value>,
    error: Option<String>,
}

const CITY_KEYS: [&str; 8] = [
    "city",
    "town",
    "village",
    "municipality",
    "suburb",
    "neighbourhood",
    "hamlet",
    "locality",
];
const REGION_KEYS: [&str; 5] = ["state", "province", "region", "county", "state_district"];

/// OpenStreetMap Nominatim, rate limited to one request per
/// `min_interval_ms`
pub struct NominatimGeocoder {
    agent: ureq::Agent,
    endpoint: String,
    user_agent: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodingConfig) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
            endpoint: config.endpoint.clone(),
            user_agent: config.user_agent.clone(),
            min_interval: Duration::from_millis(config.min_interval_ms),
            last_request: Mutex::new(None),
        }
    }

    fn wait_for_slot(&self) -> Result<()> {
        let mut last = self
            .last_request
            .lock()
            .map_err(|e| anyhow!("Geocoder lock poisoned: {}", e))?;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

impl Geocoder for NominatimGeocoder {
    fn reverse(&self, latitude: f64, longitude: f64) -> Result<Place> {
        if !valid_coordinates(latitude, longitude) {
            return Err(anyhow!("Invalid coordinates: {}, {}", latitude, longitude));
        }

        self.wait_for_slot()?;

        let response: NominatimResponse = self
            .agent
            .get(&self.endpoint)
            .set("User-Agent", &self.user_agent)
            .set("Accept-Language", "en")
            .query("lat", &latitude.to_string())
            .query("lon", &longitude.to_string())
            .query("format", "json")
            .query("addressdetails", "1")
            .query("zoom", "14")
            .call()
            .map_err(|e| anyhow!("Nominatim request failed: {}", e))?
            .into_json()
            .map_err(|e| anyhow!("Failed to parse Nominatim response: {}", e))?;

        if let Some(error) = response.error {
            return Err(anyhow!("Nominatim error: {}", error));
        }

        let place = place_from_address(&response.address);
        tracing::debug!(latitude, longitude, place = %place.display_name(), "Geocoded");
        Ok(place)
    }
}

pub fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

fn place_from_address(address: &serde_json::Map<String, serde_json::Value>) -> Place {
    let first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| address.get(*k).and_then(|v| v.as_str()))
            .find(|v| !v.is_empty())
            .map(|v| v.to_string())
    };

    Place {
        city: first(&CITY_KEYS[..]),
        region: first(&REGION_KEYS[..]),
        country: first(&["country"][..]),
    }
}
