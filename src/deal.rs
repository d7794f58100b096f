use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::GeoError;

/// WGS84 coordinate in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Checks the coordinate is finite and inside the geographic range.
    /// Nothing is wrapped or clamped here.
    pub fn validate(self) -> Result<Self, GeoError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(GeoError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(GeoError::LatitudeOutOfRange(self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(GeoError::LongitudeOutOfRange(self.lng));
        }
        Ok(self)
    }

    pub fn to_point(self) -> geo::Point<f64> {
        geo::Point::new(self.lng, self.lat)
    }
}

impl From<geo::Point<f64>> for LatLng {
    fn from(p: geo::Point<f64>) -> Self {
        Self { lat: p.y(), lng: p.x() }
    }
}

/// Pipeline stage of a deal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prospect,
    Screening,
    Underwriting,
    Loi,
    DueDiligence,
    Closing,
    Closed,
    Passed,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Prospect,
        Stage::Screening,
        Stage::Underwriting,
        Stage::Loi,
        Stage::DueDiligence,
        Stage::Closing,
        Stage::Closed,
        Stage::Passed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Prospect => "Prospect",
            Stage::Screening => "Screening",
            Stage::Underwriting => "Underwriting",
            Stage::Loi => "LOI",
            Stage::DueDiligence => "Due diligence",
            Stage::Closing => "Closing",
            Stage::Closed => "Closed",
            Stage::Passed => "Passed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One deal as delivered by the deal feed.
///
/// Coordinates are optional: a deal may only carry an `address`, which an
/// external [`Geocoder`] can resolve. Any field the engine does not know is
/// kept in `extra` and passed through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    pub stage: Stage,
    pub ask_price: f64,
    pub opportunity_score: f64,
    pub supply_risk_flag: bool,
    pub strategy: String,
    pub source: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Deal {
    /// The deal's own coordinate, if both halves are present and valid.
    pub fn location(&self) -> Option<LatLng> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => LatLng::new(lat, lng).validate().ok(),
            _ => None,
        }
    }
}

/// Resolves a street address to a coordinate.
///
/// Implementations must return `None` rather than invent a position.
pub trait Geocoder {
    fn resolve(&self, address: &str) -> Option<LatLng>;
}

/// Geocoder that never resolves anything; deals without coordinates stay
/// unlocated.
pub struct NoGeocoder;

impl Geocoder for NoGeocoder {
    fn resolve(&self, _address: &str) -> Option<LatLng> {
        None
    }
}

/// Fills in missing coordinates from the geocoder. Returns `true` when the
/// deal ends up with a usable location.
pub fn resolve_location(deal: &mut Deal, geocoder: &dyn Geocoder) -> bool {
    if deal.location().is_some() {
        return true;
    }
    let resolved = deal
        .address
        .as_deref()
        .and_then(|a| geocoder.resolve(a))
        .and_then(|ll| ll.validate().ok());
    match resolved {
        Some(ll) => {
            deal.latitude = Some(ll.lat);
            deal.longitude = Some(ll.lng);
            true
        }
        None => false,
    }
}
