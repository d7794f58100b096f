//! Filter engine: composes the independent filter dimensions into one
//! predicate over deals.
//!
//! Every dimension is optional. An empty set or `None` means the dimension is
//! inactive and always passes; active dimensions combine with logical AND.

use geo::{Distance, Haversine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::deal::{Deal, LatLng, Stage};
use crate::error::FilterError;

pub const METERS_PER_MILE: f64 = 1_609.344;

/// Inclusive ask-price bounds. Either side may be open.
///
/// When both bounds are present and `min > max` the range matches nothing.
/// Bounds are never swapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl PriceRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min: Some(min), max: Some(max) }
    }

    pub fn is_inverted(&self) -> bool {
        matches!((self.min, self.max), (Some(lo), Some(hi)) if lo > hi)
    }

    pub fn contains(&self, price: f64) -> bool {
        if !price.is_finite() || self.is_inverted() {
            return false;
        }
        self.min.is_none_or(|lo| price >= lo) && self.max.is_none_or(|hi| price <= hi)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadiusFilter {
    pub center: LatLng,
    pub miles: f64,
}

impl RadiusFilter {
    pub fn contains(&self, point: LatLng) -> bool {
        if !self.miles.is_finite() || self.miles < 0.0 || self.center.validate().is_err() {
            return false;
        }
        haversine_miles(self.center, point) <= self.miles
    }
}

/// Great-circle distance in statute miles.
pub fn haversine_miles(a: LatLng, b: LatLng) -> f64 {
    Haversine.distance(a.to_point(), b.to_point()) / METERS_PER_MILE
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    #[serde(default)]
    pub stages: BTreeSet<Stage>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub strategies: BTreeSet<String>,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub supply_risk_only: Option<bool>,
    #[serde(default)]
    pub radius: Option<RadiusFilter>,
}

impl FilterState {
    /// Number of active dimensions.
    pub fn active_count(&self) -> usize {
        [
            !self.stages.is_empty(),
            self.price_range.is_some(),
            self.min_score.is_some(),
            !self.strategies.is_empty(),
            !self.sources.is_empty(),
            self.supply_risk_only == Some(true),
            self.radius.is_some(),
        ]
        .into_iter()
        .filter(|active| *active)
        .count()
    }

    /// Lists inconsistencies that make a dimension match nothing.
    pub fn validate(&self) -> Vec<FilterError> {
        let mut problems = Vec::new();
        if let Some(range) = self.price_range {
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    problems.push(FilterError::InvertedPriceRange { min, max });
                }
            }
        }
        if let Some(radius) = self.radius {
            if !radius.miles.is_finite() || radius.miles < 0.0 {
                problems.push(FilterError::InvalidRadius(radius.miles));
            }
            if let Err(e) = radius.center.validate() {
                problems.push(FilterError::InvalidCenter(e));
            }
        }
        problems
    }

    /// Builds the predicate for this state. The returned closure owns a copy
    /// of the state and holds no other data.
    pub fn compose(&self) -> impl Fn(&Deal) -> bool + Clone + 'static {
        let state = self.clone();
        move |deal: &Deal| state.matches(deal)
    }

    pub fn matches(&self, deal: &Deal) -> bool {
        if !self.stages.is_empty() && !self.stages.contains(&deal.stage) {
            return false;
        }
        if let Some(range) = &self.price_range {
            if !range.contains(deal.ask_price) {
                return false;
            }
        }
        if let Some(min) = self.min_score {
            if !(deal.opportunity_score >= min) {
                return false;
            }
        }
        if !self.strategies.is_empty() && !self.strategies.contains(&deal.strategy) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&deal.source) {
            return false;
        }
        if self.supply_risk_only == Some(true) && !deal.supply_risk_flag {
            return false;
        }
        if let Some(radius) = &self.radius {
            // A deal without a usable coordinate never satisfies a radius.
            match deal.location() {
                Some(point) if radius.contains(point) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Distinct values present in a deal set, for populating filter controls.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterFacets {
    pub stages: BTreeSet<Stage>,
    pub strategies: BTreeSet<String>,
    pub sources: BTreeSet<String>,
    pub price_extent: Option<PriceRange>,
    pub score_extent: Option<(f64, f64)>,
}

impl FilterFacets {
    pub fn from_deals<'a>(deals: impl IntoIterator<Item = &'a Deal>) -> Self {
        let mut facets = FilterFacets::default();
        let mut price: Option<(f64, f64)> = None;
        for deal in deals {
            facets.stages.insert(deal.stage);
            facets.strategies.insert(deal.strategy.clone());
            facets.sources.insert(deal.source.clone());
            if deal.ask_price.is_finite() {
                price = Some(match price {
                    Some((lo, hi)) => (lo.min(deal.ask_price), hi.max(deal.ask_price)),
                    None => (deal.ask_price, deal.ask_price),
                });
            }
            if deal.opportunity_score.is_finite() {
                let s = deal.opportunity_score;
                facets.score_extent = Some(match facets.score_extent {
                    Some((lo, hi)) => (lo.min(s), hi.max(s)),
                    None => (s, s),
                });
            }
        }
        facets.price_extent = price.map(|(lo, hi)| PriceRange::new(lo, hi));
        facets
    }
}
