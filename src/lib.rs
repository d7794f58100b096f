//! Spatial clustering, filtering and annotation engine for a map of
//! real-estate deals.
//!
//! Deals flow through the [`filter`] predicate into a [`cluster`] index,
//! which [`viewport`] queries for each pan or zoom. [`engine::MapEngine`]
//! ties those together. [`annotation`] and [`view_state`] are independent
//! side stores.

pub mod annotation;
pub mod cluster;
pub mod config;
pub mod data;
pub mod deal;
pub mod engine;
pub mod error;
pub mod filter;
pub mod logging;
pub mod projection;
pub mod view_state;
pub mod viewport;

pub use cluster::{Cluster, ClusterId, ClusterIndex, ClusterOptions, Leaf, MapFeature, NodeId};
pub use deal::{Deal, LatLng, Stage};
pub use engine::MapEngine;
pub use error::{AtlasError, Result};
pub use filter::{FilterState, PriceRange, RadiusFilter};
pub use projection::BBox;
pub use view_state::ViewState;
pub use viewport::{Viewport, VisibleSet};
