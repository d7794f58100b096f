use serde_json::from_slice;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::deal::{Deal, Geocoder, NoGeocoder, resolve_location};
use crate::error::Result;

pub const DEALS_FILE: &str = "deals.json";
pub const ANNOTATIONS_FILE: &str = "annotations.json";
pub const VIEW_STATE_FILE: &str = "view_state.json";
pub const LOG_FILE: &str = "deal-atlas.log";

/// Deal feed loaded from the data directory, keyed by id.
///
/// `deals.json` may hold either an array of deals or an object mapping id
/// to deal. Coordinates missing from a record are resolved through the
/// geocoder when one is provided.
pub struct DealCache {
    base: PathBuf,
    deals: BTreeMap<String, Arc<Deal>>,
    unlocated: usize,
}

impl DealCache {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self> {
        Self::with_geocoder(base, &NoGeocoder)
    }

    pub fn with_geocoder<P: AsRef<Path>>(base: P, geocoder: &dyn Geocoder) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;

        let raw = match fs::read(base.join(DEALS_FILE)) {
            Ok(bytes) => parse_feed(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %base.display(), "no deal feed found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut cache = Self { base, deals: BTreeMap::new(), unlocated: 0 };
        cache.replace(raw, geocoder);
        Ok(cache)
    }

    /// Replaces the whole feed, e.g. after a refetch.
    pub fn replace(&mut self, raw: Vec<Deal>, geocoder: &dyn Geocoder) {
        self.deals.clear();
        self.unlocated = 0;
        for mut deal in raw {
            if !resolve_location(&mut deal, geocoder) {
                self.unlocated += 1;
            }
            if self.deals.insert(deal.id.clone(), Arc::new(deal)).is_some() {
                tracing::warn!("duplicate deal id in feed, keeping the last record");
            }
        }
        tracing::info!(deals = self.deals.len(), unlocated = self.unlocated, "deal feed loaded");
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }

    /// Deals with no usable coordinate after geocoding.
    pub fn unlocated(&self) -> usize {
        self.unlocated
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Deal>> {
        self.deals.get(id)
    }

    /// Deals in id order.
    pub fn deals(&self) -> Vec<Arc<Deal>> {
        self.deals.values().cloned().collect()
    }
}

fn parse_feed(bytes: &[u8]) -> Result<Vec<Deal>> {
    if let Ok(list) = from_slice::<Vec<Deal>>(bytes) {
        return Ok(list);
    }
    let map: BTreeMap<String, Deal> = from_slice(bytes)?;
    Ok(map.into_values().collect())
}
