//! Persistence of the last settled map position and panel layout.
//!
//! Storage is an injected key-value collaborator scoped per user. Writes
//! happen on settle events; intermediate frames are only remembered and
//! flushed once they have been quiet for the debounce window.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::deal::LatLng;
use crate::error::StorageError;
use crate::projection::{self, BBox};

/// Last interacted map position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub longitude: f64,
    pub latitude: f64,
    pub zoom: f64,
}

impl Default for ViewState {
    /// Continental US overview.
    fn default() -> Self {
        Self { longitude: -98.5795, latitude: 39.8283, zoom: 4.0 }
    }
}

impl ViewState {
    pub fn center(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    pub fn is_valid(&self) -> bool {
        self.center().validate().is_ok() && self.zoom.is_finite() && self.zoom >= 0.0
    }

    /// Bounding box of a `width_px` x `height_px` screen centred here.
    pub fn bounds(&self, width_px: f64, height_px: f64) -> BBox {
        let lat = self
            .latitude
            .clamp(-projection::MAX_MERCATOR_LAT, projection::MAX_MERCATOR_LAT);
        let center = LatLng::new(lat, projection::wrap_lng(self.longitude));
        let Ok((cx, cy)) = projection::project(center, self.zoom) else {
            return BBox::WORLD;
        };
        let size = projection::world_size(self.zoom);
        let (hw, hh) = (width_px / 2.0, height_px / 2.0);
        let north_west = projection::unproject(cx - hw, (cy - hh).max(0.0), self.zoom);
        let south_east = projection::unproject(cx + hw, (cy + hh).min(size), self.zoom);
        BBox::new(north_west.lng, south_east.lat, south_east.lng, north_west.lat)
    }
}

/// String key-value storage, e.g. browser local storage or a file.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls so far.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError> {
        self.writes += 1;
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// All keys in one JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&self.values)?)?;
        Ok(())
    }
}

pub struct ViewStatePersistence<S: KeyValueStore> {
    store: S,
    user: String,
    debounce: Duration,
    pending: Option<(ViewState, Instant)>,
    last_written: Option<ViewState>,
}

impl<S: KeyValueStore> ViewStatePersistence<S> {
    pub fn new(store: S, user: impl Into<String>, debounce: Duration) -> Self {
        Self { store, user: user.into(), debounce, pending: None, last_written: None }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.user, name)
    }

    /// Reads the stored view, if any. Unreadable or invalid values count as
    /// absent.
    pub fn load(&self) -> Option<ViewState> {
        let raw = match self.store.get(&self.key("view_state")) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read view state");
                return None;
            }
        };
        match serde_json::from_str::<ViewState>(&raw) {
            Ok(view) if view.is_valid() => Some(view),
            Ok(view) => {
                tracing::warn!(?view, "ignoring stored view state out of range");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed view state");
                None
            }
        }
    }

    /// Stored view or `fallback`.
    pub fn load_or(&self, fallback: ViewState) -> ViewState {
        self.load().unwrap_or(fallback)
    }

    /// Writes a settled view. Returns `false` when nothing needed writing.
    pub fn save(&mut self, view: ViewState) -> Result<bool, StorageError> {
        if !view.is_valid() {
            return Err(StorageError::Invalid(format!("view state out of range: {view:?}")));
        }
        self.pending = None;
        if self.last_written == Some(view) {
            return Ok(false);
        }
        let key = self.key("view_state");
        self.store.set(&key, serde_json::to_string(&view)?)?;
        self.last_written = Some(view);
        tracing::debug!(?view, "view state saved");
        Ok(true)
    }

    /// Records a transient view (mid-pan frame). Nothing is written until
    /// [`flush_due`](Self::flush_due) finds it has settled.
    pub fn observe(&mut self, view: ViewState, now: Instant) {
        self.pending = Some((view, now));
    }

    /// Writes the pending view once it has been quiet for the debounce
    /// window.
    pub fn flush_due(&mut self, now: Instant) -> Result<bool, StorageError> {
        match self.pending {
            Some((view, at)) if now.duration_since(at) >= self.debounce => self.save(view),
            _ => Ok(false),
        }
    }

    /// Writes any pending view regardless of the debounce window.
    pub fn flush(&mut self) -> Result<bool, StorageError> {
        match self.pending {
            Some((view, _)) => self.save(view),
            None => Ok(false),
        }
    }

    pub fn load_sections(&self) -> BTreeMap<String, bool> {
        self.store
            .get(&self.key("sections"))
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Stores the expanded/collapsed flag of one UI section.
    pub fn set_section(&mut self, name: &str, expanded: bool) -> Result<(), StorageError> {
        let mut sections = self.load_sections();
        sections.insert(name.to_string(), expanded);
        let key = self.key("sections");
        self.store.set(&key, serde_json::to_string(&sections)?)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistence() -> ViewStatePersistence<MemoryStore> {
        ViewStatePersistence::new(MemoryStore::new(), "ana", Duration::from_millis(500))
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut p = persistence();
        let view = ViewState { longitude: -84.388, latitude: 33.749, zoom: 11.5 };
        assert!(p.save(view).unwrap());
        assert_eq!(p.load(), Some(view));
    }

    #[test]
    fn missing_state_falls_back_to_default() {
        let p = persistence();
        assert_eq!(p.load(), None);
        assert_eq!(p.load_or(ViewState::default()), ViewState::default());
    }

    #[test]
    fn state_is_scoped_per_user() {
        let mut store = MemoryStore::new();
        store.set("bo:view_state", r#"{"longitude":1.0,"latitude":2.0,"zoom":3.0}"#.into()).unwrap();
        let p = ViewStatePersistence::new(store, "ana", Duration::ZERO);
        assert_eq!(p.load(), None);
    }

    #[test]
    fn intermediate_frames_are_debounced() {
        let mut p = persistence();
        let t0 = Instant::now();
        for i in 0..30 {
            let view = ViewState { longitude: f64::from(i) * 0.1, latitude: 10.0, zoom: 5.0 };
            p.observe(view, t0 + Duration::from_millis(16 * i as u64));
            assert!(!p.flush_due(t0 + Duration::from_millis(16 * i as u64)).unwrap());
        }
        assert_eq!(p.store().writes(), 0);
        let settled = t0 + Duration::from_millis(16 * 29 + 500);
        assert!(p.flush_due(settled).unwrap());
        assert_eq!(p.store().writes(), 1);
        assert_eq!(p.load().map(|v| v.longitude), Some(29.0 * 0.1));
    }

    #[test]
    fn unchanged_view_is_not_rewritten() {
        let mut p = persistence();
        let view = ViewState::default();
        assert!(p.save(view).unwrap());
        assert!(!p.save(view).unwrap());
        assert_eq!(p.store().writes(), 1);
    }

    #[test]
    fn invalid_views_are_rejected_and_stored_garbage_ignored() {
        let mut p = persistence();
        let bad = ViewState { longitude: 0.0, latitude: f64::NAN, zoom: 1.0 };
        assert!(p.save(bad).is_err());

        let mut store = MemoryStore::new();
        store.set("ana:view_state", "not json".into()).unwrap();
        assert_eq!(ViewStatePersistence::new(store, "ana", Duration::ZERO).load(), None);
    }

    #[test]
    fn section_flags_persist() {
        let mut p = persistence();
        p.set_section("filters", false).unwrap();
        p.set_section("summary", true).unwrap();
        let sections = p.load_sections();
        assert_eq!(sections.get("filters"), Some(&false));
        assert_eq!(sections.get("summary"), Some(&true));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("view_state.json");
        let view = ViewState { longitude: 2.35, latitude: 48.85, zoom: 12.0 };
        {
            let store = JsonFileStore::open(&path).unwrap();
            let mut p = ViewStatePersistence::new(store, "ana", Duration::ZERO);
            p.save(view).unwrap();
        }
        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(ViewStatePersistence::new(store, "ana", Duration::ZERO).load(), Some(view));
    }

    #[test]
    fn bounds_surround_the_center() {
        let view = ViewState { longitude: -84.388, latitude: 33.749, zoom: 10.0 };
        let bbox = view.bounds(800.0, 600.0);
        assert!(bbox.west < view.longitude && view.longitude < bbox.east);
        assert!(bbox.south < view.latitude && view.latitude < bbox.north);
        assert!(bbox.contains(view.center()));
    }
}
