use crossterm::event::KeyCode;
use std::sync::Arc;
use std::time::Instant;

use deal_atlas::{
    annotation::{AnnotationDraft, AnnotationStore, ListScope, MemoryRemote, point_geometry},
    cluster::{ClusterOptions, MapFeature},
    config::AtlasConfig,
    data::{ANNOTATIONS_FILE, DealCache, VIEW_STATE_FILE},
    deal::Stage,
    engine::MapEngine,
    filter::{FilterFacets, FilterState},
    view_state::{JsonFileStore, ViewState, ViewStatePersistence},
    viewport::{Viewport, VisibleSet},
};

/// Approximate pixel size of one terminal cell, used to size the viewport.
pub const CELL_PX: (f64, f64) = (8.0, 16.0);

const PAN_FRACTION: f64 = 0.25;
const LEAF_FOCUS_ZOOM: f64 = 14.0;

#[derive(PartialEq)]
pub enum Panel { Left, Center, Right }

pub struct AppState {
    pub engine: MapEngine,
    pub cluster_options: ClusterOptions,
    pub view: ViewState,
    pub map_cells: (u16, u16),
    pub visible: VisibleSet,
    pub list_items: Vec<MapFeature>,
    pub selected: usize,
    pub history: Vec<ViewState>,
    pub annotations: AnnotationStore<Arc<MemoryRemote>>,
    pub selected_annotation: usize,
    pub view_store: ViewStatePersistence<JsonFileStore>,
    pub facets: FilterFacets,
    strategy_cursor: Option<usize>,
    pub info: String,
    pub active_panel: Panel,
}

impl AppState {
    pub const HELP_TEXT: &'static str = "\
Tab: switch panel   ←↑→↓: pan / move in list
+/-: zoom   Enter: zoom into cluster   Esc: back
1-8: stage   s: strategy   r: supply risk   [ ]: min score   c: clear
a: pin annotation   h: share   d: delete   y: sync
q: quit";

    pub async fn new(data_dir: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = AtlasConfig::load(data_dir)?;
        let cache = DealCache::new(data_dir)?;

        let mut engine = MapEngine::new(config.cluster)?;
        engine.set_deals(cache.deals());
        let facets = engine.facets();

        let store = JsonFileStore::open(cache.base().join(VIEW_STATE_FILE))?;
        let view_store = ViewStatePersistence::new(store, config.current_user.clone(), config.view_state_debounce());
        let view = view_store.load_or(config.default_view);

        let remote = Arc::new(MemoryRemote::open_file(cache.base().join(ANNOTATIONS_FILE))?);
        let mut annotations = AnnotationStore::new(remote, config.current_user.clone());
        let info = match annotations.sync().await {
            Ok(n) => format!("{} deals, {} annotations", cache.len(), n),
            Err(e) => format!("{} deals; annotations unavailable: {e} (y to retry)", cache.len()),
        };

        let mut state = Self {
            engine,
            cluster_options: config.cluster,
            view,
            map_cells: (80, 24),
            visible: VisibleSet::default(),
            list_items: Vec::new(),
            selected: 0,
            history: Vec::new(),
            annotations,
            selected_annotation: 0,
            view_store,
            facets,
            strategy_cursor: None,
            info,
            active_panel: Panel::Center,
        };
        state.recompute();
        Ok(state)
    }

    /// Viewport covering the map panel at the current view.
    pub fn viewport(&self) -> Viewport {
        let (w, h) = self.map_cells;
        let bbox = self.view.bounds(f64::from(w) * CELL_PX.0, f64::from(h) * CELL_PX.1);
        Viewport::new(bbox, self.view.zoom)
    }

    pub fn set_map_cells(&mut self, cells: (u16, u16)) {
        if cells != self.map_cells {
            self.map_cells = cells;
            self.recompute();
        }
    }

    /// Re-queries the engine for the current viewport.
    pub fn recompute(&mut self) {
        match self.engine.on_viewport_change(self.viewport()) {
            Ok(visible) => {
                let mut items: Vec<MapFeature> = visible
                    .clusters
                    .iter()
                    .cloned()
                    .map(MapFeature::Cluster)
                    .chain(visible.leaves.iter().cloned().map(MapFeature::Leaf))
                    .collect();
                items.sort_by(|a, b| b.point_count().cmp(&a.point_count()));
                self.list_items = items;
                self.visible = visible;
            }
            Err(e) => self.info = format!("index error: {e}"),
        }
        self.selected = self.selected.min(self.list_items.len().saturating_sub(1));
    }

    fn move_to(&mut self, view: ViewState) {
        let max = f64::from(self.cluster_options.max_zoom) + 1.0;
        let min = f64::from(self.cluster_options.min_zoom);
        self.view = ViewState { zoom: view.zoom.clamp(min, max), ..view };
        self.view_store.observe(self.view, Instant::now());
        self.recompute();
    }

    fn pan(&mut self, dx: f64, dy: f64) {
        let (w, h) = self.map_cells;
        let px = f64::from(w) * CELL_PX.0 * PAN_FRACTION * dx;
        let py = f64::from(h) * CELL_PX.1 * PAN_FRACTION * dy;
        let Ok((cx, cy)) = deal_atlas::projection::project(self.view.center(), self.view.zoom) else {
            return;
        };
        let size = deal_atlas::projection::world_size(self.view.zoom);
        let target = deal_atlas::projection::unproject(cx + px, (cy + py).clamp(0.0, size), self.view.zoom);
        self.move_to(ViewState {
            longitude: deal_atlas::projection::wrap_lng(target.lng),
            latitude: target.lat,
            zoom: self.view.zoom,
        });
    }

    fn update_filter(&mut self, change: impl FnOnce(&mut FilterState)) {
        let mut filter = self.engine.filter_state().clone();
        change(&mut filter);
        let problems = self.engine.set_filter_state(filter);
        if let Some(p) = problems.first() {
            self.info = p.to_string();
        }
        self.recompute();
    }

    pub fn filter_summary(&self) -> String {
        let f = self.engine.filter_state();
        let mut parts = Vec::new();
        if !f.stages.is_empty() {
            let names: Vec<&str> = f.stages.iter().map(|s| s.label()).collect();
            parts.push(format!("Stages: {}", names.join(", ")));
        }
        if !f.strategies.is_empty() {
            parts.push(format!("Strategy: {}", f.strategies.iter().cloned().collect::<Vec<_>>().join(", ")));
        }
        if let Some(min) = f.min_score {
            parts.push(format!("Score ≥ {min:.0}"));
        }
        if f.supply_risk_only == Some(true) {
            parts.push("Supply risk only".to_string());
        }
        if parts.is_empty() {
            "No filters".to_string()
        } else {
            parts.join("\n")
        }
    }

    pub fn visible_annotations(&self) -> Vec<deal_atlas::annotation::Annotation> {
        self.annotations.list(ListScope::All)
    }

    /// Returns true when the app should quit.
    pub async fn handle_input(&mut self, key: KeyCode) -> bool {
        use KeyCode::*;
        match key {
            Char('q') => return true,
            Tab => {
                self.active_panel = match self.active_panel {
                    Panel::Left   => Panel::Center,
                    Panel::Center => Panel::Right,
                    Panel::Right  => Panel::Left,
                };
            }
            Up | Down | Left | Right if self.active_panel == Panel::Center => {
                let (dx, dy) = match key {
                    Up => (0.0, -1.0),
                    Down => (0.0, 1.0),
                    Left => (-1.0, 0.0),
                    _ => (1.0, 0.0),
                };
                self.pan(dx, dy);
            }
            Up => match self.active_panel {
                Panel::Right => self.selected_annotation = self.selected_annotation.saturating_sub(1),
                _ => if self.selected > 0 { self.selected -= 1 },
            },
            Down => match self.active_panel {
                Panel::Right => {
                    if self.selected_annotation + 1 < self.visible_annotations().len() {
                        self.selected_annotation += 1;
                    }
                }
                _ => if self.selected + 1 < self.list_items.len() { self.selected += 1 },
            },
            Char('+') | Char('=') => self.move_to(ViewState { zoom: self.view.zoom + 1.0, ..self.view }),
            Char('-') => self.move_to(ViewState { zoom: self.view.zoom - 1.0, ..self.view }),
            Enter => {
                let Some(item) = self.list_items.get(self.selected).cloned() else {
                    return false;
                };
                let target = match &item {
                    MapFeature::Cluster(c) => match self.engine.on_cluster_click(c.id) {
                        Ok(target) => target,
                        Err(e) => {
                            self.info = e.to_string();
                            return false;
                        }
                    },
                    MapFeature::Leaf(l) => {
                        self.info = format!("{} – {} – {}", l.deal.id, l.deal.stage, l.deal.strategy);
                        let at = item.position();
                        ViewState { latitude: at.lat, longitude: at.lng, zoom: self.view.zoom.max(LEAF_FOCUS_ZOOM) }
                    }
                };
                self.history.push(self.view);
                self.selected = 0;
                self.move_to(target);
            }
            Backspace | Esc => {
                if let Some(prev) = self.history.pop() {
                    self.move_to(prev);
                }
            }
            Char(c @ '1'..='8') => {
                let stage = Stage::ALL[(c as u8 - b'1') as usize];
                self.update_filter(|f| {
                    if !f.stages.remove(&stage) {
                        f.stages.insert(stage);
                    }
                });
            }
            Char('s') => {
                let strategies: Vec<String> = self.facets.strategies.iter().cloned().collect();
                self.strategy_cursor = match self.strategy_cursor {
                    None if !strategies.is_empty() => Some(0),
                    Some(i) if i + 1 < strategies.len() => Some(i + 1),
                    _ => None,
                };
                let chosen = self.strategy_cursor.map(|i| strategies[i].clone());
                self.update_filter(|f| f.strategies = chosen.into_iter().collect());
            }
            Char('r') => self.update_filter(|f| {
                f.supply_risk_only = match f.supply_risk_only {
                    Some(true) => None,
                    _ => Some(true),
                };
            }),
            Char(']') => self.update_filter(|f| {
                f.min_score = Some((f.min_score.unwrap_or(0.0) + 10.0).min(100.0));
            }),
            Char('[') => self.update_filter(|f| {
                f.min_score = f.min_score.map(|s| s - 10.0).filter(|s| *s > 0.0);
            }),
            Char('c') => {
                self.strategy_cursor = None;
                self.update_filter(|f| *f = FilterState::default());
            }
            Char('a') => {
                let n = self.annotations.list(ListScope::Mine).len() + 1;
                let draft = AnnotationDraft {
                    title: format!("Pin {n}"),
                    description: None,
                    color: "#e4572e".to_string(),
                    geometry: point_geometry(self.view.latitude, self.view.longitude),
                    shared_with_team: false,
                };
                self.info = match self.annotations.create(draft).await {
                    Ok(a) => format!("Saved {}", a.title),
                    Err(e) => format!("Could not save annotation: {e}"),
                };
            }
            Char('h') | Char('d') => {
                let Some(target) = self.visible_annotations().get(self.selected_annotation).cloned() else {
                    return false;
                };
                let result = if key == Char('h') {
                    self.annotations.set_shared(&target.id, !target.shared_with_team).await
                } else {
                    self.annotations.delete(&target.id).await
                };
                self.info = match result {
                    Ok(()) => format!("Updated {}", target.title),
                    Err(e) => e.to_string(),
                };
                let count = self.visible_annotations().len();
                self.selected_annotation = self.selected_annotation.min(count.saturating_sub(1));
            }
            Char('y') => {
                self.info = match self.annotations.sync().await {
                    Ok(n) => format!("{n} annotations"),
                    Err(e) => format!("Sync failed: {e}"),
                };
            }
            _ => {}
        }
        false
    }

    /// Writes the view once it has settled.
    pub fn tick(&mut self) {
        if let Err(e) = self.view_store.flush_due(Instant::now()) {
            tracing::warn!(error = %e, "could not persist view state");
        }
    }

    pub fn shutdown(&mut self) {
        if let Err(e) = self.view_store.save(self.view) {
            tracing::warn!(error = %e, "could not persist view state");
        }
    }
}
