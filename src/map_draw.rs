use geo::{Coord, Geometry, LineString, Polygon};
use ratatui::layout::Rect as TuiRect;
use ratatui::widgets::canvas::{Canvas, Circle, Line, Points};
use ratatui::widgets::{Block, Borders};
use ratatui::{Frame, style::Color};

use deal_atlas::{
    annotation::Annotation,
    cluster::NodeId,
    deal::LatLng,
    projection::{project, world_size},
    view_state::ViewState,
    viewport::VisibleSet,
};

use crate::state::CELL_PX;

/// Radius in pixels of the smallest cluster marker.
const MIN_RADIUS: f64 = 6.0;

struct Marker {
    x: f64,
    y: f64,
    count: usize,
    node: NodeId,
}

/// Clusters, deals and annotations of one frame, laid out in pixel space of
/// the current zoom with the view center at the origin.
pub struct MapView {
    clusters: Vec<Marker>,
    leaves: Vec<Marker>,
    shapes: Vec<(Color, Vec<Vec<(f64, f64)>>)>,
    pins: Vec<(Color, (f64, f64))>,
    x_bounds: [f64; 2],
    y_bounds: [f64; 2],
    highlight: Option<NodeId>,
}

impl MapView {
    pub fn new(
        view: ViewState,
        cells: (u16, u16),
        visible: &VisibleSet,
        annotations: &[Annotation],
        highlight: Option<NodeId>,
    ) -> Self {
        let half_w = f64::from(cells.0) * CELL_PX.0 / 2.0;
        let half_h = f64::from(cells.1) * CELL_PX.1 / 2.0;
        let to_screen = Projector::new(view);

        let clusters = visible
            .clusters
            .iter()
            .filter_map(|c| {
                let (x, y) = to_screen.point(c.centroid)?;
                Some(Marker { x, y, count: c.point_count, node: NodeId::Cluster(c.id) })
            })
            .collect();
        let leaves = visible
            .leaves
            .iter()
            .filter_map(|l| {
                let (x, y) = to_screen.point(l.position()?)?;
                Some(Marker { x, y, count: 1, node: NodeId::Leaf(l.index) })
            })
            .collect();

        let mut shapes = Vec::new();
        let mut pins = Vec::new();
        for annotation in annotations {
            let color = parse_color(&annotation.color);
            // Annotations that fail validation were never accepted by the store.
            let Ok(geometries) = annotation.geometries() else { continue };
            for geometry in &geometries {
                let mut rings = Vec::new();
                collect_rings(geometry, &mut rings);
                let projected: Vec<Vec<(f64, f64)>> = rings
                    .iter()
                    .map(|ring| ring.iter().filter_map(|c| to_screen.coord(*c)).collect())
                    .collect();
                shapes.push((color, projected));
                for c in points_of(geometry) {
                    if let Some(p) = to_screen.coord(c) {
                        pins.push((color, p));
                    }
                }
            }
        }

        Self {
            clusters,
            leaves,
            shapes,
            pins,
            x_bounds: [-half_w, half_w],
            y_bounds: [-half_h, half_h],
            highlight,
        }
    }

    /// Number of markers on the map.
    pub fn feature_count(&self) -> usize {
        self.clusters.len() + self.leaves.len()
    }

    /// Draws annotations first, then deals and clusters, with the selected one in red.
    pub fn render(&self, f: &mut Frame, area: TuiRect, title: &str) {
        let canvas = Canvas::default()
            .block(Block::default().title(title.to_string()).borders(Borders::ALL))
            .x_bounds(self.x_bounds)
            .y_bounds(self.y_bounds)
            .paint(|ctx| {
                for (color, rings) in &self.shapes {
                    for ring in rings {
                        for window in ring.windows(2) {
                            let (a, b) = (window[0], window[1]);
                            ctx.draw(&Line { x1: a.0, y1: a.1, x2: b.0, y2: b.1, color: *color });
                        }
                    }
                }
                for (color, p) in &self.pins {
                    ctx.draw(&Points { coords: &[*p], color: *color });
                }
                ctx.layer();

                let leaf_coords: Vec<(f64, f64)> = self
                    .leaves
                    .iter()
                    .filter(|m| Some(m.node) != self.highlight)
                    .map(|m| (m.x, m.y))
                    .collect();
                ctx.draw(&Points { coords: &leaf_coords, color: Color::Cyan });

                for m in &self.clusters {
                    let color = if Some(m.node) == self.highlight { Color::Red } else { Color::Yellow };
                    ctx.draw(&Circle { x: m.x, y: m.y, radius: marker_radius(m.count), color });
                    ctx.print(m.x, m.y, m.count.to_string());
                }
                if let Some(m) = self.leaves.iter().find(|m| Some(m.node) == self.highlight) {
                    ctx.draw(&Circle { x: m.x, y: m.y, radius: MIN_RADIUS / 2.0, color: Color::Red });
                }
            });
        f.render_widget(canvas, area);
    }
}

/// Grows with the order of magnitude of the count.
fn marker_radius(count: usize) -> f64 {
    MIN_RADIUS * (1.0 + (count.max(1) as f64).log10())
}

/// Maps lat/lng to pixels relative to the view center, y pointing up. The
/// x offset is wrapped so a point is drawn on the copy of the world nearest
/// the center.
struct Projector {
    center: (f64, f64),
    zoom: f64,
    world: f64,
}

impl Projector {
    fn new(view: ViewState) -> Self {
        let zoom = view.zoom;
        let center = project(view.center(), zoom).unwrap_or((0.0, 0.0));
        Self { center, zoom, world: world_size(zoom) }
    }

    fn point(&self, ll: LatLng) -> Option<(f64, f64)> {
        let (x, y) = project(ll, self.zoom).ok()?;
        let mut dx = x - self.center.0;
        if dx > self.world / 2.0 {
            dx -= self.world;
        } else if dx < -self.world / 2.0 {
            dx += self.world;
        }
        Some((dx, self.center.1 - y))
    }

    fn coord(&self, c: Coord<f64>) -> Option<(f64, f64)> {
        self.point(LatLng::new(c.y, c.x))
    }
}

fn ring_coords(ls: &LineString<f64>) -> Vec<Coord<f64>> {
    ls.0.clone()
}

fn polygon_rings(poly: &Polygon<f64>, out: &mut Vec<Vec<Coord<f64>>>) {
    out.push(ring_coords(poly.exterior()));
    out.extend(poly.interiors().iter().map(ring_coords));
}

fn collect_rings(geometry: &Geometry<f64>, out: &mut Vec<Vec<Coord<f64>>>) {
    match geometry {
        Geometry::LineString(ls) => out.push(ring_coords(ls)),
        Geometry::MultiLineString(mls) => out.extend(mls.0.iter().map(ring_coords)),
        Geometry::Polygon(p) => polygon_rings(p, out),
        Geometry::MultiPolygon(mp) => mp.0.iter().for_each(|p| polygon_rings(p, out)),
        _ => {}
    }
}

fn points_of(geometry: &Geometry<f64>) -> Vec<Coord<f64>> {
    match geometry {
        Geometry::Point(p) => vec![p.0],
        Geometry::MultiPoint(mp) => mp.0.iter().map(|p| p.0).collect(),
        _ => Vec::new(),
    }
}

/// `#rrggbb` to a terminal color, white when unparseable.
fn parse_color(hex: &str) -> Color {
    let digits = hex.trim_start_matches('#');
    if digits.len() == 6 {
        if let Ok(v) = u32::from_str_radix(digits, 16) {
            return Color::Rgb((v >> 16) as u8, (v >> 8) as u8, v as u8);
        }
    }
    Color::White
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_colors() {
        assert_eq!(parse_color("#e4572e"), Color::Rgb(0xe4, 0x57, 0x2e));
        assert_eq!(parse_color("teal"), Color::White);
    }

    #[test]
    fn points_across_the_antimeridian_stay_near_the_center() {
        let projector = Projector::new(ViewState { longitude: 179.5, latitude: 0.0, zoom: 4.0 });
        let (x, _) = projector.point(LatLng::new(0.0, -179.5)).unwrap();
        assert!(x > 0.0 && x < 100.0, "x = {x}");
    }

    fn leaf(index: usize, lat: Option<f64>) -> deal_atlas::cluster::Leaf {
        let deal: deal_atlas::deal::Deal = serde_json::from_value(serde_json::json!({
            "id": format!("d{index}"),
            "latitude": lat,
            "longitude": -84.388,
            "stage": "screening",
            "askPrice": 1.0,
            "opportunityScore": 1.0,
            "supplyRiskFlag": false,
            "strategy": "core",
            "source": "broker",
        }))
        .unwrap();
        deal_atlas::cluster::Leaf { index, deal: std::sync::Arc::new(deal) }
    }

    #[test]
    fn only_placeable_markers_are_counted() {
        let view = ViewState { latitude: 33.749, longitude: -84.388, zoom: 10.0 };
        let visible = VisibleSet {
            leaves: vec![leaf(0, Some(33.749)), leaf(1, None)],
            ..Default::default()
        };
        let map = MapView::new(view, (80, 24), &visible, &[], None);
        assert_eq!(map.feature_count(), 1);
    }

    #[test]
    fn marker_grows_with_count() {
        assert!(marker_radius(1000) > marker_radius(10));
        assert_eq!(marker_radius(0), MIN_RADIUS);
    }
}
