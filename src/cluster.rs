//! Multi-resolution point clustering.
//!
//! Points are projected once into the unit square. Level `max_zoom + 1`
//! holds the raw points; every level below is produced by greedily merging
//! the nodes of the level above that lie within `radius_px` of each other at
//! that zoom. Each level keeps its own R-tree, so a viewport query is an
//! envelope lookup on precomputed nodes and never re-clusters.

use rstar::{AABB, RTree, primitives::GeomWithData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::deal::{Deal, LatLng};
use crate::error::IndexError;
use crate::projection::{self, BBox};

/// Highest zoom the index accepts; cluster ids store zooms in a byte.
pub const MAX_SUPPORTED_ZOOM: u8 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterOptions {
    /// Merge distance in pixels at the zoom being clustered.
    pub radius_px: f64,
    /// Tile extent the radius is measured against.
    pub extent: f64,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            radius_px: 60.0,
            extent: projection::TILE_SIZE,
            min_zoom: 0,
            max_zoom: 16,
        }
    }
}

impl ClusterOptions {
    pub fn validate(&self) -> Result<(), IndexError> {
        if !(self.radius_px.is_finite() && self.radius_px > 0.0) {
            return Err(IndexError::InvalidOptions(format!(
                "radius_px must be positive, got {}",
                self.radius_px
            )));
        }
        if !(self.extent.is_finite() && self.extent > 0.0) {
            return Err(IndexError::InvalidOptions(format!(
                "extent must be positive, got {}",
                self.extent
            )));
        }
        if self.min_zoom > self.max_zoom {
            return Err(IndexError::InvalidOptions(format!(
                "min_zoom {} is above max_zoom {}",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(IndexError::InvalidOptions(format!(
                "max_zoom {} exceeds {}",
                self.max_zoom, MAX_SUPPORTED_ZOOM
            )));
        }
        Ok(())
    }
}

/// Identifies a cluster within one index build: the zoom it was formed at
/// and the slot of its first member in the level above.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId {
    pub zoom: u8,
    pub slot: u32,
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}:{}", self.zoom, self.slot)
    }
}

/// A node in the hierarchy: either a cluster or a single deal, the latter
/// referred to by its position in the index's point list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeId {
    Leaf(usize),
    Cluster(ClusterId),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: ClusterId,
    pub centroid: LatLng,
    pub point_count: usize,
    pub child_ids: Vec<NodeId>,
    pub zoom_created: u8,
    /// Sum of member ask prices.
    pub total_value: f64,
    /// Sum of member opportunity scores.
    pub score_sum: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Leaf {
    pub index: usize,
    pub deal: Arc<Deal>,
}

impl Leaf {
    pub fn position(&self) -> Option<LatLng> {
        self.deal.location()
    }
}

/// What a query hands to the render layer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapFeature {
    Cluster(Cluster),
    Leaf(Leaf),
}

impl MapFeature {
    pub fn node_id(&self) -> NodeId {
        match self {
            MapFeature::Cluster(c) => NodeId::Cluster(c.id),
            MapFeature::Leaf(l) => NodeId::Leaf(l.index),
        }
    }

    pub fn point_count(&self) -> usize {
        match self {
            MapFeature::Cluster(c) => c.point_count,
            MapFeature::Leaf(_) => 1,
        }
    }

    pub fn position(&self) -> LatLng {
        match self {
            MapFeature::Cluster(c) => c.centroid,
            // Leaves only enter the index with a valid location.
            MapFeature::Leaf(l) => l.position().unwrap_or(LatLng::new(0.0, 0.0)),
        }
    }

    pub fn total_value(&self) -> f64 {
        match self {
            MapFeature::Cluster(c) => c.total_value,
            MapFeature::Leaf(l) => l.deal.ask_price,
        }
    }

    pub fn score_sum(&self) -> f64 {
        match self {
            MapFeature::Cluster(c) => c.score_sum,
            MapFeature::Leaf(l) => l.deal.opportunity_score,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Node {
    x: f64,
    y: f64,
    id: NodeId,
    count: usize,
    total_value: f64,
    score_sum: f64,
}

#[derive(Clone, Debug)]
struct ClusterRecord {
    x: f64,
    y: f64,
    count: usize,
    total_value: f64,
    score_sum: f64,
    children: Vec<NodeId>,
}

/// Nodes of one zoom, indexed by slot.
#[derive(Debug)]
struct Level {
    nodes: Vec<Node>,
    tree: RTree<GeomWithData<[f64; 2], usize>>,
}

impl Level {
    fn new(nodes: Vec<Node>) -> Self {
        let entries = nodes
            .iter()
            .enumerate()
            .map(|(slot, n)| GeomWithData::new([n.x, n.y], slot))
            .collect();
        Self { nodes, tree: RTree::bulk_load(entries) }
    }

    /// Slots within `r` of `(x, y)`, ascending.
    fn within(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let mut hits: Vec<usize> = self
            .tree
            .locate_within_distance([x, y], r * r)
            .map(|e| e.data)
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Slots inside the rectangle, edges included, ascending.
    fn range(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<usize> {
        let envelope = AABB::from_corners([min_x, min_y], [max_x, max_y]);
        let mut hits: Vec<usize> = self.tree.locate_in_envelope(&envelope).map(|e| e.data).collect();
        hits.sort_unstable();
        hits
    }
}

/// Immutable cluster hierarchy over one filtered point set.
///
/// Rebuild it when the point set changes; pan and zoom only call [`query`].
///
/// [`query`]: ClusterIndex::query
#[derive(Debug)]
pub struct ClusterIndex {
    options: ClusterOptions,
    points: Vec<Arc<Deal>>,
    /// `levels[z - min_zoom]` for `z` in `min_zoom..=max_zoom + 1`.
    levels: Vec<Level>,
    clusters: BTreeMap<ClusterId, ClusterRecord>,
    unlocated: usize,
    invalid: usize,
}

impl ClusterIndex {
    pub fn build(
        deals: impl IntoIterator<Item = Arc<Deal>>,
        options: ClusterOptions,
    ) -> Result<Self, IndexError> {
        options.validate()?;
        let started = Instant::now();

        let mut points = Vec::new();
        let mut leaves = Vec::new();
        let (mut unlocated, mut invalid) = (0, 0);
        for deal in deals {
            let projected = deal
                .location()
                .ok_or_else(|| "missing or invalid coordinates".to_string())
                .and_then(|ll| projection::project_unit(ll).map_err(|e| e.to_string()));
            let (x, y) = match projected {
                Ok(p) if deal.ask_price.is_finite() && deal.opportunity_score.is_finite() => p,
                Ok(_) => {
                    tracing::warn!(deal = %deal.id, "excluding deal with non-finite price or score");
                    invalid += 1;
                    continue;
                }
                Err(reason) => {
                    tracing::debug!(deal = %deal.id, %reason, "excluding deal from spatial index");
                    unlocated += 1;
                    continue;
                }
            };
            leaves.push(Node {
                x,
                y,
                id: NodeId::Leaf(points.len()),
                count: 1,
                total_value: deal.ask_price,
                score_sum: deal.opportunity_score,
            });
            points.push(deal);
        }

        let mut clusters = BTreeMap::new();
        let mut levels = Vec::with_capacity(usize::from(options.max_zoom - options.min_zoom) + 2);
        let mut above = Level::new(leaves);
        for zoom in (options.min_zoom..=options.max_zoom).rev() {
            let nodes = merge_level(&above, zoom, &options, &mut clusters);
            levels.push(std::mem::replace(&mut above, Level::new(nodes)));
        }
        levels.push(above);
        levels.reverse();

        tracing::info!(
            points = points.len(),
            unlocated,
            invalid,
            clusters = clusters.len(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0,
            "cluster index built"
        );

        Ok(Self { options, points, levels, clusters, unlocated, invalid })
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Number of points that made it into the index.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Input deals left out for missing or out-of-range coordinates.
    pub fn unlocated(&self) -> usize {
        self.unlocated
    }

    /// Input deals left out for a non-finite price or score.
    pub fn invalid(&self) -> usize {
        self.invalid
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Clamps a zoom into the range the index has levels for. `None` for NaN.
    pub fn level_zoom(&self, zoom: f64) -> Option<u8> {
        if zoom.is_nan() {
            return None;
        }
        let lo = f64::from(self.options.min_zoom);
        let hi = f64::from(self.options.max_zoom) + 1.0;
        Some(zoom.floor().clamp(lo, hi) as u8)
    }

    fn level(&self, zoom: u8) -> &Level {
        &self.levels[usize::from(zoom - self.options.min_zoom)]
    }

    /// Top-level nodes at `zoom` whose position falls inside `bbox`.
    pub fn query(&self, bbox: &BBox, zoom: f64) -> Vec<MapFeature> {
        let Some(z) = self.level_zoom(zoom) else {
            tracing::warn!(zoom, "ignoring query with NaN zoom");
            return Vec::new();
        };
        let level = self.level(z);
        let mut hits = Vec::new();
        for (min_x, min_y, max_x, max_y) in bbox.unit_ranges() {
            hits.extend(level.range(min_x, min_y, max_x, max_y));
        }
        hits.sort_unstable();
        hits.dedup();
        hits.into_iter().map(|i| self.feature_for(&level.nodes[i])).collect()
    }

    /// Every node at `zoom`, regardless of position.
    pub fn all_at(&self, zoom: f64) -> Vec<MapFeature> {
        self.query(&BBox::WORLD, zoom)
    }

    pub fn cluster(&self, id: ClusterId) -> Result<Cluster, IndexError> {
        let record = self.record(id)?;
        Ok(self.cluster_from(id, record))
    }

    /// Direct children of a cluster.
    pub fn children(&self, id: ClusterId) -> Result<Vec<MapFeature>, IndexError> {
        let record = self.record(id)?;
        record.children.iter().map(|child| self.feature(*child)).collect()
    }

    /// Original deals under a cluster, depth-first in merge order.
    pub fn leaves(&self, id: ClusterId, limit: usize, offset: usize) -> Result<Vec<Leaf>, IndexError> {
        self.record(id)?;
        let mut out = Vec::new();
        let mut skipped = 0;
        let mut stack = vec![NodeId::Cluster(id)];
        while let Some(node) = stack.pop() {
            if out.len() >= limit {
                break;
            }
            match node {
                NodeId::Leaf(index) => {
                    if skipped < offset {
                        skipped += 1;
                    } else {
                        out.push(Leaf { index, deal: Arc::clone(&self.points[index]) });
                    }
                }
                NodeId::Cluster(cid) => {
                    let record = self.record(cid)?;
                    if skipped + record.count <= offset {
                        skipped += record.count;
                        continue;
                    }
                    stack.extend(record.children.iter().rev());
                }
            }
        }
        Ok(out)
    }

    /// Zoom at which the cluster first shows up as two or more nodes.
    pub fn expansion_zoom(&self, id: ClusterId) -> Result<u8, IndexError> {
        self.record(id)?;
        // A cluster always merges at least two nodes from the level directly
        // above the one it was formed at.
        Ok(id.zoom + 1)
    }

    pub fn feature(&self, id: NodeId) -> Result<MapFeature, IndexError> {
        match id {
            NodeId::Leaf(index) => self
                .points
                .get(index)
                .map(|deal| MapFeature::Leaf(Leaf { index, deal: Arc::clone(deal) }))
                .ok_or_else(|| IndexError::UnknownCluster(format!("leaf {index}"))),
            NodeId::Cluster(cid) => self.cluster(cid).map(MapFeature::Cluster),
        }
    }

    fn record(&self, id: ClusterId) -> Result<&ClusterRecord, IndexError> {
        self.clusters
            .get(&id)
            .ok_or_else(|| IndexError::UnknownCluster(id.to_string()))
    }

    fn cluster_from(&self, id: ClusterId, record: &ClusterRecord) -> Cluster {
        Cluster {
            id,
            centroid: LatLng::new(projection::y_lat(record.y), projection::x_lng(record.x)),
            point_count: record.count,
            child_ids: record.children.clone(),
            zoom_created: id.zoom,
            total_value: record.total_value,
            score_sum: record.score_sum,
        }
    }

    fn feature_for(&self, node: &Node) -> MapFeature {
        match node.id {
            NodeId::Leaf(index) => MapFeature::Leaf(Leaf { index, deal: Arc::clone(&self.points[index]) }),
            NodeId::Cluster(cid) => {
                let record = &self.clusters[&cid];
                MapFeature::Cluster(self.cluster_from(cid, record))
            }
        }
    }
}

/// Greedy merge of the level above into the nodes of `zoom`.
///
/// Nodes are visited in slot order and neighbors are taken in ascending slot
/// order, so identical input always yields identical clusters.
fn merge_level(
    above: &Level,
    zoom: u8,
    options: &ClusterOptions,
    clusters: &mut BTreeMap<ClusterId, ClusterRecord>,
) -> Vec<Node> {
    let r = options.radius_px / (options.extent * 2f64.powi(i32::from(zoom)));
    let mut taken = vec![false; above.nodes.len()];
    let mut out = Vec::with_capacity(above.nodes.len());

    for (slot, node) in above.nodes.iter().enumerate() {
        if taken[slot] {
            continue;
        }
        taken[slot] = true;

        let neighbors: Vec<usize> = above
            .within(node.x, node.y, r)
            .into_iter()
            .filter(|&j| !taken[j])
            .collect();
        if neighbors.is_empty() {
            out.push(*node);
            continue;
        }

        let mut count = node.count;
        let mut wx = node.x * node.count as f64;
        let mut wy = node.y * node.count as f64;
        let mut total_value = node.total_value;
        let mut score_sum = node.score_sum;
        let mut children = Vec::with_capacity(neighbors.len() + 1);
        children.push(node.id);
        for j in neighbors {
            taken[j] = true;
            let b = &above.nodes[j];
            wx += b.x * b.count as f64;
            wy += b.y * b.count as f64;
            count += b.count;
            total_value += b.total_value;
            score_sum += b.score_sum;
            children.push(b.id);
        }

        let id = ClusterId { zoom, slot: slot as u32 };
        let (x, y) = (wx / count as f64, wy / count as f64);
        clusters.insert(id, ClusterRecord { x, y, count, total_value, score_sum, children });
        out.push(Node { x, y, id: NodeId::Cluster(id), count, total_value, score_sum });
    }
    out
}
