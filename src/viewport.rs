use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, ClusterId, ClusterIndex, Leaf, MapFeature};
use crate::error::IndexError;
use crate::projection::BBox;
use crate::view_state::ViewState;

/// The visible map region.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub bbox: BBox,
    pub zoom: f64,
}

impl Viewport {
    pub const fn new(bbox: BBox, zoom: f64) -> Self {
        Self { bbox, zoom }
    }
}

/// Everything the render layer needs for one viewport.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleSet {
    pub clusters: Vec<Cluster>,
    pub leaves: Vec<Leaf>,
    pub summary: Summary,
}

impl VisibleSet {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.leaves.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.clusters.len() + self.leaves.len()
    }
}

/// Aggregates over every deal represented in the viewport, cluster members
/// included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub visible_count: usize,
    pub total_value: f64,
    /// `None` when nothing is visible.
    pub avg_score: Option<f64>,
}

impl Summary {
    fn from_features(features: &[MapFeature]) -> Self {
        let mut summary = Summary::default();
        let mut score_sum = 0.0;
        for feature in features {
            summary.visible_count += feature.point_count();
            summary.total_value += feature.total_value();
            score_sum += feature.score_sum();
        }
        if summary.visible_count > 0 {
            summary.avg_score = Some(score_sum / summary.visible_count as f64);
        }
        summary
    }
}

/// Splits the index's nodes for `viewport` into clusters and leaves and
/// computes the summary.
pub fn evaluate(viewport: &Viewport, index: &ClusterIndex) -> VisibleSet {
    let features = index.query(&viewport.bbox, viewport.zoom);
    let summary = Summary::from_features(&features);
    let mut visible = VisibleSet { summary, ..Default::default() };
    for feature in features {
        match feature {
            MapFeature::Cluster(c) => visible.clusters.push(c),
            MapFeature::Leaf(l) => visible.leaves.push(l),
        }
    }
    visible
}

/// Where the map should move when a cluster is clicked: its centroid at the
/// zoom where it breaks apart.
pub fn expansion_target(index: &ClusterIndex, id: ClusterId) -> Result<ViewState, IndexError> {
    let cluster = index.cluster(id)?;
    let zoom = index.expansion_zoom(id)?;
    Ok(ViewState {
        latitude: cluster.centroid.lat,
        longitude: cluster.centroid.lng,
        zoom: f64::from(zoom),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterOptions;
    use crate::deal::fixtures::deal;
    use std::sync::Arc;

    fn atlanta_trio() -> ClusterIndex {
        let deals = [(1_000_000.0, 80.0), (2_000_000.0, 90.0), (3_000_000.0, 100.0)]
            .iter()
            .enumerate()
            .map(|(i, (price, score))| {
                let mut d = deal(&format!("d{i}"), 33.749, -84.388);
                d.ask_price = *price;
                d.opportunity_score = *score;
                Arc::new(d)
            })
            .collect::<Vec<_>>();
        ClusterIndex::build(deals, ClusterOptions::default()).unwrap()
    }

    #[test]
    fn co_located_deals_summarize_as_one_cluster() {
        let index = atlanta_trio();
        let viewport = Viewport::new(BBox::new(-90.0, 30.0, -80.0, 36.0), 4.0);
        let visible = evaluate(&viewport, &index);
        assert_eq!(visible.clusters.len(), 1);
        assert!(visible.leaves.is_empty());
        let cluster = &visible.clusters[0];
        assert_eq!(cluster.point_count, 3);
        assert!((cluster.centroid.lat - 33.749).abs() < 1e-9);
        assert!((cluster.centroid.lng + 84.388).abs() < 1e-9);
        assert_eq!(visible.summary.visible_count, 3);
        assert_eq!(visible.summary.total_value, 6_000_000.0);
        assert_eq!(visible.summary.avg_score, Some(90.0));
    }

    #[test]
    fn empty_viewport_has_no_average() {
        let index = atlanta_trio();
        let viewport = Viewport::new(BBox::new(0.0, 0.0, 10.0, 10.0), 4.0);
        let visible = evaluate(&viewport, &index);
        assert!(visible.is_empty());
        assert_eq!(visible.summary, Summary::default());
    }

    #[test]
    fn pole_and_antimeridian_viewports_do_not_panic() {
        let index = atlanta_trio();
        for bbox in [
            BBox::new(170.0, -95.0, -170.0, 95.0),
            BBox::new(-720.0, -90.0, 720.0, 90.0),
            BBox::new(f64::NAN, 0.0, 0.0, 0.0),
        ] {
            let _ = evaluate(&Viewport::new(bbox, 2.0), &index);
        }
        let world = evaluate(&Viewport::new(BBox::new(-720.0, -90.0, 720.0, 90.0), 2.0), &index);
        assert_eq!(world.summary.visible_count, 3);
    }

    #[test]
    fn cluster_click_targets_the_split_zoom() {
        let deals: Vec<_> = [(33.70, -84.40), (33.80, -84.30), (33.75, -84.35)]
            .iter()
            .enumerate()
            .map(|(i, (lat, lng))| Arc::new(deal(&format!("d{i}"), *lat, *lng)))
            .collect();
        let index = ClusterIndex::build(deals, ClusterOptions::default()).unwrap();
        let visible = evaluate(&Viewport::new(BBox::WORLD, 3.0), &index);
        let cluster = &visible.clusters[0];
        let target = expansion_target(&index, cluster.id).unwrap();
        assert_eq!(target.zoom, f64::from(cluster.zoom_created + 1));
        assert_eq!(target.latitude, cluster.centroid.lat);
        assert_eq!(target.longitude, cluster.centroid.lng);
    }
}
