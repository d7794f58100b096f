use std::sync::Arc;

use deal_atlas::{
    BBox, ClusterOptions, Deal, FilterState, LatLng, MapEngine, MapFeature, PriceRange, RadiusFilter, Stage,
    Viewport,
    cluster::ClusterIndex,
    data::{DEALS_FILE, DealCache},
    filter::METERS_PER_MILE,
};
use geo::{Destination, Haversine};
use serde_json::json;

fn deal(id: &str, lat: f64, lng: f64, price: f64, score: f64) -> Deal {
    serde_json::from_value(json!({
        "id": id,
        "latitude": lat,
        "longitude": lng,
        "stage": "screening",
        "askPrice": price,
        "opportunityScore": score,
        "supplyRiskFlag": false,
        "strategy": "value-add",
        "source": "broker",
    }))
    .unwrap()
}

fn arcs(deals: Vec<Deal>) -> Vec<Arc<Deal>> {
    deals.into_iter().map(Arc::new).collect()
}

#[test]
fn stacked_deals_collapse_into_one_cluster_with_aggregates() {
    let deals = vec![
        deal("a", 33.749, -84.388, 1_000_000.0, 80.0),
        deal("b", 33.749, -84.388, 2_000_000.0, 90.0),
        deal("c", 33.749, -84.388, 3_000_000.0, 100.0),
    ];
    let mut engine = MapEngine::new(ClusterOptions::default()).unwrap();
    engine.set_deals(arcs(deals));

    let visible = engine.on_viewport_change(Viewport::new(BBox::WORLD, 3.0)).unwrap();
    assert_eq!(visible.clusters.len(), 1);
    assert!(visible.leaves.is_empty());

    let cluster = &visible.clusters[0];
    assert_eq!(cluster.point_count, 3);
    assert!((cluster.centroid.lat - 33.749).abs() < 1e-9);
    assert!((cluster.centroid.lng + 84.388).abs() < 1e-9);
    assert_eq!(visible.summary.total_value, 6_000_000.0);
    assert_eq!(visible.summary.avg_score, Some(90.0));
}

#[test]
fn min_score_keeps_only_deals_at_or_above_it() {
    let deals: Vec<Deal> = [60.0, 70.0, 85.0, 90.0, 95.0]
        .iter()
        .enumerate()
        .map(|(i, s)| deal(&format!("d{i}"), 30.0 + i as f64, -90.0, 1.0, *s))
        .collect();
    let mut engine = MapEngine::new(ClusterOptions::default()).unwrap();
    engine.set_deals(arcs(deals));
    let problems = engine.set_filter_state(FilterState { min_score: Some(85.0), ..Default::default() });
    assert!(problems.is_empty());

    engine.refresh().unwrap();
    assert_eq!(engine.stats().passing, 3);
}

#[test]
fn radius_filter_is_measured_along_the_great_circle() {
    let center = LatLng::new(33.749, -84.388);
    let at = |miles: f64| {
        let p = Haversine.destination(center.to_point(), 90.0, miles * METERS_PER_MILE);
        LatLng::from(p)
    };
    let near = at(5.0);
    let far = at(15.0);
    let deals = vec![
        deal("near", near.lat, near.lng, 1.0, 50.0),
        deal("far", far.lat, far.lng, 1.0, 50.0),
    ];

    let filter = FilterState { radius: Some(RadiusFilter { center, miles: 10.0 }), ..Default::default() };
    let passing: Vec<&str> = deals.iter().filter(|d| filter.matches(d)).map(|d| d.id.as_str()).collect();
    assert_eq!(passing, ["near"]);
}

#[test]
fn filters_combine_with_and() {
    let mut a = deal("a", 33.7, -84.4, 500_000.0, 90.0);
    a.stage = Stage::Closing;
    let mut b = deal("b", 33.8, -84.3, 5_000_000.0, 90.0);
    b.stage = Stage::Closing;
    let c = deal("c", 33.9, -84.2, 500_000.0, 90.0);

    let filter = FilterState {
        stages: [Stage::Closing].into(),
        price_range: Some(PriceRange { min: None, max: Some(1_000_000.0) }),
        ..Default::default()
    };
    let passing: Vec<&str> = [&a, &b, &c].iter().filter(|d| filter.matches(d)).map(|d| d.id.as_str()).collect();
    assert_eq!(passing, ["a"]);
}

#[test]
fn every_passing_deal_is_counted_exactly_once_at_every_zoom() {
    let deals: Vec<Deal> = (0..300)
        .map(|i| {
            let lat = 25.0 + f64::from(i % 20) * 1.1;
            let lng = -120.0 + f64::from(i / 20) * 3.3;
            deal(&format!("d{i}"), lat, lng, 1000.0, f64::from(i % 100))
        })
        .collect();
    let index = ClusterIndex::build(arcs(deals), ClusterOptions::default()).unwrap();
    for zoom in 0..=17 {
        let features = index.query(&BBox::WORLD, f64::from(zoom));
        let total: usize = features.iter().map(MapFeature::point_count).sum();
        assert_eq!(total, 300, "zoom {zoom}");
    }
}

#[test]
fn rebuilding_from_the_same_input_gives_the_same_clusters() {
    let deals: Vec<Deal> = (0..120)
        .map(|i| deal(&format!("d{i}"), 40.0 + f64::from(i % 11) * 0.07, -74.0 + f64::from(i % 13) * 0.05, 1.0, 1.0))
        .collect();
    let first = ClusterIndex::build(arcs(deals.clone()), ClusterOptions::default()).unwrap();
    let second = ClusterIndex::build(arcs(deals), ClusterOptions::default()).unwrap();
    for zoom in [2.0, 6.0, 9.0, 12.0] {
        assert_eq!(first.query(&BBox::WORLD, zoom), second.query(&BBox::WORLD, zoom));
    }
}

#[test]
fn feed_on_disk_drives_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let feed = vec![
        deal("a", 33.749, -84.388, 1.0, 10.0),
        deal("b", 47.6, -122.3, 2.0, 20.0),
    ];
    std::fs::write(dir.path().join(DEALS_FILE), serde_json::to_vec(&feed).unwrap()).unwrap();

    let cache = DealCache::new(dir.path()).unwrap();
    let mut engine = MapEngine::new(ClusterOptions::default()).unwrap();
    engine.set_deals(cache.deals());

    let southeast = Viewport::new(BBox::new(-90.0, 30.0, -80.0, 37.0), 8.0);
    let visible = engine.on_viewport_change(southeast).unwrap();
    assert_eq!(visible.summary.visible_count, 1);
    assert_eq!(visible.leaves[0].deal.id, "a");
}
