use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use anyhow::{anyhow, Result};

use manta_edge::reid::LinearIndex;
use manta_edge::{
    FeatureExtractor, FeatureVector, Frame, HistogramExtractor, IdentityMatcher, ManualClock,
    MatcherConfig,
};

const FEATURE_SIZE: usize = 128;

/// Maps a crop's first pixel value to a prepared embedding.
struct TableExtractor {
    table: HashMap<u8, Vec<f32>>,
}

impl FeatureExtractor for TableExtractor {
    fn name(&self) -> &'static str {
        "table"
    }

    fn extract(&self, crop: &Frame, _feature_size: usize) -> Result<FeatureVector> {
        let key = crop.pixels()[0];
        self.table
            .get(&key)
            .map(|v| FeatureVector::new(v.clone()))
            .ok_or_else(|| anyhow!("no embedding for crop {}", key))
    }
}

fn solid(value: u8) -> Frame {
    Frame::from_rgb(vec![value; 6 * 6 * 3], 6, 6).unwrap()
}

fn coloured(r: u8, g: u8, b: u8) -> Frame {
    let pixels = [r, g, b].repeat(8 * 8);
    Frame::from_rgb(pixels, 8, 8).unwrap()
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; FEATURE_SIZE];
    v[i] = 1.0;
    v
}

/// Unit vector whose cosine similarity with `axis(0)` is `cos`.
fn at_angle(cos: f32) -> Vec<f32> {
    let mut v = vec![0.0; FEATURE_SIZE];
    v[0] = cos;
    v[1] = (1.0 - cos * cos).sqrt();
    v
}

fn matcher_with(
    config: MatcherConfig,
    table: Vec<(u8, Vec<f32>)>,
    clock: Arc<ManualClock>,
) -> IdentityMatcher {
    IdentityMatcher::with_parts(
        config,
        Arc::new(TableExtractor {
            table: table.into_iter().collect(),
        }),
        clock,
        Box::new(LinearIndex::new()),
    )
    .unwrap()
}

#[test]
fn similarity_threshold_is_inclusive_of_close_matches() {
    for (threshold, expect_new) in [(0.6, false), (0.65, true)] {
        let config = MatcherConfig {
            feature_size: FEATURE_SIZE,
            similarity_threshold: threshold,
            ..MatcherConfig::default()
        };
        let matcher = matcher_with(
            config,
            vec![(1, axis(0)), (2, at_angle(0.62))],
            Arc::new(ManualClock::new()),
        );

        let first = matcher.process(&solid(1)).unwrap();
        assert!(first.is_new);
        let second = matcher.process(&solid(2)).unwrap();
        assert_eq!(second.is_new, expect_new, "threshold {}", threshold);
        if !expect_new {
            assert_eq!(second.id, first.id);
            let similarity = second.similarity.unwrap();
            assert!((similarity - 0.62).abs() < 1e-4);
        }
    }
}

#[test]
fn best_match_wins_over_first_match() {
    let config = MatcherConfig {
        feature_size: FEATURE_SIZE,
        similarity_threshold: 0.8,
        ..MatcherConfig::default()
    };
    // 1 and 2 are 60 degrees apart; 3 sits at 35 degrees, within threshold
    // of both but closer to 2.
    let matcher = matcher_with(
        config,
        vec![(1, axis(0)), (2, at_angle(0.5)), (3, at_angle(0.819_15))],
        Arc::new(ManualClock::new()),
    );

    let first = matcher.process(&solid(1)).unwrap();
    let second = matcher.process(&solid(2)).unwrap();
    assert!(first.is_new);
    assert!(second.is_new);
    assert_eq!(matcher.known_count(), 2);

    let query = matcher.process(&solid(3)).unwrap();
    assert!(!query.is_new);
    assert_eq!(query.id, second.id);
    assert!(query.similarity.unwrap() > 0.9);
}

#[test]
fn identity_expires_after_retention() {
    let clock = Arc::new(ManualClock::new());
    let retention = Duration::from_secs(3600);
    let matcher = IdentityMatcher::with_parts(
        MatcherConfig {
            retention,
            ..MatcherConfig::default()
        },
        Arc::new(HistogramExtractor::new()),
        clock.clone(),
        Box::new(LinearIndex::new()),
    )
    .unwrap();

    let crop = coloured(200, 30, 30);
    assert!(matcher.process(&crop).unwrap().is_new);

    clock.advance(Duration::from_secs(1800));
    assert!(!matcher.process(&crop).unwrap().is_new);

    // Retention counts from the first sighting, not the latest.
    clock.advance(Duration::from_secs(1801));
    assert!(matcher.process(&crop).unwrap().is_new);
    assert_eq!(matcher.known_count(), 1);
}

#[test]
fn different_people_are_distinct() {
    let matcher =
        IdentityMatcher::new(MatcherConfig::default(), Arc::new(HistogramExtractor::new()))
            .unwrap();
    let red = matcher.process(&coloured(255, 0, 0)).unwrap();
    let blue = matcher.process(&coloured(0, 0, 255)).unwrap();
    assert!(red.is_new);
    assert!(blue.is_new);
    assert_ne!(red.id, blue.id);
    assert_eq!(matcher.known_count(), 2);
}

#[test]
fn capacity_evicts_oldest_identity() {
    let max = 5;
    let config = MatcherConfig {
        feature_size: FEATURE_SIZE,
        max_stored_vectors: max,
        ..MatcherConfig::default()
    };
    let table = (0..=max).map(|i| (i as u8, axis(i))).collect();
    let matcher = matcher_with(config, table, Arc::new(ManualClock::new()));

    for i in 0..=max {
        assert!(matcher.process(&solid(i as u8)).unwrap().is_new);
        assert!(matcher.known_count() <= max);
    }
    assert_eq!(matcher.known_count(), max);

    // The first identity was evicted to make room for the last one.
    assert!(matcher.process(&solid(0)).unwrap().is_new);
    // The newest survives.
    assert!(!matcher.process(&solid(max as u8)).unwrap().is_new);
}

#[test]
fn concurrent_first_sightings_register_once() {
    let matcher = Arc::new(
        IdentityMatcher::new(MatcherConfig::default(), Arc::new(HistogramExtractor::new()))
            .unwrap(),
    );
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let matcher = matcher.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                matcher.process(&coloured(10, 180, 90)).unwrap().is_new
            })
        })
        .collect();

    let new_count = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|is_new| *is_new)
        .count();
    assert_eq!(new_count, 1);
    assert_eq!(matcher.known_count(), 1);
}
