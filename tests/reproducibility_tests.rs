mod common;

use std::sync::Arc;

use aq_forecast::engine::ForecastEngine;
use aq_forecast::model::entity::Entity;
use aq_forecast::registry::VersionId;
use aq_forecast::reproducibility::{derive_seed, entity_seed, SEED_MODULUS};
use tokio::sync::watch;

use common::{fast_config, hour, sinusoid_series, source_with};

#[test]
/// Verifies the seed derivation against known digests so seeds stay stable
/// across releases.
fn derive_seed_matches_known_values() {
    assert_eq!(derive_seed("dongguan", 42), 853_119_408);
    assert_eq!(derive_seed("beijing", 42), 1_326_766_153);
    for id in ["guangzhou", "shenzhen", "hongkong", "macao"] {
        assert!(derive_seed(id, 42) < SEED_MODULUS);
    }
}

#[test]
fn configured_seed_wins() {
    let mut entity = Entity::new("dongguan", "Dongguan");
    assert_eq!(entity_seed(&entity, 42), 853_119_408);
    entity.seed = Some(1001);
    assert_eq!(entity_seed(&entity, 42), 1001);
}

#[test]
/// Verifies end-to-end reproducibility: two engines with separate registries
/// train bit-identical models for the same entity and data.
fn independent_engines_train_identical_models() {
    let (_tx, rx) = watch::channel(false);
    let source = source_with("alpha", sinusoid_series(0, 240, 3));

    let mut artifacts = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let engine = ForecastEngine::new(fast_config(dir.path()), Arc::clone(&source)).unwrap();
        let outcome = engine.train("alpha", hour(239), &rx).expect("train should succeed");
        assert_eq!(outcome.summary.seed, derive_seed("alpha", 42));
        let version = VersionId::parse(&outcome.version).unwrap();
        artifacts.push(engine.registry().load("alpha", version).unwrap());
    }

    assert_eq!(artifacts[0].artifact.network, artifacts[1].artifact.network);
    assert_eq!(artifacts[0].artifact.offset, artifacts[1].artifact.offset);
    assert_eq!(artifacts[0].scaler, artifacts[1].scaler);
}
