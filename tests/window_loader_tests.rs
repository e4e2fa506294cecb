mod common;

use aq_forecast::config::{EngineConfig, QualityBounds};
use aq_forecast::error::EngineError;
use aq_forecast::window::WindowLoader;
use chrono::Duration;

use common::{clean_series, hour, observation, source_with};

fn engine(window_hours: usize, max_gap_hours: usize) -> EngineConfig {
    EngineConfig {
        window_hours,
        horizon_hours: 4,
        max_gap_hours,
        rolling_window: 3,
    }
}

#[test]
/// Verifies the happy path: exactly `window_hours` contiguous observations
/// ending at the hour containing `end`.
fn load_returns_contiguous_window_ending_at_end_hour() {
    let source = source_with("alpha", clean_series(0, 72));
    let loader = WindowLoader::new(source, &engine(48, 2), QualityBounds::default());

    let window = loader
        .load("alpha", hour(60) + Duration::minutes(35))
        .expect("load should succeed");

    assert_eq!(window.len(), 48);
    assert_eq!(window.end, hour(60));
    assert_eq!(window.start(), hour(13));
    assert_eq!(window.repaired_hours, 0);
    for pair in window.observations.windows(2) {
        assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::hours(1));
    }
}

#[test]
/// Verifies short-gap repair: missing hours are linearly interpolated
/// between their neighbours and covariates are carried forward.
fn load_interpolates_short_gaps() {
    let mut series = clean_series(0, 48);
    series.retain(|o| o.timestamp != hour(20) && o.timestamp != hour(21));
    let mut invalid = observation(hour(30), 45.0);
    invalid.valid = false;
    series.retain(|o| o.timestamp != hour(30));
    series.push(invalid);
    series.sort_by_key(|o| o.timestamp);
    let source = source_with("alpha", series);
    let loader = WindowLoader::new(source, &engine(48, 2), QualityBounds::default());

    let window = loader.load("alpha", hour(47)).expect("load should succeed");

    assert_eq!(window.len(), 48);
    assert_eq!(window.repaired_hours, 3);
    let c = window.concentrations();
    let expect_20 = c[19] + (c[22] - c[19]) / 3.0;
    let expect_21 = c[19] + 2.0 * (c[22] - c[19]) / 3.0;
    assert!((c[20] - expect_20).abs() < 1e-9);
    assert!((c[21] - expect_21).abs() < 1e-9);
    assert!((c[30] - (c[29] + c[31]) / 2.0).abs() < 1e-9);
    assert_eq!(window.observations[20].covariates, window.observations[19].covariates);
    assert!(window.observations.iter().all(|o| o.valid));
}

#[test]
fn load_rejects_gap_longer_than_tolerance() {
    let mut series = clean_series(0, 48);
    series.retain(|o| !(10..13).contains(&(o.timestamp - hour(0)).num_hours()));
    let source = source_with("alpha", series);
    let loader = WindowLoader::new(source, &engine(48, 2), QualityBounds::default());

    let err = loader.load("alpha", hour(47)).unwrap_err();
    match err {
        EngineError::IrreparableGap {
            gap_start,
            missing_hours,
            tolerance,
            ..
        } => {
            assert_eq!(gap_start, hour(10));
            assert_eq!(missing_hours, 3);
            assert_eq!(tolerance, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(loader.load("alpha", hour(47)).unwrap_err().is_retryable());
}

#[test]
/// Verifies that out-of-range values count as missing hours.
fn load_treats_out_of_bounds_values_as_missing() {
    let mut series = clean_series(0, 48);
    for obs in series.iter_mut() {
        let k = (obs.timestamp - hour(0)).num_hours();
        if (5..8).contains(&k) {
            obs.covariates.humidity = 140.0;
        }
    }
    let source = source_with("alpha", series);
    let loader = WindowLoader::new(source, &engine(48, 2), QualityBounds::default());

    assert!(matches!(
        loader.load("alpha", hour(47)),
        Err(EngineError::IrreparableGap { missing_hours: 3, .. })
    ));
}

#[test]
fn load_reports_insufficient_data_for_empty_or_short_history() {
    let source = source_with("alpha", clean_series(0, 24));
    let loader = WindowLoader::new(source, &engine(48, 2), QualityBounds::default());

    assert!(matches!(
        loader.load("beta", hour(47)),
        Err(EngineError::DataInsufficient { expected: 48, .. })
    ));
    assert!(matches!(
        loader.load("alpha", hour(47)),
        Err(EngineError::DataInsufficient { .. })
    ));
}

#[test]
/// Verifies that the source contract is enforced: two records mapping to
/// the same hour are a source error, not silently merged.
fn load_rejects_duplicate_hours() {
    struct Duplicating;

    impl aq_forecast::source::ObservationSource for Duplicating {
        fn fetch_observations(
            &self,
            _entity_id: &str,
            start: chrono::DateTime<chrono::Utc>,
            end: chrono::DateTime<chrono::Utc>,
        ) -> anyhow::Result<Vec<aq_forecast::model::observation::Observation>> {
            let mut out: Vec<_> = clean_series(0, 48)
                .into_iter()
                .filter(|o| o.timestamp >= start && o.timestamp <= end)
                .collect();
            out.push(observation(end, 10.0));
            Ok(out)
        }
    }

    let loader = WindowLoader::new(Duplicating, &engine(24, 2), QualityBounds::default());
    assert!(matches!(
        loader.load("alpha", hour(40)),
        Err(EngineError::Source(_))
    ));
}
