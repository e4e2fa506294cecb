use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;

use aq_forecast::cli::{parse_cli_command, CliCommand, USAGE};
use aq_forecast::config::Config;
use aq_forecast::engine::{ForecastEngine, TrainOutcome};
use aq_forecast::error::{EngineError, EngineResult};
use aq_forecast::observation_store::SqliteObservationStore;
use aq_forecast::registry::VersionId;

fn error_json(entity: &str, e: &EngineError) -> Value {
    json!({
        "entity": entity,
        "error": e.to_string(),
        "retryable": e.is_retryable(),
    })
}

fn train_results_json(results: Vec<(String, EngineResult<TrainOutcome>)>) -> Value {
    Value::Array(
        results
            .into_iter()
            .map(|(entity, result)| match result {
                Ok(outcome) => json!(outcome),
                Err(e) => error_json(&entity, &e),
            })
            .collect(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_cli_command(&args)?;
    if command == CliCommand::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set AQ_CONFIG_PATH or create config/default.toml");
            std::process::exit(1);
        }
    };

    let log_file = std::fs::File::create("aq-forecast.log")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.logging.level.as_str())
            }),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .json()
        .init();

    tracing::info!(
        entities = config.entities.len(),
        window_hours = config.engine.window_hours,
        horizon_hours = config.engine.horizon_hours,
        registry = %config.registry.root.display(),
        "Starting aq-forecast"
    );

    let source = SqliteObservationStore::open(&config.storage.database_path)?;
    let engine = Arc::new(ForecastEngine::new(config, source)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received");
        let _ = shutdown_tx.send(true);
    });

    let now = Utc::now();
    let output = match command {
        CliCommand::Train { entity: Some(entity) } => {
            let results = engine
                .train_many(vec![entity], now, shutdown_rx)
                .await;
            train_results_json(results)
        }
        CliCommand::Train { entity: None } => {
            train_results_json(engine.train_planned(now, shutdown_rx).await?)
        }
        CliCommand::Predict { entity, as_of } => {
            match engine.predict_with_timeout(&entity, as_of.unwrap_or(now)).await {
                Ok(record) => json!(record),
                Err(e) => error_json(&entity, &e),
            }
        }
        CliCommand::Evaluate { entity, now: at } => {
            let at = at.unwrap_or(now);
            let ids = entity
                .map(|e| vec![e])
                .unwrap_or_else(|| engine.config().entity_ids());
            Value::Array(
                ids.iter()
                    .map(|id| match engine.evaluate(id, at) {
                        Ok(outcome) => json!(outcome),
                        Err(e) => error_json(id, &e),
                    })
                    .collect(),
            )
        }
        CliCommand::Plan { now: at } => json!(engine.plan_training(at.unwrap_or(now))?),
        CliCommand::Status { entity } => {
            let ids = entity
                .map(|e| vec![e])
                .unwrap_or_else(|| engine.config().entity_ids());
            Value::Array(
                ids.iter()
                    .map(|id| match engine.lifecycle(id) {
                        Ok(state) => json!({ "entity": id, "lifecycle": state }),
                        Err(e) => error_json(id, &e),
                    })
                    .collect(),
            )
        }
        CliCommand::Rollback { entity, version } => {
            let version = VersionId::parse(&version)
                .ok_or_else(|| anyhow!("invalid version id '{version}'"))?;
            engine.registry().rollback(&entity, version)?;
            json!({ "entity": entity, "current": version.to_string() })
        }
        CliCommand::Help => Value::Null,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
