pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod features;
pub mod forecast_store;
pub mod model;
pub mod nccqr;
pub mod observation_store;
pub mod predictor;
pub mod registry;
pub mod reproducibility;
pub mod runtime;
pub mod source;
pub mod window;
