// ABOUTME: Library crate for tosh-sync - SQLite change capture delivered to PostgreSQL
// ABOUTME: Exposes configuration, watch loops, delivery engine and destinations

pub mod commands;
pub mod config;
pub mod delivery;
pub mod destination;
pub mod health;
pub mod pipeline;
pub mod postgres;
pub mod secrets;
pub mod utils;
pub mod watch;

pub use config::PipelineConfig;
pub use delivery::{DeliveryEngine, DeliveryReport};
pub use pipeline::{OnceSummary, Pipeline};
