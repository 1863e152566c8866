pub mod api;
pub mod config;
pub mod db;
pub mod engines;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod service;
pub mod storage;

pub use config::AppConfig;
pub use db::{create_pool, migrate};
pub use error::{ExtractionError, PipelineError};
pub use service::{IngestionGateway, ReviewService};
