pub mod api;
pub mod api_client;
pub mod config;
pub mod datasource;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod signalflow;

pub use error::{DatasourceError, Result};
