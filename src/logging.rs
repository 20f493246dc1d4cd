use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};
use crate::{DatasourceError, Result};

/// Installs the global subscriber. `RUST_LOG` style directives come from `config.filter`.
pub fn init_logger(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| {
        DatasourceError::InvalidRequest(format!("Invalid log filter '{}': {}", config.filter, e))
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    result.map_err(|e| DatasourceError::Internal(format!("Failed to initialize logger: {}", e)))
}
