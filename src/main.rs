use std::sync::Arc;

use signalflow_datasource::{
    api::{self, AppState},
    api_client::ApiClient,
    config::Config,
    datasource::Datasource,
    jobs::JobManager,
    logging,
    signalflow::ws::WebSocketConnector,
    Result,
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Datasource server failed");
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    logging::init_logger(&config.log)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting signalflow datasource");

    let manager = JobManager::new(Arc::new(WebSocketConnector), config.jobs.clone());
    manager.start_sweeper();
    let api = ApiClient::new(config.api_timeout)?;
    let state = AppState {
        datasource: Arc::new(Datasource::new(manager.clone(), api)),
    };

    let served = api::serve(&config, state).await;
    manager.shutdown().await;
    served
}
