use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Delivery, Job, JobHandler, INACTIVE_TIMEOUT, STREAMING_THRESHOLD, SWEEP_INTERVAL};
use crate::metrics::{self, QueryTimer};
use crate::models::{QueryResult, Target};
use crate::signalflow::{Connector, SignalFlowClient, StreamEndpoint};
use crate::{DatasourceError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct JobManagerConfig {
    pub sweep_interval: Duration,
    pub inactive_timeout: Duration,
    pub streaming_threshold: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: SWEEP_INTERVAL,
            inactive_timeout: INACTIVE_TIMEOUT,
            streaming_threshold: STREAMING_THRESHOLD,
        }
    }
}

struct SharedConnection {
    endpoint: StreamEndpoint,
    client: Arc<dyn SignalFlowClient>,
}

/// Pools running jobs behind one shared streaming connection.
///
/// Lock order is `handlers` then `connection`.
pub struct JobManager {
    config: JobManagerConfig,
    connector: Arc<dyn Connector>,
    handlers: Mutex<Vec<Arc<dyn Job>>>,
    connection: Mutex<Option<SharedConnection>>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(connector: Arc<dyn Connector>, config: JobManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            handlers: Mutex::new(Vec::new()),
            connection: Mutex::new(None),
            sweeper: parking_lot::Mutex::new(None),
        })
    }

    /// Spawns the periodic idle sweep. The task ends once the manager is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.cleanup_inactive(Utc::now()).await;
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    /// Answers every target in order. The first failure fails the batch.
    pub async fn query(
        &self,
        endpoint: &StreamEndpoint,
        targets: &[Target],
    ) -> Result<Vec<QueryResult>> {
        let _timer = QueryTimer::new();
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let delivery = self.find_or_create(endpoint, target).await?;
            let series = delivery.await.map_err(|_| {
                DatasourceError::Stream(format!(
                    "Job for query {} ended without delivering data",
                    target.ref_id
                ))
            })?;
            results.push(QueryResult {
                ref_id: target.ref_id.clone(),
                series,
                tables: Vec::new(),
            });
        }
        Ok(results)
    }

    async fn find_or_create(&self, endpoint: &StreamEndpoint, target: &Target) -> Result<Delivery> {
        let mut handlers = self.handlers.lock().await;
        let client = self.ensure_connection(endpoint, &mut handlers).await?;

        for job in handlers.iter() {
            if let Some(delivery) = job.reuse(target) {
                debug!(job_id = %job.id(), ref_id = %target.ref_id, "Reusing running job");
                metrics::record_job_reused();
                return Ok(delivery);
            }
        }

        let handler = Arc::new(JobHandler::new(client, &self.config));
        let delivery = handler.start(target).await?;
        info!(
            job_id = %handler.id(),
            ref_id = %target.ref_id,
            jobs = handlers.len() + 1,
            "Started job"
        );
        handlers.push(handler);
        Ok(delivery)
    }

    /// Returns the shared client, reconnecting when the endpoint changed or
    /// the connection dropped. Jobs bound to a previous connection are
    /// stopped and dropped.
    async fn ensure_connection(
        &self,
        endpoint: &StreamEndpoint,
        handlers: &mut Vec<Arc<dyn Job>>,
    ) -> Result<Arc<dyn SignalFlowClient>> {
        let mut connection = self.connection.lock().await;
        if let Some(current) = connection.as_ref() {
            if current.endpoint == *endpoint && !current.client.is_closed() {
                return Ok(current.client.clone());
            }
        }

        if let Some(previous) = connection.take() {
            if previous.endpoint == *endpoint {
                warn!(
                    url = %previous.endpoint.url,
                    jobs = handlers.len(),
                    "Streaming connection lost, stopping jobs"
                );
            } else {
                info!(
                    url = %previous.endpoint.url,
                    jobs = handlers.len(),
                    "Streaming endpoint changed, stopping jobs"
                );
            }
            for job in handlers.drain(..) {
                job.stop();
            }
            previous.client.close();
        }

        let client = self.connector.connect(endpoint).await?;
        metrics::record_connection();
        info!(url = %endpoint.url, "Opened streaming connection");
        *connection = Some(SharedConnection {
            endpoint: endpoint.clone(),
            client: client.clone(),
        });
        Ok(client)
    }

    /// Stops and forgets every job unused since `now - inactive_timeout`.
    pub async fn cleanup_inactive(&self, now: DateTime<Utc>) -> usize {
        let mut handlers = self.handlers.lock().await;
        let before = handlers.len();
        handlers.retain(|job| {
            if job.is_active(now) {
                return true;
            }
            info!(job_id = %job.id(), program = %job.program(), "Stopping inactive job");
            job.stop();
            false
        });
        let stopped = before - handlers.len();
        if stopped > 0 {
            debug!(stopped, remaining = handlers.len(), "Inactive jobs cleaned up");
        }
        stopped
    }

    pub async fn job_count(&self) -> usize {
        self.handlers.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let mut handlers = self.handlers.lock().await;
        let stopped = handlers.len();
        for job in handlers.drain(..) {
            job.stop();
        }
        if let Some(connection) = self.connection.lock().await.take() {
            connection.client.close();
        }
        info!(stopped, "Job manager shut down");
    }

    #[cfg(test)]
    pub(crate) async fn insert_job(&self, job: Arc<dyn Job>) {
        self.handlers.lock().await.push(job);
    }
}
