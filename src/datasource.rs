//! Entry point for datasource requests: REST lookups or streamed datapoints.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::api_client::{ApiCall, ApiClient, MetricResponse};
use crate::jobs::JobManager;
use crate::models::{
    DatasourceInfo, DatasourceRequest, DatasourceResponse, QueryModel, QueryResult, Table,
    TableColumn, Target,
};
use crate::signalflow::StreamEndpoint;
use crate::{DatasourceError, Result};

const METRIC_PATH: &str = "/v2/metric";
const SUGGEST_PATH: &str = "/v2/suggest/_signalflowsuggest";
const TABLE_REF_ID: &str = "items";
const ACCESS_TOKEN_KEY: &str = "accessToken";

pub struct Datasource {
    manager: Arc<JobManager>,
    api: ApiClient,
}

impl Datasource {
    pub fn new(manager: Arc<JobManager>, api: ApiClient) -> Self {
        Self { manager, api }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub async fn query(&self, request: &DatasourceRequest) -> Result<DatasourceResponse> {
        let first = request
            .queries
            .first()
            .ok_or_else(|| DatasourceError::InvalidRequest("Request has no queries".to_string()))?;
        let mut call: ApiCall = serde_json::from_value(first.model.clone())?;

        match call.path.as_str() {
            METRIC_PATH => {
                call.method = Method::GET;
                self.get_metrics(&request.datasource, call).await
            }
            SUGGEST_PATH => {
                call.method = Method::POST;
                self.get_suggestions(&request.datasource, call).await
            }
            _ => self.get_datapoints(request).await,
        }
    }

    async fn get_metrics(&self, info: &DatasourceInfo, call: ApiCall) -> Result<DatasourceResponse> {
        let response: MetricResponse = self.call_api(info, call).await?;
        debug!(metrics = response.results.len(), "Listed metrics");
        let names = response.results.into_iter().map(|item| item.name).collect();
        Ok(format_as_table(names))
    }

    async fn get_suggestions(
        &self,
        info: &DatasourceInfo,
        call: ApiCall,
    ) -> Result<DatasourceResponse> {
        let suggestions: Vec<String> = self.call_api(info, call).await?;
        debug!(suggestions = suggestions.len(), "Fetched program suggestions");
        Ok(format_as_table(suggestions))
    }

    async fn call_api<T: serde::de::DeserializeOwned>(
        &self,
        info: &DatasourceInfo,
        mut call: ApiCall,
    ) -> Result<T> {
        call.base_url = info.url.clone();
        call.token = access_token(info)?;
        self.api.request(&call).await
    }

    async fn get_datapoints(&self, request: &DatasourceRequest) -> Result<DatasourceResponse> {
        let endpoint = StreamEndpoint::new(&request.datasource.url, access_token(&request.datasource)?)?;
        let targets = build_targets(request)?;
        let results = self.manager.query(&endpoint, &targets).await?;
        Ok(DatasourceResponse { results })
    }
}

/// Secure settings win over the plain JSON settings.
pub fn access_token(info: &DatasourceInfo) -> Result<String> {
    if let Some(token) = info.decrypted_secure_json_data.get(ACCESS_TOKEN_KEY) {
        return Ok(token.clone());
    }
    info.json_data
        .get(ACCESS_TOKEN_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DatasourceError::InvalidRequest("Datasource has no access token".to_string()))
}

pub fn build_targets(request: &DatasourceRequest) -> Result<Vec<Target>> {
    let start = epoch_ms(request.time_range.from_epoch_ms)?;
    let stop = epoch_ms(request.time_range.to_epoch_ms)?;
    request
        .queries
        .iter()
        .map(|query| {
            let model: QueryModel = serde_json::from_value(query.model.clone())?;
            let interval_ms = query.interval_ms.unwrap_or(0).max(0) as u64;
            let target = Target::new(
                model.ref_id,
                model.program,
                start,
                stop,
                Duration::from_millis(interval_ms),
            );
            Ok(match model.alias.filter(|alias| !alias.trim().is_empty()) {
                Some(alias) => target.with_alias(alias),
                None => target,
            })
        })
        .collect()
}

fn epoch_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DatasourceError::InvalidRequest(format!("Invalid timestamp {}", ms)))
}

/// One `name` column, one row per value.
pub fn format_as_table(values: Vec<String>) -> DatasourceResponse {
    let table = Table {
        columns: vec![TableColumn {
            name: "name".to_string(),
        }],
        rows: values.into_iter().map(|value| vec![value]).collect(),
    };
    DatasourceResponse {
        results: vec![QueryResult {
            ref_id: TABLE_REF_ID.to_string(),
            series: Vec::new(),
            tables: vec![table],
        }],
    }
}
