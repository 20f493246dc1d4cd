//! Plain REST calls used for metric listing and program suggestions.

use std::time::Duration;

use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{DatasourceError, Result};

pub const TOKEN_HEADER: &str = "X-SF-TOKEN";

/// One REST call. Path, query and body come from the query model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiCall {
    #[serde(skip)]
    pub base_url: String,
    #[serde(skip)]
    pub method: Method,
    #[serde(skip)]
    pub token: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricResponseItem {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricResponse {
    #[serde(default)]
    pub results: Vec<MetricResponseItem>,
}

pub struct ApiClient {
    client: Client,
}

impl ApiClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DatasourceError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn request<T: DeserializeOwned>(&self, call: &ApiCall) -> Result<T> {
        let url = build_url(call)?;
        debug!(method = %call.method, url = %url, "Calling REST API");

        let mut request = self
            .client
            .request(call.method.clone(), url)
            .header(TOKEN_HEADER, &call.token);
        if call.method == Method::POST {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(call.data.clone());
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Error calling REST API");
            DatasourceError::from(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Error response from REST API");
            return Err(DatasourceError::Api(format!(
                "Bad status {}: {}",
                status.as_u16(),
                message
            )));
        }

        response.json::<T>().await.map_err(|e| {
            error!(error = %e, "Error decoding REST API response");
            DatasourceError::from(e)
        })
    }
}

fn build_url(call: &ApiCall) -> Result<Url> {
    let mut url = Url::parse(&call.base_url).map_err(|e| {
        DatasourceError::InvalidRequest(format!("Invalid API url '{}': {}", call.base_url, e))
    })?;
    let path = join_path(url.path(), &call.path);
    url.set_path(&path);
    if call.query.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&call.query));
    }
    Ok(url)
}

fn join_path(base: &str, extra: &str) -> String {
    let segments: Vec<&str> = base
        .split('/')
        .chain(extra.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}
