use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasourceError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Execute error: {0}")]
    Execute(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DatasourceError {
    fn from(err: serde_json::Error) -> Self {
        DatasourceError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DatasourceError {
    fn from(err: reqwest::Error) -> Self {
        DatasourceError::Api(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DatasourceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        DatasourceError::Connection(err.to_string())
    }
}

impl IntoResponse for DatasourceError {
    fn into_response(self) -> Response {
        let status = match self {
            DatasourceError::InvalidRequest(_) | DatasourceError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            DatasourceError::Connection(_)
            | DatasourceError::Execute(_)
            | DatasourceError::Stream(_)
            | DatasourceError::Api(_) => StatusCode::BAD_GATEWAY,
            DatasourceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DatasourceError>;
