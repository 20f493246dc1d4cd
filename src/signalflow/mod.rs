//! The streaming computation capability consumed by the job layer.
//!
//! A [`SignalFlowClient`] executes programs over one shared connection and
//! hands back a [`Computation`]: a feed of decoded [`StreamMessage`]s plus a
//! [`ComputationHandle`] for metadata lookups, stream hints and stopping.

pub mod codec;
pub mod ws;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use tokio::sync::{mpsc, watch};

use crate::{DatasourceError, Result};

pub const STREAM_PATH: &str = "/v2/signalflow";

pub type SeriesId = u64;

/// Service-side properties of one series (`sf_metric`, dimensions, ...).
pub type SeriesProperties = serde_json::Map<String, serde_json::Value>;

pub fn encode_series_id(id: SeriesId) -> String {
    URL_SAFE_NO_PAD.encode(id.to_be_bytes())
}

pub fn decode_series_id(encoded: &str) -> Option<SeriesId> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub program: String,
    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
    pub resolution: Option<Duration>,
    /// Ask for the whole historical range without waiting for live catch-up.
    pub immediate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PayloadValue {
    Long(i64),
    Double(f64),
    Int(i32),
    Unknown(u8),
}

impl PayloadValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            PayloadValue::Long(v) => v as f64,
            PayloadValue::Double(v) => v,
            PayloadValue::Int(v) => v as f64,
            PayloadValue::Unknown(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPayload {
    pub id: SeriesId,
    pub value: PayloadValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    ResolutionHint(Duration),
    MaxDelayHint(Duration),
    EndOfChannel,
    Abort,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Data {
        timestamp_ms: i64,
        payloads: Vec<DataPayload>,
    },
    Control(ControlEvent),
    Metadata {
        id: SeriesId,
        properties: SeriesProperties,
    },
    TransportError(String),
    Other(String),
}

impl StreamMessage {
    pub fn ends_stream(&self) -> bool {
        matches!(
            self,
            StreamMessage::Control(ControlEvent::EndOfChannel)
                | StreamMessage::Control(ControlEvent::Abort)
                | StreamMessage::TransportError(_)
        )
    }
}

pub trait ComputationHandle: Send + Sync {
    fn channel(&self) -> &str;
    fn metadata(&self, id: SeriesId) -> Option<SeriesProperties>;
    fn resolution(&self) -> Option<Duration>;
    fn max_delay(&self) -> Option<Duration>;
    fn is_finished(&self) -> bool;
    /// Flips to `true` once the computation has finished.
    fn finished(&self) -> watch::Receiver<bool>;
    fn stop(&self) -> Result<()>;
}

pub struct Computation {
    pub messages: mpsc::UnboundedReceiver<StreamMessage>,
    pub handle: Arc<dyn ComputationHandle>,
}

#[async_trait]
pub trait SignalFlowClient: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> Result<Computation>;
    fn close(&self);
    /// True once the connection is gone and no further execute can succeed.
    fn is_closed(&self) -> bool;
}

/// Identity of the shared streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub url: String,
    pub token: String,
}

impl StreamEndpoint {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: build_stream_url(base_url)?,
            token: token.into(),
        })
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &StreamEndpoint) -> Result<Arc<dyn SignalFlowClient>>;
}

/// Maps a datasource address onto the streaming endpoint. Only an explicit
/// `ws://` address stays on the plain scheme.
pub fn build_stream_url(base: &str) -> Result<String> {
    let trimmed = base.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = Url::parse(&with_scheme).map_err(|e| {
        DatasourceError::InvalidRequest(format!("Invalid datasource url '{}': {}", base, e))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        DatasourceError::InvalidRequest(format!("Datasource url '{}' has no host", base))
    })?;
    let scheme = if parsed.scheme() == "ws" { "ws" } else { "wss" };
    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Ok(format!("{}://{}{}", scheme, authority, STREAM_PATH))
}

/// Per-channel bookkeeping shared by transport implementations: metadata
/// seen so far, the latest stream hints and the finished signal.
pub struct ChannelState {
    metadata: RwLock<HashMap<SeriesId, SeriesProperties>>,
    resolution: Mutex<Option<Duration>>,
    max_delay: Mutex<Option<Duration>>,
    finished: watch::Sender<bool>,
}

impl ChannelState {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            metadata: RwLock::new(HashMap::new()),
            resolution: Mutex::new(None),
            max_delay: Mutex::new(None),
            finished,
        }
    }

    /// Records what `message` tells about the channel. Must run before the
    /// message is forwarded so lookups never lag the feed.
    pub fn observe(&self, message: &StreamMessage) {
        match message {
            StreamMessage::Metadata { id, properties } => {
                self.metadata.write().insert(*id, properties.clone());
            }
            StreamMessage::Control(ControlEvent::ResolutionHint(d)) => {
                *self.resolution.lock() = Some(*d);
            }
            StreamMessage::Control(ControlEvent::MaxDelayHint(d)) => {
                *self.max_delay.lock() = Some(*d);
            }
            _ => {}
        }
    }

    pub fn metadata(&self, id: SeriesId) -> Option<SeriesProperties> {
        self.metadata.read().get(&id).cloned()
    }

    pub fn resolution(&self) -> Option<Duration> {
        *self.resolution.lock()
    }

    pub fn max_delay(&self) -> Option<Duration> {
        *self.max_delay.lock()
    }

    pub fn finish(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}
