//! WebSocket transport: one authenticated connection multiplexing every
//! computation of a datasource over named channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use super::codec::{self, Frame};
use super::{
    ChannelState, Computation, ComputationHandle, Connector, ExecuteRequest, SeriesId,
    SeriesProperties, SignalFlowClient, StreamEndpoint, StreamMessage,
};
use crate::{DatasourceError, Result};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ChannelRoute {
    tx: mpsc::UnboundedSender<StreamMessage>,
    state: Arc<ChannelState>,
}

type Routes = Arc<Mutex<HashMap<String, ChannelRoute>>>;

pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &StreamEndpoint) -> Result<Arc<dyn SignalFlowClient>> {
        let client = WebSocketClient::connect(endpoint).await?;
        Ok(Arc::new(client))
    }
}

pub struct WebSocketClient {
    outbound: mpsc::UnboundedSender<Message>,
    routes: Routes,
    next_channel: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketClient {
    pub async fn connect(endpoint: &StreamEndpoint) -> Result<Self> {
        info!("Connecting to streaming endpoint {}", endpoint.url);
        let (socket, _) = connect_async(endpoint.url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(codec::encode_authenticate(&endpoint.token)))
            .await?;
        timeout(AUTH_TIMEOUT, wait_authenticated(&mut stream))
            .await
            .map_err(|_| {
                DatasourceError::Connection(format!(
                    "Timed out authenticating with {}",
                    endpoint.url
                ))
            })??;
        debug!("Authenticated with {}", endpoint.url);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Failed to write to streaming connection");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_frames(stream, routes.clone()));

        Ok(Self {
            outbound,
            routes,
            next_channel: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    pub fn open_channels(&self) -> usize {
        self.routes.lock().len()
    }
}

async fn wait_authenticated(stream: &mut SplitStream<Socket>) -> Result<()> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => match codec::decode_text(&text)? {
                Frame::Authenticated => return Ok(()),
                Frame::ConnectionError(e) => {
                    return Err(DatasourceError::Connection(format!(
                        "Authentication failed: {}",
                        e
                    )))
                }
                other => trace!(?other, "Ignoring frame before authentication"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(DatasourceError::Connection(
        "Connection closed during authentication".to_string(),
    ))
}

async fn read_frames(mut stream: SplitStream<Socket>, routes: Routes) {
    let mut reason = "Streaming connection closed".to_string();
    while let Some(frame) = stream.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => codec::decode_text(&text),
            Ok(Message::Binary(bytes)) => codec::decode_binary(&bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                reason = format!("Streaming connection failed: {}", e);
                break;
            }
        };
        match decoded {
            Ok(Frame::Channel { channel, message }) => route(&routes, &channel, message),
            Ok(Frame::ConnectionError(e)) => error!(error = %e, "Streaming connection error"),
            Ok(Frame::Authenticated) => {}
            Ok(Frame::Unrouted(kind)) => trace!(kind = %kind, "Ignoring connection-level frame"),
            Err(e) => warn!(error = %e, "Could not decode frame"),
        }
    }

    warn!("{}", reason);
    let open: Vec<ChannelRoute> = routes.lock().drain().map(|(_, route)| route).collect();
    for route in open {
        route.state.finish();
        let _ = route.tx.send(StreamMessage::TransportError(reason.clone()));
    }
}

fn route(routes: &Routes, channel: &str, message: StreamMessage) {
    let mut routes = routes.lock();
    let Some(target) = routes.get(channel) else {
        trace!(channel, "Dropping message for unknown channel");
        return;
    };
    target.state.observe(&message);
    if message.ends_stream() {
        if let Some(target) = routes.remove(channel) {
            target.state.finish();
            let _ = target.tx.send(message);
        }
    } else {
        let _ = target.tx.send(message);
    }
}

#[async_trait]
impl SignalFlowClient for WebSocketClient {
    async fn execute(&self, request: ExecuteRequest) -> Result<Computation> {
        let channel = format!("R{}", self.next_channel.fetch_add(1, Ordering::Relaxed));
        let (tx, messages) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState::new());
        self.routes.lock().insert(
            channel.clone(),
            ChannelRoute {
                tx,
                state: state.clone(),
            },
        );

        let frame = Message::Text(codec::encode_execute(&channel, &request));
        if self.outbound.send(frame).is_err() {
            self.routes.lock().remove(&channel);
            return Err(DatasourceError::Execute(format!(
                "Streaming connection closed, cannot execute '{}'",
                request.program
            )));
        }
        debug!(channel = %channel, program = %request.program, "Executing program");

        Ok(Computation {
            messages,
            handle: Arc::new(ChannelHandle {
                channel,
                state,
                outbound: self.outbound.clone(),
                routes: self.routes.clone(),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.outbound.is_closed()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct ChannelHandle {
    channel: String,
    state: Arc<ChannelState>,
    outbound: mpsc::UnboundedSender<Message>,
    routes: Routes,
    stopped: AtomicBool,
}

impl ComputationHandle for ChannelHandle {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn metadata(&self, id: SeriesId) -> Option<SeriesProperties> {
        self.state.metadata(id)
    }

    fn resolution(&self) -> Option<Duration> {
        self.state.resolution()
    }

    fn max_delay(&self) -> Option<Duration> {
        self.state.max_delay()
    }

    fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    fn finished(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.routes.lock().remove(&self.channel);
        self.state.finish();
        if self.outbound.is_closed() {
            return Ok(());
        }
        self.outbound
            .send(Message::Text(codec::encode_stop(&self.channel)))
            .map_err(|_| {
                DatasourceError::Stream(format!(
                    "Streaming connection closed before stopping {}",
                    self.channel
                ))
            })
    }
}
