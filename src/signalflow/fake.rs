//! In-memory streaming capability used by the job tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{
    ChannelState, Computation, ComputationHandle, Connector, ExecuteRequest, SeriesId,
    SeriesProperties, SignalFlowClient, StreamEndpoint, StreamMessage,
};
use crate::{DatasourceError, Result};

pub(crate) struct FakeHandle {
    channel: String,
    pub(crate) state: ChannelState,
    pub(crate) stops: AtomicUsize,
}

impl FakeHandle {
    pub(crate) fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            state: ChannelState::new(),
            stops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ComputationHandle for FakeHandle {
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
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.state.finish();
        Ok(())
    }
}

/// The producing side of one fake computation.
pub(crate) struct FakeFeed {
    tx: mpsc::UnboundedSender<StreamMessage>,
    pub(crate) handle: Arc<FakeHandle>,
}

impl FakeFeed {
    pub(crate) fn send(&self, message: StreamMessage) {
        self.handle.state.observe(&message);
        if message.ends_stream() {
            self.handle.state.finish();
        }
        let _ = self.tx.send(message);
    }
}

/// Builds a computation that is not attached to any client.
pub(crate) fn computation(channel: &str) -> (Computation, FakeFeed) {
    let (tx, messages) = mpsc::unbounded_channel();
    let handle = Arc::new(FakeHandle::new(channel));
    let computation = Computation {
        messages,
        handle: handle.clone(),
    };
    (computation, FakeFeed { tx, handle })
}

#[derive(Default)]
pub(crate) struct FakeClient {
    executed: Mutex<Vec<ExecuteRequest>>,
    feeds: Mutex<Vec<Arc<FakeFeed>>>,
    fail_with: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl FakeClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next(&self, reason: &str) {
        *self.fail_with.lock() = Some(reason.to_string());
    }

    pub(crate) fn executed(&self) -> Vec<ExecuteRequest> {
        self.executed.lock().clone()
    }

    pub(crate) fn feed(&self, index: usize) -> Arc<FakeFeed> {
        self.feeds.lock()[index].clone()
    }

    /// Simulates the service dropping the connection.
    pub(crate) fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalFlowClient for FakeClient {
    async fn execute(&self, request: ExecuteRequest) -> Result<Computation> {
        if let Some(reason) = self.fail_with.lock().take() {
            return Err(DatasourceError::Execute(reason));
        }
        let channel = format!("R{}", self.executed.lock().len() + 1);
        self.executed.lock().push(request);
        let (computation, feed) = computation(&channel);
        self.feeds.lock().push(Arc::new(feed));
        Ok(computation)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out one [`FakeClient`] per connect call.
#[derive(Default)]
pub(crate) struct FakeConnector {
    clients: Mutex<Vec<(StreamEndpoint, Arc<FakeClient>)>>,
    refuse: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub(crate) fn client(&self, index: usize) -> Arc<FakeClient> {
        self.clients.lock()[index].1.clone()
    }

    pub(crate) fn endpoints(&self) -> Vec<StreamEndpoint> {
        self.clients
            .lock()
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &StreamEndpoint) -> Result<Arc<dyn SignalFlowClient>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DatasourceError::Connection(format!(
                "Refused connection to {}",
                endpoint.url
            )));
        }
        let client = FakeClient::new();
        self.clients.lock().push((endpoint.clone(), client.clone()));
        Ok(client)
    }
}

/// Polls `condition` until it holds, failing the test after about a second.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
