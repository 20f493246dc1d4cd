use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::naming::{describe_series, AliasRule};
use super::{Delivery, Job, JobManagerConfig, POINTS_KEPT_BEFORE_RANGE};
use crate::metrics;
use crate::models::{Point, Series, Target};
use crate::signalflow::{
    encode_series_id, Computation, ComputationHandle, ControlEvent, DataPayload, ExecuteRequest,
    SeriesId, SignalFlowClient, StreamMessage,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Created,
    Running,
    Draining,
    Stopped,
}

struct JobState {
    phase: JobPhase,
    program: String,
    interval: Duration,
    start_time: DateTime<Utc>,
    stop_time: DateTime<Utc>,
    cutoff_time: DateTime<Utc>,
    unbounded: bool,
    /// Set when the stream broke off; the buffer may have gaps.
    failed: bool,
    alias: Option<AliasRule>,
    last_used: DateTime<Utc>,
    resolution: Option<Duration>,
    max_delay: Option<Duration>,
    points: HashMap<SeriesId, Vec<Point>>,
    computation: Option<Arc<dyn ComputationHandle>>,
    delivery: Option<oneshot::Sender<Vec<Series>>>,
    delivery_pending: bool,
}

impl JobState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            phase: JobPhase::Created,
            program: String::new(),
            interval: Duration::ZERO,
            start_time: now,
            stop_time: now,
            cutoff_time: now,
            unbounded: false,
            failed: false,
            alias: None,
            last_used: now,
            resolution: None,
            max_delay: None,
            points: HashMap::new(),
            computation: None,
            delivery: None,
            delivery_pending: false,
        }
    }

    fn initialize(&mut self, target: &Target, now: DateTime<Utc>, streaming_threshold: Duration) {
        self.points.clear();
        self.program = target.program.clone();
        self.interval = target.interval;
        self.resolution = None;
        self.max_delay = None;
        self.failed = false;
        self.apply_alias(target);
        self.initialize_time_range(target, now);
        self.unbounded =
            target.stop_time.timestamp_millis() > now.timestamp_millis() - millis(streaming_threshold);
    }

    fn initialize_time_range(&mut self, target: &Target, now: DateTime<Utc>) {
        self.start_time = target.start_time;
        self.stop_time = target.stop_time;
        self.cutoff_time = target.stop_time.min(now);
    }

    fn apply_alias(&mut self, target: &Target) {
        self.alias = target
            .alias
            .as_deref()
            .and_then(|template| AliasRule::new(&target.program, template));
    }

    fn execute_request(&self) -> ExecuteRequest {
        ExecuteRequest {
            program: self.program.clone(),
            start: self.start_time,
            stop: (!self.unbounded).then_some(self.stop_time),
            resolution: (!self.interval.is_zero()).then_some(self.interval),
            immediate: !self.unbounded,
        }
    }

    fn is_open(&self) -> bool {
        self.phase == JobPhase::Running
            && self
                .computation
                .as_ref()
                .map_or(false, |computation| !computation.is_finished())
    }

    fn is_reusable(&self, target: &Target) -> bool {
        !self.failed
            && self.program == target.program
            && self.interval == target.interval
            && self.start_time <= target.start_time
            && ((self.is_open() && self.unbounded) || self.stop_time >= target.stop_time)
    }

    fn resolution_ms(&self) -> i64 {
        self.resolution
            .or_else(|| self.computation.as_ref().and_then(|c| c.resolution()))
            .map(millis)
            .unwrap_or(0)
    }

    fn max_delay_ms(&self) -> i64 {
        self.max_delay
            .or_else(|| self.computation.as_ref().and_then(|c| c.max_delay()))
            .map(millis)
            .unwrap_or(0)
    }

    fn append(&mut self, timestamp_ms: i64, payloads: &[DataPayload]) {
        for payload in payloads {
            self.points.entry(payload.id).or_default().push(Point {
                timestamp: timestamp_ms,
                value: payload.value.as_f64(),
            });
        }
    }

    /// True once a message at `timestamp_ms` means everything up to the
    /// cutoff has arrived. Landing exactly on the rounded cutoff is not enough.
    fn is_flush_ready(&self, timestamp_ms: i64) -> bool {
        let resolution = self.resolution_ms();
        if resolution <= 0 {
            return false;
        }
        let next_expected =
            round_down(timestamp_ms + 2 * resolution - 1 + self.max_delay_ms(), resolution);
        next_expected > round_down(self.cutoff_time.timestamp_millis(), resolution)
    }

    fn trim(&mut self) {
        let trim_before =
            self.start_time.timestamp_millis() - POINTS_KEPT_BEFORE_RANGE * self.resolution_ms();
        for points in self.points.values_mut() {
            let stale = points.partition_point(|p| p.timestamp < trim_before);
            points.drain(..stale);
        }
    }

    fn build_series(&self) -> Vec<Series> {
        let mut series: Vec<Series> = self
            .points
            .iter()
            .map(|(id, points)| {
                let metadata = self.computation.as_ref().and_then(|c| c.metadata(*id));
                let (name, tags) = describe_series(*id, metadata.as_ref(), self.alias.as_ref());
                Series {
                    id: *id,
                    name,
                    tags,
                    points: points.clone(),
                }
            })
            .collect();
        series.sort_by_key(|s| s.id);
        series
    }

    fn flush(&mut self) {
        self.trim();
        self.delivery_pending = false;
        if let Some(out) = self.delivery.take() {
            let batch = self.build_series();
            if out.send(batch).is_err() {
                debug!(program = %self.program, "Requester went away before delivery");
            }
        }
    }
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

pub(crate) fn round_down(value: i64, step: i64) -> i64 {
    value.div_euclid(step) * step
}

async fn wait_finished(finished: &mut watch::Receiver<bool>) {
    loop {
        let done = *finished.borrow_and_update();
        if done || finished.changed().await.is_err() {
            return;
        }
    }
}

/// Owns one streaming computation from start to stop.
pub struct JobHandler {
    id: Uuid,
    client: Arc<dyn SignalFlowClient>,
    streaming_threshold: Duration,
    inactive_timeout: Duration,
    state: Mutex<JobState>,
}

impl JobHandler {
    pub fn new(client: Arc<dyn SignalFlowClient>, config: &JobManagerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            streaming_threshold: config.streaming_threshold,
            inactive_timeout: config.inactive_timeout,
            state: Mutex::new(JobState::new()),
        }
    }

    /// Opens the computation for `target` and starts consuming it. The
    /// returned delivery resolves with the first flushed batch.
    pub async fn start(self: &Arc<Self>, target: &Target) -> Result<Delivery> {
        let (tx, rx) = oneshot::channel();
        let request = {
            let mut state = self.state.lock();
            state.initialize(target, Utc::now(), self.streaming_threshold);
            state.delivery = Some(tx);
            state.delivery_pending = true;
            state.execute_request()
        };

        debug!(
            job_id = %self.id,
            program = %request.program,
            unbounded = request.stop.is_none(),
            "Starting job"
        );
        match self.client.execute(request).await {
            Ok(computation) => {
                self.attach(computation);
                Ok(rx)
            }
            Err(e) => {
                error!(job_id = %self.id, error = %e, "Could not execute request");
                let mut state = self.state.lock();
                state.delivery = None;
                state.delivery_pending = false;
                Err(e)
            }
        }
    }

    fn attach(self: &Arc<Self>, computation: Computation) {
        let Computation { messages, handle } = computation;
        let finished = handle.finished();
        {
            let mut state = self.state.lock();
            state.computation = Some(handle);
            state.phase = JobPhase::Running;
            state.last_used = Utc::now();
        }
        metrics::record_job_started();
        tokio::spawn(Arc::clone(self).read_messages(messages, finished));
    }

    async fn read_messages(
        self: Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<StreamMessage>,
        mut finished: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                message = messages.recv() => match message {
                    Some(message) => {
                        if !self.handle_message(message) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = wait_finished(&mut finished) => break,
            }
        }
        self.drain();
    }

    /// Returns false once the stream is over.
    fn handle_message(&self, message: StreamMessage) -> bool {
        let mut state = self.state.lock();
        match message {
            StreamMessage::Data {
                timestamp_ms,
                payloads,
            } => {
                state.append(timestamp_ms, &payloads);
                if state.is_flush_ready(timestamp_ms) {
                    state.flush();
                }
            }
            StreamMessage::Control(ControlEvent::ResolutionHint(resolution)) => {
                debug!(job_id = %self.id, resolution_ms = millis(resolution), "Resolution");
                state.resolution = Some(resolution);
            }
            StreamMessage::Control(ControlEvent::MaxDelayHint(max_delay)) => {
                debug!(job_id = %self.id, max_delay_ms = millis(max_delay), "Max delay");
                state.max_delay = Some(max_delay);
            }
            StreamMessage::Control(ControlEvent::EndOfChannel) => {
                debug!(job_id = %self.id, "Stream ended");
                return false;
            }
            StreamMessage::Control(ControlEvent::Abort) => {
                warn!(job_id = %self.id, program = %state.program, "Stream aborted");
                state.failed = true;
                return false;
            }
            StreamMessage::Control(ControlEvent::Other(event)) => {
                trace!(job_id = %self.id, event = %event, "Event");
            }
            StreamMessage::Metadata { id, .. } => {
                trace!(job_id = %self.id, series = %encode_series_id(id), "Metadata");
            }
            StreamMessage::TransportError(e) => {
                error!(job_id = %self.id, program = %state.program, error = %e, "Stream error");
                state.failed = true;
                return false;
            }
            StreamMessage::Other(kind) => {
                debug!(job_id = %self.id, kind = %kind, "Ignoring message");
            }
        }
        true
    }

    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != JobPhase::Stopped {
                state.phase = JobPhase::Draining;
            }
            state.flush();
        }
        self.stop();
    }

    pub fn phase(&self) -> JobPhase {
        self.state.lock().phase
    }

    pub fn is_delivery_pending(&self) -> bool {
        self.state.lock().delivery_pending
    }

    pub fn is_unbounded(&self) -> bool {
        self.state.lock().unbounded
    }

    pub fn is_job_reusable(&self, target: &Target) -> bool {
        self.state.lock().is_reusable(target)
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&self, last_used: DateTime<Utc>) {
        self.state.lock().last_used = last_used;
    }
}

impl Job for JobHandler {
    fn id(&self) -> Uuid {
        self.id
    }

    fn program(&self) -> String {
        self.state.lock().program.clone()
    }

    fn reuse(&self, target: &Target) -> Option<Delivery> {
        let mut state = self.state.lock();
        if state.delivery_pending || !state.is_reusable(target) {
            return None;
        }
        let now = Utc::now();
        state.initialize_time_range(target, now);
        state.apply_alias(target);
        let (tx, rx) = oneshot::channel();
        state.delivery = Some(tx);
        state.delivery_pending = true;
        state.flush();
        state.last_used = now;
        debug!(job_id = %self.id, program = %state.program, "Reusing job");
        Some(rx)
    }

    fn is_active(&self, now: DateTime<Utc>) -> bool {
        let last_used = self.state.lock().last_used;
        now.timestamp_millis() < last_used.timestamp_millis() + millis(self.inactive_timeout)
    }

    fn stop(&self) {
        let (computation, program) = {
            let mut state = self.state.lock();
            if state.phase == JobPhase::Stopped {
                return;
            }
            state.phase = JobPhase::Stopped;
            (state.computation.clone(), state.program.clone())
        };
        if let Some(computation) = computation {
            debug!(job_id = %self.id, program = %program, "Stopping job");
            if let Err(e) = computation.stop() {
                warn!(job_id = %self.id, error = %e, "Could not stop computation");
            }
            metrics::record_job_stopped();
        }
    }
}
