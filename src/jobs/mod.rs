//! Lifecycle of streaming computations behind incoming queries.
//!
//! A [`JobHandler`] owns one computation and buffers its points; the
//! [`JobManager`] pools handlers so overlapping queries share computations
//! and reclaims the ones nobody asked for in a while.

pub mod handler;
pub mod manager;
pub mod naming;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::models::{Series, Target};

pub use handler::{JobHandler, JobPhase};
pub use manager::{JobManager, JobManagerConfig};

/// Queries ending closer than this to "now" are treated as live tails.
pub const STREAMING_THRESHOLD: Duration = Duration::from_secs(2 * 60);
/// Handlers unused for this long are stopped by the sweep.
pub const INACTIVE_TIMEOUT: Duration = Duration::from_secs(6 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Points kept before the requested start, in resolution steps.
pub const POINTS_KEPT_BEFORE_RANGE: i64 = 1;

/// Receives exactly one batch of series.
pub type Delivery = oneshot::Receiver<Vec<Series>>;

/// What the manager needs from a pooled job.
pub trait Job: Send + Sync {
    fn id(&self) -> Uuid;
    fn program(&self) -> String;
    /// Answers `target` from this job's buffer, or `None` if it cannot.
    fn reuse(&self, target: &Target) -> Option<Delivery>;
    fn is_active(&self, now: DateTime<Utc>) -> bool;
    fn stop(&self);
}
