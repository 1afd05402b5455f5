//! Progress hook for multi-request fetches.
//!
//! The client reports completed requests through [`ProgressCallback`];
//! rendering (progress bars, log lines, nothing) is left to the caller.

use std::sync::Arc;

/// Receives progress from long-running fetches such as
/// [`CensusClient::fetch_time_series`](crate::CensusClient::fetch_time_series).
pub trait ProgressCallback: Send + Sync {
    /// Total units of work, once known.
    fn set_total(&self, total: u64);

    /// Advance by `delta` completed units.
    fn inc(&self, delta: u64);

    fn set_message(&self, msg: String);

    /// Work is done.
    fn finish(&self, msg: String);
}

/// Discards all progress updates.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
