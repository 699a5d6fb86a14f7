//! Batch progress: the observable [`BatchStatus`] and a per-page callback trait.
//!
//! Two integration points exist. [`crate::Pipeline::subscribe`] hands out a
//! `tokio::sync::watch` receiver for UIs that want the latest snapshot, and
//! an [`Arc<dyn BatchProgressCallback>`] injected via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] receives
//! every page event as it happens (progress bars, logs, websockets).
//!
//! # Example
//!
//! ```rust
//! use edgequake_examscan::{BatchProgressCallback, BatchStatus, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_id: &str, derived: usize, status: &BatchStatus) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{page_id}: {derived} page(s), {}/{}", status.completed, status.total);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Scheduler state machine: `Idle → Running → (Stopping →) Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    #[default]
    Idle,
    Running,
    /// Stop requested; the in-flight page is finishing.
    Stopping,
}

/// Snapshot of the current (or last) batch run.
///
/// `total` and `completed` only grow during a run, so a progress bar fed
/// from them never moves backwards. Pages queued mid-run raise `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchStatus {
    pub state: BatchState,
    pub total: usize,
    /// Pages attempted, failed ones included.
    pub completed: usize,
    pub failed: usize,
}

impl BatchStatus {
    pub fn is_running(&self) -> bool {
        self.state != BatchState::Idle
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

/// Called by the scheduler as it processes each page.
///
/// The scheduler is strictly sequential, so events never overlap, but the
/// callback may be invoked from any tokio worker thread. All methods default
/// to no-ops.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once when a run starts, with the number of pending pages.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Pages were queued while a run was in progress.
    fn on_total_changed(&self, status: &BatchStatus) {
        let _ = status;
    }

    /// Called just before a page is dispatched.
    fn on_page_start(&self, page_id: &str, status: &BatchStatus) {
        let _ = (page_id, status);
    }

    /// Called after a page was reconciled into `derived` candidate pages.
    fn on_page_complete(&self, page_id: &str, derived: usize, status: &BatchStatus) {
        let _ = (page_id, derived, status);
    }

    /// Called when a page ends in the `error` state.
    fn on_page_error(&self, page_id: &str, error: &PageError, status: &BatchStatus) {
        let _ = (page_id, error, status);
    }

    /// Called once when the run ends, normally or by a stop request.
    fn on_batch_complete(&self, status: &BatchStatus, stopped: bool) {
        let _ = (status, stopped);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
