//! Progress reporting and cancellation
//!
//! Long-running operations report work through a [`ProgressMonitor`]. A
//! monitor announces a total with [`begin`](ProgressMonitor::begin), receives
//! increments through [`worked`](ProgressMonitor::worked) and is polled for
//! cancellation between units of work.
//!
//! Work can be split hierarchically: a [`SubMonitor`] takes a fixed share of
//! its parent's units and scales whatever total its own task declares into
//! that share.
//!
//! ```rust
//! use revstore::progress::{CallbackMonitor, ProgressInfo, ProgressMonitor, SubMonitor};
//!
//! let monitor = CallbackMonitor::new(|info: ProgressInfo| {
//!     if let Some(pct) = info.percentage() {
//!         println!("{}: {:.0}%", info.operation, pct);
//!     }
//! });
//! monitor.begin("commit", 10);
//! monitor.worked(2);
//!
//! let blobs = SubMonitor::new(&monitor, 8);
//! blobs.begin("large objects", 4);
//! blobs.worked(1);
//! blobs.done();
//! assert_eq!(monitor.processed(), 10);
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot handed to progress callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Units processed so far
    pub processed: u64,
    /// Total units (if known)
    pub total: Option<u64>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Receiver of progress and source of cancellation
pub trait ProgressMonitor: Send + Sync {
    /// Start a task of `total` units
    fn begin(&self, task: &str, total: u64);

    /// Report `units` more units of work
    fn worked(&self, units: u64);

    /// Whether the caller asked to stop
    fn is_canceled(&self) -> bool {
        false
    }

    /// The task is complete
    fn done(&self) {}
}

/// Monitor that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn begin(&self, _task: &str, _total: u64) {}

    fn worked(&self, _units: u64) {}
}

/// Shared cancellation flag
#[derive(Debug, Default, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A share of a parent monitor's work
///
/// Declares its own total through `begin` and reports into the parent in
/// the parent's units, never more than `weight` in total.
pub struct SubMonitor<'a> {
    parent: &'a dyn ProgressMonitor,
    weight: u64,
    total: AtomicU64,
    worked: AtomicU64,
    reported: Mutex<u64>,
}

impl<'a> SubMonitor<'a> {
    /// Take `weight` units of `parent`
    pub fn new(parent: &'a dyn ProgressMonitor, weight: u64) -> Self {
        Self {
            parent,
            weight,
            total: AtomicU64::new(0),
            worked: AtomicU64::new(0),
            reported: Mutex::new(0),
        }
    }

    fn report_up_to(&self, target: u64) {
        let mut reported = self.reported.lock();
        let target = target.min(self.weight);
        if target > *reported {
            self.parent.worked(target - *reported);
            *reported = target;
        }
    }
}

impl ProgressMonitor for SubMonitor<'_> {
    fn begin(&self, _task: &str, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    fn worked(&self, units: u64) {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return;
        }
        let worked = self.worked.fetch_add(units, Ordering::SeqCst) + units;
        let scaled = (u128::from(worked.min(total)) * u128::from(self.weight) / u128::from(total)) as u64;
        self.report_up_to(scaled);
    }

    fn is_canceled(&self) -> bool {
        self.parent.is_canceled()
    }

    fn done(&self) {
        self.report_up_to(self.weight);
    }
}

/// Monitor forwarding every change to a callback
pub struct CallbackMonitor<F>
where
    F: Fn(ProgressInfo) + Send + Sync,
{
    callback: F,
    operation: Mutex<String>,
    total: AtomicU64,
    processed: AtomicU64,
    cancel: CancelHandle,
}

impl<F> CallbackMonitor<F>
where
    F: Fn(ProgressInfo) + Send + Sync,
{
    /// Create a monitor calling `callback` on every change
    pub fn new(callback: F) -> Self {
        Self::with_cancel(callback, CancelHandle::new())
    }

    /// Create a monitor that observes an external cancellation flag
    pub fn with_cancel(callback: F, cancel: CancelHandle) -> Self {
        Self {
            callback,
            operation: Mutex::new(String::new()),
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            cancel,
        }
    }

    /// Flag that cancels this monitor
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Units reported so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Total announced by `begin`
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    fn emit(&self) {
        let total = self.total();
        (self.callback)(ProgressInfo {
            operation: self.operation.lock().clone(),
            processed: self.processed(),
            total: (total > 0).then_some(total),
        });
    }
}

impl<F> ProgressMonitor for CallbackMonitor<F>
where
    F: Fn(ProgressInfo) + Send + Sync,
{
    fn begin(&self, task: &str, total: u64) {
        *self.operation.lock() = task.to_string();
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.emit();
    }

    fn worked(&self, units: u64) {
        self.processed.fetch_add(units, Ordering::SeqCst);
        self.emit();
    }

    fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

/// Monitor drawing a terminal progress bar
pub struct IndicatifMonitor {
    bar: ProgressBar,
    cancel: CancelHandle,
}

impl IndicatifMonitor {
    /// Draw a bar on stderr
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self::from_bar(bar)
    }

    /// A bar that never draws
    pub fn hidden() -> Self {
        Self::from_bar(ProgressBar::hidden())
    }

    fn from_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            cancel: CancelHandle::new(),
        }
    }

    /// Flag that cancels this monitor
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current bar position
    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for IndicatifMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressMonitor for IndicatifMonitor {
    fn begin(&self, task: &str, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_message(task.to_string());
    }

    fn worked(&self, units: u64) {
        self.bar.inc(units);
    }

    fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    fn done(&self) {
        self.bar.finish_and_clear();
    }
}
