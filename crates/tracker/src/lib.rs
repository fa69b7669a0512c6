//! Causality trackers.
//!
//! A [`PendingComparableValuesTracker`] is a watermark that only moves forward.
//! Readers can wait until the watermark reaches a value, and the tracker can be
//! closed on shutdown, after which updates are rejected and unsatisfied waiters fail
//! with [`TrackerClosed`].
//!
//! Two instances exist per partition replica: the safe time tracker (hybrid
//! timestamps) and the storage index tracker (applied log indexes).

use shardline_hlc::HybridTimestamp;
use thiserror::Error;
use tokio::sync::watch;

/// The tracker was closed. Callers treat this as a benign shutdown signal.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("tracker is closed")]
pub struct TrackerClosed;

#[derive(Debug, Clone, Copy)]
struct Watermark<T> {
    value: T,
    closed: bool,
}

/// Monotonic watermark with wait-until-at-least support.
pub struct PendingComparableValuesTracker<T> {
    sender: watch::Sender<Watermark<T>>,
}

impl<T> PendingComparableValuesTracker<T>
where
    T: Ord + Copy + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(Watermark {
            value: initial,
            closed: false,
        });
        Self { sender }
    }

    /// Current watermark.
    pub fn current(&self) -> T {
        self.sender.borrow().value
    }

    /// Advance the watermark to `value` if it is greater than the current one.
    ///
    /// Smaller values are ignored, so the watermark never decreases.
    pub fn update(&self, value: T) -> Result<(), TrackerClosed> {
        let mut closed = false;
        self.sender.send_if_modified(|watermark| {
            if watermark.closed {
                closed = true;
                return false;
            }
            if value > watermark.value {
                watermark.value = value;
                true
            } else {
                false
            }
        });

        if closed { Err(TrackerClosed) } else { Ok(()) }
    }

    /// Wait until the watermark is at least `target`.
    pub async fn wait_for(&self, target: T) -> Result<(), TrackerClosed> {
        let mut receiver = self.sender.subscribe();
        let watermark = receiver
            .wait_for(|w| w.closed || w.value >= target)
            .await
            .map_err(|_| TrackerClosed)?;

        if watermark.value >= target {
            Ok(())
        } else {
            Err(TrackerClosed)
        }
    }

    /// Close the tracker. Pending waiters that are not yet satisfied fail.
    pub fn close(&self) {
        self.sender.send_modify(|watermark| watermark.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.borrow().closed
    }
}

/// Per-partition safe time.
pub type SafeTimeTracker = PendingComparableValuesTracker<HybridTimestamp>;

/// Per-partition applied log index, as seen by readers of the storage.
pub type StorageIndexTracker = PendingComparableValuesTracker<u64>;
