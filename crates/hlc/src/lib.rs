//! Hybrid logical clock timestamps.
//!
//! A [`HybridTimestamp`] packs physical milliseconds and a logical counter into a
//! single `u64` so that timestamps can be compared, persisted and embedded into
//! transaction identifiers without any extra framing. The packed layout is
//! `physical << 16 | logical`, which means the byte order of the big-endian
//! encoding is the same as the logical order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of bits reserved for the logical counter.
pub const LOGICAL_TIME_BITS: u32 = 16;

/// Maximum clock skew between nodes, in milliseconds.
///
/// A new leader cannot know the highest safe time proposed by its predecessor,
/// so it assumes everything up to `now + CLOCK_SKEW` may already have been seen.
pub const CLOCK_SKEW: u64 = 7;

const LOGICAL_MASK: u64 = (1 << LOGICAL_TIME_BITS) - 1;

/// Error returned when parsing a timestamp from its textual form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid hybrid timestamp: {0}")]
pub struct ParseTimestampError(String);

/// Immutable hybrid timestamp with total ordering.
///
/// Ordering is physical time first, then the logical counter. Both are contained in
/// the packed `u64`, so the derived ordering of the inner value is the right one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HybridTimestamp(u64);

impl HybridTimestamp {
    /// The smallest possible timestamp.
    pub const MIN: HybridTimestamp = HybridTimestamp(1 << LOGICAL_TIME_BITS);

    /// The largest possible timestamp.
    pub const MAX: HybridTimestamp = HybridTimestamp(u64::MAX);

    /// Create a timestamp from physical milliseconds and a logical counter.
    pub const fn new(physical: u64, logical: u16) -> Self {
        Self((physical << LOGICAL_TIME_BITS) | logical as u64)
    }

    /// Create a timestamp from its packed representation.
    pub const fn from_u64(packed: u64) -> Self {
        Self(packed)
    }

    /// Packed representation.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Physical component (milliseconds since Unix epoch).
    pub const fn physical(&self) -> u64 {
        self.0 >> LOGICAL_TIME_BITS
    }

    /// Logical component.
    pub const fn logical(&self) -> u16 {
        (self.0 & LOGICAL_MASK) as u16
    }

    /// The next timestamp in the total order.
    pub fn tick(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The previous timestamp in the total order.
    pub fn sub_one(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Shift the physical component forward by `millis`.
    pub fn add_physical_time(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis << LOGICAL_TIME_BITS))
    }

    /// Big-endian bytes, order preserving.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Inverse of [`HybridTimestamp::to_bytes`].
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Parse from string format: "physical_logical"
    pub fn parse(s: &str) -> Result<Self, ParseTimestampError> {
        let (physical, logical) = s
            .split_once('_')
            .ok_or_else(|| ParseTimestampError(s.to_string()))?;

        let physical: u64 = physical
            .parse()
            .map_err(|_| ParseTimestampError(format!("physical component {}", physical)))?;
        let logical: u16 = logical
            .parse()
            .map_err(|_| ParseTimestampError(format!("logical component {}", logical)))?;

        Ok(Self::new(physical, logical))
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.physical(), self.logical())
    }
}

/// Source of hybrid timestamps for one node (or one in-process cluster).
///
/// `now()` is strictly monotonic across threads: every call returns a timestamp
/// greater than every timestamp previously returned or observed via `update()`.
pub struct HybridClock {
    latest: AtomicU64,
}

impl HybridClock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self {
            latest: AtomicU64::new(0),
        }
    }

    fn physical_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    /// Generate a new timestamp.
    pub fn now(&self) -> HybridTimestamp {
        let wall = HybridTimestamp::new(Self::physical_now(), 0).as_u64();

        let mut last = self.latest.load(Ordering::SeqCst);
        loop {
            // Physical time dominates, otherwise bump the logical counter
            let next = wall.max(last + 1);
            match self
                .latest
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return HybridTimestamp(next),
                Err(current) => last = current,
            }
        }
    }

    /// Update the clock from a timestamp received from elsewhere, returning a
    /// timestamp greater than both the local time and `received`.
    pub fn update(&self, received: HybridTimestamp) -> HybridTimestamp {
        let wall = HybridTimestamp::new(Self::physical_now(), 0).as_u64();

        let mut last = self.latest.load(Ordering::SeqCst);
        loop {
            let next = wall.max(last + 1).max(received.as_u64() + 1);
            match self
                .latest
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return HybridTimestamp(next),
                Err(current) => last = current,
            }
        }
    }

    /// Latest timestamp handed out, without advancing the clock.
    pub fn current(&self) -> HybridTimestamp {
        HybridTimestamp(self.latest.load(Ordering::SeqCst))
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock shared between the components of a node.
pub type SharedClock = Arc<HybridClock>;
