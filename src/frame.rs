//! Frame records and the handles that refer to them.
//!
//! - `FrameRecord`: one fixed-capacity slot of the frame store. Records are
//!   allocated once and overwritten in place, never resized.
//! - `FrameView`: borrowed, read-only view of a committed slot.
//! - `FrameRef`: index + generation handle handed downstream. It never
//!   aliases slot memory; it must be resolved against the store.
//! - `PersistedFrame`: owned copy taken for persistence, safe to hold after
//!   the store lock is released.

use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Maximum payload bytes a slot can hold (largest supported resolution).
pub const MAX_FRAME_BYTES: usize = 1280 * 960;

/// Default number of slots in the frame store.
pub const DEFAULT_STORE_SLOTS: usize = 90;

const NANOS_PER_SEC: u64 = 1_000_000_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Monotonic capture time, seconds + nanoseconds since the process clock anchor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

fn clock_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

impl Timestamp {
    pub fn new(secs: u64, nanos: u32) -> Self {
        let carry = u64::from(nanos) / NANOS_PER_SEC;
        Self {
            secs: secs + carry,
            nanos: (u64::from(nanos) % NANOS_PER_SEC) as u32,
        }
    }

    /// Current monotonic time.
    pub fn now() -> Self {
        Self::from_duration(clock_anchor().elapsed())
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::from_duration(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }

    /// Whole milliseconds (truncated).
    pub fn as_millis(&self) -> u64 {
        self.secs * 1000 + u64::from(self.nanos) / NANOS_PER_MILLI
    }

    /// Milliseconds elapsed since `earlier`, or `None` if `self` is not later.
    pub fn millis_since(&self, earlier: Timestamp) -> Option<u64> {
        let now = self.as_millis();
        let then = earlier.as_millis();
        (now > then).then(|| now - then)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

// ----------------------------------------------------------------------------
// Usefulness
// ----------------------------------------------------------------------------

/// Per-frame score written by the difference filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Usefulness {
    /// Just captured, not scored yet.
    #[default]
    Unmarked,
    /// Difference against the previous frame reached the ceiling.
    NotUseful,
    /// Difference magnitude below the ceiling.
    Useful(u64),
}

impl Usefulness {
    /// Only scored, useful frames are candidates for selection.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Usefulness::Useful(_))
    }

    pub fn magnitude(&self) -> Option<u64> {
        match self {
            Usefulness::Useful(m) => Some(*m),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// FrameRecord
// ----------------------------------------------------------------------------

/// One slot of the frame store.
pub struct FrameRecord {
    pub(crate) timestamp: Timestamp,
    pub(crate) usefulness: Usefulness,
    pub(crate) size: usize,
    pub(crate) label: u32,
    /// 1-based commit counter of the frame held here; 0 = never written.
    pub(crate) generation: u64,
    pub(crate) payload: Box<[u8]>,
}

impl FrameRecord {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamp: Timestamp::default(),
            usefulness: Usefulness::Unmarked,
            size: 0,
            label: 0,
            generation: 0,
            payload: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    pub(crate) fn view(&self, index: usize) -> FrameView<'_> {
        FrameView {
            index,
            timestamp: self.timestamp,
            usefulness: self.usefulness,
            label: self.label,
            generation: self.generation,
            payload: &self.payload[..self.size],
        }
    }
}

impl std::fmt::Debug for FrameRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRecord")
            .field("timestamp", &self.timestamp)
            .field("usefulness", &self.usefulness)
            .field("size", &self.size)
            .field("label", &self.label)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Views and references
// ----------------------------------------------------------------------------

/// Read-only view of a committed slot. Lives only as long as the store borrow.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub index: usize,
    pub timestamp: Timestamp,
    pub usefulness: Usefulness,
    pub label: u32,
    pub generation: u64,
    pub payload: &'a [u8],
}

impl FrameView<'_> {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Owned copy for use outside the store lock.
    pub fn to_persisted(&self) -> PersistedFrame {
        PersistedFrame {
            label: self.label,
            timestamp: self.timestamp,
            usefulness: self.usefulness,
            generation: self.generation,
            payload: self.payload.to_vec(),
        }
    }
}

/// Handle to a selected frame, pushed through the hand-off queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRef {
    pub index: usize,
    pub generation: u64,
    pub label: u32,
}

/// Owned frame handed to a `FrameSink`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedFrame {
    pub label: u32,
    pub timestamp: Timestamp,
    pub usefulness: Usefulness,
    pub generation: u64,
    pub payload: Vec<u8>,
}

impl PersistedFrame {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload_digest(&self) -> [u8; 32] {
        Sha256::digest(&self.payload).into()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
