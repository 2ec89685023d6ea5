//! Fixed-capacity circular frame store.
//!
//! The store owns `N` preallocated `FrameRecord` slots and three cursors:
//!
//! - `write`: next slot the capture service fills.
//! - `diff_read`: next slot the difference filter consumes.
//! - `select_read`: next slot the frame selector consumes.
//!
//! Ordering is tracked with two counters instead of comparing indices:
//! `depth` (frames not yet consumed by the selector) and `diff_pending`
//! (frames not yet consumed by the filter). With `0 <= diff_pending <= depth <= N`
//! the cursor positions always satisfy
//!
//! ```text
//! diff_read = select_read + (depth - diff_pending)   (mod N)
//! write     = diff_read   + diff_pending             (mod N)
//! ```
//!
//! so a reader may advance exactly when its distance to the cursor ahead is
//! non-zero, including the wrapped case where both indices are equal and the
//! store is full.
//!
//! The store itself is not synchronized. Services share it behind one mutex
//! (see `pipeline::SharedFrames`) and hold the lock across read-modify
//! sequences such as "fill payload, then commit".

use crate::frame::{FrameRecord, FrameRef, FrameView, Timestamp, Usefulness};

/// Cursor that can be advanced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cursor {
    Write,
    DiffRead,
    SelectRead,
}

/// Cursor that can read a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reader {
    Diff,
    Select,
}

impl From<Reader> for Cursor {
    fn from(reader: Reader) -> Self {
        match reader {
            Reader::Diff => Cursor::DiffRead,
            Reader::Select => Cursor::SelectRead,
        }
    }
}

impl std::fmt::Display for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reader::Diff => f.write_str("diff_read"),
            Reader::Select => f.write_str("select_read"),
        }
    }
}

/// Outcome of `FrameStore::advance`.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Cursor moved one slot.
    Moved,
    /// Writer moved into a full store; the oldest unconsumed frame was lost.
    Overran,
    /// Reader has nothing new to consume. State unchanged.
    Blocked,
}

impl Advance {
    pub fn moved(self) -> bool {
        !matches!(self, Advance::Blocked)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The reader has no unconsumed frame at its cursor.
    NoData { reader: Reader },
    /// Committed size does not fit the slot payload.
    PayloadTooLarge { size: usize, capacity: usize },
    /// A `FrameRef` no longer matches the slot contents.
    Overwritten {
        index: usize,
        expected: u64,
        found: u64,
    },
    IndexOutOfRange { index: usize, capacity: usize },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NoData { reader } => write!(f, "no frame available for {}", reader),
            StoreError::PayloadTooLarge { size, capacity } => {
                write!(f, "frame of {} bytes exceeds slot capacity {}", size, capacity)
            }
            StoreError::Overwritten {
                index,
                expected,
                found,
            } => write!(
                f,
                "slot {} overwritten (expected generation {}, found {})",
                index, expected, found
            ),
            StoreError::IndexOutOfRange { index, capacity } => {
                write!(f, "slot index {} out of range for {} slots", index, capacity)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Cursor state for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub write: usize,
    pub diff_read: usize,
    pub select_read: usize,
    pub depth: usize,
    pub diff_pending: usize,
}

impl std::fmt::Display for CursorSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write:{} diff_read:{} select_read:{} depth:{}",
            self.write, self.diff_read, self.select_read, self.depth
        )
    }
}

pub struct FrameStore {
    slots: Vec<FrameRecord>,
    write: usize,
    diff_read: usize,
    select_read: usize,
    depth: usize,
    diff_pending: usize,
    generation: u64,
    overruns: u64,
}

impl FrameStore {
    /// Allocate `slots` records of `frame_bytes` payload each. All cursors start at 0.
    ///
    /// Panics if `slots` is zero.
    pub fn new(slots: usize, frame_bytes: usize) -> Self {
        assert!(slots > 0, "frame store needs at least one slot");
        Self {
            slots: (0..slots)
                .map(|_| FrameRecord::with_capacity(frame_bytes))
                .collect(),
            write: 0,
            diff_read: 0,
            select_read: 0,
            depth: 0,
            diff_pending: 0,
            generation: 0,
            overruns: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_bytes(&self) -> usize {
        self.slots[0].capacity()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_full(&self) -> bool {
        self.depth == self.capacity()
    }

    /// Number of writer overruns since construction or `reset`.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Frames available to `reader` (its distance to the cursor ahead).
    pub fn pending(&self, reader: Reader) -> usize {
        match reader {
            Reader::Diff => self.diff_pending,
            Reader::Select => self.depth - self.diff_pending,
        }
    }

    pub fn cursors(&self) -> CursorSnapshot {
        CursorSnapshot {
            write: self.write,
            diff_read: self.diff_read,
            select_read: self.select_read,
            depth: self.depth,
            diff_pending: self.diff_pending,
        }
    }

    /// Zero all cursors and counters. Slot contents are left in place.
    pub fn reset(&mut self) {
        self.write = 0;
        self.diff_read = 0;
        self.select_read = 0;
        self.depth = 0;
        self.diff_pending = 0;
        self.overruns = 0;
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// Move one cursor one slot forward.
    ///
    /// The writer always moves. Readers move only when they have an
    /// unconsumed frame, which also guarantees they never pass the cursor
    /// ahead of them; otherwise `Advance::Blocked` is returned and nothing changes.
    pub fn advance(&mut self, cursor: Cursor) -> Advance {
        let outcome = match cursor {
            Cursor::Write => self.advance_write(),
            Cursor::DiffRead => {
                if self.diff_pending == 0 {
                    return Advance::Blocked;
                }
                self.diff_read = self.next(self.diff_read);
                self.diff_pending -= 1;
                Advance::Moved
            }
            Cursor::SelectRead => {
                if self.pending(Reader::Select) == 0 {
                    return Advance::Blocked;
                }
                self.select_read = self.next(self.select_read);
                self.depth -= 1;
                Advance::Moved
            }
        };
        debug_assert!(self.invariant_holds(), "cursor invariant broken: {}", self.cursors());
        outcome
    }

    fn advance_write(&mut self) -> Advance {
        let capacity = self.capacity();
        self.write = self.next(self.write);
        if self.depth < capacity {
            self.depth += 1;
            self.diff_pending += 1;
            return Advance::Moved;
        }

        // Full: the slot just committed was the selector's oldest frame.
        // Carry the lagging cursors past it so ordering still holds.
        self.select_read = self.next(self.select_read);
        if self.diff_pending == capacity {
            self.diff_read = self.next(self.diff_read);
        } else {
            self.diff_pending += 1;
        }
        self.overruns += 1;
        Advance::Overran
    }

    /// Cursor ordering check derived from the depth counters.
    pub fn invariant_holds(&self) -> bool {
        let n = self.capacity();
        self.diff_pending <= self.depth
            && self.depth <= n
            && self.diff_read == (self.select_read + (self.depth - self.diff_pending)) % n
            && self.write == (self.diff_read + self.diff_pending) % n
    }

    /// Payload of the slot the writer fills next. Holds the full slot capacity.
    pub fn current_write_slot(&mut self) -> &mut [u8] {
        &mut self.slots[self.write].payload
    }

    /// Commit the slot at `write` with its size and capture time, then advance the writer.
    pub fn write(&mut self, size: usize, timestamp: Timestamp) -> Result<Advance, StoreError> {
        let capacity = self.frame_bytes();
        if size > capacity {
            return Err(StoreError::PayloadTooLarge { size, capacity });
        }
        self.generation += 1;
        let slot = &mut self.slots[self.write];
        slot.size = size;
        slot.timestamp = timestamp;
        slot.usefulness = Usefulness::Unmarked;
        slot.label = 0;
        slot.generation = self.generation;
        Ok(self.advance(Cursor::Write))
    }

    /// Score the slot at `diff_read`, then advance the filter cursor.
    pub fn mark_usefulness(&mut self, value: Usefulness) -> Result<(), StoreError> {
        let index = self.slot_index(Reader::Diff)?;
        self.slots[index].usefulness = value;
        let _ = self.advance(Cursor::DiffRead);
        Ok(())
    }

    /// Label the slot at `select_read` with its output sequence number.
    pub fn stamp_label(&mut self, label: u32) -> Result<(), StoreError> {
        let index = self.slot_index(Reader::Select)?;
        self.slots[index].label = label;
        Ok(())
    }

    fn slot_index(&self, reader: Reader) -> Result<usize, StoreError> {
        if self.pending(reader) == 0 {
            return Err(StoreError::NoData { reader });
        }
        Ok(match reader {
            Reader::Diff => self.diff_read,
            Reader::Select => self.select_read,
        })
    }

    /// View of the slot at the reader's cursor.
    pub fn read(&self, reader: Reader) -> Result<FrameView<'_>, StoreError> {
        let index = self.slot_index(reader)?;
        Ok(self.slots[index].view(index))
    }

    pub fn peek_timestamp(&self, reader: Reader) -> Result<Timestamp, StoreError> {
        let index = self.slot_index(reader)?;
        Ok(self.slots[index].timestamp)
    }

    pub fn peek_usefulness(&self, reader: Reader) -> Result<Usefulness, StoreError> {
        let index = self.slot_index(reader)?;
        Ok(self.slots[index].usefulness)
    }

    /// Handle to the slot at the reader's cursor.
    pub fn frame_ref(&self, reader: Reader) -> Result<FrameRef, StoreError> {
        let index = self.slot_index(reader)?;
        let slot = &self.slots[index];
        Ok(FrameRef {
            index,
            generation: slot.generation,
            label: slot.label,
        })
    }

    /// Resolve a handle back to its slot, failing if the writer has since reused it.
    pub fn resolve(&self, frame: &FrameRef) -> Result<FrameView<'_>, StoreError> {
        let slot = self
            .slots
            .get(frame.index)
            .ok_or(StoreError::IndexOutOfRange {
                index: frame.index,
                capacity: self.capacity(),
            })?;
        if slot.generation != frame.generation {
            return Err(StoreError::Overwritten {
                index: frame.index,
                expected: frame.generation,
                found: slot.generation,
            });
        }
        Ok(slot.view(frame.index))
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("slots", &self.slots.len())
            .field("frame_bytes", &self.frame_bytes())
            .field("cursors", &self.cursors())
            .field("generation", &self.generation)
            .field("overruns", &self.overruns)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(store: &mut FrameStore, fill: u8, ms: u64) -> Advance {
        let slot = store.current_write_slot();
        slot[..8].fill(fill);
        store.write(8, Timestamp::from_millis(ms)).expect("write")
    }

    #[test]
    fn new_store_is_empty_and_readers_are_blocked() {
        let mut store = FrameStore::new(4, 16);
        assert_eq!(store.cursors(), CursorSnapshot::default());
        assert_eq!(store.advance(Cursor::DiffRead), Advance::Blocked);
        assert_eq!(store.advance(Cursor::SelectRead), Advance::Blocked);
        assert_eq!(
            store.read(Reader::Diff).unwrap_err(),
            StoreError::NoData {
                reader: Reader::Diff
            }
        );
    }

    #[test]
    fn selector_cannot_pass_filter() {
        let mut store = FrameStore::new(4, 16);
        commit(&mut store, 1, 0);
        commit(&mut store, 2, 10);
        assert_eq!(store.advance(Cursor::SelectRead), Advance::Blocked);
        store.mark_usefulness(Usefulness::Useful(3)).unwrap();
        assert_eq!(store.pending(Reader::Select), 1);
        assert_eq!(store.advance(Cursor::SelectRead), Advance::Moved);
        assert_eq!(store.advance(Cursor::SelectRead), Advance::Blocked);
        assert_eq!(store.depth(), 1);
    }

    #[test]
    fn write_resets_usefulness_and_stamps_generation() {
        let mut store = FrameStore::new(2, 16);
        commit(&mut store, 9, 5);
        let view = store.read(Reader::Diff).unwrap();
        assert_eq!(view.usefulness, Usefulness::Unmarked);
        assert_eq!(view.generation, 1);
        assert_eq!(view.timestamp, Timestamp::from_millis(5));
        assert_eq!(view.payload, &[9u8; 8]);
    }

    #[test]
    fn oversized_write_is_rejected_without_moving() {
        let mut store = FrameStore::new(2, 16);
        let err = store.write(17, Timestamp::default()).unwrap_err();
        assert_eq!(
            err,
            StoreError::PayloadTooLarge {
                size: 17,
                capacity: 16
            }
        );
        assert_eq!(store.cursors().write, 0);
        assert_eq!(store.depth(), 0);
    }

    #[test]
    fn overrun_saturates_depth_and_carries_readers() {
        let mut store = FrameStore::new(3, 16);
        for i in 0..3 {
            assert_eq!(commit(&mut store, i, u64::from(i)), Advance::Moved);
        }
        assert!(store.is_full());
        assert_eq!(commit(&mut store, 3, 3), Advance::Overran);
        assert_eq!(store.depth(), 3);
        assert_eq!(store.overruns(), 1);
        assert!(store.invariant_holds());
        // Oldest frame (fill 0) is gone; the filter now starts at fill 1.
        assert_eq!(store.read(Reader::Diff).unwrap().payload[0], 1);
    }

    #[test]
    fn overrun_with_scored_frames_keeps_filter_position() {
        let mut store = FrameStore::new(3, 16);
        for i in 0..3 {
            let _ = commit(&mut store, i, u64::from(i));
        }
        store.mark_usefulness(Usefulness::Useful(1)).unwrap();
        store.mark_usefulness(Usefulness::Useful(1)).unwrap();
        assert_eq!(commit(&mut store, 3, 3), Advance::Overran);
        let snap = store.cursors();
        assert_eq!(snap.select_read, 1);
        assert_eq!(snap.diff_read, 2);
        assert_eq!(snap.diff_pending, 2);
        assert_eq!(store.pending(Reader::Select), 1);
        assert!(store.invariant_holds());
    }

    #[test]
    fn resolve_detects_reused_slot() {
        let mut store = FrameStore::new(2, 16);
        let _ = commit(&mut store, 1, 0);
        store.mark_usefulness(Usefulness::Useful(0)).unwrap();
        store.stamp_label(1).unwrap();
        let handle = store.frame_ref(Reader::Select).unwrap();
        assert_eq!(handle.label, 1);
        let _ = store.advance(Cursor::SelectRead);
        assert!(store.resolve(&handle).is_ok());

        let _ = commit(&mut store, 2, 1);
        let _ = commit(&mut store, 3, 2);
        match store.resolve(&handle) {
            Err(StoreError::Overwritten {
                index, expected, ..
            }) => {
                assert_eq!(index, 0);
                assert_eq!(expected, 1);
            }
            other => panic!("expected overwritten, got {:?}", other.map(|v| v.index)),
        }
    }

    #[test]
    fn resolve_rejects_out_of_range_index() {
        let store = FrameStore::new(2, 4);
        let bogus = FrameRef {
            index: 5,
            generation: 0,
            label: 0,
        };
        assert!(matches!(
            store.resolve(&bogus),
            Err(StoreError::IndexOutOfRange { index: 5, .. })
        ));
    }

    #[test]
    fn snapshot_display_matches_log_format() {
        let mut store = FrameStore::new(4, 4);
        let _ = store.advance(Cursor::Write);
        assert_eq!(
            store.cursors().to_string(),
            "write:1 diff_read:0 select_read:0 depth:1"
        );
    }
}
