//! Difference filter: scores frames against the previously read frame.
//!
//! The filter owns the diff-read cursor. Its first pass only captures a
//! baseline (one frame consumed, left unmarked); every later pass scores up
//! to `burst` pending frames. A frame is `Useful(magnitude)` when fewer than
//! `useful_ceiling` bytes moved by more than `pixel_threshold`.

use anyhow::{bail, Result};

use crate::frame::{Timestamp, Usefulness, MAX_FRAME_BYTES};
use crate::store::{FrameStore, Reader, StoreError};

#[derive(Clone, Debug)]
pub struct FilterConfig {
    /// Frames scored per invocation at most.
    pub burst: usize,
    /// Per-byte delta that counts as a changed pixel.
    pub pixel_threshold: u8,
    /// Magnitudes at or above this mark the frame not useful.
    pub useful_ceiling: u64,
    /// Largest payload the comparison accepts.
    pub max_frame_bytes: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            burst: 5,
            pixel_threshold: 20,
            useful_ceiling: 300,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// What one `process` call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterPass {
    /// First frame became the comparison baseline. Nothing was scored.
    Baseline,
    /// Number of frames scored this call (may be 0 when nothing was pending).
    Scored(usize),
}

impl FilterPass {
    pub fn scored(self) -> usize {
        match self {
            FilterPass::Baseline => 0,
            FilterPass::Scored(n) => n,
        }
    }
}

pub struct DifferenceFilter {
    config: FilterConfig,
    previous: Vec<u8>,
    baseline: Option<Timestamp>,
    last_seen_ms: Option<u64>,
}

impl DifferenceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            previous: Vec::with_capacity(config.max_frame_bytes),
            config,
            baseline: None,
            last_seen_ms: None,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Capture time of the baseline frame, once taken.
    pub fn baseline_timestamp(&self) -> Option<Timestamp> {
        self.baseline
    }

    pub fn last_seen_ms(&self) -> Option<u64> {
        self.last_seen_ms
    }

    /// Run one release worth of filtering.
    ///
    /// Returns an error only for frames larger than `max_frame_bytes`; that
    /// is a configuration fault and must not be retried.
    pub fn process(&mut self, store: &mut FrameStore) -> Result<FilterPass> {
        if self.baseline.is_none() {
            return self.capture_baseline(store);
        }

        let mut scored = 0;
        while scored < self.config.burst {
            let (timestamp, magnitude) = {
                let view = match store.read(Reader::Diff) {
                    Ok(view) => view,
                    Err(StoreError::NoData { .. }) => break,
                    Err(e) => return Err(e.into()),
                };
                self.check_size(view.size())?;
                let magnitude = pixel_difference(
                    view.payload,
                    &self.previous,
                    self.config.pixel_threshold,
                );
                self.previous.clear();
                self.previous.extend_from_slice(view.payload);
                (view.timestamp, magnitude)
            };

            let usefulness = if magnitude < self.config.useful_ceiling {
                Usefulness::Useful(magnitude)
            } else {
                Usefulness::NotUseful
            };
            store.mark_usefulness(usefulness)?;
            if usefulness.is_selectable() {
                log::debug!(
                    "difference filter: frame @{}ms useful (magnitude {})",
                    timestamp.as_millis(),
                    magnitude
                );
            }
            self.last_seen_ms = Some(timestamp.as_millis());
            scored += 1;
        }
        Ok(FilterPass::Scored(scored))
    }

    fn capture_baseline(&mut self, store: &mut FrameStore) -> Result<FilterPass> {
        let timestamp = {
            let view = match store.read(Reader::Diff) {
                Ok(view) => view,
                Err(StoreError::NoData { .. }) => return Ok(FilterPass::Scored(0)),
                Err(e) => return Err(e.into()),
            };
            self.check_size(view.size())?;
            self.previous.clear();
            self.previous.extend_from_slice(view.payload);
            view.timestamp
        };
        // Baseline frame is consumed without a score.
        let _ = store.advance(crate::store::Cursor::DiffRead);
        self.baseline = Some(timestamp);
        self.last_seen_ms = Some(timestamp.as_millis());
        log::info!(
            "difference filter: baseline captured @{}ms ({} bytes)",
            timestamp.as_millis(),
            self.previous.len()
        );
        Ok(FilterPass::Baseline)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_frame_bytes {
            bail!(
                "frame of {} bytes exceeds difference buffer of {} bytes",
                size,
                self.config.max_frame_bytes
            );
        }
        Ok(())
    }
}

/// Count of bytes whose absolute delta exceeds `threshold`.
///
/// Darkening counts the same as brightening: a byte that drops by more than
/// `threshold` is a change, not only one that rises. Bytes present in only
/// one of the frames count as changed.
pub fn pixel_difference(current: &[u8], previous: &[u8], threshold: u8) -> u64 {
    let changed = current
        .iter()
        .zip(previous)
        .filter(|(a, b)| a.abs_diff(**b) > threshold)
        .count();
    let unmatched = current.len().abs_diff(previous.len());
    (changed + unmatched) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(store: &mut FrameStore, fill: u8, len: usize, ms: u64) {
        store.current_write_slot()[..len].fill(fill);
        let _ = store.write(len, Timestamp::from_millis(ms)).unwrap();
    }

    #[test]
    fn pixel_difference_uses_absolute_delta() {
        assert_eq!(pixel_difference(&[0, 0, 0], &[30, 10, 0], 20), 1);
        assert_eq!(pixel_difference(&[30, 10, 0], &[0, 0, 0], 20), 1);
        // A frame that only got darker still registers every dimmed byte.
        assert_eq!(pixel_difference(&[0; 8], &[200; 8], 20), 8);
        assert_eq!(pixel_difference(&[5, 5], &[5, 5, 5, 5], 20), 2);
    }

    #[test]
    fn empty_store_yields_nothing_and_keeps_waiting_for_baseline() {
        let mut store = FrameStore::new(4, 64);
        let mut filter = DifferenceFilter::new(FilterConfig::default());
        assert_eq!(filter.process(&mut store).unwrap(), FilterPass::Scored(0));
        assert!(filter.baseline_timestamp().is_none());
    }

    #[test]
    fn small_changes_are_useful_with_magnitude() {
        let mut store = FrameStore::new(4, 64);
        let mut filter = DifferenceFilter::new(FilterConfig {
            useful_ceiling: 10,
            ..FilterConfig::default()
        });
        commit(&mut store, 100, 32, 0);
        commit(&mut store, 100, 32, 30);
        store.current_write_slot()[..32].fill(100);
        store.current_write_slot()[..4].fill(200);
        let _ = store.write(32, Timestamp::from_millis(60)).unwrap();

        assert_eq!(filter.process(&mut store).unwrap(), FilterPass::Baseline);
        assert_eq!(filter.process(&mut store).unwrap(), FilterPass::Scored(2));
        assert_eq!(store.pending(Reader::Select), 3);

        // Baseline frame stays unmarked.
        assert_eq!(
            store.peek_usefulness(Reader::Select).unwrap(),
            Usefulness::Unmarked
        );
        let _ = store.advance(crate::store::Cursor::SelectRead);
        assert_eq!(
            store.peek_usefulness(Reader::Select).unwrap(),
            Usefulness::Useful(0)
        );
        let _ = store.advance(crate::store::Cursor::SelectRead);
        assert_eq!(
            store.peek_usefulness(Reader::Select).unwrap(),
            Usefulness::Useful(4)
        );
        assert_eq!(filter.last_seen_ms(), Some(60));
    }

    #[test]
    fn burst_limits_frames_per_call() {
        let mut store = FrameStore::new(16, 8);
        let mut filter = DifferenceFilter::new(FilterConfig {
            burst: 2,
            ..FilterConfig::default()
        });
        for i in 0..6 {
            commit(&mut store, 0, 8, i * 10);
        }
        assert_eq!(filter.process(&mut store).unwrap(), FilterPass::Baseline);
        assert_eq!(filter.process(&mut store).unwrap().scored(), 2);
        assert_eq!(filter.process(&mut store).unwrap().scored(), 2);
        assert_eq!(filter.process(&mut store).unwrap().scored(), 1);
        assert_eq!(filter.process(&mut store).unwrap().scored(), 0);
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut store = FrameStore::new(4, 64);
        let mut filter = DifferenceFilter::new(FilterConfig {
            max_frame_bytes: 16,
            ..FilterConfig::default()
        });
        commit(&mut store, 1, 32, 0);
        let err = filter.process(&mut store).unwrap_err();
        assert!(err.to_string().contains("exceeds difference buffer"));
        // Nothing consumed.
        assert_eq!(store.pending(Reader::Diff), 1);
    }
}
