//! Frame selector: picks at most one frame per release at a fixed cadence.
//!
//! The selector owns the select-read cursor and trails the difference
//! filter. A frame qualifies when more than `period - tolerance` has elapsed
//! since the last selected frame (or the baseline, before the first
//! selection) and the filter scored it useful.

use std::time::Duration;

use crate::frame::{FrameRef, Timestamp};
use crate::handoff::HandoffQueue;
use crate::store::{Cursor, FrameStore, Reader};

#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Target time between selected frames.
    pub period: Duration,
    /// Early-selection allowance subtracted from `period`.
    pub tolerance: Duration,
    /// Highest label handed out; selection stops afterwards.
    pub max_selections: u32,
}

impl SelectorConfig {
    pub fn from_rate_hz(rate_hz: f64, tolerance: Duration, max_selections: u32) -> Self {
        Self {
            period: Duration::from_nanos((1e9 / rate_hz).round() as u64),
            tolerance,
            max_selections,
        }
    }

    fn threshold_ms(&self) -> u64 {
        self.period.saturating_sub(self.tolerance).as_millis() as u64
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(100),
            tolerance: Duration::from_millis(10),
            max_selections: 180,
        }
    }
}

/// Outcome of one `select` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The difference filter has not captured its baseline yet.
    AwaitingBaseline,
    /// Every pending frame was consumed and none qualified.
    NothingQualified,
    /// A frame was labelled and queued for persistence.
    Selected { label: u32 },
    /// A frame qualified but the hand-off queue was full; it was dropped.
    QueueFull { label: u32 },
}

pub struct FrameSelector {
    config: SelectorConfig,
    last_selected: Option<Timestamp>,
    next_label: u32,
}

impl FrameSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            last_selected: None,
            next_label: 1,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Label the next selected frame will carry.
    pub fn next_label(&self) -> u32 {
        self.next_label
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_label > self.config.max_selections
    }

    pub fn last_selected(&self) -> Option<Timestamp> {
        self.last_selected
    }

    /// Consume scored frames until one qualifies or none are left.
    ///
    /// `baseline` is the filter's baseline capture time; selection does not
    /// start before it exists.
    pub fn select(
        &mut self,
        store: &mut FrameStore,
        queue: &mut HandoffQueue<FrameRef>,
        baseline: Option<Timestamp>,
    ) -> Selection {
        let Some(baseline) = baseline else {
            return Selection::AwaitingBaseline;
        };
        let reference = self.last_selected.unwrap_or(baseline);
        let threshold = self.config.threshold_ms();

        while !self.is_exhausted() {
            let (Ok(timestamp), Ok(usefulness)) = (
                store.peek_timestamp(Reader::Select),
                store.peek_usefulness(Reader::Select),
            ) else {
                break;
            };

            let due = timestamp
                .millis_since(reference)
                .is_some_and(|elapsed| elapsed > threshold);
            if !(due && usefulness.is_selectable()) {
                let _ = store.advance(Cursor::SelectRead);
                continue;
            }

            let label = self.next_label;
            // Slot is pending for the selector, so these cannot fail.
            if store.stamp_label(label).is_err() {
                break;
            }
            let Ok(frame) = store.frame_ref(Reader::Select) else {
                break;
            };
            let _ = store.advance(Cursor::SelectRead);
            self.last_selected = Some(timestamp);

            return match queue.push(frame) {
                Ok(()) => {
                    self.next_label += 1;
                    log::info!(
                        "frame selector: frame {} selected @{}ms ({:?})",
                        label,
                        timestamp.as_millis(),
                        usefulness
                    );
                    Selection::Selected { label }
                }
                Err(_) => {
                    log::warn!(
                        "frame selector: hand-off queue full, dropping frame {} @{}ms",
                        label,
                        timestamp.as_millis()
                    );
                    Selection::QueueFull { label }
                }
            };
        }
        Selection::NothingQualified
    }
}
