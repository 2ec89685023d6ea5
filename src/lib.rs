//! Synchronome frame pipeline
//!
//! This crate implements a periodic frame-acquisition pipeline that captures
//! frames from a source, scores them against their predecessor, selects one
//! frame per period and persists the selections.
//!
//! # Architecture
//!
//! Four services share one circular frame store:
//!
//! 1. **Capture**: writes each acquired frame at the write cursor.
//! 2. **Filter**: scores frames at the diff-read cursor by pixel difference.
//! 3. **Selector**: picks at most one useful frame per period at the
//!    select-read cursor and hands it off through a bounded queue.
//! 4. **Write-back**: copies handed-off frames out of the store and persists them.
//!
//! A sequencer releases each service at a harmonic sub-rate of one base tick
//! and stops the pipeline once the frame budget is persisted.
//!
//! # Module Structure
//!
//! - `frame`: Slot records, timestamps, frame handles
//! - `store`: Circular frame store and its three cursors
//! - `handoff`: Bounded FIFO between selector and write-back
//! - `filter`, `select`: Difference filter and periodic selector
//! - `ingest`, `storage`: Frame sources and persistence sinks
//! - `sequencer`, `pipeline`: Release scheduling and the service threads
//! - `config`: Layered configuration

pub mod config;
pub mod filter;
pub mod frame;
pub mod handoff;
pub mod ingest;
pub mod pipeline;
pub mod select;
pub mod sequencer;
pub mod storage;
pub mod store;

pub use config::SynchronomeConfig;
pub use filter::{pixel_difference, DifferenceFilter, FilterConfig, FilterPass};
pub use frame::{
    FrameRef, FrameView, PersistedFrame, Timestamp, Usefulness, DEFAULT_STORE_SLOTS,
    MAX_FRAME_BYTES,
};
pub use handoff::{HandoffQueue, QueueFull};
pub use ingest::{open_source, FrameSource, SourceConfig, SourceStats, SyntheticSource};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport, SharedFrames};
pub use select::{FrameSelector, Selection, SelectorConfig};
pub use sequencer::{
    AbortFlag, Release, Releases, Schedule, Sequencer, SequencerReport, Service, StopReason,
};
pub use storage::{FrameSink, InMemoryFrameSink, SqliteFrameSink};
pub use store::{Advance, Cursor, CursorSnapshot, FrameStore, Reader, StoreError};
