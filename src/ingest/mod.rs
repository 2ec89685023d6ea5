//! Frame capture collaborators.
//!
//! A `FrameSource` is split in two phases so the frame store lock is never
//! held across device I/O:
//!
//! 1. `acquire()` waits for the next frame and timestamps it (no lock held).
//! 2. `fill()` copies or converts that frame into the store's write slot
//!    (lock held), returning the committed size.
//!
//! Only `stub://` synthetic sources ship with the crate. Device access and
//! pixel-format conversion live outside it.

pub mod synthetic;

use anyhow::Result;

use crate::frame::Timestamp;

pub use synthetic::{SourceConfig, SyntheticSource};

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    /// Open the underlying stream.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until the next frame is available and return its capture time.
    fn acquire(&mut self) -> Result<Timestamp>;

    /// Write the acquired frame into `slot` and return the number of bytes used.
    fn fill(&mut self, slot: &mut [u8]) -> Result<usize>;

    /// Reported with acquisition errors.
    fn stats(&self) -> SourceStats;
}

/// Build a source from its URL.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(SyntheticSource::new(config)?))
}
