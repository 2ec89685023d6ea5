//! Synthetic frame source (`stub://` URLs).
//!
//! Produces RGB frames of `width * height * 3` bytes:
//! - a static gradient background,
//! - a bright horizontal band that jumps to a new row every
//!   `scene_interval` frames (a large difference),
//! - one flickering pixel per frame (a small difference).
//!
//! Fed through the difference filter this yields mostly useful frames with
//! a not-useful frame at every scene change.

use anyhow::{anyhow, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Timestamp;

const BAND_ROWS: u32 = 16;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Source URL. Must use the `stub://` scheme.
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Frames between band moves.
    pub scene_interval: u64,
}

impl SourceConfig {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://synchronome".to_string(),
            width: 640,
            height: 480,
            scene_interval: 50,
        }
    }
}

pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    scene_state: u32,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        if !config.url.starts_with("stub://") {
            return Err(anyhow!(
                "unsupported frame source '{}': only stub:// sources are built in",
                config.url
            ));
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic source needs a non-zero frame size"));
        }
        Ok(Self {
            config,
            frame_count: 0,
            scene_state: 0,
            connected: false,
        })
    }

    fn band_start(&self) -> u32 {
        let span = self.config.height.saturating_sub(BAND_ROWS).max(1);
        (self.scene_state.wrapping_mul(37)) % span
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn acquire(&mut self) -> Result<Timestamp> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} not connected", self.config.url));
        }
        self.frame_count += 1;
        if self.config.scene_interval > 0 && self.frame_count % self.config.scene_interval == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        Ok(Timestamp::now())
    }

    fn fill(&mut self, slot: &mut [u8]) -> Result<usize> {
        let size = self.config.frame_bytes();
        if size > slot.len() {
            return Err(anyhow!(
                "synthetic frame of {} bytes does not fit {} byte slot",
                size,
                slot.len()
            ));
        }
        let row_bytes = self.config.width as usize * 3;
        let band = self.band_start() as usize..(self.band_start() + BAND_ROWS) as usize;
        for (row, line) in slot[..size].chunks_mut(row_bytes).enumerate() {
            if band.contains(&row) {
                line.fill(0xF0);
            } else {
                for (col, px) in line.iter_mut().enumerate() {
                    *px = ((col / 3 + row) % 128) as u8;
                }
            }
        }
        let flicker = (self.frame_count as usize).wrapping_mul(7919) % size;
        slot[flicker] = slot[flicker].wrapping_add(0x80);
        Ok(size)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::pixel_difference;

    fn small() -> SourceConfig {
        SourceConfig {
            url: "stub://test".to_string(),
            width: 32,
            height: 32,
            scene_interval: 4,
        }
    }

    #[test]
    fn rejects_device_urls() {
        let cfg = SourceConfig {
            url: "/dev/video0".to_string(),
            ..small()
        };
        assert!(SyntheticSource::new(cfg).is_err());
    }

    #[test]
    fn acquire_requires_connect() {
        let mut source = SyntheticSource::new(small()).unwrap();
        assert!(source.acquire().is_err());
        source.connect().unwrap();
        assert!(source.acquire().is_ok());
        assert_eq!(source.stats().frames_captured, 1);
    }

    #[test]
    fn consecutive_frames_differ_slightly_and_scene_changes_differ_a_lot() {
        let cfg = small();
        let mut source = SyntheticSource::new(cfg.clone()).unwrap();
        source.connect().unwrap();
        let mut frames = Vec::new();
        for _ in 0..4 {
            let mut slot = vec![0u8; cfg.frame_bytes()];
            source.acquire().unwrap();
            let size = source.fill(&mut slot).unwrap();
            assert_eq!(size, cfg.frame_bytes());
            frames.push(slot);
        }
        // Frames 1 -> 2: only flicker pixels moved.
        assert!(pixel_difference(&frames[1], &frames[0], 20) <= 2);
        // Frame 4 moved the band.
        assert!(pixel_difference(&frames[3], &frames[2], 20) > 300);
    }

    #[test]
    fn fill_rejects_small_slot() {
        let mut source = SyntheticSource::new(small()).unwrap();
        source.connect().unwrap();
        source.acquire().unwrap();
        let mut slot = vec![0u8; 16];
        assert!(source.fill(&mut slot).is_err());
    }
}
