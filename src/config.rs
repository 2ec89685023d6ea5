use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::filter::FilterConfig;
use crate::frame::{DEFAULT_STORE_SLOTS, MAX_FRAME_BYTES};
use crate::ingest::SourceConfig;
use crate::pipeline::PipelineConfig;
use crate::select::SelectorConfig;
use crate::sequencer::Schedule;

const DEFAULT_HANDOFF_CAPACITY: usize = 10;
const DEFAULT_BURST: usize = 5;
const DEFAULT_PIXEL_THRESHOLD: u8 = 20;
const DEFAULT_USEFUL_CEILING: u64 = 300;
const DEFAULT_SELECTION_HZ: f64 = 10.0;
const DEFAULT_TOLERANCE_MS: u64 = 10;
const DEFAULT_MAX_SELECTIONS: u32 = 180;
const DEFAULT_BASE_PERIOD_MS: u64 = 10;
const DEFAULT_CAPTURE_DIVISOR: u64 = 3;
const DEFAULT_FILTER_DIVISOR: u64 = 5;
const DEFAULT_SELECTOR_DIVISOR: u64 = 10;
const DEFAULT_WRITEBACK_DIVISOR: u64 = 1;
const DEFAULT_FRAME_BUDGET: u64 = 180;
const DEFAULT_SOURCE: &str = "stub://synchronome";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_WARMUP_FRAMES: u32 = 20;
const DEFAULT_SCENE_INTERVAL: u64 = 50;
const DEFAULT_DB_PATH: &str = "frames.db";

#[derive(Debug, Deserialize, Default)]
struct SynchronomeConfigFile {
    store: Option<StoreConfigFile>,
    handoff: Option<HandoffConfigFile>,
    filter: Option<FilterConfigFile>,
    selector: Option<SelectorConfigFile>,
    sequencer: Option<SequencerConfigFile>,
    capture: Option<CaptureConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    slots: Option<usize>,
    frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct HandoffConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterConfigFile {
    burst: Option<usize>,
    pixel_threshold: Option<u8>,
    useful_ceiling: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SelectorConfigFile {
    rate_hz: Option<f64>,
    tolerance_ms: Option<u64>,
    max_selections: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SequencerConfigFile {
    base_period_ms: Option<u64>,
    capture_divisor: Option<u64>,
    filter_divisor: Option<u64>,
    selector_divisor: Option<u64>,
    writeback_divisor: Option<u64>,
    frame_budget: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    warmup_frames: Option<u32>,
    scene_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SynchronomeConfig {
    pub store: StoreSettings,
    pub handoff_capacity: usize,
    pub filter: FilterSettings,
    pub selector: SelectorSettings,
    pub sequencer: SequencerSettings,
    pub capture: CaptureSettings,
    pub db_path: String,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub slots: usize,
    pub frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub burst: usize,
    pub pixel_threshold: u8,
    pub useful_ceiling: u64,
}

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub rate_hz: f64,
    pub tolerance: Duration,
    pub max_selections: u32,
}

#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub base_period: Duration,
    pub capture_divisor: u64,
    pub filter_divisor: u64,
    pub selector_divisor: u64,
    pub writeback_divisor: u64,
    pub frame_budget: u64,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub warmup_frames: u32,
    pub scene_interval: u64,
}

impl SynchronomeConfig {
    /// File named by `SYNCHRONOME_CONFIG` (optional), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SYNCHRONOME_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SynchronomeConfigFile) -> Self {
        let store = file.store.unwrap_or_default();
        let handoff = file.handoff.unwrap_or_default();
        let filter = file.filter.unwrap_or_default();
        let selector = file.selector.unwrap_or_default();
        let sequencer = file.sequencer.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let output = file.output.unwrap_or_default();

        Self {
            store: StoreSettings {
                slots: store.slots.unwrap_or(DEFAULT_STORE_SLOTS),
                frame_bytes: store.frame_bytes.unwrap_or(MAX_FRAME_BYTES),
            },
            handoff_capacity: handoff.capacity.unwrap_or(DEFAULT_HANDOFF_CAPACITY),
            filter: FilterSettings {
                burst: filter.burst.unwrap_or(DEFAULT_BURST),
                pixel_threshold: filter.pixel_threshold.unwrap_or(DEFAULT_PIXEL_THRESHOLD),
                useful_ceiling: filter.useful_ceiling.unwrap_or(DEFAULT_USEFUL_CEILING),
            },
            selector: SelectorSettings {
                rate_hz: selector.rate_hz.unwrap_or(DEFAULT_SELECTION_HZ),
                tolerance: Duration::from_millis(
                    selector.tolerance_ms.unwrap_or(DEFAULT_TOLERANCE_MS),
                ),
                max_selections: selector.max_selections.unwrap_or(DEFAULT_MAX_SELECTIONS),
            },
            sequencer: SequencerSettings {
                base_period: Duration::from_millis(
                    sequencer.base_period_ms.unwrap_or(DEFAULT_BASE_PERIOD_MS),
                ),
                capture_divisor: sequencer.capture_divisor.unwrap_or(DEFAULT_CAPTURE_DIVISOR),
                filter_divisor: sequencer.filter_divisor.unwrap_or(DEFAULT_FILTER_DIVISOR),
                selector_divisor: sequencer
                    .selector_divisor
                    .unwrap_or(DEFAULT_SELECTOR_DIVISOR),
                writeback_divisor: sequencer
                    .writeback_divisor
                    .unwrap_or(DEFAULT_WRITEBACK_DIVISOR),
                frame_budget: sequencer.frame_budget.unwrap_or(DEFAULT_FRAME_BUDGET),
            },
            capture: CaptureSettings {
                source: capture
                    .source
                    .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
                warmup_frames: capture.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
                scene_interval: capture.scene_interval.unwrap_or(DEFAULT_SCENE_INTERVAL),
            },
            db_path: output
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("SYNCHRONOME_SOURCE") {
            if !source.trim().is_empty() {
                self.capture.source = source;
            }
        }
        if let Ok(path) = std::env::var("SYNCHRONOME_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(budget) = std::env::var("SYNCHRONOME_FRAME_BUDGET") {
            self.sequencer.frame_budget = budget.trim().parse().map_err(|_| {
                anyhow!("SYNCHRONOME_FRAME_BUDGET must be an integer number of frames")
            })?;
        }
        if let Ok(rate) = std::env::var("SYNCHRONOME_SELECTION_HZ") {
            self.selector.rate_hz = rate
                .trim()
                .parse()
                .map_err(|_| anyhow!("SYNCHRONOME_SELECTION_HZ must be a number"))?;
        }
        if let Ok(slots) = std::env::var("SYNCHRONOME_SLOTS") {
            self.store.slots = slots
                .trim()
                .parse()
                .map_err(|_| anyhow!("SYNCHRONOME_SLOTS must be an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.slots < 2 {
            return Err(anyhow!("store.slots must be at least 2"));
        }
        if self.store.frame_bytes == 0 || self.store.frame_bytes > MAX_FRAME_BYTES {
            return Err(anyhow!(
                "store.frame_bytes must be between 1 and {}",
                MAX_FRAME_BYTES
            ));
        }
        if self.handoff_capacity == 0 {
            return Err(anyhow!("handoff.capacity must be at least 1"));
        }
        if self.filter.burst == 0 {
            return Err(anyhow!("filter.burst must be at least 1"));
        }
        if !self.selector.rate_hz.is_finite() || self.selector.rate_hz <= 0.0 {
            return Err(anyhow!("selector.rate_hz must be a positive number"));
        }
        if self.selector.tolerance >= self.selection_period() {
            return Err(anyhow!(
                "selector.tolerance_ms must be below the selection period ({} ms)",
                self.selection_period().as_millis()
            ));
        }
        if self.sequencer.base_period.is_zero() {
            return Err(anyhow!("sequencer.base_period_ms must be greater than zero"));
        }
        for (name, divisor) in [
            ("capture_divisor", self.sequencer.capture_divisor),
            ("filter_divisor", self.sequencer.filter_divisor),
            ("selector_divisor", self.sequencer.selector_divisor),
            ("writeback_divisor", self.sequencer.writeback_divisor),
        ] {
            if divisor == 0 {
                return Err(anyhow!("sequencer.{} must be at least 1", name));
            }
        }
        if self.sequencer.frame_budget == 0 {
            return Err(anyhow!("sequencer.frame_budget must be at least 1"));
        }
        if self.sequencer.frame_budget > u64::from(self.selector.max_selections) {
            return Err(anyhow!(
                "sequencer.frame_budget {} exceeds selector.max_selections {}",
                self.sequencer.frame_budget,
                self.selector.max_selections
            ));
        }
        let frame = self.source_config().frame_bytes();
        if frame == 0 || frame > self.store.frame_bytes {
            return Err(anyhow!(
                "capture frame of {}x{} ({} bytes) does not fit store.frame_bytes {}",
                self.capture.width,
                self.capture.height,
                frame,
                self.store.frame_bytes
            ));
        }
        Ok(())
    }

    pub fn selection_period(&self) -> Duration {
        SelectorConfig::from_rate_hz(self.selector.rate_hz, self.selector.tolerance, 0).period
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.capture.source.clone(),
            width: self.capture.width,
            height: self.capture.height,
            scene_interval: self.capture.scene_interval,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            slots: self.store.slots,
            frame_bytes: self.store.frame_bytes,
            handoff_capacity: self.handoff_capacity,
            filter: FilterConfig {
                burst: self.filter.burst,
                pixel_threshold: self.filter.pixel_threshold,
                useful_ceiling: self.filter.useful_ceiling,
                max_frame_bytes: MAX_FRAME_BYTES,
            },
            selector: SelectorConfig::from_rate_hz(
                self.selector.rate_hz,
                self.selector.tolerance,
                self.selector.max_selections,
            ),
            schedule: Schedule {
                base_period: self.sequencer.base_period,
                divisors: [
                    self.sequencer.capture_divisor,
                    self.sequencer.filter_divisor,
                    self.sequencer.selector_divisor,
                    self.sequencer.writeback_divisor,
                ],
            },
            frame_budget: self.sequencer.frame_budget,
            warmup_frames: self.capture.warmup_frames,
        }
    }
}

fn read_config_file(path: &Path) -> Result<SynchronomeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
