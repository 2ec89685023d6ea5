//! The four pipeline services and their shared state.
//!
//! ```text
//!  sequencer ──release──> capture ──write──> [ FrameStore ] ──diff_read──> filter
//!                                                 │
//!                                            select_read
//!                                                 v
//!                          writeback <──pop── [ HandoffQueue ] <──push── selector
//! ```
//!
//! `SharedFrames` (store + hand-off queue + baseline) sits behind a single
//! mutex. Every critical section is a bounded cursor/slot operation; source
//! acquisition and sink persistence run with the lock released.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::filter::{DifferenceFilter, FilterConfig};
use crate::frame::{FrameRef, PersistedFrame, Timestamp, DEFAULT_STORE_SLOTS, MAX_FRAME_BYTES};
use crate::handoff::HandoffQueue;
use crate::ingest::FrameSource;
use crate::select::{FrameSelector, Selection, SelectorConfig};
use crate::sequencer::{AbortFlag, Releases, Schedule, Sequencer, Service, StopReason};
use crate::storage::FrameSink;
use crate::store::{Advance, CursorSnapshot, FrameStore};

/// State shared by all services under one lock.
#[derive(Debug)]
pub struct SharedFrames {
    pub store: FrameStore,
    pub handoff: HandoffQueue<FrameRef>,
    /// Baseline capture time published by the filter service.
    pub baseline: Option<Timestamp>,
    /// Set by the selector once it has handed out its last label.
    pub selections_exhausted: bool,
}

impl SharedFrames {
    pub fn new(slots: usize, frame_bytes: usize, handoff_capacity: usize) -> Self {
        Self {
            store: FrameStore::new(slots, frame_bytes),
            handoff: HandoffQueue::new(handoff_capacity),
            baseline: None,
            selections_exhausted: false,
        }
    }

    /// Pop the oldest queued frame and copy it out of the store.
    ///
    /// `Ok(None)` when the queue is empty. A reference whose slot has been
    /// reused by the writer comes back as an error and is consumed.
    pub fn take_selected(&mut self) -> Result<Option<PersistedFrame>> {
        let Some(frame) = self.handoff.pop() else {
            return Ok(None);
        };
        let view = self
            .store
            .resolve(&frame)
            .with_context(|| format!("selected frame {} lost", frame.label))?;
        Ok(Some(view.to_persisted()))
    }
}

fn lock(frames: &Mutex<SharedFrames>) -> Result<MutexGuard<'_, SharedFrames>> {
    frames
        .lock()
        .map_err(|_| anyhow!("frame store lock poisoned"))
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub slots: usize,
    pub frame_bytes: usize,
    pub handoff_capacity: usize,
    pub filter: FilterConfig,
    pub selector: SelectorConfig,
    pub schedule: Schedule,
    /// Persisted frames after which the sequencer stops.
    pub frame_budget: u64,
    /// Captures discarded at start while the camera settles.
    pub warmup_frames: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_STORE_SLOTS,
            frame_bytes: MAX_FRAME_BYTES,
            handoff_capacity: 10,
            filter: FilterConfig::default(),
            selector: SelectorConfig::default(),
            schedule: Schedule::default(),
            frame_budget: 180,
            warmup_frames: 20,
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub captured: AtomicU64,
    pub overruns: AtomicU64,
    pub scored: AtomicU64,
    pub selected: AtomicU64,
    pub queue_full: AtomicU64,
    pub stale: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub captured: u64,
    pub overruns: u64,
    pub scored: u64,
    pub selected: u64,
    pub queue_full: u64,
    pub stale: u64,
    pub persisted: u64,
    pub ticks: u64,
    pub stop_reason: StopReason,
    pub cursors: CursorSnapshot,
}

pub struct Pipeline {
    config: PipelineConfig,
    abort: Arc<AbortFlag>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            abort: Arc::new(AbortFlag::new()),
        }
    }

    /// Flag that stops the pipeline when raised (e.g. from a Ctrl-C handler).
    pub fn abort_flag(&self) -> Arc<AbortFlag> {
        self.abort.clone()
    }

    /// Run until the frame budget is persisted or the abort flag is raised.
    ///
    /// The sequencer runs on the calling thread; each service gets its own
    /// thread. The first service error is returned after every thread joined.
    pub fn run(
        self,
        mut source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> Result<PipelineReport> {
        let cfg = self.config;
        source.connect()?;

        let frames = Arc::new(Mutex::new(SharedFrames::new(
            cfg.slots,
            cfg.frame_bytes,
            cfg.handoff_capacity,
        )));
        let releases = Arc::new(Releases::new());
        let stats = Arc::new(PipelineStats::default());
        let persisted = Arc::new(AtomicU64::new(0));
        let drained = Arc::new(AtomicBool::new(false));

        log::info!(
            "pipeline starting: {} slots x {} bytes, hand-off {} entries, budget {} frames",
            cfg.slots,
            cfg.frame_bytes,
            cfg.handoff_capacity,
            cfg.frame_budget
        );
        for service in Service::ALL {
            log::info!(
                "{} service released at {:.1} Hz",
                service.name(),
                cfg.schedule.rate_hz(service)
            );
        }

        let ctx = ServiceContext {
            frames: frames.clone(),
            releases: releases.clone(),
            abort: self.abort.clone(),
            stats: stats.clone(),
        };

        let mut handles: Vec<(Service, JoinHandle<Result<u64>>)> = Vec::new();
        let spawned = (|| -> Result<()> {
            handles.push((
                Service::Capture,
                ctx.spawn(Service::Capture, capture_body(&ctx, source, cfg.warmup_frames))?,
            ));
            handles.push((
                Service::Filter,
                ctx.spawn(Service::Filter, filter_body(&ctx, cfg.filter.clone()))?,
            ));
            handles.push((
                Service::Selector,
                ctx.spawn(Service::Selector, selector_body(&ctx, cfg.selector.clone()))?,
            ));
            handles.push((
                Service::Writeback,
                ctx.spawn(
                    Service::Writeback,
                    writeback_body(&ctx, sink, persisted.clone(), drained.clone()),
                )?,
            ));
            Ok(())
        })();

        let sequenced = match spawned {
            Ok(()) => Sequencer::new(
                cfg.schedule.clone(),
                releases.clone(),
                self.abort.clone(),
                persisted.clone(),
                cfg.frame_budget,
            )
            .with_drained_flag(drained.clone())
            .run(),
            Err(e) => {
                self.abort.raise();
                releases.post_all()?;
                Err(e)
            }
        };

        let mut first_error: Option<anyhow::Error> = None;
        for (service, handle) in handles {
            let outcome = handle
                .join()
                .map_err(|_| anyhow!("{} service panicked", service.name()))
                .and_then(|r| r);
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        let sequencer = sequenced?;
        if let Some(e) = first_error {
            return Err(e);
        }

        let cursors = lock(&frames)?.store.cursors();
        let report = PipelineReport {
            captured: stats.captured.load(Ordering::SeqCst),
            overruns: stats.overruns.load(Ordering::SeqCst),
            scored: stats.scored.load(Ordering::SeqCst),
            selected: stats.selected.load(Ordering::SeqCst),
            queue_full: stats.queue_full.load(Ordering::SeqCst),
            stale: stats.stale.load(Ordering::SeqCst),
            persisted: persisted.load(Ordering::SeqCst),
            ticks: sequencer.ticks,
            stop_reason: sequencer.reason,
            cursors,
        };
        log::info!(
            "pipeline stopped: captured={} scored={} selected={} persisted={} overruns={} queue_full={} stale={} [{}]",
            report.captured,
            report.scored,
            report.selected,
            report.persisted,
            report.overruns,
            report.queue_full,
            report.stale,
            report.cursors
        );
        Ok(report)
    }
}

// ----------------------------------------------------------------------------
// Service loops
// ----------------------------------------------------------------------------

struct ServiceContext {
    frames: Arc<Mutex<SharedFrames>>,
    releases: Arc<Releases>,
    abort: Arc<AbortFlag>,
    stats: Arc<PipelineStats>,
}

type ServiceBody = Box<dyn FnMut() -> Result<()> + Send>;

impl ServiceContext {
    fn spawn(&self, service: Service, mut body: ServiceBody) -> Result<JoinHandle<Result<u64>>> {
        let releases = self.releases.clone();
        let abort = self.abort.clone();
        let handle = std::thread::Builder::new()
            .name(service.name().to_string())
            .spawn(move || {
                let release = releases.get(service);
                let mut count = 0u64;
                while !abort.is_raised() {
                    release.wait()?;
                    if abort.is_raised() {
                        break;
                    }
                    count += 1;
                    if let Err(e) = body() {
                        log::error!("{} service failed: {:#}", service.name(), e);
                        abort.raise();
                        releases.post_all()?;
                        return Err(e.context(format!("{} service", service.name())));
                    }
                }
                log::info!("{} service exiting after {} releases", service.name(), count);
                Ok(count)
            })
            .with_context(|| format!("spawn {} service", service.name()))?;
        Ok(handle)
    }
}

fn capture_body(
    ctx: &ServiceContext,
    mut source: Box<dyn FrameSource>,
    warmup_frames: u32,
) -> ServiceBody {
    let frames = ctx.frames.clone();
    let stats = ctx.stats.clone();
    let mut warmup = warmup_frames;
    Box::new(move || {
        let timestamp = source.acquire().with_context(|| {
            let source_stats = source.stats();
            format!(
                "acquire from {} after {} frames",
                source_stats.url, source_stats.frames_captured
            )
        })?;
        if warmup > 0 {
            warmup -= 1;
            return Ok(());
        }

        let mut shared = lock(&frames)?;
        let size = source.fill(shared.store.current_write_slot())?;
        let outcome = shared.store.write(size, timestamp)?;
        stats.captured.fetch_add(1, Ordering::SeqCst);
        if outcome == Advance::Overran {
            stats.overruns.fetch_add(1, Ordering::SeqCst);
            log::warn!("frame store overrun, oldest frame lost [{}]", shared.store.cursors());
        }
        Ok(())
    })
}

fn filter_body(ctx: &ServiceContext, config: FilterConfig) -> ServiceBody {
    let frames = ctx.frames.clone();
    let stats = ctx.stats.clone();
    let mut filter = DifferenceFilter::new(config);
    Box::new(move || {
        let mut shared = lock(&frames)?;
        let pass = filter.process(&mut shared.store)?;
        if shared.baseline.is_none() {
            shared.baseline = filter.baseline_timestamp();
        }
        stats
            .scored
            .fetch_add(pass.scored() as u64, Ordering::SeqCst);
        log::debug!("filter: {:?} [{}]", pass, shared.store.cursors());
        Ok(())
    })
}

fn selector_body(ctx: &ServiceContext, config: SelectorConfig) -> ServiceBody {
    let frames = ctx.frames.clone();
    let stats = ctx.stats.clone();
    let mut selector = FrameSelector::new(config);
    Box::new(move || {
        let mut guard = lock(&frames)?;
        let shared = &mut *guard;
        match selector.select(&mut shared.store, &mut shared.handoff, shared.baseline) {
            Selection::AwaitingBaseline => {
                log::debug!("selector: baseline not captured yet");
            }
            Selection::NothingQualified => {
                log::debug!("selector: no frame qualified [{}]", shared.store.cursors());
            }
            Selection::Selected { .. } => {
                stats.selected.fetch_add(1, Ordering::SeqCst);
            }
            Selection::QueueFull { .. } => {
                stats.queue_full.fetch_add(1, Ordering::SeqCst);
            }
        }
        if selector.is_exhausted() && !shared.selections_exhausted {
            shared.selections_exhausted = true;
            log::info!(
                "selector: all {} labels handed out",
                selector.config().max_selections
            );
        }
        Ok(())
    })
}

fn writeback_body(
    ctx: &ServiceContext,
    mut sink: Box<dyn FrameSink>,
    persisted: Arc<AtomicU64>,
    drained: Arc<AtomicBool>,
) -> ServiceBody {
    let frames = ctx.frames.clone();
    let stats = ctx.stats.clone();
    Box::new(move || {
        let frame = {
            let mut shared = lock(&frames)?;
            match shared.take_selected() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if shared.selections_exhausted && !drained.swap(true, Ordering::SeqCst) {
                        log::warn!(
                            "writeback: selections exhausted with {} frames persisted",
                            persisted.load(Ordering::SeqCst)
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    stats.stale.fetch_add(1, Ordering::SeqCst);
                    log::warn!("writeback: {:#}", e);
                    return Ok(());
                }
            }
        };
        sink.persist(&frame)?;
        let total = persisted.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "writeback: frame {} written ({} bytes, {} total)",
            frame.label,
            frame.size(),
            total
        );
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Usefulness;

    #[test]
    fn take_selected_copies_frame_out() {
        let mut shared = SharedFrames::new(4, 8, 2);
        shared.store.current_write_slot()[..3].copy_from_slice(b"abc");
        let _ = shared.store.write(3, Timestamp::from_millis(5)).unwrap();
        shared.store.mark_usefulness(Usefulness::Useful(1)).unwrap();
        shared.store.stamp_label(1).unwrap();
        let frame = shared.store.frame_ref(crate::store::Reader::Select).unwrap();
        shared.handoff.push(frame).unwrap();

        let persisted = shared.take_selected().unwrap().unwrap();
        assert_eq!(persisted.payload, b"abc");
        assert_eq!(persisted.label, 1);
        assert!(shared.take_selected().unwrap().is_none());
    }

    #[test]
    fn take_selected_reports_overwritten_slot() {
        let mut shared = SharedFrames::new(2, 8, 2);
        let _ = shared.store.write(1, Timestamp::from_millis(0)).unwrap();
        shared.store.mark_usefulness(Usefulness::Useful(0)).unwrap();
        let frame = shared.store.frame_ref(crate::store::Reader::Select).unwrap();
        let _ = shared.store.advance(crate::store::Cursor::SelectRead);
        shared.handoff.push(frame).unwrap();
        let _ = shared.store.write(1, Timestamp::from_millis(1)).unwrap();
        let _ = shared.store.write(1, Timestamp::from_millis(2)).unwrap();

        let err = shared.take_selected().unwrap_err();
        assert!(format!("{:#}", err).contains("overwritten"));
        assert!(shared.handoff.is_empty());
    }
}
