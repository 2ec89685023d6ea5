use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use synchronome::{
    AbortFlag, FilterConfig, FrameSink, FrameSource, InMemoryFrameSink, PersistedFrame, Pipeline,
    PipelineConfig, Schedule, SelectorConfig, SourceConfig, SourceStats, SqliteFrameSink,
    StopReason, SyntheticSource, Timestamp,
};

fn small_source() -> SyntheticSource {
    SyntheticSource::new(SourceConfig {
        url: "stub://pipeline-test".to_string(),
        width: 32,
        height: 32,
        scene_interval: 10_000,
    })
    .expect("synthetic source")
}

fn small_config() -> PipelineConfig {
    PipelineConfig {
        slots: 16,
        frame_bytes: 4096,
        handoff_capacity: 4,
        filter: FilterConfig::default(),
        selector: SelectorConfig {
            period: Duration::from_millis(5),
            tolerance: Duration::from_millis(1),
            max_selections: 50,
        },
        schedule: Schedule {
            base_period: Duration::from_millis(1),
            divisors: [1, 1, 2, 1],
        },
        frame_budget: 5,
        warmup_frames: 2,
    }
}

/// Raises the abort flag if a run hangs.
fn watchdog(abort: Arc<AbortFlag>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for _ in 0..200 {
            if abort.is_raised() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        abort.raise();
    })
}

#[test]
fn pipeline_persists_budget_in_label_order() {
    let sink = InMemoryFrameSink::new();
    let pipeline = Pipeline::new(small_config());
    let guard = watchdog(pipeline.abort_flag());

    let report = pipeline
        .run(Box::new(small_source()), Box::new(sink.clone()))
        .expect("pipeline run");
    guard.join().unwrap();

    assert_eq!(report.stop_reason, StopReason::BudgetReached);
    assert!(report.persisted >= 5);
    assert!(report.captured > 0);
    assert!(report.ticks > 0);

    let frames = sink.frames().unwrap();
    assert_eq!(frames.len() as u64, report.persisted);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.label, i as u32 + 1);
        assert_eq!(frame.size(), 32 * 32 * 3);
        assert!(frame.usefulness.is_selectable());
    }
    for pair in frames.windows(2) {
        let gap = pair[1]
            .timestamp
            .millis_since(pair[0].timestamp)
            .expect("selected frames in capture order");
        assert!(gap > 4, "frames selected {} ms apart", gap);
    }
}

#[test]
fn pipeline_writes_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.db");
    let path = path.to_str().unwrap();

    let pipeline = Pipeline::new(small_config());
    let guard = watchdog(pipeline.abort_flag());
    let sink = SqliteFrameSink::open(path).unwrap();
    let report = pipeline
        .run(Box::new(small_source()), Box::new(sink))
        .expect("pipeline run");
    guard.join().unwrap();
    assert_eq!(report.stop_reason, StopReason::BudgetReached);

    let reader = SqliteFrameSink::open(path).unwrap();
    assert_eq!(reader.count().unwrap(), report.persisted);
    let labels = reader.labels().unwrap();
    assert_eq!(labels[..5], [1, 2, 3, 4, 5]);
    assert!(reader.payload_digest(1).unwrap().is_some());
}

#[test]
fn pipeline_stops_when_aborted() {
    let base = small_config();
    let pipeline = Pipeline::new(PipelineConfig {
        frame_budget: 1_000,
        selector: SelectorConfig {
            max_selections: 1_000,
            ..base.selector.clone()
        },
        ..base
    });
    let abort = pipeline.abort_flag();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        abort.raise();
    });

    let report = pipeline
        .run(Box::new(small_source()), Box::new(InMemoryFrameSink::new()))
        .expect("pipeline run");
    stopper.join().unwrap();
    assert_eq!(report.stop_reason, StopReason::Aborted);
    assert!(report.persisted < 1_000);
}

#[test]
fn oversized_frame_is_fatal() {
    let pipeline = Pipeline::new(PipelineConfig {
        filter: FilterConfig {
            max_frame_bytes: 1024,
            ..FilterConfig::default()
        },
        ..small_config()
    });
    let guard = watchdog(pipeline.abort_flag());

    let err = pipeline
        .run(Box::new(small_source()), Box::new(InMemoryFrameSink::new()))
        .unwrap_err();
    guard.join().unwrap();
    assert!(format!("{:#}", err).contains("exceeds difference buffer"));
}

/// Sink that stalls on its first frame long enough for the writer to lap the store.
struct StallingSink {
    inner: InMemoryFrameSink,
    stalled: bool,
}

impl FrameSink for StallingSink {
    fn persist(&mut self, frame: &PersistedFrame) -> Result<()> {
        if !self.stalled {
            self.stalled = true;
            std::thread::sleep(Duration::from_millis(300));
        }
        self.inner.persist(frame)
    }
}

#[test]
fn pipeline_stops_when_lost_frames_leave_budget_unreachable() {
    let base = small_config();
    let pipeline = Pipeline::new(PipelineConfig {
        slots: 4,
        selector: SelectorConfig {
            max_selections: 3,
            ..base.selector.clone()
        },
        schedule: Schedule {
            base_period: Duration::from_millis(1),
            divisors: [1, 1, 1, 1],
        },
        frame_budget: 3,
        ..base
    });
    let guard = watchdog(pipeline.abort_flag());
    let sink = InMemoryFrameSink::new();

    let report = pipeline
        .run(
            Box::new(small_source()),
            Box::new(StallingSink {
                inner: sink.clone(),
                stalled: false,
            }),
        )
        .expect("pipeline run");
    guard.join().unwrap();

    assert_eq!(report.stop_reason, StopReason::SelectionsExhausted);
    assert_eq!(report.selected, 3);
    assert!(report.stale >= 1);
    assert_eq!(report.persisted + report.stale, report.selected);
    assert_eq!(sink.len() as u64, report.persisted);
}

/// Source that fails after a fixed number of frames.
struct FailingSource {
    remaining: u32,
    captured: u64,
}

impl FrameSource for FailingSource {
    fn acquire(&mut self) -> Result<Timestamp> {
        if self.remaining == 0 {
            return Err(anyhow!("camera unplugged"));
        }
        self.remaining -= 1;
        self.captured += 1;
        Ok(Timestamp::now())
    }

    fn fill(&mut self, slot: &mut [u8]) -> Result<usize> {
        let size = 32 * 32 * 3;
        slot[..size].fill(0);
        Ok(size)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.captured,
            url: "stub://failing".to_string(),
        }
    }
}

#[test]
fn source_failure_reports_source_stats() {
    let pipeline = Pipeline::new(small_config());
    let guard = watchdog(pipeline.abort_flag());

    let err = pipeline
        .run(
            Box::new(FailingSource {
                remaining: 5,
                captured: 0,
            }),
            Box::new(InMemoryFrameSink::new()),
        )
        .unwrap_err();
    guard.join().unwrap();
    let message = format!("{:#}", err);
    assert!(message.contains("acquire from stub://failing after 5 frames"), "{}", message);
    assert!(message.contains("camera unplugged"));
}
