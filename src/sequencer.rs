//! Periodic sequencer that releases the pipeline services.
//!
//! One base tick drives every service at a harmonic sub-rate: on tick `k`
//! a service is released when `k % divisor == 0`. Each release posts the
//! service's counting `Release`; services block only on that primitive.
//!
//! Shutdown: when the abort flag is raised (Ctrl-C, a failing service) or
//! the persisted-frame budget is reached, the sequencer stops ticking,
//! raises the flag and posts every release once more so no service stays
//! parked.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Release: counting wait primitive
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Release {
    count: Mutex<u64>,
    ready: Condvar,
}

impl Release {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) -> Result<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| anyhow!("release lock poisoned"))?;
        *count += 1;
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a release is pending, then consume it.
    pub fn wait(&self) -> Result<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| anyhow!("release lock poisoned"))?;
        while *count == 0 {
            count = self
                .ready
                .wait(count)
                .map_err(|_| anyhow!("release lock poisoned"))?;
        }
        *count -= 1;
        Ok(())
    }

    /// Releases posted but not yet consumed.
    pub fn pending(&self) -> u64 {
        self.count.lock().map(|c| *c).unwrap_or(0)
    }
}

// ----------------------------------------------------------------------------
// AbortFlag
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AbortFlag(AtomicBool);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Services and schedule
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    Capture,
    Filter,
    Selector,
    Writeback,
}

impl Service {
    pub const ALL: [Service; 4] = [
        Service::Capture,
        Service::Filter,
        Service::Selector,
        Service::Writeback,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Service::Capture => "capture",
            Service::Filter => "filter",
            Service::Selector => "selector",
            Service::Writeback => "writeback",
        }
    }

    fn slot(self) -> usize {
        match self {
            Service::Capture => 0,
            Service::Filter => 1,
            Service::Selector => 2,
            Service::Writeback => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Schedule {
    pub base_period: Duration,
    /// Indexed by `Service`: capture, filter, selector, writeback.
    pub divisors: [u64; 4],
}

impl Schedule {
    pub fn divisor(&self, service: Service) -> u64 {
        self.divisors[service.slot()]
    }

    /// Services released on `tick` (1-based).
    pub fn due(&self, tick: u64) -> impl Iterator<Item = Service> + '_ {
        Service::ALL.into_iter().filter(move |s| {
            let divisor = self.divisor(*s);
            divisor > 0 && tick % divisor == 0
        })
    }

    /// Effective release rate of `service` in Hz.
    pub fn rate_hz(&self, service: Service) -> f64 {
        let period = self.base_period.as_secs_f64() * self.divisor(service) as f64;
        if period > 0.0 {
            1.0 / period
        } else {
            0.0
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            base_period: Duration::from_millis(10),
            divisors: [3, 5, 10, 1],
        }
    }
}

/// One `Release` per service.
#[derive(Debug, Default)]
pub struct Releases([Release; 4]);

impl Releases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service: Service) -> &Release {
        &self.0[service.slot()]
    }

    /// Post every release once. All are attempted; the first failure is returned.
    pub fn post_all(&self) -> Result<()> {
        let mut first_error = None;
        for release in &self.0 {
            if let Err(e) = release.post() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ----------------------------------------------------------------------------
// Sequencer
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Aborted,
    BudgetReached,
    /// Every label was handed out and the hand-off queue drained, short of
    /// the budget (some selected frames were lost before persistence).
    SelectionsExhausted,
}

#[derive(Clone, Copy, Debug)]
pub struct SequencerReport {
    pub ticks: u64,
    pub reason: StopReason,
}

pub struct Sequencer {
    schedule: Schedule,
    releases: Arc<Releases>,
    abort: Arc<AbortFlag>,
    persisted: Arc<AtomicU64>,
    frame_budget: u64,
    drained: Arc<AtomicBool>,
}

impl Sequencer {
    pub fn new(
        schedule: Schedule,
        releases: Arc<Releases>,
        abort: Arc<AbortFlag>,
        persisted: Arc<AtomicU64>,
        frame_budget: u64,
    ) -> Self {
        Self {
            schedule,
            releases,
            abort,
            persisted,
            frame_budget,
            drained: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised once no further frame can be persisted. Checked each tick.
    pub fn with_drained_flag(mut self, drained: Arc<AtomicBool>) -> Self {
        self.drained = drained;
        self
    }

    /// Tick until aborted, the budget is reached or nothing is left to
    /// persist, then shut the services down.
    ///
    /// Shutdown happens on every exit path, including a failed release.
    pub fn run(self) -> Result<SequencerReport> {
        let mut ticks = 0u64;
        let outcome = self.tick(&mut ticks);

        self.abort.raise();
        let released = self.releases.post_all();
        let reason = outcome?;
        released?;

        log::info!(
            "sequencer stopping after {} ticks ({:?}, {} frames persisted)",
            ticks,
            reason,
            self.persisted.load(Ordering::SeqCst)
        );
        Ok(SequencerReport { ticks, reason })
    }

    fn tick(&self, ticks: &mut u64) -> Result<StopReason> {
        let period = self.schedule.base_period;
        let mut next = Instant::now() + period;

        loop {
            if self.abort.is_raised() {
                return Ok(StopReason::Aborted);
            }
            if self.persisted.load(Ordering::SeqCst) >= self.frame_budget {
                return Ok(StopReason::BudgetReached);
            }
            if self.drained.load(Ordering::SeqCst) {
                return Ok(StopReason::SelectionsExhausted);
            }

            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            }
            next += period;
            *ticks += 1;

            for service in self.schedule.due(*ticks) {
                if let Err(e) = self.releases.get(service).post() {
                    log::error!("sequencer: releasing {} failed: {:#}", service.name(), e);
                    return Err(e);
                }
            }
        }
    }
}
