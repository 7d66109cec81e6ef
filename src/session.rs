//! What happens on each event of a monitoring run
//!
//! The readiness loop in [`crate::scheduler`] turns OS notifications into
//! calls on [`Session`]. Keeping the reactions here, behind the [`Target`] and
//! [`IntervalTimer`] seams, lets them run against fakes in tests.

use std::io::Write;

use crate::clock::MonotonicClock;
use crate::error::Result;
use crate::phase::{PhaseState, PhaseTracker, PhaseTransition};
use crate::stats::{HotnessSample, Sample};
use crate::supervisor::{ChildEvent, ChildProcess};

/// Which statistics a run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Near/far residency from `numa_maps` (`emu:` lines)
    Locality,
    /// Residency and referenced bytes from `smaps_rollup` (`memprof:` lines)
    Hotness,
}

/// The monitored process
pub trait Target {
    fn sample_locality(&mut self) -> Result<Sample>;
    fn sample_hotness(&mut self) -> Result<HotnessSample>;
    fn reset_hotness(&mut self) -> Result<()>;
    /// Continue a stopped process
    fn resume(&mut self) -> Result<()>;
}

impl Target for ChildProcess {
    fn sample_locality(&mut self) -> Result<Sample> {
        ChildProcess::sample_locality(self)
    }

    fn sample_hotness(&mut self) -> Result<HotnessSample> {
        ChildProcess::sample_hotness(self)
    }

    fn reset_hotness(&mut self) -> Result<()> {
        self.reset_hotness_tracking()
    }

    fn resume(&mut self) -> Result<()> {
        ChildProcess::resume(self)
    }
}

/// Periodic sampling timer that phases arm and disarm
pub trait IntervalTimer {
    fn arm(&mut self) -> Result<()>;
    fn disarm(&mut self) -> Result<()>;
    fn is_armed(&self) -> bool;
    /// Consume pending expirations, returning whether any were pending
    ///
    /// Overruns collapse into a single sample.
    fn acknowledge(&mut self) -> Result<bool>;
}

/// Whether the loop keeps going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: SamplingMode,
    /// Only rank 0 reports hotness
    pub rank: u32,
    pub start_pattern: Option<String>,
    pub end_pattern: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Locality,
            rank: 0,
            start_pattern: None,
            end_pattern: None,
        }
    }
}

pub struct Session<T, I, W> {
    target: T,
    timer: Option<I>,
    out: W,
    phase: PhaseTracker,
    mode: SamplingMode,
    rank: u32,
    clock: MonotonicClock,
}

impl<T: Target, I: IntervalTimer, W: Write> Session<T, I, W> {
    /// `timer` is `None` when periodic sampling is disabled
    pub fn new(target: T, timer: Option<I>, out: W, config: &SessionConfig, clock: MonotonicClock) -> Self {
        Self {
            target,
            timer,
            out,
            phase: PhaseTracker::new(config.start_pattern.as_deref(), config.end_pattern.as_deref()),
            mode: config.mode,
            rank: config.rank,
            clock,
        }
    }

    pub fn phase(&self) -> PhaseState {
        self.phase.state()
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn timer(&self) -> Option<&I> {
        self.timer.as_ref()
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    /// Arm the timer when the run starts out monitoring
    pub fn begin(&mut self) -> Result<()> {
        if self.phase.is_monitoring() {
            self.arm_timer()?;
        }
        Ok(())
    }

    fn hotness_enabled(&self) -> bool {
        self.mode == SamplingMode::Hotness && self.rank == 0
    }

    fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| t.is_armed())
    }

    fn arm_timer(&mut self) -> Result<()> {
        match self.timer.as_mut() {
            Some(timer) => timer.arm(),
            None => Ok(()),
        }
    }

    fn report_locality(&mut self) -> Result<()> {
        if self.mode == SamplingMode::Locality {
            let sample = self.target.sample_locality()?;
            writeln!(self.out, "{}", sample)?;
        }
        Ok(())
    }

    fn report_hotness(&mut self) -> Result<()> {
        let sample = self.target.sample_hotness()?;
        writeln!(self.out, "{}", sample)?;
        Ok(())
    }

    /// Report and start a fresh referenced-bytes interval
    fn report_hotness_interval(&mut self) -> Result<()> {
        if self.hotness_enabled() {
            self.report_hotness()?;
            self.target.reset_hotness()?;
        }
        Ok(())
    }

    /// The periodic timer expired
    pub fn on_timer(&mut self) -> Result<()> {
        let expired = match self.timer.as_mut() {
            Some(timer) => timer.acknowledge()?,
            None => return Ok(()),
        };
        if !expired || !self.phase.is_monitoring() {
            return Ok(());
        }

        self.report_locality()?;
        self.report_hotness_interval()?;
        self.out.flush()?;
        Ok(())
    }

    /// The target changed state
    pub fn on_child(&mut self, event: ChildEvent) -> Result<Flow> {
        match event {
            ChildEvent::Stopped => {
                writeln!(self.out, "emu: stop")?;
                self.report_locality()?;
                self.report_hotness_interval()?;
                writeln!(self.out, "emu: continue")?;
                self.out.flush()?;
                self.target.resume()?;
                Ok(Flow::Continue)
            }
            ChildEvent::Continued => Ok(Flow::Continue),
            ChildEvent::Exited(code) => {
                tracing::debug!(code, "target exited");
                Ok(Flow::Exit)
            }
            ChildEvent::Signaled(signal) => {
                tracing::debug!(?signal, "target killed by signal");
                Ok(Flow::Exit)
            }
        }
    }

    /// Pass a captured line through without phase effects
    pub fn echo(&mut self, raw: &[u8]) -> Result<()> {
        self.out.write_all(raw)?;
        self.out.flush()?;
        Ok(())
    }

    /// A line arrived on the capture channel (terminator included)
    pub fn on_line(&mut self, raw: &[u8]) -> Result<()> {
        self.out.write_all(raw)?;

        let text = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = String::from_utf8_lossy(text);

        match self.phase.observe(&line) {
            Some(PhaseTransition::Started) => {
                writeln!(self.out, "emu: start {:.2}", self.clock.elapsed_secs())?;
                self.report_locality()?;
                if self.hotness_enabled() {
                    self.target.reset_hotness()?;
                }
                self.arm_timer()?;
            }
            Some(PhaseTransition::Ended) => {
                self.report_locality()?;
                // A closing hotness report would cover a shorter interval than
                // the periodic ones, so it is only taken without a timer
                if self.hotness_enabled() && !self.timer_armed() {
                    self.report_hotness()?;
                }
                if let Some(timer) = self.timer.as_mut().filter(|t| t.is_armed()) {
                    timer.disarm()?;
                }
                writeln!(self.out, "emu: end {:.2}", self.clock.elapsed_secs())?;
            }
            None => {}
        }

        self.out.flush()?;
        Ok(())
    }
}
