//! Safe output ramps
//!
//! An output is never commanded straight to a new value: the controller
//! plans a monotonic staircase bounded by a maximum step and/or a maximum
//! rate, uploads it to the board and waits for the ramp process to confirm
//! completion. The controller remembers the last confirmed value of every
//! channel it drove; after a timeout or a cancel the value is read back from
//! the board rather than guessed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::hardware::{ensure_idle, OutputChannel, ProcessId, SweepHardware};
use crate::plan::linspace;
use crate::units::ChannelCalibration;
use crate::{Error, Result};

/// Upper bound on the staircase length of a single ramp
pub const MAX_RAMP_STEPS: usize = 1_000_000;

/// DAC output together with its calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrivenOutput {
    /// Output channel
    pub channel: OutputChannel,
    /// Code ↔ physical conversion for the channel
    #[serde(default)]
    pub calibration: ChannelCalibration,
}

impl DrivenOutput {
    /// Output with the default ±10 V, 16-bit calibration.
    #[must_use]
    pub fn new(channel: OutputChannel) -> Self {
        Self {
            channel,
            calibration: ChannelCalibration::default(),
        }
    }
}

/// Step and rate bounds of a ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampLimits {
    /// Largest change between consecutive setpoints
    pub max_step: Option<f64>,
    /// Largest change per second
    pub max_rate: Option<f64>,
    /// Time the board spends on each setpoint
    pub update_period: Duration,
}

impl RampLimits {
    /// Step-bounded limits.
    #[must_use]
    pub const fn max_step(max_step: f64) -> Self {
        Self {
            max_step: Some(max_step),
            max_rate: None,
            update_period: Duration::from_millis(1),
        }
    }

    /// Add a rate bound.
    #[must_use]
    pub const fn with_max_rate(mut self, max_rate: f64, update_period: Duration) -> Self {
        self.max_rate = Some(max_rate);
        self.update_period = update_period;
        self
    }

    /// Check that at least one positive limit is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSweepSpec`] for missing or non-positive limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_step.is_none() && self.max_rate.is_none() {
            return Err(Error::InvalidSweepSpec(
                "ramp needs a maximum step or a maximum rate".to_string(),
            ));
        }
        for (name, limit) in [("max step", self.max_step), ("max rate", self.max_rate)] {
            if let Some(value) = limit {
                if !value.is_finite() || value <= 0.0 {
                    return Err(Error::InvalidSweepSpec(format!(
                        "ramp {name} must be positive, got {value}"
                    )));
                }
            }
        }
        if self.max_rate.is_some() && self.update_period.is_zero() {
            return Err(Error::InvalidSweepSpec(
                "rate-limited ramp needs a nonzero update period".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing of the completion wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSettings {
    /// Step/rate bounds
    pub limits: RampLimits,
    /// Sleep between completion polls
    pub poll_interval: Duration,
    /// Give up waiting for completion after this long
    pub timeout: Duration,
}

/// Completed ramp.
#[derive(Debug, Clone, PartialEq)]
pub struct RampOutcome {
    /// Driven channel
    pub channel: OutputChannel,
    /// Value before the ramp
    pub from: f64,
    /// Confirmed value after the ramp
    pub to: f64,
    /// Setpoints stepped through (empty for a no-op)
    pub steps: Vec<f64>,
    /// Completion polls
    pub polls: usize,
    /// Wall time spent
    pub elapsed: Duration,
}

/// Plan the setpoints between `current` and `target`.
///
/// The result excludes `current`, ends exactly at `target` and is monotonic.
///
/// # Errors
///
/// Returns [`Error::InvalidSweepSpec`] for non-finite values, missing or
/// non-positive limits, or a staircase longer than [`MAX_RAMP_STEPS`].
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn plan_steps(current: f64, target: f64, limits: &RampLimits) -> Result<Vec<f64>> {
    limits.validate()?;
    if !current.is_finite() || !target.is_finite() {
        return Err(Error::InvalidSweepSpec(format!(
            "ramp endpoints must be finite, got {current} → {target}"
        )));
    }
    let delta = (target - current).abs();
    if delta == 0.0 {
        return Ok(Vec::new());
    }

    let by_step = limits.max_step.map_or(0.0, |s| (delta / s).ceil());
    let by_rate = limits
        .max_rate
        .map_or(0.0, |r| (delta / (r * limits.update_period.as_secs_f64())).ceil());
    let steps = by_step.max(by_rate).max(1.0);
    if steps > MAX_RAMP_STEPS as f64 {
        return Err(Error::InvalidSweepSpec(format!(
            "ramp {current} → {target} needs {steps} steps (limit {MAX_RAMP_STEPS})"
        )));
    }

    let (low, high) = if current < target {
        (current, target)
    } else {
        (target, current)
    };
    let mut trajectory = linspace(current, target, steps as usize + 1);
    trajectory.remove(0);
    for value in &mut trajectory {
        *value = value.clamp(low, high);
    }
    Ok(trajectory)
}

/// Drives DAC outputs through safe ramps using one firmware ramp process.
#[derive(Debug, Clone)]
pub struct RampController {
    process: ProcessId,
    settings: RampSettings,
    confirmed: BTreeMap<OutputChannel, f64>,
    cancel: CancellationToken,
    exclusive: Vec<ProcessId>,
}

impl RampController {
    /// Controller using firmware process `process`.
    #[must_use]
    pub fn new(process: ProcessId, settings: RampSettings) -> Self {
        Self {
            process,
            settings,
            confirmed: BTreeMap::new(),
            cancel: CancellationToken::new(),
            exclusive: vec![process],
        }
    }

    /// Also refuse to start while any of `processes` is running.
    #[must_use]
    pub fn exclusive_with(mut self, processes: impl IntoIterator<Item = ProcessId>) -> Self {
        for process in processes {
            if !self.exclusive.contains(&process) {
                self.exclusive.push(process);
            }
        }
        self
    }

    /// Observe `cancel` while waiting.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Firmware process used for ramps.
    #[must_use]
    pub const fn process(&self) -> ProcessId {
        self.process
    }

    /// Last value confirmed on `channel`.
    #[must_use]
    pub fn confirmed(&self, channel: OutputChannel) -> Option<f64> {
        self.confirmed.get(&channel).copied()
    }

    /// Record a value reached by other means (e.g. the end of a sweep-and-read
    /// trajectory).
    pub fn mark_confirmed(&mut self, channel: OutputChannel, value: f64) {
        self.confirmed.insert(channel, value);
    }

    /// Drop the confirmed value of `channel`; the next ramp reads it back.
    pub fn forget(&mut self, channel: OutputChannel) {
        self.confirmed.remove(&channel);
    }

    /// Channels this controller has confirmed a value for.
    pub fn driven_channels(&self) -> impl Iterator<Item = OutputChannel> + '_ {
        self.confirmed.keys().copied()
    }

    /// Ramp `output` to `target` from its last confirmed value, reading the
    /// value back from the board if the channel has not been driven yet.
    ///
    /// # Errors
    ///
    /// See [`RampController::ramp_from`].
    pub fn ramp<H: SweepHardware + ?Sized>(
        &mut self,
        hw: &mut H,
        output: &DrivenOutput,
        target: f64,
    ) -> Result<RampOutcome> {
        let current = match self.confirmed(output.channel) {
            Some(value) => value,
            None => read_back(hw, output)?,
        };
        self.ramp_from(hw, output, current, target)
    }

    /// Ramp `output` from `current` to `target` and wait for completion.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSweepSpec`]: target outside the output span or bad limits
    /// - [`Error::SweepBusy`]: the ramp or an exclusive process is already running
    /// - [`Error::RampTimeout`]: completion not confirmed within the timeout
    /// - [`Error::Cancelled`]: cancelled; the output holds the last step reached
    pub fn ramp_from<H: SweepHardware + ?Sized>(
        &mut self,
        hw: &mut H,
        output: &DrivenOutput,
        current: f64,
        target: f64,
    ) -> Result<RampOutcome> {
        if !output.calibration.contains(target) {
            return Err(Error::InvalidSweepSpec(format!(
                "ramp target {target} outside the span of {}",
                output.channel
            )));
        }
        let steps = plan_steps(current, target, &self.settings.limits)?;
        self.cancel.check()?;

        let started = Instant::now();
        if steps.is_empty() {
            debug!(channel = %output.channel, value = target, "already at target");
            self.confirmed.insert(output.channel, target);
            return Ok(RampOutcome {
                channel: output.channel,
                from: current,
                to: target,
                steps,
                polls: 0,
                elapsed: started.elapsed(),
            });
        }

        ensure_idle(hw, &self.exclusive)?;
        hw.load_trajectory(output.channel, &output.calibration.to_codes(&steps))?;
        hw.start(self.process)?;
        info!(
            channel = %output.channel,
            from = current,
            to = target,
            steps = steps.len(),
            "ramping output"
        );

        let mut polls = 0;
        loop {
            polls += 1;
            if !hw.is_running(self.process)? {
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(self.abort(hw, output));
            }
            if started.elapsed() >= self.settings.timeout {
                return Err(self.time_out(hw, output));
            }
            if self.cancel.sleep(self.settings.poll_interval).is_err() {
                return Err(self.abort(hw, output));
            }
        }

        self.confirmed.insert(output.channel, target);
        debug!(channel = %output.channel, value = target, polls, "ramp confirmed");
        Ok(RampOutcome {
            channel: output.channel,
            from: current,
            to: target,
            steps,
            polls,
            elapsed: started.elapsed(),
        })
    }

    /// Stop the ramp where it is and confirm the value actually reached.
    fn abort<H: SweepHardware + ?Sized>(&mut self, hw: &mut H, output: &DrivenOutput) -> Error {
        if let Err(e) = hw.stop(self.process) {
            warn!(process = %self.process, error = %e, "could not stop cancelled ramp");
            return Error::Cancelled;
        }
        match read_back(hw, output) {
            Ok(value) => {
                warn!(channel = %output.channel, value, "ramp aborted, output holds last step");
                self.confirmed.insert(output.channel, value);
            }
            Err(e) => warn!(channel = %output.channel, error = %e, "could not read back aborted ramp"),
        }
        Error::Cancelled
    }

    /// Stop a ramp that never confirmed and re-read where the output ended up.
    ///
    /// The error reports the value confirmed before the ramp. The cached
    /// value becomes the read-back, or is dropped when the board cannot be
    /// read, so the next ramp never starts from a stale value.
    fn time_out<H: SweepHardware + ?Sized>(&mut self, hw: &mut H, output: &DrivenOutput) -> Error {
        let last_confirmed = self.confirmed(output.channel);
        if let Err(e) = hw.stop(self.process) {
            warn!(process = %self.process, error = %e, "could not stop timed-out ramp");
        }
        match read_back(hw, output) {
            Ok(value) => {
                warn!(channel = %output.channel, value, "ramp timed out, output re-read");
                self.confirmed.insert(output.channel, value);
            }
            Err(e) => {
                warn!(channel = %output.channel, error = %e, "could not read back timed-out ramp");
                self.confirmed.remove(&output.channel);
            }
        }
        Error::RampTimeout {
            channel: output.channel,
            timeout: self.settings.timeout,
            last_confirmed,
        }
    }
}

/// Current physical value of an output according to the board.
fn read_back<H: SweepHardware + ?Sized>(hw: &mut H, output: &DrivenOutput) -> Result<f64> {
    let code = hw.output_code(output.channel)?;
    output
        .calibration
        .to_physical(&[code])
        .first()
        .copied()
        .ok_or_else(|| Error::instrument("board", format!("no read-back for {}", output.channel)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimFault, SimProcess, SimulatedDaq};

    const RAMP: ProcessId = ProcessId(1);
    const GATE: OutputChannel = OutputChannel(0);

    fn settings(max_step: f64) -> RampSettings {
        RampSettings {
            limits: RampLimits::max_step(max_step),
            poll_interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
        }
    }

    fn daq() -> SimulatedDaq {
        SimulatedDaq::new()
            .with_advance_per_tick(4)
            .with_process(RAMP, SimProcess::Ramp)
    }

    #[test]
    fn test_plan_steps_by_max_step() {
        let steps = plan_steps(0.0, 1.0, &RampLimits::max_step(0.25)).unwrap();
        assert_eq!(steps, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_plan_steps_rate_dominates() {
        // 1 V at 10 V/s with 10 ms updates: 10 steps, tighter than the 0.5 V step bound
        let limits = RampLimits::max_step(0.5).with_max_rate(10.0, Duration::from_millis(10));
        let steps = plan_steps(0.0, 1.0, &limits).unwrap();
        assert_eq!(steps.len(), 10);
        assert_eq!(*steps.last().unwrap(), 1.0);
    }

    #[test]
    fn test_plan_steps_downwards() {
        let steps = plan_steps(1.0, -1.0, &RampLimits::max_step(0.5)).unwrap();
        assert_eq!(steps, vec![0.5, 0.0, -0.5, -1.0]);
    }

    #[test]
    fn test_plan_steps_noop() {
        assert!(plan_steps(0.3, 0.3, &RampLimits::max_step(0.1)).unwrap().is_empty());
    }

    #[test]
    fn test_plan_steps_requires_limit() {
        let limits = RampLimits {
            max_step: None,
            max_rate: None,
            update_period: Duration::from_millis(1),
        };
        assert!(matches!(
            plan_steps(0.0, 1.0, &limits),
            Err(Error::InvalidSweepSpec(_))
        ));
        assert!(plan_steps(0.0, 1.0, &RampLimits::max_step(-0.1)).is_err());
        assert!(plan_steps(0.0, 1.0, &RampLimits::max_step(1e-9)).is_err());
    }

    #[test]
    fn test_ramp_reaches_target_through_steps() {
        let mut hw = daq();
        let mut ramp = RampController::new(RAMP, settings(0.1));
        let outcome = ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 1.0).unwrap();

        assert_eq!(outcome.steps.len(), 10);
        assert_eq!(ramp.confirmed(GATE), Some(1.0));
        assert!((hw.output_volts(GATE) - 1.0).abs() < 1e-3);
        assert_eq!(hw.output_history_volts(GATE).len(), 10);
    }

    #[test]
    fn test_ramp_noop_confirms_without_io() {
        let mut hw = daq();
        let mut ramp = RampController::new(RAMP, settings(0.1));
        let outcome = ramp
            .ramp_from(&mut hw, &DrivenOutput::new(GATE), 0.0, 0.0)
            .unwrap();
        assert!(outcome.steps.is_empty());
        assert!(hw.output_history().is_empty());
        assert_eq!(ramp.confirmed(GATE), Some(0.0));
    }

    #[test]
    fn test_ramp_timeout_reports_last_confirmed_and_rereads() {
        let mut hw = daq();
        hw.inject(SimFault::NeverStops(RAMP));
        let mut ramp = RampController::new(
            RAMP,
            RampSettings {
                timeout: Duration::from_millis(20),
                ..settings(0.1)
            },
        );
        ramp.mark_confirmed(GATE, 0.0);
        let err = ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 1.0).unwrap_err();
        match err {
            Error::RampTimeout { last_confirmed, .. } => assert_eq!(last_confirmed, Some(0.0)),
            other => panic!("unexpected error: {other}"),
        }
        // The board moved all the way; the cache follows the read-back
        assert!(!hw.is_running(RAMP).unwrap());
        assert_eq!(ramp.confirmed(GATE), Some(hw.output_volts(GATE)));
        assert!((hw.output_volts(GATE) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_ramp_after_timeout_starts_from_read_back() {
        let mut hw = daq();
        hw.inject(SimFault::NeverStops(RAMP));
        let mut ramp = RampController::new(
            RAMP,
            RampSettings {
                timeout: Duration::from_millis(20),
                ..settings(0.1)
            },
        );
        ramp.mark_confirmed(GATE, 0.0);
        assert!(ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 0.5).is_err());

        // Returning to 0 must step down from where the board is, not no-op
        hw.clear_faults();
        let outcome = ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 0.0).unwrap();
        assert!(!outcome.steps.is_empty());
        assert!((outcome.from - 0.5).abs() < 1e-3);
        assert_eq!(hw.output_volts(GATE), 0.0);
    }

    #[test]
    fn test_running_acquisition_blocks_ramp() {
        const ACQ: ProcessId = ProcessId(2);
        let mut hw = daq().with_process(
            ACQ,
            SimProcess::SweepAndRead {
                output: Some(GATE),
                inputs: Vec::new(),
                samples: 0,
            },
        );
        hw.load_trajectory(GATE, &[32_768; 100]).unwrap();
        hw.start(ACQ).unwrap();
        let written = hw.output_history().len();

        let mut ramp = RampController::new(RAMP, settings(0.1)).exclusive_with([ACQ]);
        ramp.mark_confirmed(GATE, 0.0);
        let err = ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 1.0).unwrap_err();
        assert!(matches!(err, Error::SweepBusy(ACQ)));
        assert_eq!(ramp.confirmed(GATE), Some(0.0));
        // Only the acquisition's own tick touched the output
        assert!(hw
            .output_history()
            .iter()
            .skip(written)
            .all(|&(_, code)| code == 32_768));
    }

    #[test]
    fn test_ramp_rejects_target_outside_span() {
        let mut hw = daq();
        let mut ramp = RampController::new(RAMP, settings(0.1));
        let err = ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 12.0).unwrap_err();
        assert!(matches!(err, Error::InvalidSweepSpec(_)));
        assert!(hw.output_history().is_empty());
    }

    #[test]
    fn test_ramp_confirms_only_representable_values() {
        let mut hw = daq();
        let mut ramp = RampController::new(RAMP, settings(1.0));
        let output = DrivenOutput::new(GATE);
        assert!(matches!(
            ramp.ramp(&mut hw, &output, 10.0),
            Err(Error::InvalidSweepSpec(_))
        ));

        let top = output.calibration.span.top(output.calibration.bits);
        ramp.ramp(&mut hw, &output, top).unwrap();
        assert_eq!(ramp.confirmed(GATE), Some(top));
        assert_eq!(hw.output_volts(GATE), top);
    }

    #[test]
    fn test_cancelled_ramp_does_not_start() {
        let mut hw = daq();
        let cancel = CancellationToken::new();
        let mut ramp = RampController::new(RAMP, settings(0.1)).with_cancel(cancel.clone());
        cancel.cancel();
        let err = ramp.ramp(&mut hw, &DrivenOutput::new(GATE), 1.0).unwrap_err();
        assert!(err.is_cancelled());
        assert!(hw.output_history().is_empty());
    }
}
