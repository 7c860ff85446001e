//! Buffered acquisition
//!
//! A sweep-and-read firmware process fills on-board sample buffers while the
//! host polls its completed-sample register and drains new blocks.
//!
//! ## Completed-count rule
//!
//! ```text
//! poll: running = is_running(p); register = completed_count(p)
//!       completed = running ? register - 1 : register
//! ```
//!
//! While the process runs, the sample at `register - 1` may still be in
//! flight and is not read. `is_running` is read first so a process that
//! stops between the two reads is never mistaken for a running one.

use std::ops::Range;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::hardware::{ensure_idle, InputChannel, ProcessId, SweepHardware};
use crate::record::Slot;
use crate::units::ChannelCalibration;
use crate::{Error, Result};

/// One sampled input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// ADC input
    pub input: InputChannel,
    /// Name used in the record
    pub name: String,
    /// Physical unit after calibration
    pub unit: String,
    /// Code ↔ physical conversion
    #[serde(default)]
    pub calibration: ChannelCalibration,
}

impl ChannelSpec {
    /// Channel with the default ±10 V, 16-bit calibration.
    pub fn new(input: InputChannel, name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            input,
            name: name.into(),
            unit: unit.into(),
            calibration: ChannelCalibration::default(),
        }
    }

    /// Replace the calibration.
    #[must_use]
    pub const fn with_calibration(mut self, calibration: ChannelCalibration) -> Self {
        self.calibration = calibration;
        self
    }
}

/// Poll timing and record options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Sleep between polls
    pub poll_interval: Duration,
    /// Fault if the register does not move for this long
    pub stall_timeout: Duration,
    /// Time between samples, used for the slot time axis
    pub sample_period: Duration,
    /// Trailing window of the running statistics
    pub averaging_window: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(5),
            sample_period: Duration::from_millis(1),
            averaging_window: 1,
        }
    }
}

/// Samples drained in one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredBlock {
    /// Sample indices covered
    pub range: Range<usize>,
    /// Converted values, one vector per channel in session order
    pub channels: Vec<Vec<f64>>,
}

/// Receives every block as it is acquired (live plotting).
pub trait BlockSink {
    /// Called once per drained block.
    fn on_block(&mut self, block: &AcquiredBlock);
}

impl<F: FnMut(&AcquiredBlock)> BlockSink for F {
    fn on_block(&mut self, block: &AcquiredBlock) {
        self(block);
    }
}

/// Summary of a finished acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Register polls performed
    pub polls: usize,
    /// Samples acquired per channel
    pub samples: usize,
    /// Wall time from start to the last sample
    pub elapsed: Duration,
}

/// Runs one sweep-and-read process and drains its buffers into a slot.
pub struct AcquisitionSession {
    process: ProcessId,
    channels: Vec<ChannelSpec>,
    settings: AcquisitionSettings,
    sink: Option<Box<dyn BlockSink>>,
    cancel: CancellationToken,
    exclusive: Vec<ProcessId>,
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("process", &self.process)
            .field("channels", &self.channels)
            .field("settings", &self.settings)
            .field("sink", &self.sink.is_some())
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl AcquisitionSession {
    /// Session for `process` sampling `channels`.
    #[must_use]
    pub fn new(process: ProcessId, channels: Vec<ChannelSpec>, settings: AcquisitionSettings) -> Self {
        Self {
            process,
            channels,
            settings,
            sink: None,
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

    /// Forward every block to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: impl BlockSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Observe `cancel` between polls.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Firmware process.
    #[must_use]
    pub const fn process(&self) -> ProcessId {
        self.process
    }

    /// Sampled channels.
    #[must_use]
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    /// Poll settings.
    #[must_use]
    pub const fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Size `slot` for `setpoints` with this session's channels.
    pub fn prepare(&self, slot: &mut Slot, setpoints: Vec<f64>) {
        slot.prepare(
            setpoints,
            self.channels.iter().map(|c| (c.name.as_str(), c.unit.as_str())),
            self.settings.averaging_window,
        );
    }

    /// Start the process and drain `expected` samples per channel into `slot`.
    ///
    /// `slot` must be prepared for `expected` samples of this session's
    /// channels. The process is stopped on any fault or cancellation; the
    /// slot then holds exactly the samples drained so far.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`]: `expected` is zero or the slot does not match
    /// - [`Error::SweepBusy`]: this or an exclusive process is already running
    /// - [`Error::AcquisitionFault`]: start failure or inconsistent counter
    /// - [`Error::Cancelled`]: cancelled between polls
    pub fn run<H: SweepHardware + ?Sized>(
        &mut self,
        hw: &mut H,
        expected: usize,
        slot: &mut Slot,
    ) -> Result<AcquisitionReport> {
        if expected == 0 {
            return Err(Error::InvalidInput("acquisition of zero samples".to_string()));
        }
        if slot.capacity() != expected || slot.channels().len() != self.channels.len() {
            return Err(Error::InvalidInput(format!(
                "slot sized for {} samples of {} channels, expected {expected} of {}",
                slot.capacity(),
                slot.channels().len(),
                self.channels.len()
            )));
        }
        self.cancel.check()?;
        ensure_idle(hw, &self.exclusive)?;

        let started = Instant::now();
        hw.start(self.process).map_err(|e| {
            Error::acquisition_fault(self.process, format!("process failed to start: {e}"))
        })?;
        info!(process = %self.process, expected, channels = self.channels.len(), "acquisition started");

        match self.drain(hw, expected, slot, started) {
            Ok(report) => {
                info!(
                    process = %self.process,
                    polls = report.polls,
                    samples = report.samples,
                    elapsed = ?report.elapsed,
                    "acquisition complete"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(stop) = hw.stop(self.process) {
                    warn!(process = %self.process, error = %stop, "could not stop acquisition");
                }
                if e.is_cancelled() {
                    warn!(process = %self.process, filled = slot.filled(), "acquisition cancelled");
                } else {
                    error!(process = %self.process, filled = slot.filled(), error = %e, "acquisition aborted");
                }
                Err(e)
            }
        }
    }

    fn drain<H: SweepHardware + ?Sized>(
        &mut self,
        hw: &mut H,
        expected: usize,
        slot: &mut Slot,
        started: Instant,
    ) -> Result<AcquisitionReport> {
        let process = self.process;
        let mut last_read = 0;
        let mut last_register = 0;
        let mut last_progress = Instant::now();
        let mut polls = 0;

        loop {
            polls += 1;
            let running = hw.is_running(process)?;
            let register = hw.completed_count(process)?;

            if register < last_register {
                return Err(Error::acquisition_fault(
                    process,
                    format!("sample counter regressed from {last_register} to {register}"),
                ));
            }
            if register > expected {
                return Err(Error::acquisition_fault(
                    process,
                    format!("sample counter {register} exceeds expected {expected}"),
                ));
            }
            if register > last_register {
                last_register = register;
                last_progress = Instant::now();
            }

            let completed = if running {
                register.saturating_sub(1)
            } else {
                register
            };
            if completed > last_read {
                let block = self.read_block(hw, last_read..completed)?;
                slot.write_block(block.range.start, &block.channels, self.settings.sample_period)?;
                debug!(process = %process, from = last_read, to = completed, polls, "block acquired");
                if let Some(sink) = self.sink.as_mut() {
                    sink.on_block(&block);
                }
                last_read = completed;
            }

            if completed == expected {
                return Ok(AcquisitionReport {
                    polls,
                    samples: completed,
                    elapsed: started.elapsed(),
                });
            }
            if !running {
                return Err(Error::acquisition_fault(
                    process,
                    format!("process stopped after {completed} of {expected} samples"),
                ));
            }
            if last_progress.elapsed() >= self.settings.stall_timeout {
                return Err(Error::acquisition_fault(
                    process,
                    format!(
                        "no progress for {:?} at {register} of {expected} samples",
                        self.settings.stall_timeout
                    ),
                ));
            }
            self.cancel.sleep(self.settings.poll_interval)?;
        }
    }

    /// Read and convert `range` for every channel before anything is written.
    fn read_block<H: SweepHardware + ?Sized>(
        &self,
        hw: &mut H,
        range: Range<usize>,
    ) -> Result<AcquiredBlock> {
        let count = range.len();
        let mut channels = Vec::with_capacity(self.channels.len());
        for spec in &self.channels {
            let codes = hw.read_samples(spec.input, range.start, count)?;
            if codes.len() != count {
                return Err(Error::acquisition_fault(
                    self.process,
                    format!(
                        "{} returned {} samples for [{}, {})",
                        spec.input,
                        codes.len(),
                        range.start,
                        range.end
                    ),
                ));
            }
            channels.push(spec.calibration.to_physical(&codes));
        }
        Ok(AcquiredBlock { range, channels })
    }
}
