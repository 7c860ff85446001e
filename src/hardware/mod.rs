//! Hardware seams consumed by the sweep core
//!
//! Two kinds of collaborators are driven:
//!
//! - [`SweepHardware`]: a multi-channel ADC/DAC board running numbered
//!   firmware processes (output ramps, sweep-and-read acquisitions) against
//!   on-board sample buffers.
//! - [`Instrument`]: a bench instrument addressed by channel number
//!   (temperature controller, lock-in amplifier, current source).
//!
//! When an instrument is not available, [`ConsoleInstrument`] asks the
//! operator to perform the setting by hand.

mod console;
pub mod sim;

pub use console::ConsoleInstrument;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Firmware process number on the ADC/DAC board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u8);

/// DAC output channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputChannel(pub u8);

/// ADC input channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputChannel(pub u8);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DAC{}", self.0)
    }
}

impl fmt::Display for InputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ADC{}", self.0)
    }
}

/// ADC/DAC board with buffered firmware processes.
///
/// Implementations talk to one physical link and are driven from a single
/// thread of control; every call may perform I/O.
pub trait SweepHardware {
    /// Upload the code trajectory the next process will step `channel` through.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn load_trajectory(&mut self, channel: OutputChannel, codes: &[u32]) -> Result<()>;

    /// Start a firmware process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn start(&mut self, process: ProcessId) -> Result<()>;

    /// Stop a firmware process; outputs hold their last written code.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn stop(&mut self, process: ProcessId) -> Result<()>;

    /// Whether the process is still running.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn is_running(&mut self, process: ProcessId) -> Result<bool>;

    /// Hardware-maintained sample counter of the process.
    ///
    /// While the process runs, the sample at `count - 1` may still be in
    /// flight; callers must not read it until the process has stopped.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn completed_count(&mut self, process: ProcessId) -> Result<usize>;

    /// Read `count` raw codes of `channel` starting at sample `start`.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn read_samples(&mut self, channel: InputChannel, start: usize, count: usize)
        -> Result<Vec<u32>>;

    /// Code currently held by an output channel.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn output_code(&mut self, channel: OutputChannel) -> Result<u32>;
}

impl<H: SweepHardware + ?Sized> SweepHardware for Box<H> {
    fn load_trajectory(&mut self, channel: OutputChannel, codes: &[u32]) -> Result<()> {
        (**self).load_trajectory(channel, codes)
    }

    fn start(&mut self, process: ProcessId) -> Result<()> {
        (**self).start(process)
    }

    fn stop(&mut self, process: ProcessId) -> Result<()> {
        (**self).stop(process)
    }

    fn is_running(&mut self, process: ProcessId) -> Result<bool> {
        (**self).is_running(process)
    }

    fn completed_count(&mut self, process: ProcessId) -> Result<usize> {
        (**self).completed_count(process)
    }

    fn read_samples(
        &mut self,
        channel: InputChannel,
        start: usize,
        count: usize,
    ) -> Result<Vec<u32>> {
        (**self).read_samples(channel, start, count)
    }

    fn output_code(&mut self, channel: OutputChannel) -> Result<u32> {
        (**self).output_code(channel)
    }
}

impl<H: SweepHardware + ?Sized> SweepHardware for &mut H {
    fn load_trajectory(&mut self, channel: OutputChannel, codes: &[u32]) -> Result<()> {
        (**self).load_trajectory(channel, codes)
    }

    fn start(&mut self, process: ProcessId) -> Result<()> {
        (**self).start(process)
    }

    fn stop(&mut self, process: ProcessId) -> Result<()> {
        (**self).stop(process)
    }

    fn is_running(&mut self, process: ProcessId) -> Result<bool> {
        (**self).is_running(process)
    }

    fn completed_count(&mut self, process: ProcessId) -> Result<usize> {
        (**self).completed_count(process)
    }

    fn read_samples(
        &mut self,
        channel: InputChannel,
        start: usize,
        count: usize,
    ) -> Result<Vec<u32>> {
        (**self).read_samples(channel, start, count)
    }

    fn output_code(&mut self, channel: OutputChannel) -> Result<u32> {
        (**self).output_code(channel)
    }
}

/// Bench instrument addressed by channel number.
pub trait Instrument {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Command a physical value on an output channel (setpoint, amplitude,
    /// frequency, ...).
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn set_output(&mut self, channel: usize, value: f64) -> Result<()>;

    /// Read a physical value from an input channel.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn read_input(&mut self, channel: usize) -> Result<f64>;

    /// Block until the last command has taken effect.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn wait_ready(&mut self) -> Result<()> {
        Ok(())
    }

    /// Switch the instrument's external input between driven and floating.
    ///
    /// # Errors
    ///
    /// Driver/link failures.
    fn set_input_enabled(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

/// Check that none of `processes` is currently running.
///
/// # Errors
///
/// Returns [`crate::Error::SweepBusy`] for the first running process.
pub fn ensure_idle<H: SweepHardware + ?Sized>(hw: &mut H, processes: &[ProcessId]) -> Result<()> {
    for &process in processes {
        if hw.is_running(process)? {
            return Err(crate::Error::SweepBusy(process));
        }
    }
    Ok(())
}
