//! Sweep configuration
//!
//! One JSON document describes a whole run. Durations are given in seconds
//! (`*_s` fields). [`SweepConfig::validate`] checks the structure and plans
//! every trajectory, so a bad configuration fails before any hardware I/O.
//!
//! ```json
//! {
//!   "chip_id": "C12", "device_id": "D3",
//!   "output_path": "/data/C12-D3.json",
//!   "thermal": { "duration_s": 600, "sample_period_s": 5 },
//!   "temperatures": { "start": 4, "stop": 20, "points": 5 },
//!   "acquisition": {
//!     "process": 2,
//!     "output": { "channel": 1 },
//!     "trajectory": { "start": -1, "stop": 1, "points": 201, "mode": "forward-backward" },
//!     "channels": [ { "input": 0, "name": "current", "unit": "A" } ]
//!   }
//! }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionSettings, ChannelSpec};
use crate::hardware::ProcessId;
use crate::plan::{plan, SweepSpec};
use crate::ramp::{DrivenOutput, RampLimits, RampSettings};
use crate::record::SweepAxes;
use crate::{Error, Result};

/// Heater amplitude below which the current source input floats (volts)
pub const DEFAULT_INPUT_THRESHOLD_V: f64 = 0.004;

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::InvalidConfig(format!("{name} = {value}: {e}")))
}

fn positive_seconds(name: &str, value: f64) -> Result<Duration> {
    let duration = seconds(name, value)?;
    if duration.is_zero() {
        return Err(Error::InvalidConfig(format!("{name} must be positive")));
    }
    Ok(duration)
}

/// Thermometer read during thermal waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermometerChannel {
    /// Name in the recorded trace
    pub name: String,
    /// Input channel on the temperature controller
    pub input: usize,
}

fn default_thermometers() -> Vec<ThermometerChannel> {
    vec![
        ThermometerChannel {
            name: "stage".to_string(),
            input: 0,
        },
        ThermometerChannel {
            name: "shield".to_string(),
            input: 1,
        },
    ]
}

const fn default_read_retries() -> u32 {
    3
}

/// Thermalization after each temperature step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalSettings {
    /// Full wait duration; never shortened
    pub duration_s: f64,
    /// Thermometer cadence
    pub sample_period_s: f64,
    /// Consecutive failed reads tolerated before aborting
    #[serde(default = "default_read_retries")]
    pub max_read_retries: u32,
    /// Thermometers logged during the wait
    #[serde(default = "default_thermometers")]
    pub channels: Vec<ThermometerChannel>,
}

impl ThermalSettings {
    /// Wait duration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a negative or non-finite value.
    pub fn duration(&self) -> Result<Duration> {
        seconds("thermal.duration_s", self.duration_s)
    }

    /// Sample period.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a non-positive or non-finite value.
    pub fn sample_period(&self) -> Result<Duration> {
        positive_seconds("thermal.sample_period_s", self.sample_period_s)
    }

    /// Thermometer names, in reading order.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }
}

/// Anneal phase before the temperature sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnealConfig {
    /// Anneal setpoint
    pub temperature: f64,
    /// Time held at the setpoint
    pub duration_s: f64,
}

impl AnnealConfig {
    /// Hold duration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a negative or non-finite value.
    pub fn duration(&self) -> Result<Duration> {
        seconds("anneal.duration_s", self.duration_s)
    }
}

const fn default_input_threshold() -> f64 {
    DEFAULT_INPUT_THRESHOLD_V
}

/// Heater driven by a lock-in sine through a voltage-controlled current source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeaterConfig {
    /// Heater current trajectory
    pub currents: SweepSpec,
    /// Current source transconductance (amperes per volt)
    pub source_gain: f64,
    /// Amplitude threshold of the source input switch
    #[serde(default = "default_input_threshold")]
    pub input_threshold_v: f64,
}

impl HeaterConfig {
    /// Lock-in amplitude commanding `current`.
    #[must_use]
    pub fn amplitude(&self, current: f64) -> f64 {
        current / self.source_gain
    }
}

/// Gate voltage sweep on a ramped output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Gate output
    pub output: DrivenOutput,
    /// Gate trajectory
    pub voltages: SweepSpec,
}

const fn default_acquisition_process() -> ProcessId {
    ProcessId(2)
}

const fn default_poll_interval() -> f64 {
    0.05
}

const fn default_stall_timeout() -> f64 {
    10.0
}

const fn default_sample_period() -> f64 {
    0.001
}

const fn default_window() -> usize {
    1
}

/// Innermost sweep-and-read acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sweep-and-read firmware process
    #[serde(default = "default_acquisition_process")]
    pub process: ProcessId,
    /// Swept output (typically the bias)
    pub output: DrivenOutput,
    /// Swept output trajectory
    pub trajectory: SweepSpec,
    /// Sampled inputs
    pub channels: Vec<ChannelSpec>,
    /// Sleep between counter polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: f64,
    /// Counter stall tolerance
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_s: f64,
    /// Firmware sample period
    #[serde(default = "default_sample_period")]
    pub sample_period_s: f64,
    /// Trailing window of the running statistics
    #[serde(default = "default_window")]
    pub averaging_window: usize,
}

impl AcquisitionConfig {
    /// Poll settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unusable durations.
    pub fn settings(&self) -> Result<AcquisitionSettings> {
        Ok(AcquisitionSettings {
            poll_interval: seconds("acquisition.poll_interval_s", self.poll_interval_s)?,
            stall_timeout: positive_seconds("acquisition.stall_timeout_s", self.stall_timeout_s)?,
            sample_period: seconds("acquisition.sample_period_s", self.sample_period_s)?,
            averaging_window: self.averaging_window,
        })
    }
}

const fn default_ramp_process() -> ProcessId {
    ProcessId(1)
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_step() -> Option<f64> {
    Some(0.01)
}

const fn default_update_period() -> f64 {
    0.001
}

const fn default_ramp_timeout() -> f64 {
    120.0
}

/// Output ramp limits and completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampConfig {
    /// Ramp firmware process
    #[serde(default = "default_ramp_process")]
    pub process: ProcessId,
    /// Largest step between setpoints
    #[serde(default = "default_max_step")]
    pub max_step: Option<f64>,
    /// Largest change per second
    #[serde(default)]
    pub max_rate: Option<f64>,
    /// Time per setpoint on the board
    #[serde(default = "default_update_period")]
    pub update_period_s: f64,
    /// Sleep between completion polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: f64,
    /// Completion timeout
    #[serde(default = "default_ramp_timeout")]
    pub timeout_s: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            process: default_ramp_process(),
            max_step: default_max_step(),
            max_rate: None,
            update_period_s: default_update_period(),
            poll_interval_s: default_poll_interval(),
            timeout_s: default_ramp_timeout(),
        }
    }
}

impl RampConfig {
    /// Ramp controller settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unusable durations and
    /// [`Error::InvalidSweepSpec`] for unusable limits.
    pub fn settings(&self) -> Result<RampSettings> {
        let limits = RampLimits {
            max_step: self.max_step,
            max_rate: self.max_rate,
            update_period: seconds("ramp.update_period_s", self.update_period_s)?,
        };
        limits.validate()?;
        Ok(RampSettings {
            limits,
            poll_interval: seconds("ramp.poll_interval_s", self.poll_interval_s)?,
            timeout: positive_seconds("ramp.timeout_s", self.timeout_s)?,
        })
    }
}

/// Planned trajectories of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Outer axes
    pub axes: SweepAxes,
    /// Innermost acquisition trajectory
    pub trajectory: Vec<f64>,
}

const fn default_settle_time() -> f64 {
    1.0
}

/// Complete description of a sweep run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Chip identifier
    pub chip_id: String,
    /// Device identifier on the chip
    pub device_id: String,
    /// Checkpoint file
    pub output_path: PathBuf,
    /// Parquet trace export written when the run ends
    #[serde(default)]
    pub export_traces: Option<PathBuf>,
    /// Anneal before the temperature sweep
    #[serde(default)]
    pub anneal: Option<AnnealConfig>,
    /// Thermalization settings
    pub thermal: ThermalSettings,
    /// Temperature trajectory (outermost)
    #[serde(default)]
    pub temperatures: Option<SweepSpec>,
    /// Heater current sweep
    #[serde(default)]
    pub heater: Option<HeaterConfig>,
    /// Lock-in reference frequencies
    #[serde(default)]
    pub frequencies: Vec<f64>,
    /// Gate voltage sweep
    #[serde(default)]
    pub gate: Option<GateConfig>,
    /// Innermost acquisition
    pub acquisition: AcquisitionConfig,
    /// Output ramps
    #[serde(default)]
    pub ramp: RampConfig,
    /// Wait between the last ramp and the acquisition start
    #[serde(default = "default_settle_time")]
    pub settle_time_s: f64,
}

impl SweepConfig {
    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::Serialization`] for malformed JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Snapshot stored in the experiment envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the configuration cannot be encoded.
    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Settle wait before each acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a negative or non-finite value.
    pub fn settle_time(&self) -> Result<Duration> {
        seconds("settle_time_s", self.settle_time_s)
    }

    /// Plan every trajectory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSweepSpec`] for the first bad trajectory.
    pub fn plan(&self) -> Result<SweepPlan> {
        let optional = |spec: Option<&SweepSpec>| spec.map_or(Ok(Vec::new()), plan);
        Ok(SweepPlan {
            axes: SweepAxes {
                temperatures: optional(self.temperatures.as_ref())?,
                heater_currents: optional(self.heater.as_ref().map(|h| &h.currents))?,
                frequencies: self.frequencies.clone(),
                gate_voltages: optional(self.gate.as_ref().map(|g| &g.voltages))?,
            },
            trajectory: plan(&self.acquisition.trajectory)?,
        })
    }

    /// Check the whole configuration and plan every trajectory.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`]: structural problems
    /// - [`Error::InvalidSweepSpec`]: a trajectory cannot be planned or
    ///   leaves its output span
    pub fn validate(&self) -> Result<SweepPlan> {
        if self.chip_id.trim().is_empty() || self.device_id.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "chip_id and device_id must be set".to_string(),
            ));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("output_path must be set".to_string()));
        }

        self.thermal.duration()?;
        self.thermal.sample_period()?;
        if self.thermal.channels.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one thermometer channel is required".to_string(),
            ));
        }
        if let Some(anneal) = &self.anneal {
            anneal.duration()?;
            if !anneal.temperature.is_finite() {
                return Err(Error::InvalidConfig("anneal temperature must be finite".to_string()));
            }
        }
        self.settle_time()?;
        self.ramp.settings()?;
        self.acquisition.settings()?;

        if let Some(heater) = &self.heater {
            if !heater.source_gain.is_finite() || heater.source_gain == 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "heater source gain must be finite and nonzero, got {}",
                    heater.source_gain
                )));
            }
            if !heater.input_threshold_v.is_finite() || heater.input_threshold_v < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "heater input threshold must be non-negative, got {}",
                    heater.input_threshold_v
                )));
            }
        }
        if let Some(f) = self.frequencies.iter().find(|f| !f.is_finite() || **f <= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "frequencies must be positive, got {f}"
            )));
        }

        let acquisition = &self.acquisition;
        if acquisition.channels.is_empty() {
            return Err(Error::InvalidConfig(
                "acquisition needs at least one channel".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for channel in &acquisition.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate acquisition channel name {:?}",
                    channel.name
                )));
            }
            channel.calibration.validate()?;
        }
        if acquisition.process == self.ramp.process {
            return Err(Error::InvalidConfig(format!(
                "acquisition and ramp cannot share process {}",
                acquisition.process
            )));
        }
        acquisition.output.calibration.validate()?;
        if let Some(gate) = &self.gate {
            gate.output.calibration.validate()?;
            if gate.output.channel == acquisition.output.channel {
                return Err(Error::InvalidConfig(format!(
                    "gate and acquisition both drive {}",
                    gate.output.channel
                )));
            }
        }

        let planned = self.plan()?;
        check_span("acquisition trajectory", &acquisition.output, &planned.trajectory)?;
        if let Some(gate) = &self.gate {
            check_span("gate voltages", &gate.output, &planned.axes.gate_voltages)?;
        }
        Ok(planned)
    }
}

fn check_span(what: &str, output: &DrivenOutput, values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !output.calibration.contains(**v)) {
        Some(v) => Err(Error::InvalidSweepSpec(format!(
            "{what} value {v} outside the span of {}",
            output.channel
        ))),
        None => Ok(()),
    }
}
