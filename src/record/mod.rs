//! Result record, experiment envelope and persistence
//!
//! ## Layout
//!
//! ```text
//! ExperimentEnvelope
//!   ├── metadata (chip, device, timestamps, RunStatus, config snapshot)
//!   └── ResultRecord
//!         ├── SweepAxes        temperature × heater × frequency × gate
//!         ├── Slot[]           dense arena, one per SlotIndex
//!         │     ├── setpoints  acquisition trajectory
//!         │     ├── ChannelTrace[] (values, running mean, running std)
//!         │     └── time
//!         ├── anneal           ThermalTrace
//!         └── thermalization   ThermalTrace per temperature
//! ```
//!
//! Slots are pre-sized with zeros when an acquisition is prepared. The
//! `filled` count and [`SlotStatus`] say how much of a slot is real data.

mod envelope;
mod export;
mod store;

pub use envelope::{ExperimentEnvelope, ExperimentEnvelopeBuilder, RunStatus};
pub use export::{export_traces, trace_batch, trace_schema};
pub use store::RecordStore;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::thermal::ThermalTrace;
use crate::{Error, Result};

/// Setpoints of the outer sweep axes. An empty axis has extent 1.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepAxes {
    /// Temperature setpoints (outermost)
    pub temperatures: Vec<f64>,
    /// Heater currents
    pub heater_currents: Vec<f64>,
    /// Lock-in frequencies
    pub frequencies: Vec<f64>,
    /// Gate voltages (innermost outer axis)
    pub gate_voltages: Vec<f64>,
}

impl SweepAxes {
    /// Extent of each axis, in iteration order.
    #[must_use]
    pub fn dims(&self) -> [usize; 4] {
        [
            self.temperatures.len().max(1),
            self.heater_currents.len().max(1),
            self.frequencies.len().max(1),
            self.gate_voltages.len().max(1),
        ]
    }

    /// Number of slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.dims().iter().product()
    }
}

/// Position of a slot in the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SlotIndex {
    /// Temperature index
    pub temperature: usize,
    /// Heater current index
    pub heater: usize,
    /// Frequency index
    pub frequency: usize,
    /// Gate voltage index
    pub gate: usize,
}

impl SlotIndex {
    /// Index from its four coordinates.
    #[must_use]
    pub const fn new(temperature: usize, heater: usize, frequency: usize, gate: usize) -> Self {
        Self {
            temperature,
            heater,
            frequency,
            gate,
        }
    }
}

/// Setpoint values at a slot; `None` for an unused axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinates {
    /// Temperature setpoint
    pub temperature: Option<f64>,
    /// Heater current
    pub heater_current: Option<f64>,
    /// Frequency
    pub frequency: Option<f64>,
    /// Gate voltage
    pub gate_voltage: Option<f64>,
}

/// How much of a slot holds acquired data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Nothing acquired
    #[default]
    Empty,
    /// Some samples acquired
    Partial,
    /// Every planned sample acquired
    Complete,
}

/// Samples of one input channel within a slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelTrace {
    /// Channel name
    pub name: String,
    /// Physical unit
    pub unit: String,
    /// Converted samples
    pub values: Vec<f64>,
    /// Trailing-window mean at each sample
    pub mean: Vec<f64>,
    /// Trailing-window population standard deviation at each sample
    pub std: Vec<f64>,
}

impl ChannelTrace {
    fn zeroed(name: &str, unit: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            values: vec![0.0; capacity],
            mean: vec![0.0; capacity],
            std: vec![0.0; capacity],
        }
    }

    fn update_stats(&mut self, index: usize, window: usize) {
        let from = (index + 1).saturating_sub(window.max(1));
        let tail = &self.values[from..=index];
        #[allow(clippy::cast_precision_loss)]
        let n = tail.len() as f64;
        let mean = tail.iter().sum::<f64>() / n;
        let variance = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        self.mean[index] = mean;
        self.std[index] = variance.sqrt();
    }
}

/// One acquisition: the trajectory, the traces and the sample times.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Slot {
    setpoints: Vec<f64>,
    channels: Vec<ChannelTrace>,
    time: Vec<f64>,
    filled: usize,
    status: SlotStatus,
    averaging_window: usize,
}

impl Slot {
    /// Size the slot for `setpoints.len()` samples of each channel.
    ///
    /// `channels` yields `(name, unit)` pairs. Previous contents are
    /// discarded.
    pub fn prepare<'a>(
        &mut self,
        setpoints: Vec<f64>,
        channels: impl IntoIterator<Item = (&'a str, &'a str)>,
        averaging_window: usize,
    ) {
        let capacity = setpoints.len();
        self.channels = channels
            .into_iter()
            .map(|(name, unit)| ChannelTrace::zeroed(name, unit, capacity))
            .collect();
        self.setpoints = setpoints;
        self.time = Vec::with_capacity(capacity);
        self.filled = 0;
        self.status = SlotStatus::Empty;
        self.averaging_window = averaging_window.max(1);
    }

    /// Append a block of samples starting at `start`.
    ///
    /// `block[c]` holds the new samples of channel `c`. Either the whole
    /// block is written or nothing is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the block is not contiguous with
    /// the samples already written, has the wrong channel count, ragged
    /// lengths, or runs past the slot capacity.
    pub fn write_block(
        &mut self,
        start: usize,
        block: &[Vec<f64>],
        sample_period: Duration,
    ) -> Result<()> {
        if start != self.filled {
            return Err(Error::InvalidInput(format!(
                "block starts at sample {start} but {} samples are filled",
                self.filled
            )));
        }
        if block.len() != self.channels.len() {
            return Err(Error::InvalidInput(format!(
                "block has {} channels, slot has {}",
                block.len(),
                self.channels.len()
            )));
        }
        let count = block.first().map_or(0, Vec::len);
        if block.iter().any(|c| c.len() != count) {
            return Err(Error::InvalidInput("ragged block".to_string()));
        }
        let end = start + count;
        if end > self.capacity() {
            return Err(Error::InvalidInput(format!(
                "block [{start}, {end}) exceeds slot capacity {}",
                self.capacity()
            )));
        }

        for (trace, samples) in self.channels.iter_mut().zip(block) {
            trace.values[start..end].copy_from_slice(samples);
            for index in start..end {
                trace.update_stats(index, self.averaging_window);
            }
        }
        let period = sample_period.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        self.time.extend((start..end).map(|i| i as f64 * period));
        self.filled = end;
        self.status = if self.filled == self.capacity() {
            SlotStatus::Complete
        } else if self.filled > 0 {
            SlotStatus::Partial
        } else {
            SlotStatus::Empty
        };
        Ok(())
    }

    /// Planned sample count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.setpoints.len()
    }

    /// Samples written so far.
    #[must_use]
    pub const fn filled(&self) -> usize {
        self.filled
    }

    /// Fill status.
    #[must_use]
    pub const fn status(&self) -> SlotStatus {
        self.status
    }

    /// Acquisition trajectory.
    #[must_use]
    pub fn setpoints(&self) -> &[f64] {
        &self.setpoints
    }

    /// All channel traces.
    #[must_use]
    pub fn channels(&self) -> &[ChannelTrace] {
        &self.channels
    }

    /// Trace of one channel by name.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&ChannelTrace> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Acquired values of one channel (the filled prefix only).
    #[must_use]
    pub fn acquired(&self, name: &str) -> Option<&[f64]> {
        self.channel(name).map(|c| &c.values[..self.filled])
    }

    /// Seconds since the acquisition start, one per filled sample.
    #[must_use]
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// Trailing-window size of the running statistics.
    #[must_use]
    pub const fn averaging_window(&self) -> usize {
        self.averaging_window
    }
}

/// Typed multi-dimensional result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    axes: SweepAxes,
    slots: Vec<Slot>,
    anneal: Option<ThermalTrace>,
    thermalization: Vec<Option<ThermalTrace>>,
}

impl Default for ResultRecord {
    /// Record with a single slot and no outer axes.
    fn default() -> Self {
        Self::new(SweepAxes::default())
    }
}

impl ResultRecord {
    /// Empty record over `axes`.
    #[must_use]
    pub fn new(axes: SweepAxes) -> Self {
        let slots = vec![Slot::default(); axes.slot_count()];
        let thermalization = vec![None; axes.dims()[0]];
        Self {
            axes,
            slots,
            anneal: None,
            thermalization,
        }
    }

    /// Sweep axes.
    #[must_use]
    pub const fn axes(&self) -> &SweepAxes {
        &self.axes
    }

    /// Extent of each axis.
    #[must_use]
    pub fn dims(&self) -> [usize; 4] {
        self.axes.dims()
    }

    fn offset(&self, index: SlotIndex) -> Option<usize> {
        let [nt, nh, nf, ng] = self.dims();
        if index.temperature >= nt || index.heater >= nh || index.frequency >= nf || index.gate >= ng
        {
            return None;
        }
        Some(((index.temperature * nh + index.heater) * nf + index.frequency) * ng + index.gate)
    }

    /// Slot at `index`.
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> Option<&Slot> {
        self.offset(index).and_then(|o| self.slots.get(o))
    }

    /// Mutable slot at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an index outside the axes.
    pub fn slot_mut(&mut self, index: SlotIndex) -> Result<&mut Slot> {
        let offset = self.offset(index).ok_or_else(|| {
            Error::InvalidInput(format!("slot {index:?} outside dims {:?}", self.dims()))
        })?;
        self.slots
            .get_mut(offset)
            .ok_or_else(|| Error::InvalidInput(format!("slot {index:?} not allocated")))
    }

    /// Every slot index in iteration order (temperature outermost).
    pub fn indices(&self) -> impl Iterator<Item = SlotIndex> {
        let [nt, nh, nf, ng] = self.dims();
        (0..nt).flat_map(move |t| {
            (0..nh).flat_map(move |h| {
                (0..nf).flat_map(move |f| (0..ng).map(move |g| SlotIndex::new(t, h, f, g)))
            })
        })
    }

    /// Setpoint values at `index`.
    #[must_use]
    pub fn coordinates(&self, index: SlotIndex) -> Coordinates {
        Coordinates {
            temperature: self.axes.temperatures.get(index.temperature).copied(),
            heater_current: self.axes.heater_currents.get(index.heater).copied(),
            frequency: self.axes.frequencies.get(index.frequency).copied(),
            gate_voltage: self.axes.gate_voltages.get(index.gate).copied(),
        }
    }

    /// Slots paired with their index, in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &Slot)> {
        self.indices().zip(self.slots.iter())
    }

    /// Number of fully acquired slots.
    #[must_use]
    pub fn completed_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status() == SlotStatus::Complete)
            .count()
    }

    /// Anneal trace, if the run annealed.
    #[must_use]
    pub const fn anneal(&self) -> Option<&ThermalTrace> {
        self.anneal.as_ref()
    }

    /// Store the anneal trace.
    pub fn set_anneal(&mut self, trace: ThermalTrace) {
        self.anneal = Some(trace);
    }

    /// Thermalization trace of temperature `index`.
    #[must_use]
    pub fn thermalization(&self, index: usize) -> Option<&ThermalTrace> {
        self.thermalization.get(index).and_then(Option::as_ref)
    }

    /// Store the thermalization trace of temperature `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an index outside the temperature axis.
    pub fn set_thermalization(&mut self, index: usize, trace: ThermalTrace) -> Result<()> {
        let slot = self.thermalization.get_mut(index).ok_or_else(|| {
            Error::InvalidInput(format!("no temperature index {index}"))
        })?;
        *slot = Some(trace);
        Ok(())
    }
}
