//! Simulated instruments
//!
//! Deterministic stand-ins for the ADC/DAC board and bench instruments, used
//! by the test-suite and the demo. Every call to
//! [`SweepHardware::is_running`] on a running process is one firmware "tick":
//! the process advances by a configurable number of samples (or ramp steps).
//!
//! Faults can be injected to exercise the error paths of the sweep core.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::{InputChannel, Instrument, OutputChannel, ProcessId, SweepHardware};
use crate::units::{code_to_volts, volts_to_code, CodeSpan, DEFAULT_BITS};
use crate::{Error, Result};

const DAQ_NAME: &str = "simulated daq";

/// Firmware process kinds known to the simulated board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimProcess {
    /// Steps the most recently loaded output through its trajectory.
    Ramp,
    /// Steps `output` (if any) through its trajectory while sampling `inputs`.
    SweepAndRead {
        /// Swept output; its trajectory length sets the sample count
        output: Option<OutputChannel>,
        /// Sampled inputs
        inputs: Vec<InputChannel>,
        /// Sample count when no output is swept
        samples: usize,
    },
}

/// How an input channel responds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    /// Raw code equals the sample index (wrapping at full scale)
    SampleIndex,
    /// `volts = slope * source_volts + offset`
    Linear {
        /// Output channel feeding the input, if any
        source: Option<OutputChannel>,
        /// Transfer slope
        slope: f64,
        /// Offset in volts
        offset: f64,
    },
}

/// Injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The process refuses to start
    FailStart(ProcessId),
    /// The counter steps backwards on the given tick
    RegressAtTick {
        /// Affected process
        process: ProcessId,
        /// Tick number (1-based) of the regression
        tick: usize,
    },
    /// The counter stops advancing at `count` while the process keeps running
    StallAt {
        /// Affected process
        process: ProcessId,
        /// Counter value where progress stops
        count: usize,
    },
    /// The process never reports completion
    NeverStops(ProcessId),
    /// Reads of this channel return one sample too few
    ShortRead(InputChannel),
}

/// One `read_samples` call as seen by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRecord {
    /// Channel read
    pub channel: InputChannel,
    /// First sample index
    pub start: usize,
    /// Samples requested
    pub count: usize,
    /// Counter register at the time of the read
    pub counter: usize,
    /// Whether the process was running at the time of the read
    pub running: bool,
}

#[derive(Debug, Clone)]
struct RunState {
    ramped: Option<OutputChannel>,
    counter: usize,
    total: usize,
    ticks: usize,
    stopped: bool,
}

/// Simulated ADC/DAC board.
#[derive(Debug)]
pub struct SimulatedDaq {
    bits: u8,
    span: CodeSpan,
    advance_per_tick: usize,
    processes: BTreeMap<ProcessId, SimProcess>,
    runs: BTreeMap<ProcessId, RunState>,
    last_started: Option<ProcessId>,
    last_loaded: Option<OutputChannel>,
    trajectories: BTreeMap<OutputChannel, Vec<u32>>,
    outputs: BTreeMap<OutputChannel, u32>,
    buffers: BTreeMap<InputChannel, Vec<u32>>,
    responses: BTreeMap<InputChannel, Response>,
    faults: Vec<SimFault>,
    output_history: Vec<(OutputChannel, u32)>,
    read_log: Vec<ReadRecord>,
}

impl Default for SimulatedDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDaq {
    /// 16-bit ±10 V board advancing one sample per tick.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: DEFAULT_BITS,
            span: CodeSpan::default(),
            advance_per_tick: 1,
            processes: BTreeMap::new(),
            runs: BTreeMap::new(),
            last_started: None,
            last_loaded: None,
            trajectories: BTreeMap::new(),
            outputs: BTreeMap::new(),
            buffers: BTreeMap::new(),
            responses: BTreeMap::new(),
            faults: Vec::new(),
            output_history: Vec::new(),
            read_log: Vec::new(),
        }
    }

    /// Samples (or ramp steps) completed per tick.
    #[must_use]
    pub fn with_advance_per_tick(mut self, advance: usize) -> Self {
        self.advance_per_tick = advance.max(1);
        self
    }

    /// Register a firmware process.
    #[must_use]
    pub fn with_process(mut self, id: ProcessId, process: SimProcess) -> Self {
        self.processes.insert(id, process);
        self
    }

    /// Set the response of an input channel.
    #[must_use]
    pub fn with_response(mut self, channel: InputChannel, response: Response) -> Self {
        self.responses.insert(channel, response);
        self
    }

    /// Inject a fault.
    pub fn inject(&mut self, fault: SimFault) {
        self.faults.push(fault);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    /// Every code written to an output, in order.
    #[must_use]
    pub fn output_history(&self) -> &[(OutputChannel, u32)] {
        &self.output_history
    }

    /// Output history of one channel in volts.
    #[must_use]
    pub fn output_history_volts(&self, channel: OutputChannel) -> Vec<f64> {
        self.output_history
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|&(_, code)| code_to_volts(code, self.bits, self.span))
            .collect()
    }

    /// Every sample read, in order.
    #[must_use]
    pub fn read_log(&self) -> &[ReadRecord] {
        &self.read_log
    }

    /// Voltage currently held by an output.
    #[must_use]
    pub fn output_volts(&self, channel: OutputChannel) -> f64 {
        code_to_volts(self.current_code(channel), self.bits, self.span)
    }

    fn current_code(&self, channel: OutputChannel) -> u32 {
        self.outputs
            .get(&channel)
            .copied()
            .unwrap_or_else(|| volts_to_code(0.0, self.bits, self.span))
    }

    fn has_fault(&self, wanted: impl Fn(&SimFault) -> bool) -> bool {
        self.faults.iter().any(wanted)
    }

    fn write_output(&mut self, channel: OutputChannel, code: u32) {
        self.outputs.insert(channel, code);
        self.output_history.push((channel, code));
    }

    fn sample_code(&self, channel: InputChannel, index: usize) -> u32 {
        let response = self
            .responses
            .get(&channel)
            .copied()
            .unwrap_or(Response::SampleIndex);
        match response {
            Response::SampleIndex => {
                let modulus = 1usize << self.bits;
                u32::try_from(index % modulus).unwrap_or(u32::MAX)
            }
            Response::Linear {
                source,
                slope,
                offset,
            } => {
                let source_volts = source.map_or(0.0, |s| self.output_volts(s));
                volts_to_code(slope * source_volts + offset, self.bits, self.span)
            }
        }
    }

    fn produce(&mut self, process: ProcessId, from: usize, to: usize) {
        let Some(kind) = self.processes.get(&process).cloned() else {
            return;
        };
        let ramped = self.runs.get(&process).and_then(|r| r.ramped);
        for index in from..to {
            match &kind {
                SimProcess::Ramp => {
                    if let Some(output) = ramped {
                        if let Some(&code) = self.trajectories.get(&output).and_then(|t| t.get(index)) {
                            self.write_output(output, code);
                        }
                    }
                }
                SimProcess::SweepAndRead { output, inputs, .. } => {
                    if let Some(out) = output {
                        if let Some(&code) = self.trajectories.get(out).and_then(|t| t.get(index)) {
                            self.write_output(*out, code);
                        }
                    }
                    for &input in inputs {
                        let code = self.sample_code(input, index);
                        if let Some(slot) = self.buffers.get_mut(&input).and_then(|b| b.get_mut(index)) {
                            *slot = code;
                        }
                    }
                }
            }
        }
    }

    fn tick(&mut self, process: ProcessId) {
        let advance = self.advance_per_tick;
        let never_stops = self.has_fault(|f| *f == SimFault::NeverStops(process));
        let regress_tick = self.faults.iter().find_map(|f| match *f {
            SimFault::RegressAtTick { process: p, tick } if p == process => Some(tick),
            _ => None,
        });
        let stall = self.faults.iter().find_map(|f| match *f {
            SimFault::StallAt { process: p, count } if p == process => Some(count),
            _ => None,
        });

        let Some(run) = self.runs.get_mut(&process) else {
            return;
        };
        run.ticks += 1;
        let before = run.counter;
        if regress_tick == Some(run.ticks) {
            run.counter = run.counter.saturating_sub(2);
            return;
        }
        let mut next = (run.counter + advance).min(run.total);
        if let Some(limit) = stall {
            next = next.min(limit);
        }
        run.counter = next;
        if run.counter == run.total && !never_stops {
            run.stopped = true;
        }
        self.produce(process, before, next);
    }

    fn is_process_running(&self, process: ProcessId) -> bool {
        self.runs.get(&process).is_some_and(|r| !r.stopped)
    }
}

impl SweepHardware for SimulatedDaq {
    fn load_trajectory(&mut self, channel: OutputChannel, codes: &[u32]) -> Result<()> {
        self.trajectories.insert(channel, codes.to_vec());
        self.last_loaded = Some(channel);
        Ok(())
    }

    fn start(&mut self, process: ProcessId) -> Result<()> {
        if self.has_fault(|f| *f == SimFault::FailStart(process)) {
            return Err(Error::instrument(DAQ_NAME, format!("process {process} failed to start")));
        }
        let kind = self
            .processes
            .get(&process)
            .cloned()
            .ok_or_else(|| Error::instrument(DAQ_NAME, format!("process {process} not loaded")))?;
        let ramped = match &kind {
            SimProcess::Ramp => Some(
                self.last_loaded
                    .ok_or_else(|| Error::instrument(DAQ_NAME, "no ramp trajectory loaded"))?,
            ),
            SimProcess::SweepAndRead { .. } => None,
        };
        let total = match &kind {
            SimProcess::Ramp => ramped
                .and_then(|output| self.trajectories.get(&output))
                .map_or(0, Vec::len),
            SimProcess::SweepAndRead {
                output, samples, ..
            } => match output {
                Some(out) => self.trajectories.get(out).map_or(0, Vec::len),
                None => *samples,
            },
        };
        if let SimProcess::SweepAndRead { inputs, .. } = &kind {
            for &input in inputs {
                self.buffers.insert(input, vec![0; total]);
            }
        }
        let never_stops = self.has_fault(|f| *f == SimFault::NeverStops(process));
        self.runs.insert(
            process,
            RunState {
                ramped,
                counter: 0,
                total,
                ticks: 0,
                stopped: total == 0 && !never_stops,
            },
        );
        self.last_started = Some(process);
        Ok(())
    }

    fn stop(&mut self, process: ProcessId) -> Result<()> {
        if let Some(run) = self.runs.get_mut(&process) {
            run.stopped = true;
        }
        Ok(())
    }

    fn is_running(&mut self, process: ProcessId) -> Result<bool> {
        if !self.is_process_running(process) {
            return Ok(false);
        }
        self.tick(process);
        Ok(self.is_process_running(process))
    }

    fn completed_count(&mut self, process: ProcessId) -> Result<usize> {
        Ok(self.runs.get(&process).map_or(0, |r| r.counter))
    }

    fn read_samples(
        &mut self,
        channel: InputChannel,
        start: usize,
        count: usize,
    ) -> Result<Vec<u32>> {
        let (counter, running) = self
            .last_started
            .and_then(|p| self.runs.get(&p))
            .map_or((0, false), |r| (r.counter, !r.stopped));
        self.read_log.push(ReadRecord {
            channel,
            start,
            count,
            counter,
            running,
        });
        let buffer = self
            .buffers
            .get(&channel)
            .ok_or_else(|| Error::instrument(DAQ_NAME, format!("{channel} not sampled")))?;
        let end = start + count;
        if end > buffer.len() {
            return Err(Error::instrument(
                DAQ_NAME,
                format!("read of {channel} [{start}, {end}) past buffer of {}", buffer.len()),
            ));
        }
        let mut codes = buffer[start..end].to_vec();
        if self.has_fault(|f| *f == SimFault::ShortRead(channel)) {
            codes.pop();
        }
        Ok(codes)
    }

    fn output_code(&mut self, channel: OutputChannel) -> Result<u32> {
        Ok(self.current_code(channel))
    }
}

#[derive(Debug)]
struct ThermostatState {
    setpoint: f64,
    stage: f64,
    shield: f64,
    approach: f64,
    failing_reads: usize,
    reads: usize,
    setpoints: Vec<f64>,
}

/// Temperature controller: output 0 is the setpoint, input 0 the stage and
/// input 1 the shield temperature.
///
/// The stage relaxes towards the setpoint by a fixed fraction per stage read;
/// the shield lags the stage. Clones share state, so a test can keep a handle
/// after boxing the instrument.
#[derive(Debug, Clone)]
pub struct SimulatedThermostat {
    state: Rc<RefCell<ThermostatState>>,
}

impl SimulatedThermostat {
    /// Thermostat starting at `initial` kelvin.
    #[must_use]
    pub fn new(initial: f64) -> Self {
        Self {
            state: Rc::new(RefCell::new(ThermostatState {
                setpoint: initial,
                stage: initial,
                shield: initial,
                approach: 0.3,
                failing_reads: 0,
                reads: 0,
                setpoints: Vec::new(),
            })),
        }
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.borrow_mut().failing_reads = count;
    }

    /// Setpoints commanded so far.
    #[must_use]
    pub fn setpoints(&self) -> Vec<f64> {
        self.state.borrow().setpoints.clone()
    }

    /// Reads attempted so far (including failed ones).
    #[must_use]
    pub fn reads(&self) -> usize {
        self.state.borrow().reads
    }

    /// Current stage temperature.
    #[must_use]
    pub fn stage(&self) -> f64 {
        self.state.borrow().stage
    }
}

impl Instrument for SimulatedThermostat {
    fn name(&self) -> &str {
        "simulated thermostat"
    }

    fn set_output(&mut self, channel: usize, value: f64) -> Result<()> {
        if channel != 0 {
            return Err(Error::instrument(self.name(), format!("no output channel {channel}")));
        }
        let mut state = self.state.borrow_mut();
        state.setpoint = value;
        state.setpoints.push(value);
        Ok(())
    }

    fn read_input(&mut self, channel: usize) -> Result<f64> {
        let mut state = self.state.borrow_mut();
        state.reads += 1;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(Error::instrument("simulated thermostat", "read timed out"));
        }
        match channel {
            0 => {
                let step = (state.setpoint - state.stage) * state.approach;
                state.stage += step;
                Ok(state.stage)
            }
            1 => {
                let step = (state.stage - state.shield) * state.approach * 0.5;
                state.shield += step;
                Ok(state.shield)
            }
            other => Err(Error::instrument(
                "simulated thermostat",
                format!("no input channel {other}"),
            )),
        }
    }
}

#[derive(Debug)]
struct SourceState {
    outputs: BTreeMap<usize, f64>,
    history: Vec<(usize, f64)>,
    input_enabled: bool,
    input_switches: usize,
}

/// Lock-in amplifier or current source that echoes its outputs.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    name: String,
    state: Rc<RefCell<SourceState>>,
}

impl SimulatedSource {
    /// Source with all outputs at zero and its input floating.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Rc::new(RefCell::new(SourceState {
                outputs: BTreeMap::new(),
                history: Vec::new(),
                input_enabled: false,
                input_switches: 0,
            })),
        }
    }

    /// Last value commanded on `channel`.
    #[must_use]
    pub fn output(&self, channel: usize) -> f64 {
        self.state.borrow().outputs.get(&channel).copied().unwrap_or(0.0)
    }

    /// All commands in order.
    #[must_use]
    pub fn history(&self) -> Vec<(usize, f64)> {
        self.state.borrow().history.clone()
    }

    /// Whether the external input is driven.
    #[must_use]
    pub fn input_enabled(&self) -> bool {
        self.state.borrow().input_enabled
    }

    /// Number of input enable/disable commands received.
    #[must_use]
    pub fn input_switches(&self) -> usize {
        self.state.borrow().input_switches
    }
}

impl Instrument for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_output(&mut self, channel: usize, value: f64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.outputs.insert(channel, value);
        state.history.push((channel, value));
        Ok(())
    }

    fn read_input(&mut self, channel: usize) -> Result<f64> {
        Ok(self.output(channel))
    }

    fn set_input_enabled(&mut self, enabled: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.input_enabled = enabled;
        state.input_switches += 1;
        Ok(())
    }
}
