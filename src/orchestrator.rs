//! Sweep orchestration
//!
//! ## State machine
//!
//! ```text
//! Idle → Annealing → Thermalizing(t) → RampingSecondary → SteadyStateWait
//!                          ↑                  ↑                  │
//!                          │                  └── Persisting ← Acquiring
//!                          └──────── next temperature ───────────┘
//!      … → RampingToRest → Finished          (any failure → Faulted)
//! ```
//!
//! The cross product is walked with temperature outermost, then heater
//! current, frequency and gate voltage; the acquisition trajectory is the
//! innermost sweep. Every trajectory is planned before the first hardware
//! call. The envelope is checkpointed after every acquisition, and after a
//! failure with `Failed`/`Cancelled` status. Outputs are ramped back to 0 at
//! the end of every run, successful or not.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionSession, BlockSink};
use crate::cancel::CancellationToken;
use crate::config::{HeaterConfig, SweepConfig, SweepPlan};
use crate::hardware::{ConsoleInstrument, Instrument, SweepHardware};
use crate::ramp::{DrivenOutput, RampController};
use crate::record::{ExperimentEnvelope, RecordStore, ResultRecord, RunStatus, SlotIndex};
use crate::thermal::{ThermalTrace, ThermalWait};
use crate::Result;

/// Temperature controller output carrying the setpoint
pub const THERMOSTAT_SETPOINT: usize = 0;
/// Lock-in output carrying the reference frequency
pub const LOCKIN_FREQUENCY: usize = 0;
/// Lock-in output carrying the sine amplitude
pub const LOCKIN_AMPLITUDE: usize = 1;

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Not started
    Idle,
    /// Holding the anneal setpoint
    Annealing,
    /// Waiting at temperature index `t`
    Thermalizing(usize),
    /// Moving heater, frequency, gate or bias to the next point
    RampingSecondary,
    /// Settle wait before acquiring
    SteadyStateWait,
    /// Sweep-and-read in progress
    Acquiring,
    /// Writing the checkpoint
    Persisting,
    /// Returning outputs to 0
    RampingToRest,
    /// Run complete
    Finished,
    /// Run aborted
    Faulted,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thermalizing(t) => write!(f, "Thermalizing({t})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Bench instruments. `None` is replaced by an operator console stand-in.
#[derive(Default)]
pub struct Instruments {
    /// Temperature controller
    pub temperature: Option<Box<dyn Instrument>>,
    /// Voltage-controlled current source feeding the heater
    pub heater_source: Option<Box<dyn Instrument>>,
    /// Lock-in amplifier providing the heater sine
    pub lockin: Option<Box<dyn Instrument>>,
}

impl Instruments {
    /// All instruments driven by the operator.
    #[must_use]
    pub fn manual() -> Self {
        Self::default()
    }

    /// Use `instrument` as the temperature controller.
    #[must_use]
    pub fn with_temperature(mut self, instrument: impl Instrument + 'static) -> Self {
        self.temperature = Some(Box::new(instrument));
        self
    }

    /// Use `instrument` as the heater current source.
    #[must_use]
    pub fn with_heater_source(mut self, instrument: impl Instrument + 'static) -> Self {
        self.heater_source = Some(Box::new(instrument));
        self
    }

    /// Use `instrument` as the lock-in amplifier.
    #[must_use]
    pub fn with_lockin(mut self, instrument: impl Instrument + 'static) -> Self {
        self.lockin = Some(Box::new(instrument));
        self
    }
}

fn or_console(instrument: Option<Box<dyn Instrument>>, name: &str) -> Box<dyn Instrument> {
    instrument.unwrap_or_else(|| {
        info!(instrument = name, "no driver configured, using operator console");
        Box::new(ConsoleInstrument::stdio(name))
    })
}

/// Runs a complete temperature-stepped sweep.
pub struct SweepOrchestrator<H> {
    config: SweepConfig,
    plan: SweepPlan,
    hw: H,
    temperature: Box<dyn Instrument>,
    heater_source: Box<dyn Instrument>,
    lockin: Box<dyn Instrument>,
    ramp: RampController,
    session: AcquisitionSession,
    store: RecordStore,
    cancel: CancellationToken,
    state: SweepState,
    history: Vec<SweepState>,
    current_input_enabled: bool,
}

impl<H: SweepHardware> SweepOrchestrator<H> {
    /// Validate `config`, plan every trajectory and wire the collaborators.
    ///
    /// No hardware or instrument I/O happens here.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] or [`crate::Error::InvalidSweepSpec`].
    pub fn new(config: SweepConfig, hw: H, instruments: Instruments) -> Result<Self> {
        let plan = config.validate()?;
        let cancel = CancellationToken::new();
        let ramp = RampController::new(config.ramp.process, config.ramp.settings()?)
            .exclusive_with([config.acquisition.process])
            .with_cancel(cancel.clone());
        let session = AcquisitionSession::new(
            config.acquisition.process,
            config.acquisition.channels.clone(),
            config.acquisition.settings()?,
        )
        .exclusive_with([config.ramp.process])
        .with_cancel(cancel.clone());
        let mut store = RecordStore::new(&config.output_path);
        if let Some(export) = &config.export_traces {
            store = store.with_trace_export(export);
        }

        Ok(Self {
            temperature: or_console(instruments.temperature, "temperature controller"),
            heater_source: or_console(instruments.heater_source, "heater current source"),
            lockin: or_console(instruments.lockin, "lock-in amplifier"),
            config,
            plan,
            hw,
            ramp,
            session,
            store,
            cancel,
            state: SweepState::Idle,
            history: vec![SweepState::Idle],
            current_input_enabled: false,
        })
    }

    /// Forward every acquired block to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: impl BlockSink + 'static) -> Self {
        self.session = self.session.with_sink(sink);
        self
    }

    /// Handle that aborts the run from another thread or a signal handler.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> SweepState {
        self.state
    }

    /// Every phase entered so far, in order.
    #[must_use]
    pub fn history(&self) -> &[SweepState] {
        &self.history
    }

    /// Whether the heater current source input is driven.
    #[must_use]
    pub const fn current_input_enabled(&self) -> bool {
        self.current_input_enabled
    }

    /// Planned trajectories.
    #[must_use]
    pub const fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Record store.
    #[must_use]
    pub const fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Hardware handle.
    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    /// Run the sweep to completion.
    ///
    /// On failure the envelope is checkpointed with `Failed` (or `Cancelled`)
    /// status and outputs are ramped to rest before the error is returned.
    ///
    /// # Errors
    ///
    /// Any error raised by a phase; cleanup failures are logged, never
    /// returned in place of the original error.
    pub fn run(&mut self) -> Result<ExperimentEnvelope> {
        let mut envelope = ExperimentEnvelope::builder(&self.config.chip_id, &self.config.device_id)
            .config(self.config.to_json_value()?)
            .record(ResultRecord::new(self.plan.axes.clone()))
            .build();
        envelope.start();
        info!(
            chip = %self.config.chip_id,
            device = %self.config.device_id,
            slots = self.plan.axes.slot_count(),
            samples_per_slot = self.plan.trajectory.len(),
            "sweep started"
        );

        let outcome = self.execute(&mut envelope);
        let rest = self.rest();

        match outcome.and(rest) {
            Ok(()) => match self.store.finalize(&mut envelope, RunStatus::Success) {
                Ok(()) => {
                    self.enter(SweepState::Finished);
                    info!(completed = envelope.record().completed_slots(), "sweep finished");
                    Ok(envelope)
                }
                Err(e) => {
                    error!(error = %e, "could not write final checkpoint");
                    self.enter(SweepState::Faulted);
                    Err(e)
                }
            },
            Err(e) => {
                let status = if e.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                error!(error = %e, state = %self.state, ?status, "sweep aborted");
                self.enter(SweepState::Faulted);
                if let Err(persist) = self.store.finalize(&mut envelope, status) {
                    error!(error = %persist, "could not checkpoint aborted sweep");
                }
                Err(e)
            }
        }
    }

    fn enter(&mut self, state: SweepState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state transition");
            self.state = state;
            self.history.push(state);
        }
    }

    fn execute(&mut self, envelope: &mut ExperimentEnvelope) -> Result<()> {
        if let Some(anneal) = self.config.anneal {
            self.enter(SweepState::Annealing);
            let trace = self.hold_temperature(anneal.temperature, anneal.duration()?)?;
            envelope.record_mut().set_anneal(trace);
            self.checkpoint(envelope)?;
        }

        let axes = self.plan.axes.clone();
        let [nt, nh, nf, ng] = axes.dims();
        for t in 0..nt {
            if let Some(&temperature) = axes.temperatures.get(t) {
                self.enter(SweepState::Thermalizing(t));
                let trace = self.hold_temperature(temperature, self.config.thermal.duration()?)?;
                envelope.record_mut().set_thermalization(t, trace)?;
                self.checkpoint(envelope)?;
            }
            for h in 0..nh {
                if let (Some(&current), Some(heater)) = (axes.heater_currents.get(h), self.config.heater) {
                    self.enter(SweepState::RampingSecondary);
                    self.set_heater(&heater, current)?;
                }
                for f in 0..nf {
                    if let Some(&frequency) = axes.frequencies.get(f) {
                        self.enter(SweepState::RampingSecondary);
                        self.lockin.set_output(LOCKIN_FREQUENCY, frequency)?;
                        self.lockin.wait_ready()?;
                        debug!(frequency, "lock-in frequency set");
                    }
                    for g in 0..ng {
                        self.acquire_point(envelope, SlotIndex::new(t, h, f, g))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn acquire_point(&mut self, envelope: &mut ExperimentEnvelope, index: SlotIndex) -> Result<()> {
        self.enter(SweepState::RampingSecondary);
        if let (Some(gate), Some(&voltage)) =
            (self.config.gate, self.plan.axes.gate_voltages.get(index.gate))
        {
            self.ramp.ramp(&mut self.hw, &gate.output, voltage)?;
        }
        let output = self.config.acquisition.output;
        let trajectory = self.plan.trajectory.clone();
        if let Some(&first) = trajectory.first() {
            self.ramp.ramp(&mut self.hw, &output, first)?;
        }

        self.enter(SweepState::SteadyStateWait);
        self.cancel.sleep(self.config.settle_time()?)?;

        self.enter(SweepState::Acquiring);
        let expected = trajectory.len();
        let last = trajectory.last().copied();
        self.hw
            .load_trajectory(output.channel, &output.calibration.to_codes(&trajectory))?;
        let slot = envelope.record_mut().slot_mut(index)?;
        self.session.prepare(slot, trajectory);
        self.ramp.forget(output.channel);
        let report = self.session.run(&mut self.hw, expected, slot)?;
        if let Some(last) = last {
            self.ramp.mark_confirmed(output.channel, last);
        }
        debug!(?index, polls = report.polls, "slot acquired");

        self.enter(SweepState::Persisting);
        self.checkpoint(envelope)
    }

    fn checkpoint(&self, envelope: &mut ExperimentEnvelope) -> Result<()> {
        envelope.touch();
        self.store.checkpoint(envelope)
    }

    /// Command `setpoint` and log the thermometers for `duration`.
    fn hold_temperature(
        &mut self,
        setpoint: f64,
        duration: std::time::Duration,
    ) -> Result<ThermalTrace> {
        let thermal = &self.config.thermal;
        self.temperature.set_output(THERMOSTAT_SETPOINT, setpoint)?;
        self.temperature.wait_ready()?;
        let wait = ThermalWait::new(duration, thermal.sample_period()?)?
            .with_retries(thermal.max_read_retries)
            .with_cancel(self.cancel.clone());
        let names = thermal.channel_names();
        let inputs: Vec<usize> = thermal.channels.iter().map(|c| c.input).collect();
        let instrument = &mut self.temperature;
        wait.wait(&names, setpoint, || {
            inputs.iter().map(|&input| instrument.read_input(input)).collect()
        })
    }

    /// Command the heater sine for `current`, toggling the source input only
    /// when the amplitude crosses the threshold.
    fn set_heater(&mut self, heater: &HeaterConfig, current: f64) -> Result<()> {
        let amplitude = heater.amplitude(current);
        let drive = amplitude.abs() >= heater.input_threshold_v;
        if !drive && self.current_input_enabled {
            self.heater_source.set_input_enabled(false)?;
            self.current_input_enabled = false;
            info!(amplitude, "heater source input floating");
        }
        self.lockin.set_output(LOCKIN_AMPLITUDE, amplitude)?;
        self.lockin.wait_ready()?;
        if drive && !self.current_input_enabled {
            self.heater_source.set_input_enabled(true)?;
            self.current_input_enabled = true;
            info!(amplitude, "heater source input driven");
        }
        debug!(current, amplitude, "heater set");
        Ok(())
    }

    /// Ramp every driven output to 0 and switch the heater off.
    ///
    /// Runs even after cancellation; returns the first failure after trying
    /// every step.
    fn rest(&mut self) -> Result<()> {
        self.enter(SweepState::RampingToRest);
        let mut ramp = self.ramp.clone().with_cancel(CancellationToken::new());
        let mut outputs: Vec<DrivenOutput> = self.config.gate.map(|g| g.output).into_iter().collect();
        outputs.push(self.config.acquisition.output);

        let mut first_error = None;
        for output in &outputs {
            if let Err(e) = ramp.ramp(&mut self.hw, output, 0.0) {
                warn!(channel = %output.channel, error = %e, "could not ramp output to rest");
                first_error.get_or_insert(e);
            }
        }
        if self.config.heater.is_some() {
            if self.current_input_enabled {
                match self.heater_source.set_input_enabled(false) {
                    Ok(()) => self.current_input_enabled = false,
                    Err(e) => {
                        warn!(error = %e, "could not float heater source input");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Err(e) = self.lockin.set_output(LOCKIN_AMPLITUDE, 0.0) {
                warn!(error = %e, "could not zero heater amplitude");
                first_error.get_or_insert(e);
            }
        }
        self.ramp = ramp.with_cancel(self.cancel.clone());
        first_error.map_or(Ok(()), Err)
    }
}

impl<H> fmt::Debug for SweepOrchestrator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepOrchestrator")
            .field("chip_id", &self.config.chip_id)
            .field("device_id", &self.config.device_id)
            .field("state", &self.state)
            .field("current_input_enabled", &self.current_input_enabled)
            .finish_non_exhaustive()
    }
}

