//! End-to-end sweeps against the simulated board and instruments

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use labsweep::acquisition::AcquiredBlock;
use labsweep::hardware::sim::{
    Response, SimFault, SimProcess, SimulatedDaq, SimulatedSource, SimulatedThermostat,
};
use labsweep::hardware::{InputChannel, Instrument, OutputChannel, ProcessId};
use labsweep::orchestrator::{LOCKIN_AMPLITUDE, LOCKIN_FREQUENCY};
use labsweep::record::{RecordStore, SlotIndex, SlotStatus};
use labsweep::{Error, Instruments, Result, RunStatus, SweepConfig, SweepOrchestrator, SweepState};

const RAMP: ProcessId = ProcessId(1);
const ACQ: ProcessId = ProcessId(2);
const GATE: OutputChannel = OutputChannel(0);
const BIAS: OutputChannel = OutputChannel(1);
const CURRENT: InputChannel = InputChannel(0);
const VOLTAGE: InputChannel = InputChannel(1);

const THERMAL_DURATION_S: f64 = 0.05;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "labsweep-orchestrator-{name}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Two temperatures × three heater currents × one frequency × two gate
/// voltages, with a 9-point forward-backward bias sweep per slot.
fn config(dir: &Path) -> SweepConfig {
    let value = serde_json::json!({
        "chip_id": "C12",
        "device_id": "D3",
        "output_path": dir.join("run.json"),
        "thermal": { "duration_s": THERMAL_DURATION_S, "sample_period_s": 0.01 },
        "temperatures": { "start": 4.0, "stop": 6.0, "points": 2 },
        "heater": {
            "currents": { "start": 0.0, "stop": 2e-3, "points": 3 },
            "source_gain": 1e-3
        },
        "frequencies": [7.0],
        "gate": {
            "output": { "channel": 0 },
            "voltages": { "start": 0.0, "stop": 0.05, "points": 2 }
        },
        "acquisition": {
            "process": 2,
            "output": { "channel": 1 },
            "trajectory": { "start": 0.0, "stop": 0.1, "points": 5, "mode": "forward-backward" },
            "channels": [
                { "input": 0, "name": "current", "unit": "A" },
                { "input": 1, "name": "voltage", "unit": "V" }
            ],
            "poll_interval_s": 0.0,
            "stall_timeout_s": 2.0
        },
        "ramp": { "process": 1, "max_step": 0.01, "poll_interval_s": 0.0, "timeout_s": 2.0 },
        "settle_time_s": 0.0
    });
    serde_json::from_value(value).unwrap()
}

fn board() -> SimulatedDaq {
    SimulatedDaq::new()
        .with_advance_per_tick(16)
        .with_process(RAMP, SimProcess::Ramp)
        .with_process(
            ACQ,
            SimProcess::SweepAndRead {
                output: Some(BIAS),
                inputs: vec![CURRENT, VOLTAGE],
                samples: 0,
            },
        )
        .with_response(
            CURRENT,
            Response::Linear {
                source: Some(BIAS),
                slope: 0.5,
                offset: 0.0,
            },
        )
        .with_response(
            VOLTAGE,
            Response::Linear {
                source: Some(BIAS),
                slope: 1.0,
                offset: 0.0,
            },
        )
}

struct Bench {
    thermostat: SimulatedThermostat,
    lockin: SimulatedSource,
    heater: SimulatedSource,
}

impl Bench {
    fn new() -> Self {
        Self {
            thermostat: SimulatedThermostat::new(300.0),
            lockin: SimulatedSource::new("lock-in"),
            heater: SimulatedSource::new("heater source"),
        }
    }

    fn instruments(&self) -> Instruments {
        Instruments::default()
            .with_temperature(self.thermostat.clone())
            .with_lockin(self.lockin.clone())
            .with_heater_source(self.heater.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Frequency(f64),
    Amplitude(f64),
    Input(bool),
}

/// Instrument appending every command to a shared log.
#[derive(Clone)]
struct Recorder {
    name: &'static str,
    events: Rc<RefCell<Vec<Event>>>,
}

impl Instrument for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn set_output(&mut self, channel: usize, value: f64) -> Result<()> {
        let event = match channel {
            LOCKIN_FREQUENCY => Event::Frequency(value),
            LOCKIN_AMPLITUDE => Event::Amplitude(value),
            other => return Err(Error::instrument(self.name, format!("no output {other}"))),
        };
        self.events.borrow_mut().push(event);
        Ok(())
    }

    fn read_input(&mut self, _channel: usize) -> Result<f64> {
        Ok(0.0)
    }

    fn set_input_enabled(&mut self, enabled: bool) -> Result<()> {
        self.events.borrow_mut().push(Event::Input(enabled));
        Ok(())
    }
}

#[test]
fn test_full_sweep_succeeds() {
    let dir = scratch("success");
    let config = config(&dir);
    let mut daq = board();
    let bench = Bench::new();

    let mut orchestrator = SweepOrchestrator::new(config, &mut daq, bench.instruments()).unwrap();
    let started = Instant::now();
    let envelope = orchestrator.run().unwrap();
    let elapsed = started.elapsed();
    let history = orchestrator.history().to_vec();
    let state = orchestrator.state();
    let input_enabled = orchestrator.current_input_enabled();
    drop(orchestrator);

    assert_eq!(envelope.status(), RunStatus::Success);
    assert!(envelope.ended_at().is_some());
    assert_eq!(state, SweepState::Finished);
    assert_eq!(history.first(), Some(&SweepState::Idle));
    assert_eq!(history.last(), Some(&SweepState::Finished));
    assert!(history.contains(&SweepState::Thermalizing(0)));
    assert!(history.contains(&SweepState::Thermalizing(1)));
    assert!(history.contains(&SweepState::RampingToRest));
    assert!(!history.contains(&SweepState::Annealing));

    let record = envelope.record();
    assert_eq!(record.dims(), [2, 3, 1, 2]);
    assert_eq!(record.completed_slots(), 12);
    for (index, slot) in record.iter() {
        assert_eq!(slot.status(), SlotStatus::Complete, "slot {index:?}");
        assert_eq!(slot.filled(), 9);
        let current = slot.acquired("current").unwrap();
        for (value, setpoint) in current.iter().zip(slot.setpoints()) {
            assert!((value - 0.5 * setpoint).abs() < 1e-3, "{value} vs {setpoint}");
        }
    }
    let coordinates = record.coordinates(SlotIndex::new(1, 2, 0, 1));
    assert_eq!(coordinates.temperature, Some(6.0));
    assert_eq!(coordinates.heater_current, Some(2e-3));
    assert_eq!(coordinates.frequency, Some(7.0));
    assert_eq!(coordinates.gate_voltage, Some(0.05));

    // The checkpoint on disk is the final envelope
    let stored = RecordStore::load(dir.join("run.json")).unwrap();
    assert_eq!(stored, envelope);
    assert!(stored.config().is_some());

    // Thermal waits are never cut short
    assert_eq!(bench.thermostat.setpoints(), vec![4.0, 6.0]);
    assert!(elapsed >= Duration::from_secs_f64(2.0 * THERMAL_DURATION_S));
    for t in 0..2 {
        let trace = record.thermalization(t).unwrap();
        assert!(trace.len() >= 2);
        assert_eq!(trace.channels, vec!["stage", "shield"]);
        assert!(trace.time.iter().all(|&s| s < THERMAL_DURATION_S));
    }

    // Outputs at rest, heater off
    assert_eq!(daq.output_volts(GATE), 0.0);
    assert_eq!(daq.output_volts(BIAS), 0.0);
    assert!(!input_enabled);
    assert!(!bench.heater.input_enabled());
    assert_eq!(bench.lockin.output(LOCKIN_AMPLITUDE), 0.0);
    assert_eq!(bench.lockin.output(LOCKIN_FREQUENCY), 7.0);
}

#[test]
fn test_gate_moves_only_through_bounded_steps() {
    let dir = scratch("bounded-steps");
    let mut daq = board();
    let bench = Bench::new();
    let mut orchestrator =
        SweepOrchestrator::new(config(&dir), &mut daq, bench.instruments()).unwrap();
    orchestrator.run().unwrap();
    drop(orchestrator);

    let gate = daq.output_history_volts(GATE);
    assert!(!gate.is_empty());
    let mut previous = 0.0;
    for value in gate {
        assert!((value - previous).abs() <= 0.01 + 1e-3, "{previous} → {value}");
        previous = value;
    }
}

#[test]
fn test_heater_input_switches_only_on_threshold_crossings() {
    let dir = scratch("debounce");
    let events: Rc<RefCell<Vec<Event>>> = Rc::default();
    let recorder = |name: &'static str| Recorder {
        name,
        events: Rc::clone(&events),
    };
    let instruments = Instruments::default()
        .with_temperature(SimulatedThermostat::new(4.0))
        .with_lockin(recorder("lock-in"))
        .with_heater_source(recorder("heater source"));

    let mut daq = board();
    let mut orchestrator = SweepOrchestrator::new(config(&dir), &mut daq, instruments).unwrap();
    orchestrator.run().unwrap();
    drop(orchestrator);

    let heater_events: Vec<Event> = events
        .borrow()
        .iter()
        .copied()
        .filter(|e| !matches!(e, Event::Frequency(_)))
        .collect();
    assert_eq!(
        heater_events,
        vec![
            // 4 K: 0 A stays floating, 1 mA crosses up after the amplitude is set
            Event::Amplitude(0.0),
            Event::Amplitude(1.0),
            Event::Input(true),
            Event::Amplitude(2.0),
            // 6 K: crossing down floats the input before the amplitude drops
            Event::Input(false),
            Event::Amplitude(0.0),
            Event::Amplitude(1.0),
            Event::Input(true),
            Event::Amplitude(2.0),
            // rest
            Event::Input(false),
            Event::Amplitude(0.0),
        ]
    );
}

#[test]
fn test_anneal_precedes_temperature_sweep() {
    let dir = scratch("anneal");
    let mut config = config(&dir);
    config.anneal = serde_json::from_value(serde_json::json!({
        "temperature": 30.0,
        "duration_s": 0.02
    }))
    .unwrap();
    let mut daq = board();
    let bench = Bench::new();
    let mut orchestrator = SweepOrchestrator::new(config, &mut daq, bench.instruments()).unwrap();
    let envelope = orchestrator.run().unwrap();
    assert_eq!(orchestrator.history()[1], SweepState::Annealing);
    drop(orchestrator);

    assert_eq!(bench.thermostat.setpoints(), vec![30.0, 4.0, 6.0]);
    let anneal = envelope.record().anneal().unwrap();
    assert!((anneal.setpoint - 30.0).abs() < f64::EPSILON);
    assert!(!anneal.is_empty());
}

#[test]
fn test_acquisition_failure_checkpoints_failed_and_rests() {
    let dir = scratch("failure");
    let mut daq = board();
    daq.inject(SimFault::FailStart(ACQ));
    let bench = Bench::new();
    let mut orchestrator =
        SweepOrchestrator::new(config(&dir), &mut daq, bench.instruments()).unwrap();

    let err = orchestrator.run().unwrap_err();
    assert!(matches!(err, Error::AcquisitionFault { process, .. } if process == ACQ));
    assert_eq!(orchestrator.state(), SweepState::Faulted);
    assert!(orchestrator.history().contains(&SweepState::RampingToRest));
    drop(orchestrator);

    let stored = RecordStore::load(dir.join("run.json")).unwrap();
    assert_eq!(stored.status(), RunStatus::Failed);
    assert!(stored.ended_at().is_some());
    assert_eq!(stored.record().completed_slots(), 0);
    assert!(stored.record().thermalization(0).is_some());

    assert_eq!(daq.output_volts(GATE), 0.0);
    assert_eq!(daq.output_volts(BIAS), 0.0);
    assert!(!bench.heater.input_enabled());
}

#[test]
fn test_thermometer_failures_beyond_retries_abort() {
    let dir = scratch("thermal-io");
    let mut config = config(&dir);
    config.thermal.duration_s = 5.0;
    let mut daq = board();
    let bench = Bench::new();
    bench.thermostat.fail_next_reads(100);
    let mut orchestrator = SweepOrchestrator::new(config, &mut daq, bench.instruments()).unwrap();

    let err = orchestrator.run().unwrap_err();
    assert!(matches!(err, Error::ThermalWaitIo { attempts: 4, .. }));
    drop(orchestrator);

    let stored = RecordStore::load(dir.join("run.json")).unwrap();
    assert_eq!(stored.status(), RunStatus::Failed);
    assert!(daq.read_log().is_empty());
}

#[test]
fn test_transient_thermometer_failures_are_retried() {
    let dir = scratch("thermal-retry");
    let mut daq = board();
    let bench = Bench::new();
    bench.thermostat.fail_next_reads(2);
    let mut orchestrator =
        SweepOrchestrator::new(config(&dir), &mut daq, bench.instruments()).unwrap();

    let envelope = orchestrator.run().unwrap();
    let trace = envelope.record().thermalization(0).unwrap();
    assert_eq!(trace.failed_reads, 2);
    assert_eq!(envelope.status(), RunStatus::Success);
}

#[test]
fn test_cancel_during_sweep_checkpoints_cancelled() {
    let dir = scratch("cancel");
    let mut daq = board();
    let bench = Bench::new();
    let orchestrator =
        SweepOrchestrator::new(config(&dir), &mut daq, bench.instruments()).unwrap();
    let token = orchestrator.cancel_token();
    let mut orchestrator = orchestrator.with_sink(move |_: &AcquiredBlock| token.cancel());

    let err = orchestrator.run().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(orchestrator.state(), SweepState::Faulted);
    drop(orchestrator);

    // The acquisition in progress finished; the next gate ramp observed the cancel
    let stored = RecordStore::load(dir.join("run.json")).unwrap();
    assert_eq!(stored.status(), RunStatus::Cancelled);
    assert_eq!(stored.record().completed_slots(), 1);
    assert_eq!(
        stored.record().slot(SlotIndex::new(0, 0, 0, 0)).unwrap().status(),
        SlotStatus::Complete
    );

    // Cleanup still ran
    assert_eq!(daq.output_volts(GATE), 0.0);
    assert_eq!(daq.output_volts(BIAS), 0.0);
}

#[test]
fn test_gate_ramp_timeout_still_rests_every_output() {
    let dir = scratch("ramp-timeout");
    let mut config = config(&dir);
    config.ramp.timeout_s = 0.05;
    let mut daq = board();
    daq.inject(SimFault::NeverStops(RAMP));
    let bench = Bench::new();
    let mut orchestrator = SweepOrchestrator::new(config, &mut daq, bench.instruments()).unwrap();

    // Slot g=0 needs no gate move; the 0 → 0.05 V ramp for g=1 never confirms
    let err = orchestrator.run().unwrap_err();
    assert!(matches!(
        err,
        Error::RampTimeout { channel, last_confirmed: Some(v), .. } if channel == GATE && v == 0.0
    ));
    assert!(orchestrator.history().contains(&SweepState::RampingToRest));
    drop(orchestrator);

    let stored = RecordStore::load(dir.join("run.json")).unwrap();
    assert_eq!(stored.status(), RunStatus::Failed);
    assert_eq!(stored.record().completed_slots(), 1);

    // The gate moved before the timeout and was stepped back down
    let gate = daq.output_history_volts(GATE);
    assert!(gate.iter().any(|&v| v > 0.04));
    assert_eq!(daq.output_volts(GATE), 0.0);
    assert_eq!(daq.output_volts(BIAS), 0.0);
    assert!(!bench.heater.input_enabled());
}

#[test]
fn test_invalid_config_touches_no_hardware() {
    let dir = scratch("invalid");
    let mut config = config(&dir);
    config.acquisition.trajectory.stop = 15.0;
    let mut daq = board();
    let bench = Bench::new();

    let err = SweepOrchestrator::new(config, &mut daq, bench.instruments()).unwrap_err();
    assert!(matches!(err, Error::InvalidSweepSpec(_)));

    assert!(daq.output_history().is_empty());
    assert!(daq.read_log().is_empty());
    assert!(bench.thermostat.setpoints().is_empty());
    assert!(bench.lockin.history().is_empty());
    assert!(!dir.join("run.json").exists());
}

#[test]
fn test_trace_export_written_at_end() {
    let dir = scratch("export");
    let mut config = config(&dir);
    config.export_traces = Some(dir.join("traces.parquet"));
    let mut daq = board();
    let bench = Bench::new();
    let mut orchestrator = SweepOrchestrator::new(config, &mut daq, bench.instruments()).unwrap();
    orchestrator.run().unwrap();

    let metadata = std::fs::metadata(dir.join("traces.parquet")).unwrap();
    assert!(metadata.len() > 0);
}
