//! Simulated Sweep Example
//!
//! Runs a complete temperature × heater × gate I-V sweep against the
//! simulated board, thermostat, lock-in and heater source, then reloads the
//! checkpoint and exports the acquired traces to Parquet.
//!
//! Run with: cargo run --example simulated_sweep
//! Verbose:  RUST_LOG=labsweep=debug cargo run --example simulated_sweep

use anyhow::Context;
use labsweep::hardware::sim::{
    Response, SimProcess, SimulatedDaq, SimulatedSource, SimulatedThermostat,
};
use labsweep::hardware::{InputChannel, OutputChannel, ProcessId};
use labsweep::record::RecordStore;
use labsweep::{Instruments, SweepConfig, SweepOrchestrator};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("labsweep=info")),
        )
        .init();

    println!("=== labsweep Simulated Sweep ===\n");

    let dir = std::env::temp_dir().join("labsweep-demo");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    // -------------------------------------------------------------------------
    // 1. Configuration
    // -------------------------------------------------------------------------
    println!("1. Loading configuration...");

    let config: SweepConfig = serde_json::from_value(serde_json::json!({
        "chip_id": "SIM-01",
        "device_id": "R1",
        "output_path": dir.join("SIM-01-R1.json"),
        "export_traces": dir.join("SIM-01-R1.parquet"),
        "thermal": { "duration_s": 0.2, "sample_period_s": 0.02 },
        "temperatures": { "start": 4.0, "stop": 12.0, "points": 3 },
        "heater": {
            "currents": { "start": 0.0, "stop": 1e-3, "points": 2 },
            "source_gain": 1e-3
        },
        "frequencies": [7.0],
        "gate": {
            "output": { "channel": 0 },
            "voltages": { "start": -0.2, "stop": 0.2, "points": 3 }
        },
        "acquisition": {
            "output": { "channel": 1 },
            "trajectory": { "start": 0.0, "stop": 0.5, "points": 51, "mode": "forward-backward" },
            "channels": [
                { "input": 0, "name": "current", "unit": "A", "calibration": { "gain": 1e4 } },
                { "input": 1, "name": "voltage", "unit": "V" }
            ],
            "poll_interval_s": 0.002,
            "averaging_window": 4
        },
        "ramp": { "max_step": 0.02, "poll_interval_s": 0.001 },
        "settle_time_s": 0.01
    }))
    .context("parsing demo configuration")?;

    let plan = config.validate().context("validating configuration")?;
    println!("   Chip/device: {}/{}", config.chip_id, config.device_id);
    println!("   Slots: {:?} = {}", plan.axes.dims(), plan.axes.slot_count());
    println!("   Samples per slot: {}", plan.trajectory.len());

    // -------------------------------------------------------------------------
    // 2. Simulated bench
    // -------------------------------------------------------------------------
    println!("\n2. Wiring simulated instruments...");

    let bias = OutputChannel(1);
    let mut daq = SimulatedDaq::new()
        .with_advance_per_tick(7)
        .with_process(ProcessId(1), SimProcess::Ramp)
        .with_process(
            ProcessId(2),
            SimProcess::SweepAndRead {
                output: Some(bias),
                inputs: vec![InputChannel(0), InputChannel(1)],
                samples: 0,
            },
        )
        // 10 kΩ device behind a 1e4 V/A transimpedance amplifier
        .with_response(
            InputChannel(0),
            Response::Linear {
                source: Some(bias),
                slope: 1.0,
                offset: 0.0,
            },
        )
        .with_response(
            InputChannel(1),
            Response::Linear {
                source: Some(bias),
                slope: 1.0,
                offset: 0.0,
            },
        );
    let thermostat = SimulatedThermostat::new(290.0);
    let heater_source = SimulatedSource::new("heater source");
    let instruments = Instruments::default()
        .with_temperature(thermostat.clone())
        .with_lockin(SimulatedSource::new("lock-in"))
        .with_heater_source(heater_source.clone());

    // -------------------------------------------------------------------------
    // 3. Run
    // -------------------------------------------------------------------------
    println!("\n3. Running sweep...");

    let mut orchestrator = SweepOrchestrator::new(config.clone(), &mut daq, instruments)
        .context("building orchestrator")?;
    let envelope = orchestrator.run().context("sweep failed")?;
    println!("   Final state: {}", orchestrator.state());
    println!("   Phases entered: {}", orchestrator.history().len());
    drop(orchestrator);

    println!("   Status: {:?}", envelope.status());
    println!(
        "   Completed slots: {}/{}",
        envelope.record().completed_slots(),
        plan.axes.slot_count()
    );
    println!("   Stage temperature at end: {:.3} K", thermostat.stage());
    println!("   Bias at rest: {:.4} V", daq.output_volts(bias));
    println!(
        "   Heater source input switched {} times, now {}",
        heater_source.input_switches(),
        if heater_source.input_enabled() { "driven" } else { "floating" }
    );

    // -------------------------------------------------------------------------
    // 4. Reload and summarize
    // -------------------------------------------------------------------------
    println!("\n4. Reloading checkpoint...");

    let store = RecordStore::new(&config.output_path);
    let reloaded = store.recover().context("recovering checkpoint")?;
    for (index, slot) in reloaded.record().iter() {
        let coordinates = reloaded.record().coordinates(index);
        let (Some(current), Some(voltage)) = (slot.acquired("current"), slot.acquired("voltage"))
        else {
            continue;
        };
        let peak = voltage
            .iter()
            .zip(current)
            .max_by(|a, b| a.0.total_cmp(b.0))
            .map(|(&v, &i)| (v, i));
        if let Some((v, i)) = peak {
            println!(
                "   T={:>5.1} K  Ih={:.0e} A  Vg={:>+5.2} V  peak {:.3} V → {:.3e} A  (R ≈ {:.0} Ω)",
                coordinates.temperature.unwrap_or(f64::NAN),
                coordinates.heater_current.unwrap_or(f64::NAN),
                coordinates.gate_voltage.unwrap_or(f64::NAN),
                v,
                i,
                v / i
            );
        }
    }

    if let Some(export) = &config.export_traces {
        let bytes = std::fs::metadata(export)
            .with_context(|| format!("reading {}", export.display()))?
            .len();
        println!("\n   Traces exported to {} ({bytes} bytes)", export.display());
    }

    println!("\n=== Done ===");
    Ok(())
}
