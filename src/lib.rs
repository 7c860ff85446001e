//! # labsweep: Sweep-and-Acquire Control for Electrical Characterization
//!
//! **Version**: 0.1.0
//!
//! labsweep drives laboratory instruments through temperature-stepped
//! electrical and thermoelectric characterization sweeps: it ramps outputs
//! along planned trajectories, drains hardware-buffered acquisitions,
//! converts raw converter codes to physical units and checkpoints a typed
//! result record crash-safely after every acquisition.
//!
//! ## Design Principles
//!
//! - **Monotonic transitions**: outputs only move through bounded ramps
//! - **At most one active sweep**: a busy firmware process is never restarted
//! - **Durable checkpoints**: an interrupted sweep loses at most one acquisition
//! - **Fail before I/O**: every trajectory is planned before hardware is touched
//!
//! ## Example Usage
//!
//! ```rust
//! use labsweep::plan::{plan, SweepMode, SweepSpec};
//!
//! // Bias sweep 0 → 1 V → 0 in 0.25 V steps
//! let spec = SweepSpec::linear(0.0, 1.0, 5).mode(SweepMode::ForwardBackward);
//! let trajectory = plan(&spec)?;
//! assert_eq!(trajectory.len(), spec.len());
//! assert_eq!(trajectory, vec![0.0, 0.25, 0.5, 0.75, 1.0, 0.75, 0.5, 0.25, 0.0]);
//! # Ok::<(), labsweep::Error>(())
//! ```
//!
//! A full run is driven by [`orchestrator::SweepOrchestrator`] from a
//! [`config::SweepConfig`]; see `demos/simulated_sweep.rs`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod acquisition;
pub mod cancel;
pub mod config;
pub mod error;
pub mod hardware;
pub mod orchestrator;
pub mod plan;
pub mod ramp;
pub mod record;
pub mod thermal;
pub mod units;

pub use acquisition::{AcquisitionSession, ChannelSpec};
pub use cancel::CancellationToken;
pub use config::SweepConfig;
pub use error::{Error, Result};
pub use orchestrator::{Instruments, SweepOrchestrator, SweepState};
pub use plan::{plan, SweepSpec};
pub use ramp::RampController;
pub use record::{ExperimentEnvelope, RecordStore, ResultRecord, RunStatus};
pub use thermal::ThermalWait;
