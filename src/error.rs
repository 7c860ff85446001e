//! Error types for labsweep
//!
//! Every failure propagates to the orchestrator, which reports it to the
//! operator, checkpoints what was truly acquired and ramps outputs to rest.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::hardware::{OutputChannel, ProcessId};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// labsweep error types
#[derive(Error, Debug)]
pub enum Error {
    /// Bad trajectory parameters (always detected before hardware I/O)
    #[error("Invalid sweep specification: {0}")]
    InvalidSweepSpec(String),

    /// Hardware did not confirm ramp completion in time
    #[error(
        "Ramp of output {channel} not confirmed within {timeout:?}\n\
         Output left at last confirmed value {last_confirmed:?}"
    )]
    RampTimeout {
        /// Output channel being ramped
        channel: OutputChannel,
        /// Timeout that elapsed
        timeout: Duration,
        /// Last value confirmed on the channel, if any
        last_confirmed: Option<f64>,
    },

    /// Sample counter behaved inconsistently or the process failed to run
    #[error("Acquisition fault on process {process}: {reason}")]
    AcquisitionFault {
        /// Hardware process identifier
        process: ProcessId,
        /// What went wrong
        reason: String,
    },

    /// Temperature reads failed more often than the retry policy allows
    #[error("Thermal wait aborted after {attempts} consecutive failed reads: {message}")]
    ThermalWaitIo {
        /// Consecutive failed reads, including the aborting one
        attempts: u32,
        /// Last read failure
        message: String,
    },

    /// Checkpoint rename/write failed
    #[error("Persistence failed for {}: {source}", .path.display())]
    Persistence {
        /// File being written or rotated
        path: PathBuf,
        /// Underlying IO failure
        #[source]
        source: std::io::Error,
    },

    /// A hardware sweep process is already active
    #[error("Sweep process {0} is already running (at most one active sweep)")]
    SweepBusy(ProcessId),

    /// Operator requested cancellation
    #[error("Sweep cancelled by operator")]
    Cancelled,

    /// Structural configuration problem
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid argument to a library call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Instrument driver failure
    #[error("Instrument error ({instrument}): {message}")]
    Instrument {
        /// Instrument name
        instrument: String,
        /// Driver message
        message: String,
    },

    /// Envelope or configuration (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error (trace export)
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error (trace export)
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl Error {
    /// Build an [`Error::Instrument`] from a driver name and message.
    pub fn instrument(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instrument {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    /// Build an [`Error::AcquisitionFault`].
    pub fn acquisition_fault(process: ProcessId, reason: impl Into<String>) -> Self {
        Self::AcquisitionFault {
            process,
            reason: reason.into(),
        }
    }

    /// Whether the error came from an operator cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
