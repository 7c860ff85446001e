//! Experiment envelope - the unit written to disk

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResultRecord;

/// Status of a sweep run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Envelope created, no hardware touched yet.
    Pending,
    /// Sweep in progress.
    Running,
    /// Every slot acquired and outputs back at rest.
    Success,
    /// Aborted by an error.
    Failed,
    /// Aborted by the operator.
    Cancelled,
}

impl RunStatus {
    /// Whether the run has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Metadata plus result record of one sweep run.
///
/// Created once per run and checkpointed after every inner-loop
/// acquisition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentEnvelope {
    chip_id: String,
    device_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: RunStatus,
    config: Option<serde_json::Value>,
    record: ResultRecord,
}

impl ExperimentEnvelope {
    /// Pending envelope for `chip_id`/`device_id` around `record`.
    #[must_use]
    pub fn new(
        chip_id: impl Into<String>,
        device_id: impl Into<String>,
        record: ResultRecord,
    ) -> Self {
        Self::builder(chip_id, device_id).record(record).build()
    }

    /// Builder for an envelope with optional fields.
    #[must_use]
    pub fn builder(
        chip_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> ExperimentEnvelopeBuilder {
        ExperimentEnvelopeBuilder::new(chip_id, device_id)
    }

    /// Chip identifier.
    #[must_use]
    pub fn chip_id(&self) -> &str {
        &self.chip_id
    }

    /// Device identifier on the chip.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp of the last modification.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// End timestamp, once the run has ended.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Configuration snapshot.
    #[must_use]
    pub const fn config(&self) -> Option<&serde_json::Value> {
        self.config.as_ref()
    }

    /// Result record.
    #[must_use]
    pub const fn record(&self) -> &ResultRecord {
        &self.record
    }

    /// Mutable result record; bumps `updated_at`.
    pub fn record_mut(&mut self) -> &mut ResultRecord {
        self.touch();
        &mut self.record
    }

    /// Transition Pending → Running.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.touch();
    }

    /// End the run with `status` and stamp the end time.
    pub fn complete(&mut self, status: RunStatus) {
        self.status = status;
        let now = Utc::now();
        self.updated_at = now;
        self.ended_at = Some(now);
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Builder for [`ExperimentEnvelope`].
#[derive(Debug)]
pub struct ExperimentEnvelopeBuilder {
    chip_id: String,
    device_id: String,
    created_at: DateTime<Utc>,
    config: Option<serde_json::Value>,
    record: ResultRecord,
}

impl ExperimentEnvelopeBuilder {
    /// Builder with the required identifiers.
    #[must_use]
    pub fn new(chip_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            chip_id: chip_id.into(),
            device_id: device_id.into(),
            created_at: Utc::now(),
            config: None,
            record: ResultRecord::default(),
        }
    }

    /// Override the creation timestamp.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach a configuration snapshot.
    #[must_use]
    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Attach the result record.
    #[must_use]
    pub fn record(mut self, record: ResultRecord) -> Self {
        self.record = record;
        self
    }

    /// Build a Pending envelope.
    #[must_use]
    pub fn build(self) -> ExperimentEnvelope {
        ExperimentEnvelope {
            chip_id: self.chip_id,
            device_id: self.device_id,
            created_at: self.created_at,
            updated_at: self.created_at,
            ended_at: None,
            status: RunStatus::Pending,
            config: self.config,
            record: self.record,
        }
    }
}
