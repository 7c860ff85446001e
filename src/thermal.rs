//! Fixed-duration thermal waits
//!
//! Thermalization and annealing both wait the full configured duration while
//! logging thermometer readings at a fixed cadence; they never end early on
//! apparent convergence. Readings land in arrays pre-sized to
//! `ceil(duration / sample_period)` and the unused tail is trimmed afterwards.
//!
//! A failed read is skipped and logged; more than `max_read_retries`
//! consecutive failures abort the wait. The elapsed-time budget keeps running
//! through failures.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::{Error, Result};

/// Readings logged during one thermal wait.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThermalTrace {
    /// Commanded setpoint
    pub setpoint: f64,
    /// Thermometer names, one per reading column
    pub channels: Vec<String>,
    /// Seconds since the start of the wait
    pub time: Vec<f64>,
    /// `readings[channel][sample]`
    pub readings: Vec<Vec<f64>>,
    /// Reads that failed and were skipped
    pub failed_reads: u32,
}

impl ThermalTrace {
    /// Number of samples taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Whether no sample was taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Readings of one thermometer.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.readings.get(i))
            .map(Vec::as_slice)
    }

    /// Last reading of one thermometer.
    #[must_use]
    pub fn last(&self, name: &str) -> Option<f64> {
        self.channel(name).and_then(|r| r.last().copied())
    }
}

/// Fixed-duration sampling wait.
#[derive(Debug, Clone)]
pub struct ThermalWait {
    duration: Duration,
    sample_period: Duration,
    max_read_retries: u32,
    cancel: CancellationToken,
}

impl ThermalWait {
    /// Wait of `duration`, sampling every `sample_period`, aborting on the
    /// first failed read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero sample period.
    pub fn new(duration: Duration, sample_period: Duration) -> Result<Self> {
        if sample_period.is_zero() {
            return Err(Error::InvalidConfig(
                "thermal sample period must be nonzero".to_string(),
            ));
        }
        Ok(Self {
            duration,
            sample_period,
            max_read_retries: 0,
            cancel: CancellationToken::new(),
        })
    }

    /// Tolerate up to `retries` consecutive failed reads.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.max_read_retries = retries;
        self
    }

    /// Observe `cancel` at every cadence sleep.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upper bound on the number of samples.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn capacity(&self) -> usize {
        let ratio = self.duration.as_secs_f64() / self.sample_period.as_secs_f64();
        (ratio.ceil() as usize).max(1)
    }

    /// Sample `read` for the full duration.
    ///
    /// `read` returns one value per entry of `channels`.
    ///
    /// # Errors
    ///
    /// - [`Error::ThermalWaitIo`]: too many consecutive failed reads
    /// - [`Error::Cancelled`]: cancelled during the wait
    pub fn wait<F>(&self, channels: &[String], setpoint: f64, mut read: F) -> Result<ThermalTrace>
    where
        F: FnMut() -> Result<Vec<f64>>,
    {
        let capacity = self.capacity();
        let mut time = vec![0.0; capacity];
        let mut readings = vec![vec![0.0; capacity]; channels.len()];
        let mut taken = 0;
        let mut consecutive_failures = 0u32;
        let mut failed_reads = 0u32;

        info!(setpoint, duration = ?self.duration, "thermal wait started");
        let start = Instant::now();
        let mut tick: u32 = 0;
        loop {
            self.cancel.check()?;
            let elapsed = start.elapsed();
            if elapsed >= self.duration {
                break;
            }

            if taken < capacity {
                let outcome = read().and_then(|values| {
                    if values.len() == channels.len() {
                        Ok(values)
                    } else {
                        Err(Error::InvalidInput(format!(
                            "expected {} thermometer readings, got {}",
                            channels.len(),
                            values.len()
                        )))
                    }
                });
                match outcome {
                    Ok(values) => {
                        time[taken] = elapsed.as_secs_f64();
                        for (column, value) in readings.iter_mut().zip(values) {
                            column[taken] = value;
                        }
                        taken += 1;
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        failed_reads += 1;
                        if consecutive_failures > self.max_read_retries {
                            return Err(Error::ThermalWaitIo {
                                attempts: consecutive_failures,
                                message: e.to_string(),
                            });
                        }
                        warn!(
                            error = %e,
                            consecutive_failures,
                            "temperature read failed, retrying at next sample"
                        );
                    }
                }
            }

            tick += 1;
            let next = (self.sample_period * tick).min(self.duration);
            self.cancel.sleep(next.saturating_sub(start.elapsed()))?;
        }

        time.truncate(taken);
        for column in &mut readings {
            column.truncate(taken);
        }
        debug!(samples = taken, failed_reads, "thermal wait finished");
        Ok(ThermalTrace {
            setpoint,
            channels: channels.to_vec(),
            time,
            readings,
            failed_reads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["stage".to_string(), "shield".to_string()]
    }

    #[test]
    fn test_capacity_rounds_up() {
        let wait = ThermalWait::new(Duration::from_millis(100), Duration::from_millis(30)).unwrap();
        assert_eq!(wait.capacity(), 4);
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(ThermalWait::new(Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[test]
    fn test_waits_full_duration_and_trims() {
        let wait = ThermalWait::new(Duration::from_millis(60), Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        let trace = wait.wait(&names(), 4.2, || Ok(vec![4.2, 40.0])).unwrap();

        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(!trace.is_empty());
        assert!(trace.len() <= wait.capacity());
        assert_eq!(trace.readings[0].len(), trace.len());
        assert_eq!(trace.time[0], trace.time[0].min(0.005));
        assert!(trace.time.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(trace.last("shield"), Some(40.0));
    }

    #[test]
    fn test_first_failure_aborts_without_retries() {
        let wait = ThermalWait::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap();
        let err = wait
            .wait(&names(), 4.2, || Err(Error::instrument("thermometer", "timeout")))
            .unwrap_err();
        assert!(matches!(err, Error::ThermalWaitIo { attempts: 1, .. }));
    }

    #[test]
    fn test_retries_skip_failed_reads() {
        let wait = ThermalWait::new(Duration::from_millis(60), Duration::from_millis(10))
            .unwrap()
            .with_retries(2);
        let mut calls = 0;
        let trace = wait
            .wait(&names(), 10.0, || {
                calls += 1;
                if calls % 2 == 0 {
                    Err(Error::instrument("thermometer", "timeout"))
                } else {
                    Ok(vec![10.0, 12.0])
                }
            })
            .unwrap();
        assert!(trace.failed_reads >= 1);
        assert!(!trace.is_empty());
    }

    #[test]
    fn test_wrong_reading_count_is_a_failed_read() {
        let wait = ThermalWait::new(Duration::from_millis(30), Duration::from_millis(10)).unwrap();
        let err = wait.wait(&names(), 1.0, || Ok(vec![1.0])).unwrap_err();
        assert!(matches!(err, Error::ThermalWaitIo { .. }));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let wait = ThermalWait::new(Duration::from_secs(10), Duration::from_millis(10))
            .unwrap()
            .with_cancel(cancel.clone());
        let mut reads = 0;
        let err = wait
            .wait(&names(), 1.0, || {
                reads += 1;
                if reads == 3 {
                    cancel.cancel();
                }
                Ok(vec![1.0, 1.0])
            })
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
