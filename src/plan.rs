//! Setpoint trajectory planning
//!
//! A trajectory is fully determined by `(start, stop, points, spacing, mode,
//! cycles)`:
//!
//! | mode              | length of one cycle |
//! |-------------------|---------------------|
//! | `Forward`         | `n`                 |
//! | `ForwardBackward` | `2n - 1`            |
//! | `Loop`            | `4n - 3`            |
//!
//! Each additional cycle appends the sequence without its first point, so a
//! trajectory of one-cycle length `L` has `L + (cycles - 1) * (L - 1)` points.
//! A loop passes through both polarities symmetrically and must start at 0.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound on the length of a planned trajectory
pub const MAX_TRAJECTORY_POINTS: usize = 10_000_000;

/// Spacing of the base sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Spacing {
    /// Evenly spaced values
    #[default]
    Linear,
    /// Evenly spaced in log10 space
    Log,
}

/// Shape of the trajectory built from the base sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepMode {
    /// `start → stop`
    #[default]
    Forward,
    /// `start → stop → start`
    ForwardBackward,
    /// `0 → stop → 0 → -stop → 0`; `start` must be 0
    Loop,
}

/// Trajectory parameters for one controlled output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// First value
    pub start: f64,
    /// Turning value
    pub stop: f64,
    /// Points in the base sequence, endpoints included
    pub points: usize,
    /// Base sequence spacing
    #[serde(default)]
    pub spacing: Spacing,
    /// Trajectory shape
    #[serde(default)]
    pub mode: SweepMode,
    /// Number of repetitions
    #[serde(default = "default_cycles")]
    pub cycles: usize,
}

const fn default_cycles() -> usize {
    1
}

impl SweepSpec {
    /// Single-cycle forward linear sweep.
    #[must_use]
    pub const fn linear(start: f64, stop: f64, points: usize) -> Self {
        Self {
            start,
            stop,
            points,
            spacing: Spacing::Linear,
            mode: SweepMode::Forward,
            cycles: 1,
        }
    }

    /// Set the spacing.
    #[must_use]
    pub const fn spacing(mut self, spacing: Spacing) -> Self {
        self.spacing = spacing;
        self
    }

    /// Set the mode.
    #[must_use]
    pub const fn mode(mut self, mode: SweepMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the cycle count.
    #[must_use]
    pub const fn cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    /// Closed-form trajectory length (valid specs only; saturates at
    /// `usize::MAX` otherwise).
    #[must_use]
    pub const fn len(&self) -> usize {
        match self.checked_len() {
            Some(len) => len,
            None => usize::MAX,
        }
    }

    /// Closed-form trajectory length, `None` on overflow.
    #[must_use]
    pub const fn checked_len(&self) -> Option<usize> {
        let n = self.points;
        let one = match self.mode {
            SweepMode::Forward => Some(n),
            SweepMode::ForwardBackward => n.checked_mul(2),
            SweepMode::Loop => n.checked_mul(4),
        };
        let one = match one {
            Some(one) => match self.mode {
                SweepMode::Forward => one,
                SweepMode::ForwardBackward => one.saturating_sub(1),
                SweepMode::Loop => one.saturating_sub(3),
            },
            None => return None,
        };
        match self.cycles.saturating_sub(1).checked_mul(one.saturating_sub(1)) {
            Some(tail) => one.checked_add(tail),
            None => None,
        }
    }

    /// Whether the trajectory is empty (never true for a valid spec).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Check the parameters without building the trajectory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSweepSpec`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.points < 1 {
            return Err(Error::InvalidSweepSpec(
                "sweep needs at least one point".to_string(),
            ));
        }
        if self.cycles < 1 {
            return Err(Error::InvalidSweepSpec(
                "cycle count must be at least 1".to_string(),
            ));
        }
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(Error::InvalidSweepSpec(format!(
                "sweep bounds must be finite, got {} → {}",
                self.start, self.stop
            )));
        }
        if self.mode != SweepMode::Forward && self.points < 2 {
            return Err(Error::InvalidSweepSpec(format!(
                "{:?} sweep with {} point collapses to a single point",
                self.mode, self.points
            )));
        }
        if self.mode == SweepMode::Loop && self.start != 0.0 {
            return Err(Error::InvalidSweepSpec(format!(
                "loop sweep must start at 0, got {}",
                self.start
            )));
        }
        match self.checked_len() {
            Some(len) if len <= MAX_TRAJECTORY_POINTS => {}
            _ => {
                return Err(Error::InvalidSweepSpec(format!(
                    "{} points × {} cycles exceeds {MAX_TRAJECTORY_POINTS} setpoints",
                    self.points, self.cycles
                )));
            }
        }
        if self.spacing == Spacing::Log
            && (self.start == 0.0 || self.stop == 0.0 || self.start.signum() != self.stop.signum())
        {
            return Err(Error::InvalidSweepSpec(format!(
                "log spacing needs nonzero bounds of equal sign, got {} → {}",
                self.start, self.stop
            )));
        }
        Ok(())
    }
}

/// Evenly spaced values from `start` to `stop` inclusive.
///
/// The last value is exactly `stop`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn linspace(start: f64, stop: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let last = points - 1;
            let step = (stop - start) / last as f64;
            let mut values: Vec<f64> = (0..last).map(|i| start + step * i as f64).collect();
            values.push(stop);
            values
        }
    }
}

fn logspace(start: f64, stop: f64, points: usize) -> Vec<f64> {
    let sign = start.signum();
    let mut values: Vec<f64> = linspace(start.abs().log10(), stop.abs().log10(), points)
        .into_iter()
        .map(|e| sign * 10f64.powf(e))
        .collect();
    if let Some(first) = values.first_mut() {
        *first = start;
    }
    if let Some(last) = values.last_mut() {
        *last = stop;
    }
    values
}

fn forward_backward(base: &[f64]) -> Vec<f64> {
    let mut out = base.to_vec();
    out.extend(base.iter().rev().skip(1));
    out
}

/// Build the setpoint trajectory for `spec`.
///
/// # Errors
///
/// Returns [`Error::InvalidSweepSpec`] if the parameters are invalid.
///
/// # Example
///
/// ```rust
/// use labsweep::plan::{plan, SweepMode, SweepSpec};
///
/// let spec = SweepSpec::linear(0.0, 1.0, 3).mode(SweepMode::ForwardBackward);
/// assert_eq!(plan(&spec)?, vec![0.0, 0.5, 1.0, 0.5, 0.0]);
/// # Ok::<(), labsweep::Error>(())
/// ```
pub fn plan(spec: &SweepSpec) -> Result<Vec<f64>> {
    spec.validate()?;

    let base = match spec.spacing {
        Spacing::Linear => linspace(spec.start, spec.stop, spec.points),
        Spacing::Log => logspace(spec.start, spec.stop, spec.points),
    };

    let one_cycle = match spec.mode {
        SweepMode::Forward => base,
        SweepMode::ForwardBackward => forward_backward(&base),
        SweepMode::Loop => {
            let mut out = forward_backward(&base);
            let negated: Vec<f64> = base.iter().map(|v| -v).collect();
            // Both halves meet at 0
            out.extend(forward_backward(&negated).into_iter().skip(1));
            out
        }
    };

    let mut trajectory = Vec::with_capacity(spec.len());
    trajectory.extend_from_slice(&one_cycle);
    for _ in 1..spec.cycles {
        trajectory.extend_from_slice(&one_cycle[1..]);
    }
    Ok(trajectory)
}
