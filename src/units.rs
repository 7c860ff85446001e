//! ADC/DAC code ↔ physical unit conversion
//!
//! Codes are unsigned offset-binary words: code 0 is the bottom of the span
//! and `2^bits` would be the top (the top code is `2^bits - 1`). The default
//! span is ±10 V at 16 bits, i.e. one LSB is `20 / 65536 ≈ 3.05e-4` V.
//!
//! Physical values are derived from the converter voltage by dividing out the
//! front-end gain and, for lock-in outputs, scaling by the configured
//! sensitivity over the lock-in's 10 V full-scale output.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default converter resolution
pub const DEFAULT_BITS: u8 = 16;

/// Lock-in analog output at full sensitivity
pub const LOCKIN_FULL_SCALE_V: f64 = 10.0;

/// Voltage span covered by the converter codes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodeSpan {
    /// Voltage at code 0
    pub min: f64,
    /// Voltage one LSB above the top code
    pub max: f64,
}

impl Default for CodeSpan {
    fn default() -> Self {
        Self::symmetric(10.0)
    }
}

impl CodeSpan {
    /// Symmetric span `[-half_width, +half_width]`.
    #[must_use]
    pub const fn symmetric(half_width: f64) -> Self {
        Self {
            min: -half_width,
            max: half_width,
        }
    }

    /// Width of the span in volts.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Size of one quantization step at `bits` resolution.
    #[must_use]
    pub fn lsb(&self, bits: u8) -> f64 {
        self.width() / full_scale(bits)
    }

    /// Voltage of the top code at `bits` resolution.
    #[must_use]
    pub fn top(&self, bits: u8) -> f64 {
        self.max - self.lsb(bits)
    }

    /// Whether `volts` lies between the bottom and top codes at `bits`
    /// resolution.
    #[must_use]
    pub fn contains(&self, volts: f64, bits: u8) -> bool {
        volts >= self.min && volts <= self.top(bits)
    }
}

#[allow(clippy::cast_precision_loss)]
fn full_scale(bits: u8) -> f64 {
    (1u64 << bits) as f64
}

/// Convert one raw code to volts.
#[must_use]
pub fn code_to_volts(code: u32, bits: u8, span: CodeSpan) -> f64 {
    span.min + f64::from(code) * span.lsb(bits)
}

/// Convert volts to the nearest code, clamped to the representable range.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn volts_to_code(volts: f64, bits: u8, span: CodeSpan) -> u32 {
    let top = full_scale(bits) - 1.0;
    let code = ((volts - span.min) / span.lsb(bits)).round();
    code.clamp(0.0, top) as u32
}

/// Convert a block of raw codes to volts.
#[must_use]
pub fn code_to_physical(codes: &[u32], bits: u8, span: CodeSpan) -> Vec<f64> {
    codes.iter().map(|&c| code_to_volts(c, bits, span)).collect()
}

/// Convert a block of voltages to codes.
#[must_use]
pub fn physical_to_code(values: &[f64], bits: u8, span: CodeSpan) -> Vec<u32> {
    values.iter().map(|&v| volts_to_code(v, bits, span)).collect()
}

/// Input coupling of the signal path feeding a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    /// Direct coupling
    #[default]
    Dc,
    /// Capacitive coupling
    Ac,
}

/// Static per-channel calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Converter resolution
    #[serde(default = "default_bits")]
    pub bits: u8,
    /// Converter voltage span
    #[serde(default)]
    pub span: CodeSpan,
    /// Front-end amplifier gain (volts at the converter per physical unit)
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Lock-in sensitivity; the converter sees `LOCKIN_FULL_SCALE_V` at this value
    #[serde(default)]
    pub sensitivity: Option<f64>,
    /// Signal coupling (recorded with the data)
    #[serde(default)]
    pub coupling: Coupling,
}

const fn default_bits() -> u8 {
    DEFAULT_BITS
}

const fn default_gain() -> f64 {
    1.0
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            bits: DEFAULT_BITS,
            span: CodeSpan::default(),
            gain: 1.0,
            sensitivity: None,
            coupling: Coupling::Dc,
        }
    }
}

impl ChannelCalibration {
    /// Calibration with unity gain at the given resolution and span.
    #[must_use]
    pub fn new(bits: u8, span: CodeSpan) -> Self {
        Self {
            bits,
            span,
            ..Self::default()
        }
    }

    /// Set the front-end gain.
    #[must_use]
    pub const fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Set the lock-in sensitivity.
    #[must_use]
    pub const fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    /// Set the coupling.
    #[must_use]
    pub const fn with_coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = coupling;
        self
    }

    /// Check resolution, span and gain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unusable values.
    pub fn validate(&self) -> Result<()> {
        if !(1..=31).contains(&self.bits) {
            return Err(Error::InvalidConfig(format!(
                "bit resolution must be between 1 and 31, got {}",
                self.bits
            )));
        }
        if !self.span.width().is_finite() || self.span.width() <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "code span must be finite and increasing, got [{}, {}]",
                self.span.min, self.span.max
            )));
        }
        if !self.gain.is_finite() || self.gain == 0.0 {
            return Err(Error::InvalidConfig(format!(
                "gain must be finite and nonzero, got {}",
                self.gain
            )));
        }
        if let Some(s) = self.sensitivity {
            if !s.is_finite() || s <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "sensitivity must be positive, got {s}"
                )));
            }
        }
        Ok(())
    }

    fn scale(&self) -> f64 {
        let lockin = self
            .sensitivity
            .map_or(1.0, |s| s / LOCKIN_FULL_SCALE_V);
        lockin / self.gain
    }

    /// Converter voltage to physical value.
    #[must_use]
    pub fn volts_to_physical(&self, volts: f64) -> f64 {
        volts * self.scale()
    }

    /// Physical value to converter voltage.
    #[must_use]
    pub fn physical_to_volts(&self, physical: f64) -> f64 {
        physical / self.scale()
    }

    /// Raw codes to physical values.
    #[must_use]
    pub fn to_physical(&self, codes: &[u32]) -> Vec<f64> {
        codes
            .iter()
            .map(|&c| self.volts_to_physical(code_to_volts(c, self.bits, self.span)))
            .collect()
    }

    /// Physical values to raw codes.
    #[must_use]
    pub fn to_codes(&self, values: &[f64]) -> Vec<u32> {
        values
            .iter()
            .map(|&v| volts_to_code(self.physical_to_volts(v), self.bits, self.span))
            .collect()
    }

    /// Whether `physical` maps onto a code without clamping.
    #[must_use]
    pub fn contains(&self, physical: f64) -> bool {
        self.span.contains(self.physical_to_volts(physical), self.bits)
    }

    /// One quantization step expressed in physical units.
    #[must_use]
    pub fn physical_lsb(&self) -> f64 {
        (self.span.lsb(self.bits) * self.scale()).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_span_lsb() {
        let span = CodeSpan::default();
        assert!((span.lsb(16) - 20.0 / 65536.0).abs() < 1e-15);
    }

    #[test]
    fn test_code_endpoints() {
        let span = CodeSpan::default();
        assert!((code_to_volts(0, 16, span) + 10.0).abs() < 1e-12);
        assert!((code_to_volts(32768, 16, span)).abs() < 1e-12);
        assert_eq!(volts_to_code(0.0, 16, span), 32768);
        assert_eq!(volts_to_code(-10.0, 16, span), 0);
    }

    #[test]
    fn test_out_of_span_clamps() {
        let span = CodeSpan::default();
        assert_eq!(volts_to_code(25.0, 16, span), 65535);
        assert_eq!(volts_to_code(-25.0, 16, span), 0);
    }

    #[test]
    fn test_span_excludes_full_scale() {
        let span = CodeSpan::default();
        let top = span.top(DEFAULT_BITS);
        assert!((top - (10.0 - 20.0 / 65536.0)).abs() < 1e-12);
        assert!(span.contains(-10.0, DEFAULT_BITS));
        assert!(span.contains(top, DEFAULT_BITS));
        assert!(!span.contains(10.0, DEFAULT_BITS));
        assert!(!span.contains(-10.000_001, DEFAULT_BITS));

        let calibration = ChannelCalibration::default();
        assert!(!calibration.contains(10.0));
        assert!(calibration.contains(top));
        assert_eq!(calibration.to_physical(&calibration.to_codes(&[top])), vec![top]);
    }

    #[test]
    fn test_lockin_scaling() {
        // 1 mV sensitivity, preamp gain 100: 10 V at the converter is 10 µV at the sample
        let cal = ChannelCalibration::default()
            .with_gain(100.0)
            .with_sensitivity(1e-3);
        assert!((cal.volts_to_physical(10.0) - 1e-5).abs() < 1e-18);
        assert!((cal.physical_to_volts(1e-5) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_bits() {
        let cal = ChannelCalibration::new(0, CodeSpan::default());
        assert!(matches!(cal.validate(), Err(Error::InvalidConfig(_))));
        let cal = ChannelCalibration::new(32, CodeSpan::default());
        assert!(cal.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_gain() {
        let cal = ChannelCalibration::default().with_gain(0.0);
        assert!(cal.validate().is_err());
    }
}
