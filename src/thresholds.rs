//! User-tunable thresholds, shared between the control surface and the evaluation path.
//!
//! Each value is an independent scalar stored as `f32` bits in an `AtomicU32`. There is no
//! cross-field invariant, so relaxed loads and stores are enough: a write is picked up by the
//! next classification event that reads it.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

pub const DEFAULT_PROBABILITY_THRESHOLD: f32 = 0.75;
pub const DEFAULT_OVERLAP_FACTOR: f32 = 0.50;
pub const DEFAULT_DEVICE_THRESHOLD: f32 = 0.6;

/// Live threshold values.
#[derive(Debug)]
pub struct Thresholds {
    probability_threshold: AtomicF32,
    overlap_factor: AtomicF32,
    device_threshold: AtomicF32,
}

/// A plain copy of all three values, used for reporting and for bulk updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdValues {
    /// Forwarded to the inference engine as a gating hint.
    pub probability_threshold: f32,
    /// Forwarded to the inference engine; controls its windowing cadence.
    pub overlap_factor: f32,
    /// Minimum top confidence required before a command is sent to the device.
    pub device_threshold: f32,
}

impl Default for ThresholdValues {
    fn default() -> Self {
        Self {
            probability_threshold: DEFAULT_PROBABILITY_THRESHOLD,
            overlap_factor: DEFAULT_OVERLAP_FACTOR,
            device_threshold: DEFAULT_DEVICE_THRESHOLD,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_values_unchecked(ThresholdValues::default())
    }
}

impl Thresholds {
    /// Create thresholds from initial values, rejecting anything outside `[0, 1]`.
    pub fn new(values: ThresholdValues) -> Result<Self> {
        validate("probability_threshold", values.probability_threshold)?;
        validate("overlap_factor", values.overlap_factor)?;
        validate("device_threshold", values.device_threshold)?;
        Ok(Self::from_values_unchecked(values))
    }

    fn from_values_unchecked(values: ThresholdValues) -> Self {
        Self {
            probability_threshold: AtomicF32::new(values.probability_threshold),
            overlap_factor: AtomicF32::new(values.overlap_factor),
            device_threshold: AtomicF32::new(values.device_threshold),
        }
    }

    pub fn probability_threshold(&self) -> f32 {
        self.probability_threshold.load()
    }

    pub fn overlap_factor(&self) -> f32 {
        self.overlap_factor.load()
    }

    pub fn device_threshold(&self) -> f32 {
        self.device_threshold.load()
    }

    pub fn set_probability_threshold(&self, value: f32) -> Result<()> {
        validate("probability_threshold", value)?;
        self.probability_threshold.store(value);
        info!(probability_threshold = value, "probability threshold updated");
        Ok(())
    }

    pub fn set_overlap_factor(&self, value: f32) -> Result<()> {
        validate("overlap_factor", value)?;
        self.overlap_factor.store(value);
        info!(overlap_factor = value, "overlap factor updated");
        Ok(())
    }

    pub fn set_device_threshold(&self, value: f32) -> Result<()> {
        validate("device_threshold", value)?;
        self.device_threshold.store(value);
        info!(device_threshold = value, "device threshold updated");
        Ok(())
    }

    /// Validate every value first, then store the ones that changed.
    ///
    /// Nothing is written if any value is invalid.
    pub fn apply(&self, values: ThresholdValues) -> Result<()> {
        validate("probability_threshold", values.probability_threshold)?;
        validate("overlap_factor", values.overlap_factor)?;
        validate("device_threshold", values.device_threshold)?;

        let current = self.values();
        if values.probability_threshold != current.probability_threshold {
            self.set_probability_threshold(values.probability_threshold)?;
        }
        if values.overlap_factor != current.overlap_factor {
            self.set_overlap_factor(values.overlap_factor)?;
        }
        if values.device_threshold != current.device_threshold {
            self.set_device_threshold(values.device_threshold)?;
        }
        Ok(())
    }

    /// Read all three values. Each read is independent; no cross-field atomicity is implied.
    pub fn values(&self) -> ThresholdValues {
        ThresholdValues {
            probability_threshold: self.probability_threshold(),
            overlap_factor: self.overlap_factor(),
            device_threshold: self.device_threshold(),
        }
    }
}

fn validate(name: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidThreshold { name, value })
    }
}

#[derive(Debug)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_bridge() {
        let t = Thresholds::default();
        assert_eq!(t.probability_threshold(), 0.75);
        assert_eq!(t.overlap_factor(), 0.50);
        assert_eq!(t.device_threshold(), 0.6);
    }

    #[test]
    fn updates_are_visible_to_later_reads() -> anyhow::Result<()> {
        let t = Thresholds::default();
        t.set_device_threshold(0.9)?;
        t.set_overlap_factor(0.25)?;
        assert_eq!(t.device_threshold(), 0.9);
        assert_eq!(t.values().overlap_factor, 0.25);
        assert_eq!(t.values().probability_threshold, 0.75);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_and_non_finite_values() {
        let t = Thresholds::default();
        assert!(t.set_device_threshold(1.5).is_err());
        assert!(t.set_probability_threshold(-0.1).is_err());
        assert!(t.set_overlap_factor(f32::NAN).is_err());
        assert_eq!(t.device_threshold(), 0.6);
    }

    #[test]
    fn apply_is_all_or_nothing() -> anyhow::Result<()> {
        let t = Thresholds::default();
        let bad = ThresholdValues {
            device_threshold: 0.9,
            overlap_factor: -1.0,
            ..t.values()
        };
        assert!(t.apply(bad).is_err());
        assert_eq!(t.values(), ThresholdValues::default());

        t.apply(ThresholdValues {
            device_threshold: 0.9,
            ..t.values()
        })?;
        assert_eq!(t.device_threshold(), 0.9);
        Ok(())
    }

    #[test]
    fn new_validates_every_field() {
        let err = Thresholds::new(ThresholdValues {
            overlap_factor: 2.0,
            ..ThresholdValues::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("overlap_factor"));
    }
}
