//! Learning-rate schedules
//!
//! A schedule yields a multiplier in `[0, 1]` that the optimizer applies to
//! every parameter group's base rate. The trainer resets it at the start of
//! each task and steps it once per epoch.

use crate::error::{HyperCmtlError, Result};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Schedule shape
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerType {
    /// Multiplier stays at 1
    #[default]
    Constant,

    /// `gamma^(epoch / step_size)`
    StepDecay {
        /// Epochs between decays
        step_size: usize,
        /// Decay factor
        gamma: f32,
    },

    /// `gamma^epoch`
    Exponential {
        /// Per-epoch decay factor
        gamma: f32,
    },

    /// Cosine from 1 down to `floor` over `t_max` epochs, then restart
    CosineAnnealing {
        /// Period in epochs
        t_max: usize,
        /// Lowest multiplier
        floor: f32,
    },

    /// Linear ramp up over `warmup_epochs`, then linear decay to 0 at `total_epochs`
    WarmupLinear {
        /// Ramp length
        warmup_epochs: usize,
        /// Epoch at which the multiplier reaches 0
        total_epochs: usize,
    },

    /// Multiply by `factor` after `patience` epochs without validation-loss improvement
    ReduceOnPlateau {
        /// Multiplier applied on a plateau
        factor: f32,
        /// Epochs without improvement before reducing
        patience: usize,
        /// Lowest multiplier
        floor: f32,
    },
}

impl SchedulerType {
    /// Reject parameters that would produce a degenerate schedule
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            SchedulerType::Constant => true,
            SchedulerType::StepDecay { step_size, gamma } => *step_size > 0 && *gamma > 0.0 && *gamma <= 1.0,
            SchedulerType::Exponential { gamma } => *gamma > 0.0 && *gamma <= 1.0,
            SchedulerType::CosineAnnealing { t_max, floor } => *t_max > 0 && (0.0..=1.0).contains(floor),
            SchedulerType::WarmupLinear {
                warmup_epochs,
                total_epochs,
            } => warmup_epochs < total_epochs,
            SchedulerType::ReduceOnPlateau { factor, floor, .. } => {
                *factor > 0.0 && *factor < 1.0 && (0.0..=1.0).contains(floor)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(HyperCmtlError::config(format!("invalid scheduler: {:?}", self)))
        }
    }
}

/// Per-task learning-rate multiplier
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    kind: SchedulerType,
    scale: f32,
    epoch: usize,
    best_metric: f32,
    stale_epochs: usize,
}

impl LearningRateScheduler {
    /// Create a schedule starting at multiplier 1
    pub fn new(kind: SchedulerType) -> Self {
        let mut scheduler = Self {
            kind,
            scale: 1.0,
            epoch: 0,
            best_metric: f32::INFINITY,
            stale_epochs: 0,
        };
        scheduler.scale = scheduler.compute_scale();
        scheduler
    }

    /// Current multiplier
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Epochs stepped since the last reset
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Advance one epoch.
    ///
    /// `metric` is the validation loss, used only by `ReduceOnPlateau`.
    /// Returns the new multiplier.
    pub fn step(&mut self, metric: Option<f32>) -> f32 {
        self.epoch += 1;
        match (&self.kind, metric) {
            (SchedulerType::ReduceOnPlateau { factor, patience, floor }, Some(metric)) => {
                if metric < self.best_metric - 1e-8 {
                    self.best_metric = metric;
                    self.stale_epochs = 0;
                } else {
                    self.stale_epochs += 1;
                    if self.stale_epochs >= *patience {
                        self.scale = (self.scale * factor).max(*floor);
                        self.stale_epochs = 0;
                    }
                }
            }
            (SchedulerType::ReduceOnPlateau { .. }, None) => {}
            _ => self.scale = self.compute_scale(),
        }
        self.scale
    }

    /// Back to epoch 0 (start of a new task)
    pub fn reset(&mut self) {
        self.epoch = 0;
        self.best_metric = f32::INFINITY;
        self.stale_epochs = 0;
        self.scale = 1.0;
        self.scale = self.compute_scale();
    }

    fn compute_scale(&self) -> f32 {
        match &self.kind {
            SchedulerType::Constant => 1.0,
            SchedulerType::StepDecay { step_size, gamma } => gamma.powi((self.epoch / (*step_size).max(1)) as i32),
            SchedulerType::Exponential { gamma } => gamma.powi(self.epoch as i32),
            SchedulerType::CosineAnnealing { t_max, floor } => {
                let t_max = (*t_max).max(1);
                let phase = (self.epoch % t_max) as f32 / t_max as f32;
                floor + 0.5 * (1.0 - floor) * (1.0 + (PI * phase).cos())
            }
            SchedulerType::WarmupLinear {
                warmup_epochs,
                total_epochs,
            } => {
                if self.epoch < *warmup_epochs {
                    (self.epoch + 1) as f32 / *warmup_epochs as f32
                } else if self.epoch < *total_epochs {
                    let decay_span = (*total_epochs - *warmup_epochs).max(1);
                    (*total_epochs - self.epoch) as f32 / decay_span as f32
                } else {
                    0.0
                }
            }
            SchedulerType::ReduceOnPlateau { .. } => self.scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant() {
        let mut s = LearningRateScheduler::new(SchedulerType::Constant);
        for _ in 0..5 {
            assert_relative_eq!(s.step(None), 1.0);
        }
    }

    #[test]
    fn test_step_decay() {
        let mut s = LearningRateScheduler::new(SchedulerType::StepDecay { step_size: 2, gamma: 0.5 });
        assert_relative_eq!(s.scale(), 1.0);
        assert_relative_eq!(s.step(None), 1.0);
        assert_relative_eq!(s.step(None), 0.5);
        assert_relative_eq!(s.step(None), 0.5);
        assert_relative_eq!(s.step(None), 0.25);
    }

    #[test]
    fn test_cosine_reaches_floor_region_then_restarts() {
        let mut s = LearningRateScheduler::new(SchedulerType::CosineAnnealing { t_max: 4, floor: 0.1 });
        assert_relative_eq!(s.step(None), 0.1 + 0.45 * (1.0 + (PI / 4.0).cos()), epsilon = 1e-6);
        s.step(None);
        assert_relative_eq!(s.step(None), 0.1 + 0.45 * (1.0 + (3.0 * PI / 4.0).cos()), epsilon = 1e-6);
        assert_relative_eq!(s.step(None), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_warmup_starts_below_one() {
        let mut s = LearningRateScheduler::new(SchedulerType::WarmupLinear {
            warmup_epochs: 2,
            total_epochs: 4,
        });
        assert_relative_eq!(s.scale(), 0.5);
        assert_relative_eq!(s.step(None), 1.0);
        assert_relative_eq!(s.step(None), 1.0);
        assert_relative_eq!(s.step(None), 0.5);
        assert_relative_eq!(s.step(None), 0.0);
    }

    #[test]
    fn test_plateau_reduces_and_respects_floor() {
        let mut s = LearningRateScheduler::new(SchedulerType::ReduceOnPlateau {
            factor: 0.5,
            patience: 2,
            floor: 0.2,
        });
        s.step(Some(1.0));
        s.step(Some(1.1));
        assert_relative_eq!(s.step(Some(1.2)), 0.5);
        for _ in 0..10 {
            s.step(Some(2.0));
        }
        assert_relative_eq!(s.scale(), 0.2);
    }

    #[test]
    fn test_reset_restores_start() {
        let mut s = LearningRateScheduler::new(SchedulerType::Exponential { gamma: 0.9 });
        for _ in 0..3 {
            s.step(None);
        }
        assert!(s.scale() < 1.0);
        s.reset();
        assert_eq!(s.epoch(), 0);
        assert_relative_eq!(s.scale(), 1.0);
    }

    #[test]
    fn test_validate() {
        assert!(SchedulerType::StepDecay { step_size: 0, gamma: 0.5 }.validate().is_err());
        assert!(SchedulerType::Exponential { gamma: 1.5 }.validate().is_err());
        assert!(SchedulerType::CosineAnnealing { t_max: 3, floor: 0.0 }.validate().is_ok());
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_string(&SchedulerType::Exponential { gamma: 0.9 }).unwrap();
        assert!(json.contains("\"type\":\"exponential\""));
        let back: SchedulerType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SchedulerType::Exponential { gamma: 0.9 });
    }
}
