//! Output distillation against a frozen snapshot
//!
//! Student and teacher logits are softened with the same temperature `T`; the
//! per-example loss is `T² · KL(student ‖ teacher)` with both distributions
//! clamped away from zero before the log-ratio.

use crate::config::NonFinitePolicy;
use crate::error::{HyperCmtlError, Result};
use crate::loss::softmax;
use ndarray::{Array1, Array2, Axis, Zip};
use tracing::warn;

/// Lower clamp applied to probabilities before taking logs
pub const PROB_EPSILON: f32 = 1e-10;

/// Lower clamp that leaves NaN untouched so it still surfaces downstream
fn clamp_min(x: f32, eps: f32) -> f32 {
    if x < eps {
        eps
    } else {
        x
    }
}

/// Softmax of `logits / temperature`
pub fn temperature_softmax(logits: &Array2<f32>, temperature: f32) -> Array2<f32> {
    softmax(logits, temperature)
}

/// Row-wise `Σ p · ln(p / q)` with both sides clamped to `≥ eps`
pub fn kl_divergence(p: &Array2<f32>, q: &Array2<f32>, eps: f32) -> Array1<f32> {
    let mut out = Array1::zeros(p.nrows());
    Zip::from(&mut out)
        .and(p.rows())
        .and(q.rows())
        .for_each(|kl, p_row, q_row| {
            *kl = p_row
                .iter()
                .zip(q_row.iter())
                .map(|(&p, &q)| {
                    let p = clamp_min(p, eps);
                    let q = clamp_min(q, eps);
                    p * (p / q).ln()
                })
                .sum();
        });
    out
}

/// Result of one distillation comparison
#[derive(Debug, Clone)]
pub struct DistillationLoss {
    /// `T² · KL` per example
    pub per_example: Array1<f32>,
    /// Batch mean of `per_example`
    pub mean: f32,
    /// Gradient of `mean` w.r.t. the student logits
    pub grad_student: Array2<f32>,
}

/// Computes the temperature-scaled distillation loss
#[derive(Debug, Clone, Copy)]
pub struct DistillationEngine {
    temperature: f32,
    policy: NonFinitePolicy,
}

impl DistillationEngine {
    /// Create an engine
    ///
    /// # Errors
    /// `HyperCmtlError::Config` when `temperature` is not a positive finite number.
    pub fn new(temperature: f32, policy: NonFinitePolicy) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(HyperCmtlError::config(format!(
                "distillation temperature must be positive, got {}",
                temperature
            )));
        }
        Ok(Self { temperature, policy })
    }

    /// Softmax temperature
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Compare student logits with teacher logits on the same batch
    ///
    /// # Arguments
    /// * `student` - Live model logits `[batch, classes]`
    /// * `teacher` - Snapshot logits `[batch, classes]`, treated as constants
    pub fn loss(&self, student: &Array2<f32>, teacher: &Array2<f32>) -> Result<DistillationLoss> {
        if student.dim() != teacher.dim() {
            return Err(HyperCmtlError::shape_mismatch(
                "teacher logits",
                student.shape(),
                teacher.shape(),
            ));
        }
        if student.nrows() == 0 {
            return Err(HyperCmtlError::invalid_input("empty batch"));
        }

        let t = self.temperature;
        let p_student = temperature_softmax(student, t);
        let p_teacher = temperature_softmax(teacher, t);
        let kl = kl_divergence(&p_student, &p_teacher, PROB_EPSILON);
        let per_example = kl.mapv(|v| v * t * t);

        if per_example.iter().any(|v| !v.is_finite()) {
            match self.policy {
                NonFinitePolicy::Warn => {
                    warn!(temperature = t, "non-finite distillation divergence, continuing");
                }
                NonFinitePolicy::Abort => {
                    return Err(HyperCmtlError::numerical("non-finite distillation divergence"));
                }
            }
        }

        let batch = student.nrows() as f32;
        let mean = per_example.sum() / batch;

        // d(T² KL)/d logit_j = T · p_j · (ln(p_j / q_j) − KL)
        let mut grad_student = Array2::zeros(student.raw_dim());
        for (i, mut row) in grad_student.axis_iter_mut(Axis(0)).enumerate() {
            let p = p_student.row(i);
            let q = p_teacher.row(i);
            for j in 0..row.len() {
                let log_ratio = (clamp_min(p[j], PROB_EPSILON) / clamp_min(q[j], PROB_EPSILON)).ln();
                row[j] = t * p[j] * (log_ratio - kl[i]) / batch;
            }
        }

        Ok(DistillationLoss {
            per_example,
            mean,
            grad_student,
        })
    }
}
