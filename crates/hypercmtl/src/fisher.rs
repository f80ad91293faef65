//! Fisher-weighted parameter anchoring
//!
//! At a task boundary every trainable parameter is frozen as an anchor and
//! paired with a diagonal importance estimate (mean squared NLL gradient over
//! a capped number of batches). Later tasks pay
//!
//! ```text
//! penalty = Σ_i F_i · (θ_i − θ*_i)²
//! ```
//!
//! which the trainer scales by `ewc_lambda`. Each boundary replaces the
//! previous pairs; there is no per-task accumulation.

use crate::data::Batch;
use crate::error::{HyperCmtlError, Result};
use crate::loss::cross_entropy;
use crate::model::TaskModel;
use crate::tensor::{Gradients, ParameterSource, TensorMap};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Importance score and anchor value of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchoredParameter {
    /// Non-negative per-element importance
    pub importance: ArrayD<f32>,
    /// Value frozen at the boundary
    pub anchor: ArrayD<f32>,
}

/// Summary of an importance estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FisherStats {
    /// Number of named parameters
    pub num_parameters: usize,
    /// Number of scalars
    pub num_elements: usize,
    /// Mean importance over all scalars
    pub mean_importance: f32,
    /// Largest importance
    pub max_importance: f32,
    /// Batches the estimate was averaged over
    pub batches_used: usize,
}

/// Paired importance/anchor maps from one task boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FisherDiagonal {
    entries: BTreeMap<String, AnchoredParameter>,
    task_id: usize,
    batches_used: usize,
}

impl FisherDiagonal {
    /// Pair importance scores with anchors.
    ///
    /// # Errors
    /// Fails unless both maps name exactly the same parameters with equal shapes.
    pub fn from_parts(importance: TensorMap, anchors: TensorMap, task_id: usize, batches_used: usize) -> Result<Self> {
        if importance.len() != anchors.len() {
            return Err(HyperCmtlError::invalid_input(format!(
                "{} importance entries for {} anchors",
                importance.len(),
                anchors.len()
            )));
        }
        let mut anchors = anchors;
        let mut entries = BTreeMap::new();
        for (name, fisher) in importance {
            let anchor = anchors
                .remove(&name)
                .ok_or_else(|| HyperCmtlError::invalid_input(format!("no anchor for '{}'", name)))?;
            if anchor.shape() != fisher.shape() {
                return Err(HyperCmtlError::shape_mismatch(name, anchor.shape(), fisher.shape()));
            }
            if fisher.iter().any(|&f| f < 0.0 || !f.is_finite()) {
                return Err(HyperCmtlError::numerical(format!(
                    "importance of '{}' must be finite and non-negative",
                    name
                )));
            }
            entries.insert(
                name,
                AnchoredParameter {
                    importance: fisher,
                    anchor,
                },
            );
        }
        Ok(Self {
            entries,
            task_id,
            batches_used,
        })
    }

    /// Task whose boundary produced this estimate
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// Number of named parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no parameter is anchored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Importance and anchor of one parameter
    pub fn get(&self, name: &str) -> Option<&AnchoredParameter> {
        self.entries.get(name)
    }

    /// Anchored names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `Σ F · (θ − θ*)²` over parameters present in both `params` and the maps
    pub fn penalty<P: ParameterSource + ?Sized>(&self, params: &P) -> f32 {
        let mut total = 0.0f32;
        params.visit_parameters(&mut |name, value| {
            let Some(entry) = self.entries.get(name) else {
                return;
            };
            if entry.anchor.shape() != value.shape() {
                debug!(name, "skipping anchored parameter with changed shape");
                return;
            }
            total += value
                .iter()
                .zip(entry.anchor.iter())
                .zip(entry.importance.iter())
                .map(|((&theta, &anchor), &f)| {
                    let diff = theta - anchor;
                    f * diff * diff
                })
                .sum::<f32>();
        });
        total
    }

    /// Gradient of [`FisherDiagonal::penalty`]: `2 · F · (θ − θ*)`
    pub fn gradient<P: ParameterSource + ?Sized>(&self, params: &P) -> Gradients {
        let mut grads = Gradients::new();
        params.visit_parameters(&mut |name, value| {
            let Some(entry) = self.entries.get(name) else {
                return;
            };
            if entry.anchor.shape() != value.shape() {
                return;
            }
            let mut grad = &value - &entry.anchor;
            grad.zip_mut_with(&entry.importance, |g, &f| *g *= 2.0 * f);
            grads.insert(name, grad);
        });
        grads
    }

    /// Summary statistics
    pub fn stats(&self) -> FisherStats {
        let mut num_elements = 0usize;
        let mut sum = 0.0f64;
        let mut max = 0.0f32;
        for entry in self.entries.values() {
            num_elements += entry.importance.len();
            for &f in entry.importance.iter() {
                sum += f as f64;
                max = max.max(f);
            }
        }
        FisherStats {
            num_parameters: self.entries.len(),
            num_elements,
            mean_importance: if num_elements == 0 {
                0.0
            } else {
                (sum / num_elements as f64) as f32
            },
            max_importance: max,
            batches_used: self.batches_used,
        }
    }
}

/// Estimates [`FisherDiagonal`] at task boundaries
#[derive(Debug, Clone, Copy)]
pub struct FisherEstimator {
    max_batches: usize,
}

impl FisherEstimator {
    /// Estimator averaging over at most `max_batches` batches
    pub fn new(max_batches: usize) -> Self {
        Self { max_batches }
    }

    /// Batch cap
    pub fn max_batches(&self) -> usize {
        self.max_batches
    }

    /// Freeze anchors and estimate importance for `task_id`.
    ///
    /// Runs in inference mode and never updates `model`; gradients are
    /// squared into the accumulator and dropped. Every trainable parameter
    /// gets an entry, zero where no sampled batch produced a gradient.
    pub fn estimate<'a, M, I>(&self, model: &M, task_id: usize, batches: I) -> Result<FisherDiagonal>
    where
        M: TaskModel + ?Sized,
        I: IntoIterator<Item = &'a Batch>,
    {
        let anchors = model.named_parameters();
        let mut importance = anchors.zeros_like();
        let mut batches_used = 0usize;

        for batch in batches.into_iter().take(self.max_batches) {
            let (logits, trace) = model.forward_traced(&batch.inputs, task_id, None)?;
            let (_, grad_logits) = cross_entropy(&logits, &batch.labels)?;
            let grads = model.backward(&trace, &grad_logits)?;
            for (name, grad) in grads.iter() {
                if let Some(acc) = importance.get_mut(name) {
                    acc.zip_mut_with(grad, |f, &g| *f += g * g);
                }
            }
            batches_used += 1;
        }

        if batches_used > 0 {
            importance.scale(1.0 / batches_used as f32);
        }

        debug!(task_id, batches_used, "estimated Fisher diagonal");
        FisherDiagonal::from_parts(importance, anchors, task_id, batches_used)
    }
}
