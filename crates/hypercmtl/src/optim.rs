//! Grouped first-order optimizers over named parameters
//!
//! One [`Optimizer`] serves every parameter group; each group carries its own
//! base learning rate and a shared multiplier set by the scheduler. State is
//! kept per parameter name, and a parameter absent from the gradient map is
//! left untouched: no decay, no moment update, no step count.

use crate::config::OptimizerConfig;
use crate::error::{HyperCmtlError, Result};
use crate::model::ParameterGroup;
use crate::tensor::{Gradients, ParameterSourceMut};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use std::collections::{BTreeMap, BTreeSet};

/// Per-parameter optimizer state
#[derive(Debug, Clone)]
enum ParamState {
    /// SGD momentum buffer
    Sgd { velocity: Option<ArrayD<f32>> },
    /// Adam moments and step count
    Adam {
        m: ArrayD<f32>,
        v: ArrayD<f32>,
        t: i32,
    },
}

/// Optimizer over several parameter groups
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    groups: Vec<ParameterGroup>,
    base_lr: BTreeMap<String, f32>,
    lr_scale: f32,
    state: BTreeMap<String, ParamState>,
}

impl Optimizer {
    /// Create an optimizer
    ///
    /// # Errors
    /// Invalid hyperparameters, or a parameter listed in more than one group.
    pub fn new(config: OptimizerConfig, groups: Vec<ParameterGroup>) -> Result<Self> {
        config.validate()?;
        let mut optimizer = Self {
            config,
            groups: Vec::with_capacity(groups.len()),
            base_lr: BTreeMap::new(),
            lr_scale: 1.0,
            state: BTreeMap::new(),
        };
        for group in groups {
            optimizer.add_group(group)?;
        }
        Ok(optimizer)
    }

    /// Manage a group created after construction, e.g. a newly added task head.
    ///
    /// # Errors
    /// Invalid learning rate, or a parameter that is already managed. On error
    /// the optimizer is unchanged.
    pub fn add_group(&mut self, group: ParameterGroup) -> Result<()> {
        if !group.learning_rate.is_finite() || group.learning_rate < 0.0 {
            return Err(HyperCmtlError::config(format!(
                "learning rate of group '{}' must be non-negative",
                group.name
            )));
        }
        let mut seen = BTreeSet::new();
        for name in &group.parameters {
            if self.base_lr.contains_key(name) || !seen.insert(name.as_str()) {
                return Err(HyperCmtlError::config(format!(
                    "parameter '{}' appears in more than one group",
                    name
                )));
            }
        }
        for name in &group.parameters {
            self.base_lr.insert(name.clone(), group.learning_rate);
        }
        self.groups.push(group);
        Ok(())
    }

    /// Update rule
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Parameter groups
    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    /// Multiplier applied to every group's base rate
    pub fn lr_scale(&self) -> f32 {
        self.lr_scale
    }

    /// Set the multiplier (typically from a scheduler)
    pub fn set_lr_scale(&mut self, scale: f32) {
        self.lr_scale = scale;
    }

    /// Effective learning rate of `name`, if it is managed
    pub fn learning_rate(&self, name: &str) -> Option<f32> {
        self.base_lr.get(name).map(|lr| lr * self.lr_scale)
    }

    /// Apply one update to every managed parameter that has a gradient
    ///
    /// # Returns
    /// Number of parameters updated
    pub fn step<P: ParameterSourceMut + ?Sized>(&mut self, params: &mut P, grads: &Gradients) -> Result<usize> {
        let mut updated = 0usize;
        let mut failure: Option<HyperCmtlError> = None;
        let config = self.config.clone();
        let lr_scale = self.lr_scale;
        let base_lr = &self.base_lr;
        let state = &mut self.state;

        params.visit_parameters_mut(&mut |name, value| {
            if failure.is_some() {
                return;
            }
            let (Some(&lr), Some(grad)) = (base_lr.get(name), grads.get(name)) else {
                return;
            };
            if grad.shape() != value.shape() {
                failure = Some(HyperCmtlError::shape_mismatch(name, value.shape(), grad.shape()));
                return;
            }
            let slot = state.entry(name.to_string()).or_insert_with(|| initial_state(&config, grad));
            apply_update(&config, slot, value, grad.view(), lr * lr_scale);
            updated += 1;
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(updated),
        }
    }
}

fn initial_state(config: &OptimizerConfig, like: &ArrayD<f32>) -> ParamState {
    match config {
        OptimizerConfig::Sgd { .. } => ParamState::Sgd { velocity: None },
        OptimizerConfig::Adam { .. } | OptimizerConfig::AdamW { .. } => ParamState::Adam {
            m: ArrayD::zeros(like.raw_dim()),
            v: ArrayD::zeros(like.raw_dim()),
            t: 0,
        },
    }
}

fn apply_update(
    config: &OptimizerConfig,
    state: &mut ParamState,
    mut param: ArrayViewMutD<'_, f32>,
    grad: ArrayViewD<'_, f32>,
    lr: f32,
) {
    match (config, state) {
        (OptimizerConfig::Sgd { momentum, weight_decay }, ParamState::Sgd { velocity }) => {
            // g' = g + wd·θ ; v = μ·v + g' ; θ -= lr·v
            let mut g = grad.to_owned();
            if *weight_decay > 0.0 {
                g.scaled_add(*weight_decay, &param);
            }
            if *momentum > 0.0 {
                let v = velocity.get_or_insert_with(|| ArrayD::zeros(g.raw_dim()));
                Zip::from(&mut *v).and(&g).for_each(|v, &g| *v = momentum * *v + g);
                param.scaled_add(-lr, &*v);
            } else {
                param.scaled_add(-lr, &g);
            }
        }
        (
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
                weight_decay,
            },
            ParamState::Adam { m, v, t },
        ) => {
            let wd = *weight_decay;
            adam_update(param, grad, lr, (*beta1, *beta2, *epsilon), m, v, t, |g, theta| g + wd * theta, 0.0);
        }
        (
            OptimizerConfig::AdamW {
                beta1,
                beta2,
                epsilon,
                weight_decay,
            },
            ParamState::Adam { m, v, t },
        ) => {
            adam_update(param, grad, lr, (*beta1, *beta2, *epsilon), m, v, t, |g, _| g, *weight_decay);
        }
        // state always matches the config it was created from
        _ => {}
    }
}

/// Bias-corrected Adam step.
///
/// `coupled` folds an L2 term into the gradient (Adam); `decoupled` shrinks
/// the parameter directly by `lr · decoupled · θ` before the update (AdamW).
#[allow(clippy::too_many_arguments)]
fn adam_update(
    mut param: ArrayViewMutD<'_, f32>,
    grad: ArrayViewD<'_, f32>,
    lr: f32,
    (beta1, beta2, epsilon): (f32, f32, f32),
    m: &mut ArrayD<f32>,
    v: &mut ArrayD<f32>,
    t: &mut i32,
    coupled: impl Fn(f32, f32) -> f32,
    decoupled: f32,
) {
    *t += 1;
    let bias1 = 1.0 - beta1.powi(*t);
    let bias2 = 1.0 - beta2.powi(*t);
    let shrink = 1.0 - lr * decoupled;

    Zip::from(&mut param)
        .and(&grad)
        .and(&mut *m)
        .and(&mut *v)
        .for_each(|theta, &g, m, v| {
            let g = coupled(g, *theta);
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *theta = *theta * shrink - lr * m_hat / (v_hat.sqrt() + epsilon);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorMap;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    fn group(names: &[&str], lr: f32) -> ParameterGroup {
        ParameterGroup {
            name: "g".to_string(),
            parameters: names.iter().map(|s| s.to_string()).collect(),
            learning_rate: lr,
        }
    }

    fn params() -> TensorMap {
        let mut p = TensorMap::new();
        p.insert("a", arr1(&[1.0, -1.0]).into_dyn());
        p.insert("b", arr1(&[2.0]).into_dyn());
        p
    }

    #[test]
    fn test_plain_sgd() {
        let config = OptimizerConfig::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
        };
        let mut opt = Optimizer::new(config, vec![group(&["a", "b"], 0.1)]).unwrap();
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("a", arr1(&[1.0, 2.0]).into_dyn());

        assert_eq!(opt.step(&mut p, &g).unwrap(), 1);
        let a = p.get("a").unwrap().as_slice().unwrap();
        assert_relative_eq!(a[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(a[1], -1.2, epsilon = 1e-6);
        assert_eq!(p.get("b").unwrap().as_slice().unwrap()[0], 2.0);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let config = OptimizerConfig::Sgd {
            momentum: 0.5,
            weight_decay: 0.0,
        };
        let mut opt = Optimizer::new(config, vec![group(&["b"], 1.0)]).unwrap();
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("b", arr1(&[1.0]).into_dyn());
        opt.step(&mut p, &g).unwrap();
        opt.step(&mut p, &g).unwrap();
        // 2 − 1 − 1.5
        assert_relative_eq!(p.get("b").unwrap().as_slice().unwrap()[0], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let config = OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let mut opt = Optimizer::new(config, vec![group(&["a"], 0.01)]).unwrap();
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("a", arr1(&[5.0, -0.1]).into_dyn());
        opt.step(&mut p, &g).unwrap();
        let a = p.get("a").unwrap().as_slice().unwrap();
        assert_relative_eq!(a[0], 0.99, epsilon = 1e-5);
        assert_relative_eq!(a[1], -0.99, epsilon = 1e-5);
    }

    #[test]
    fn test_adamw_decay_only_touches_updated_params() {
        let config = OptimizerConfig::AdamW {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.5,
        };
        let mut opt = Optimizer::new(config, vec![group(&["a", "b"], 0.1)]).unwrap();
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("a", arr1(&[0.0, 0.0]).into_dyn());
        opt.step(&mut p, &g).unwrap();
        assert_relative_eq!(p.get("a").unwrap().as_slice().unwrap()[0], 0.95, epsilon = 1e-6);
        assert_eq!(p.get("b").unwrap().as_slice().unwrap()[0], 2.0);
    }

    #[test]
    fn test_lr_scale() {
        let config = OptimizerConfig::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
        };
        let mut opt = Optimizer::new(config, vec![group(&["b"], 1.0)]).unwrap();
        opt.set_lr_scale(0.0);
        assert_eq!(opt.learning_rate("b"), Some(0.0));
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("b", arr1(&[1.0]).into_dyn());
        opt.step(&mut p, &g).unwrap();
        assert_eq!(p.get("b").unwrap().as_slice().unwrap()[0], 2.0);
    }

    #[test]
    fn test_unmanaged_and_mismatched() {
        let mut opt = Optimizer::new(OptimizerConfig::default(), vec![group(&["a"], 0.1)]).unwrap();
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("b", arr1(&[1.0]).into_dyn());
        assert_eq!(opt.step(&mut p, &g).unwrap(), 0);

        g.insert("a", arr1(&[1.0, 2.0, 3.0]).into_dyn());
        assert!(matches!(opt.step(&mut p, &g), Err(HyperCmtlError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let groups = vec![group(&["a"], 0.1), group(&["a"], 0.2)];
        assert!(Optimizer::new(OptimizerConfig::default(), groups).is_err());
        assert!(Optimizer::new(OptimizerConfig::default(), vec![group(&["a", "a"], 0.1)]).is_err());
    }

    #[test]
    fn test_added_group_is_updated() {
        let config = OptimizerConfig::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
        };
        let mut opt = Optimizer::new(config, vec![group(&["a"], 0.1)]).unwrap();
        let mut p = params();
        let mut g = TensorMap::new();
        g.insert("b", arr1(&[1.0]).into_dyn());
        assert_eq!(opt.step(&mut p, &g).unwrap(), 0);

        opt.add_group(group(&["b"], 0.5)).unwrap();
        assert_eq!(opt.groups().len(), 2);
        assert_eq!(opt.learning_rate("b"), Some(0.5));
        assert_eq!(opt.step(&mut p, &g).unwrap(), 1);
        assert_relative_eq!(p.get("b").unwrap().as_slice().unwrap()[0], 1.5, epsilon = 1e-6);

        assert!(opt.add_group(group(&["b", "c"], 0.1)).is_err());
        assert_eq!(opt.learning_rate("c"), None);
        assert!(opt.add_group(group(&["c"], -1.0)).is_err());
    }
}
