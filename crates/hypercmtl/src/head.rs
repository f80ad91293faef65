//! Functional task head
//!
//! A two-stage classifier (projection → ReLU → dropout → classifier) that owns
//! no trainable weights. Parameters are supplied on every call; absent entries
//! fall back to fixed, conventionally initialised defaults.

use crate::error::{HyperCmtlError, Result};
use crate::hypernet::TargetSpec;
use crate::layer::{affine, affine_backward, Activation, Dropout, Linear};
use crate::tensor::{as_matrix, Gradients, TensorMap};
use ndarray::{Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Ix1};
use rand::Rng;

/// Projection stage weight `[hidden, in]`
pub const PROJECTION_WEIGHT: &str = "projection.weight";
/// Projection stage bias `[hidden]`
pub const PROJECTION_BIAS: &str = "projection.bias";
/// Classifier stage weight `[classes, hidden]`
pub const CLASSIFIER_WEIGHT: &str = "classifier.weight";
/// Classifier stage bias `[classes]`
pub const CLASSIFIER_BIAS: &str = "classifier.bias";

/// Shape contract of the functional head
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadSchema {
    /// Width of the backbone features
    pub input_features: usize,
    /// Width of the projection stage
    pub hidden: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Dropout probability after the projection nonlinearity
    pub dropout: f32,
}

impl HeadSchema {
    /// Every named tensor the head consumes, with its consumer fan-in
    pub fn targets(&self) -> Vec<TargetSpec> {
        vec![
            TargetSpec::new(PROJECTION_WEIGHT, &[self.hidden, self.input_features], self.input_features),
            TargetSpec::new(PROJECTION_BIAS, &[self.hidden], self.input_features),
            TargetSpec::new(CLASSIFIER_WEIGHT, &[self.num_classes, self.hidden], self.hidden),
            TargetSpec::new(CLASSIFIER_BIAS, &[self.num_classes], self.hidden),
        ]
    }

    /// Expected shape of a named tensor
    pub fn shape_of(&self, name: &str) -> Option<Vec<usize>> {
        self.targets().into_iter().find(|t| t.name == name).map(|t| t.shape)
    }

    fn validate(&self) -> Result<()> {
        if self.input_features == 0 || self.hidden == 0 || self.num_classes == 0 {
            return Err(HyperCmtlError::config(format!(
                "head dimensions must be positive: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Activations recorded by [`FunctionalHead::forward_traced`]
#[derive(Debug, Clone)]
pub struct HeadTrace {
    features: Array2<f32>,
    pre_activation: Array2<f32>,
    mask: Option<Array2<f32>>,
    hidden: Array2<f32>,
    projection_weight: Array2<f32>,
    classifier_weight: Array2<f32>,
    supplied: [bool; 4],
}

/// Classifier evaluated against externally supplied parameters
#[derive(Debug, Clone)]
pub struct FunctionalHead {
    schema: HeadSchema,
    dropout: Dropout,
    defaults: TensorMap,
}

struct Resolved<'a> {
    projection_weight: ArrayView2<'a, f32>,
    projection_bias: ArrayView1<'a, f32>,
    classifier_weight: ArrayView2<'a, f32>,
    classifier_bias: ArrayView1<'a, f32>,
    supplied: [bool; 4],
}

impl FunctionalHead {
    /// Create the head and draw its fallback defaults
    pub fn new<R: Rng + ?Sized>(schema: HeadSchema, rng: &mut R) -> Result<Self> {
        schema.validate()?;
        let dropout = Dropout::new(schema.dropout)?;

        let projection = Linear::uniform_fan_in(schema.input_features, schema.hidden, rng);
        let classifier = Linear::uniform_fan_in(schema.hidden, schema.num_classes, rng);
        let mut defaults = TensorMap::new();
        defaults.insert(PROJECTION_WEIGHT, projection.weights().clone().into_dyn());
        defaults.insert(PROJECTION_BIAS, projection.bias().clone().into_dyn());
        defaults.insert(CLASSIFIER_WEIGHT, classifier.weights().clone().into_dyn());
        defaults.insert(CLASSIFIER_BIAS, classifier.bias().clone().into_dyn());

        Ok(Self {
            schema,
            dropout,
            defaults,
        })
    }

    /// Shape contract
    pub fn schema(&self) -> &HeadSchema {
        &self.schema
    }

    /// Fallback values used for absent entries
    pub fn defaults(&self) -> &TensorMap {
        &self.defaults
    }

    fn lookup<'a>(&'a self, params: &'a TensorMap, name: &str) -> Result<(ArrayViewD<'a, f32>, bool)> {
        match params.get(name) {
            Some(tensor) => Ok((tensor.view(), true)),
            None => self
                .defaults
                .get(name)
                .map(|t| (t.view(), false))
                .ok_or_else(|| HyperCmtlError::invalid_input(format!("no default for '{}'", name))),
        }
    }

    fn vector<'a>(name: &str, tensor: ArrayViewD<'a, f32>, len: usize) -> Result<ArrayView1<'a, f32>> {
        if tensor.shape() != [len] {
            return Err(HyperCmtlError::shape_mismatch(name, &[len], tensor.shape()));
        }
        Ok(tensor.into_dimensionality::<Ix1>()?)
    }

    fn resolve<'a>(&'a self, params: &'a TensorMap) -> Result<Resolved<'a>> {
        let s = &self.schema;
        let (pw, pw_supplied) = self.lookup(params, PROJECTION_WEIGHT)?;
        let (pb, pb_supplied) = self.lookup(params, PROJECTION_BIAS)?;
        let (cw, cw_supplied) = self.lookup(params, CLASSIFIER_WEIGHT)?;
        let (cb, cb_supplied) = self.lookup(params, CLASSIFIER_BIAS)?;

        Ok(Resolved {
            projection_weight: as_matrix(PROJECTION_WEIGHT, pw, [s.hidden, s.input_features])?,
            projection_bias: Self::vector(PROJECTION_BIAS, pb, s.hidden)?,
            classifier_weight: as_matrix(CLASSIFIER_WEIGHT, cw, [s.num_classes, s.hidden])?,
            classifier_bias: Self::vector(CLASSIFIER_BIAS, cb, s.num_classes)?,
            supplied: [pw_supplied, pb_supplied, cw_supplied, cb_supplied],
        })
    }

    fn check_features(&self, features: &Array2<f32>) -> Result<()> {
        if features.ncols() != self.schema.input_features {
            return Err(HyperCmtlError::dimension_mismatch(
                self.schema.input_features,
                features.ncols(),
            ));
        }
        Ok(())
    }

    /// Inference-mode forward pass (dropout off)
    ///
    /// # Arguments
    /// * `features` - Backbone features `[batch, input_features]`
    /// * `params` - Parameter set keyed by schema name
    ///
    /// # Returns
    /// Logits `[batch, num_classes]`
    pub fn forward(&self, features: &Array2<f32>, params: &TensorMap) -> Result<Array2<f32>> {
        self.check_features(features)?;
        let p = self.resolve(params)?;
        let pre = affine(&features.view(), &p.projection_weight, &p.projection_bias);
        let hidden = Activation::Relu.apply(&pre);
        Ok(affine(&hidden.view(), &p.classifier_weight, &p.classifier_bias))
    }

    /// Forward pass that records activations for [`FunctionalHead::backward`].
    ///
    /// Passing an RNG selects training mode, where dropout masks are drawn
    /// from it; `None` is inference mode.
    pub fn forward_traced<R: Rng + ?Sized>(
        &self,
        features: &Array2<f32>,
        params: &TensorMap,
        rng: Option<&mut R>,
    ) -> Result<(Array2<f32>, HeadTrace)> {
        self.check_features(features)?;
        let p = self.resolve(params)?;

        let pre = affine(&features.view(), &p.projection_weight, &p.projection_bias);
        let mut hidden = Activation::Relu.apply(&pre);
        let mask = rng.and_then(|rng| self.dropout.sample_mask(hidden.dim(), rng));
        if let Some(mask) = &mask {
            hidden *= mask;
        }
        let logits = affine(&hidden.view(), &p.classifier_weight, &p.classifier_bias);

        let trace = HeadTrace {
            features: features.clone(),
            pre_activation: pre,
            mask,
            hidden,
            projection_weight: p.projection_weight.to_owned(),
            classifier_weight: p.classifier_weight.to_owned(),
            supplied: p.supplied,
        };
        Ok((logits, trace))
    }

    /// Backward pass.
    ///
    /// Returns the gradient w.r.t. the features and gradients for every
    /// supplied parameter. Defaults are constants and get no gradient.
    pub fn backward(&self, trace: &HeadTrace, grad_logits: &Array2<f32>) -> Result<(Array2<f32>, Gradients)> {
        if grad_logits.dim() != (trace.hidden.nrows(), self.schema.num_classes) {
            return Err(HyperCmtlError::shape_mismatch(
                "logits",
                &[trace.hidden.nrows(), self.schema.num_classes],
                grad_logits.shape(),
            ));
        }

        let (grad_hidden, grad_cw, grad_cb) =
            affine_backward(&trace.hidden.view(), &trace.classifier_weight.view(), grad_logits);
        let mut grad_hidden = grad_hidden;
        if let Some(mask) = &trace.mask {
            grad_hidden *= mask;
        }
        let grad_pre = Activation::Relu.backward(&trace.pre_activation, &grad_hidden);
        let (grad_features, grad_pw, grad_pb) =
            affine_backward(&trace.features.view(), &trace.projection_weight.view(), &grad_pre);

        let named: [(&str, ArrayD<f32>); 4] = [
            (PROJECTION_WEIGHT, grad_pw.into_dyn()),
            (PROJECTION_BIAS, grad_pb.into_dyn()),
            (CLASSIFIER_WEIGHT, grad_cw.into_dyn()),
            (CLASSIFIER_BIAS, grad_cb.into_dyn()),
        ];
        let mut grads = Gradients::new();
        for ((name, grad), supplied) in named.into_iter().zip(trace.supplied) {
            if supplied {
                grads.insert(name, grad);
            }
        }
        Ok((grad_features, grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array1, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn schema() -> HeadSchema {
        HeadSchema {
            input_features: 5,
            hidden: 4,
            num_classes: 3,
            dropout: 0.5,
        }
    }

    fn full_params(rng: &mut StdRng) -> TensorMap {
        let head = FunctionalHead::new(schema(), rng).unwrap();
        head.defaults().clone()
    }

    #[test]
    fn test_forward_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let params = full_params(&mut rng);
        let logits = head.forward(&Array2::ones((7, 5)), &params).unwrap();
        assert_eq!(logits.dim(), (7, 3));
    }

    #[test]
    fn test_missing_entry_falls_back_to_default() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let features = Array2::from_elem((2, 5), 0.5);

        let mut partial = head.defaults().clone();
        partial.remove(CLASSIFIER_BIAS);
        let a = head.forward(&features, &partial).unwrap();
        let b = head.forward(&features, &TensorMap::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_shape_mismatch_names_parameter() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let mut params = TensorMap::new();
        params.insert(PROJECTION_WEIGHT, ArrayD::zeros(IxDyn(&[5, 4])));
        match head.forward(&Array2::ones((1, 5)), &params) {
            Err(HyperCmtlError::ShapeMismatch { name, expected, actual }) => {
                assert_eq!(name, PROJECTION_WEIGHT);
                assert_eq!(expected, vec![4, 5]);
                assert_eq!(actual, vec![5, 4]);
            }
            other => panic!("expected shape mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_inference_trace_matches_forward() {
        let mut rng = StdRng::seed_from_u64(2);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let params = full_params(&mut rng);
        let features = Array2::from_shape_fn((3, 5), |(i, j)| (i + j) as f32 * 0.1);
        let (traced, _) = head
            .forward_traced::<StdRng>(&features, &params, None)
            .unwrap();
        assert_eq!(traced, head.forward(&features, &params).unwrap());
    }

    #[test]
    fn test_gradients_only_for_supplied() {
        let mut rng = StdRng::seed_from_u64(3);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let mut params = TensorMap::new();
        params.insert(CLASSIFIER_WEIGHT, ArrayD::from_elem(IxDyn(&[3, 4]), 0.1));
        let (logits, trace) = head
            .forward_traced::<StdRng>(&Array2::ones((2, 5)), &params, None)
            .unwrap();
        let (_, grads) = head.backward(&trace, &Array2::ones(logits.raw_dim())).unwrap();
        assert_eq!(grads.names().collect::<Vec<_>>(), vec![CLASSIFIER_WEIGHT]);
    }

    #[test]
    fn test_projection_bias_gradient_finite_difference() {
        let mut rng = StdRng::seed_from_u64(4);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let params = full_params(&mut rng);
        let features = Array2::from_shape_fn((2, 5), |(i, j)| 0.3 * i as f32 - 0.2 * j as f32 + 0.5);

        // loss = sum of logits weighted by w
        let w = Array2::from_shape_fn((2, 3), |(i, j)| 1.0 + i as f32 - 0.5 * j as f32);
        let (_, trace) = head.forward_traced::<StdRng>(&features, &params, None).unwrap();
        let (_, grads) = head.backward(&trace, &w).unwrap();
        let analytic = grads.get(PROJECTION_BIAS).unwrap().as_slice().unwrap().to_vec();

        let eps = 1e-3;
        let loss = |p: &TensorMap| (head.forward(&features, p).unwrap() * &w).sum();
        for k in 0..4 {
            let mut plus = params.clone();
            plus.get_mut(PROJECTION_BIAS).unwrap().as_slice_mut().unwrap()[k] += eps;
            let mut minus = params.clone();
            minus.get_mut(PROJECTION_BIAS).unwrap().as_slice_mut().unwrap()[k] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert_relative_eq!(analytic[k], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_training_mode_dropout_changes_output() {
        let mut rng = StdRng::seed_from_u64(5);
        let head = FunctionalHead::new(schema(), &mut rng).unwrap();
        let mut params = head.defaults().clone();
        params.insert(PROJECTION_BIAS, Array1::from_elem(4, 1.0).into_dyn());
        let features = Array2::ones((16, 5));
        let eval = head.forward(&features, &params).unwrap();
        let mut dropout_rng = StdRng::seed_from_u64(6);
        let (train, trace) = head
            .forward_traced(&features, &params, Some(&mut dropout_rng))
            .unwrap();
        assert!(trace.mask.is_some());
        assert_ne!(eval, train);
    }
}
