//! Dense layers with explicit backward passes
//!
//! Everything here works on row-major batches (`[batch, features]`). Forward
//! passes that feed a backward pass return a trace holding the activations the
//! gradient computation needs.

use crate::error::{HyperCmtlError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Elementwise nonlinearity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// max(0, x)
    #[default]
    Relu,
    /// tanh(x)
    Tanh,
    /// x
    Identity,
}

impl Activation {
    /// Apply the activation to every element
    pub fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => x.mapv(|v| v.max(0.0)),
            Activation::Tanh => x.mapv(f32::tanh),
            Activation::Identity => x.clone(),
        }
    }

    /// Gradient w.r.t. the pre-activation given the gradient w.r.t. the output
    pub fn backward(&self, pre_activation: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => {
                let mut grad = grad_output.clone();
                grad.zip_mut_with(pre_activation, |g, &p| {
                    if p <= 0.0 {
                        *g = 0.0;
                    }
                });
                grad
            }
            Activation::Tanh => {
                let mut grad = grad_output.clone();
                grad.zip_mut_with(pre_activation, |g, &p| {
                    let t = p.tanh();
                    *g *= 1.0 - t * t;
                });
                grad
            }
            Activation::Identity => grad_output.clone(),
        }
    }

    /// Kaiming gain for this nonlinearity
    pub fn gain(&self) -> f32 {
        match self {
            Activation::Relu => std::f32::consts::SQRT_2,
            Activation::Tanh => 5.0 / 3.0,
            Activation::Identity => 1.0,
        }
    }
}

/// `x · Wᵀ + b` for a batch `x` of shape `[batch, in]` and `W` of shape `[out, in]`
pub fn affine(x: &ArrayView2<f32>, weight: &ArrayView2<f32>, bias: &ArrayView1<f32>) -> Array2<f32> {
    x.dot(&weight.t()) + bias
}

/// Backward of [`affine`]: returns `(grad_x, grad_weight, grad_bias)`
pub fn affine_backward(
    x: &ArrayView2<f32>,
    weight: &ArrayView2<f32>,
    grad_output: &Array2<f32>,
) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
    let grad_x = grad_output.dot(weight);
    let grad_weight = grad_output.t().dot(x);
    let grad_bias = grad_output.sum_axis(Axis(0));
    (grad_x, grad_weight, grad_bias)
}

/// Linear transformation layer owning its weights
#[derive(Debug, Clone)]
pub struct Linear {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

/// Gradients of one [`Linear`] layer
#[derive(Debug, Clone)]
pub struct LinearGrad {
    /// Gradient w.r.t. the weight matrix `[out, in]`
    pub weight: Array2<f32>,
    /// Gradient w.r.t. the bias `[out]`
    pub bias: Array1<f32>,
}

impl Linear {
    /// Build a layer from explicit weights `[out, in]` and bias `[out]`
    pub fn from_parts(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(HyperCmtlError::dimension_mismatch(weights.nrows(), bias.len()));
        }
        Ok(Self { weights, bias })
    }

    /// Xavier/Glorot normal weights, zero bias
    pub fn xavier<R: Rng + ?Sized>(input_dim: usize, output_dim: usize, rng: &mut R) -> Result<Self> {
        let scale = (2.0 / (input_dim + output_dim) as f32).sqrt();
        let weights = normal_matrix(output_dim, input_dim, scale, rng)?;
        Ok(Self {
            weights,
            bias: Array1::zeros(output_dim),
        })
    }

    /// Kaiming normal weights (fan-in mode) for the given activation, zero bias
    pub fn kaiming<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        let std = activation.gain() / (input_dim.max(1) as f32).sqrt();
        let weights = normal_matrix(output_dim, input_dim, std, rng)?;
        Ok(Self {
            weights,
            bias: Array1::zeros(output_dim),
        })
    }

    /// Uniform `[-1/sqrt(in), 1/sqrt(in)]` weights and bias
    pub fn uniform_fan_in<R: Rng + ?Sized>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (input_dim.max(1) as f32).sqrt();
        let weights = Array2::from_shape_fn((output_dim, input_dim), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(output_dim, |_| rng.gen_range(-bound..bound));
        Self { weights, bias }
    }

    /// Forward pass over a batch: `x · Wᵀ + b`
    pub fn forward(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        affine(input, &self.weights.view(), &self.bias.view())
    }

    /// Backward pass given the layer input and the output gradient
    pub fn backward(&self, input: &ArrayView2<f32>, grad_output: &Array2<f32>) -> (Array2<f32>, LinearGrad) {
        let (grad_x, weight, bias) = affine_backward(input, &self.weights.view(), grad_output);
        (grad_x, LinearGrad { weight, bias })
    }

    /// Input dimension
    pub fn input_dim(&self) -> usize {
        self.weights.ncols()
    }

    /// Output dimension
    pub fn output_dim(&self) -> usize {
        self.weights.nrows()
    }

    /// Weight matrix `[out, in]`
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    /// Bias vector `[out]`
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Number of scalars in this layer
    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

fn normal_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, std: f32, rng: &mut R) -> Result<Array2<f32>> {
    let normal = Normal::new(0.0f32, std)
        .map_err(|e| HyperCmtlError::config(format!("invalid init std {}: {}", std, e)))?;
    Ok(Array2::from_shape_fn((rows, cols), |_| normal.sample(rng)))
}

/// Inverted dropout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    /// Create a dropout stage with drop probability `p` in `[0, 1)`
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(HyperCmtlError::config(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self { p })
    }

    /// Drop probability
    pub fn probability(&self) -> f32 {
        self.p
    }

    /// Draw a scaled keep-mask, or `None` when dropout is a no-op
    pub fn sample_mask<R: Rng + ?Sized>(&self, shape: (usize, usize), rng: &mut R) -> Option<Array2<f32>> {
        if self.p == 0.0 {
            return None;
        }
        let keep_scale = 1.0 / (1.0 - self.p);
        Some(Array2::from_shape_fn(shape, |_| {
            if rng.gen::<f32>() < self.p {
                0.0
            } else {
                keep_scale
            }
        }))
    }
}

/// Stack of linear layers with a shared nonlinearity
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    activate_output: bool,
}

/// Activations recorded by [`Mlp::forward_traced`]
#[derive(Debug, Clone, Default)]
pub struct MlpTrace {
    /// Input of each layer
    pub inputs: Vec<Array2<f32>>,
    /// Pre-activation output of each layer
    pub pre_activations: Vec<Array2<f32>>,
}

impl Mlp {
    /// Chain `layers`; the activation follows every hidden layer and, if
    /// `activate_output` is set, the last one too.
    pub fn new(layers: Vec<Linear>, activation: Activation, activate_output: bool) -> Result<Self> {
        if layers.is_empty() {
            return Err(HyperCmtlError::config("an MLP needs at least one layer"));
        }
        for pair in layers.windows(2) {
            if pair[0].output_dim() != pair[1].input_dim() {
                return Err(HyperCmtlError::dimension_mismatch(
                    pair[1].input_dim(),
                    pair[0].output_dim(),
                ));
            }
        }
        Ok(Self {
            layers,
            activation,
            activate_output,
        })
    }

    /// Input width of the first layer
    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, Linear::input_dim)
    }

    /// Output width of the last layer
    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Linear::output_dim)
    }

    /// Layers in order
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Total number of scalars
    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(Linear::num_parameters).sum()
    }

    fn is_activated(&self, index: usize) -> bool {
        index + 1 < self.layers.len() || self.activate_output
    }

    /// Forward pass without recording activations
    pub fn forward(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut x = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let pre = layer.forward(&x.view());
            x = if self.is_activated(i) {
                self.activation.apply(&pre)
            } else {
                pre
            };
        }
        x
    }

    /// Forward pass that records what [`Mlp::backward`] needs
    pub fn forward_traced(&self, input: &ArrayView2<f32>) -> (Array2<f32>, MlpTrace) {
        let mut trace = MlpTrace::default();
        let mut x = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let pre = layer.forward(&x.view());
            let out = if self.is_activated(i) {
                self.activation.apply(&pre)
            } else {
                pre.clone()
            };
            trace.inputs.push(x);
            trace.pre_activations.push(pre);
            x = out;
        }
        (x, trace)
    }

    /// Backward pass: returns the input gradient and one gradient per layer
    pub fn backward(&self, trace: &MlpTrace, grad_output: &Array2<f32>) -> Result<(Array2<f32>, Vec<LinearGrad>)> {
        if trace.inputs.len() != self.layers.len() || trace.pre_activations.len() != self.layers.len() {
            return Err(HyperCmtlError::invalid_input(format!(
                "trace records {} layers, network has {}",
                trace.inputs.len(),
                self.layers.len()
            )));
        }

        let mut grads = Vec::with_capacity(self.layers.len());
        let mut grad = grad_output.clone();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            if self.is_activated(i) {
                grad = self.activation.backward(&trace.pre_activations[i], &grad);
            }
            let (grad_input, layer_grad) = layer.backward(&trace.inputs[i].view(), &grad);
            grads.push(layer_grad);
            grad = grad_input;
        }
        grads.reverse();
        Ok((grad, grads))
    }

    /// Visit `{prefix}.layers.{i}.weight|bias`
    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for (i, layer) in self.layers.iter().enumerate() {
            f(&format!("{}.layers.{}.weight", prefix, i), layer.weights.view().into_dyn());
            f(&format!("{}.layers.{}.bias", prefix, i), layer.bias.view().into_dyn());
        }
    }

    /// Mutable counterpart of [`Mlp::visit_parameters`]
    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            f(&format!("{}.layers.{}.weight", prefix, i), layer.weights.view_mut().into_dyn());
            f(&format!("{}.layers.{}.bias", prefix, i), layer.bias.view_mut().into_dyn());
        }
    }

    /// Name per-layer gradients the same way [`Mlp::visit_parameters`] names parameters
    pub fn named_gradients(prefix: &str, grads: Vec<LinearGrad>) -> Vec<(String, ndarray::ArrayD<f32>)> {
        let mut out = Vec::with_capacity(grads.len() * 2);
        for (i, grad) in grads.into_iter().enumerate() {
            out.push((format!("{}.layers.{}.weight", prefix, i), grad.weight.into_dyn()));
            out.push((format!("{}.layers.{}.bias", prefix, i), grad.bias.into_dyn()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward() {
        let layer = Linear::from_parts(arr2(&[[1.0, 2.0], [0.0, -1.0]]), Array1::from(vec![0.5, 0.0])).unwrap();
        let out = layer.forward(&arr2(&[[1.0, 1.0]]).view());
        assert_eq!(out, arr2(&[[3.5, -1.0]]));
    }

    #[test]
    fn test_from_parts_rejects_bias_mismatch() {
        let result = Linear::from_parts(Array2::zeros((3, 2)), Array1::zeros(2));
        assert!(result.is_err());
    }

    #[test]
    fn test_relu_backward_masks_negative() {
        let pre = arr2(&[[-1.0, 2.0]]);
        let grad = Activation::Relu.backward(&pre, &arr2(&[[5.0, 5.0]]));
        assert_eq!(grad, arr2(&[[0.0, 5.0]]));
    }

    #[test]
    fn test_dropout_mask_scaling() {
        let dropout = Dropout::new(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mask = dropout.sample_mask((4, 16), &mut rng).unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || (m - 2.0).abs() < 1e-6));
        assert!(Dropout::new(0.0).unwrap().sample_mask((2, 2), &mut rng).is_none());
        assert!(Dropout::new(1.0).is_err());
    }

    #[test]
    fn test_mlp_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(11);
        let layers = vec![
            Linear::xavier(3, 4, &mut rng).unwrap(),
            Linear::xavier(4, 2, &mut rng).unwrap(),
        ];
        let mlp = Mlp::new(layers, Activation::Tanh, false).unwrap();
        let x = arr2(&[[0.3, -0.2, 0.8]]);

        // loss = sum(output)
        let (out, trace) = mlp.forward_traced(&x.view());
        let (grad_x, _) = mlp.backward(&trace, &Array2::ones(out.raw_dim())).unwrap();

        let eps = 1e-3;
        for j in 0..3 {
            let mut plus = x.clone();
            plus[[0, j]] += eps;
            let mut minus = x.clone();
            minus[[0, j]] -= eps;
            let numeric = (mlp.forward(&plus.view()).sum() - mlp.forward(&minus.view()).sum()) / (2.0 * eps);
            assert_relative_eq!(grad_x[[0, j]], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_mlp_rejects_mismatched_layers() {
        let mut rng = StdRng::seed_from_u64(0);
        let layers = vec![
            Linear::xavier(3, 4, &mut rng).unwrap(),
            Linear::xavier(5, 2, &mut rng).unwrap(),
        ];
        assert!(Mlp::new(layers, Activation::Relu, false).is_err());
    }

    #[test]
    fn test_visit_names() {
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(vec![Linear::uniform_fan_in(2, 2, &mut rng)], Activation::Relu, true).unwrap();
        let mut names = Vec::new();
        mlp.visit_parameters("backbone", &mut |name, _| names.push(name.to_string()));
        assert_eq!(names, vec!["backbone.layers.0.weight", "backbone.layers.0.bias"]);
    }
}
