//! Hypernetwork: task embedding → head parameters
//!
//! Each target tensor of the functional head gets its own small generator MLP.
//! Generators are kept in an ordered map keyed by target name.

use crate::error::{HyperCmtlError, Result};
use crate::layer::{Activation, Linear, Mlp, MlpTrace};
use crate::tensor::{to_row, GeneratedParameterSet, Gradients};
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayViewD, ArrayViewMutD, Axis, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;

/// Parameter name prefix for generator weights
pub const HYPERNET_PREFIX: &str = "hypernet";

/// Scale applied to the Kaiming-normal output weights of every generator
const OUTPUT_WEIGHT_SCALE: f32 = 0.01;

/// A tensor the hypernetwork must produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// Name in the generated parameter set
    pub name: String,
    /// Exact shape expected by the consumer
    pub shape: Vec<usize>,
    /// Input width of the consuming linear stage
    pub fan_in: usize,
}

impl TargetSpec {
    /// Create a target description
    pub fn new(name: impl Into<String>, shape: &[usize], fan_in: usize) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            fan_in,
        }
    }

    /// Number of scalars in the target tensor
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Generator hyperparameters shared by every target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorConfig {
    /// Embedding width
    pub input_dim: usize,
    /// Hidden layer width
    pub hidden_width: usize,
    /// Number of hidden layers (0 means a single linear map)
    pub depth: usize,
    /// Nonlinearity between hidden layers
    pub activation: Activation,
}

/// One generator MLP producing one target tensor
#[derive(Debug, Clone)]
struct Generator {
    target: TargetSpec,
    mlp: Mlp,
}

impl Generator {
    fn new<R: Rng + ?Sized>(config: &GeneratorConfig, target: TargetSpec, rng: &mut R) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.depth + 1);
        let mut width = config.input_dim;
        for _ in 0..config.depth {
            layers.push(Linear::kaiming(width, config.hidden_width, config.activation, rng)?);
            width = config.hidden_width;
        }
        layers.push(output_layer(width, &target, config.activation, rng)?);

        let mlp = Mlp::new(layers, config.activation, false)?;
        Ok(Self { target, mlp })
    }

    fn reshape(&self, row: Array2<f32>) -> Result<ArrayD<f32>> {
        let flat = row.into_shape_with_order(self.target.numel())?;
        Ok(flat.into_shape_with_order(IxDyn(&self.target.shape))?)
    }
}

/// Output projection sized so an untrained generator emits a conventionally
/// initialised tensor for a layer of fan-in `target.fan_in`.
fn output_layer<R: Rng + ?Sized>(
    hidden: usize,
    target: &TargetSpec,
    activation: Activation,
    rng: &mut R,
) -> Result<Linear> {
    let std = activation.gain() / (hidden.max(1) as f32).sqrt() * OUTPUT_WEIGHT_SCALE;
    let normal = Normal::new(0.0f32, std)
        .map_err(|e| HyperCmtlError::config(format!("generator init: {}", e)))?;
    let numel = target.numel();
    let weights = Array2::from_shape_fn((numel, hidden), |_| normal.sample(rng));

    let bound = 1.0 / target.fan_in.max(1) as f32;
    let bias = Array1::from_shape_fn(numel, |_| rng.gen_range(-bound..bound));
    Linear::from_parts(weights, bias)
}

/// Activations of every generator for one embedding
#[derive(Debug, Clone)]
pub struct HyperTrace {
    traces: BTreeMap<String, MlpTrace>,
}

/// Maps a task embedding to a full parameter set for the functional head
#[derive(Debug, Clone)]
pub struct HyperNetwork {
    config: GeneratorConfig,
    generators: BTreeMap<String, Generator>,
}

impl HyperNetwork {
    /// Build one generator per target
    ///
    /// # Arguments
    /// * `config` - Generator hyperparameters
    /// * `targets` - Tensors to produce (names must be unique)
    /// * `rng` - Source of randomness for initialisation
    pub fn new<R: Rng + ?Sized>(config: GeneratorConfig, targets: &[TargetSpec], rng: &mut R) -> Result<Self> {
        if config.input_dim == 0 {
            return Err(HyperCmtlError::config("hypernetwork input width must be positive"));
        }
        if config.depth > 0 && config.hidden_width == 0 {
            return Err(HyperCmtlError::config("hypernetwork hidden width must be positive"));
        }

        let mut generators = BTreeMap::new();
        for target in targets {
            if target.numel() == 0 {
                return Err(HyperCmtlError::config(format!("target '{}' is empty", target.name)));
            }
            let generator = Generator::new(&config, target.clone(), rng)?;
            if generators.insert(target.name.clone(), generator).is_some() {
                return Err(HyperCmtlError::config(format!("duplicate target '{}'", target.name)));
            }
        }

        Ok(Self { config, generators })
    }

    /// Generator hyperparameters
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Embedding width this network accepts
    pub fn input_dim(&self) -> usize {
        self.config.input_dim
    }

    /// Targets in name order
    pub fn targets(&self) -> impl Iterator<Item = &TargetSpec> {
        self.generators.values().map(|g| &g.target)
    }

    /// Number of generator scalars
    pub fn parameter_count(&self) -> usize {
        self.generators.values().map(|g| g.mlp.num_parameters()).sum()
    }

    fn embedding_row(&self, z: &ArrayView1<f32>) -> Result<Array2<f32>> {
        if z.len() != self.config.input_dim {
            return Err(HyperCmtlError::dimension_mismatch(self.config.input_dim, z.len()));
        }
        Ok(z.to_owned().insert_axis(Axis(0)))
    }

    /// Generate every target tensor from embedding `z`
    pub fn generate(&self, z: &ArrayView1<f32>) -> Result<GeneratedParameterSet> {
        let row = self.embedding_row(z)?;
        let mut params = GeneratedParameterSet::new();
        for (name, generator) in &self.generators {
            let out = generator.mlp.forward(&row.view());
            params.insert(name.clone(), generator.reshape(out)?);
        }
        Ok(params)
    }

    /// [`HyperNetwork::generate`] plus the activations needed for backward
    pub fn generate_traced(&self, z: &ArrayView1<f32>) -> Result<(GeneratedParameterSet, HyperTrace)> {
        let row = self.embedding_row(z)?;
        let mut params = GeneratedParameterSet::new();
        let mut traces = BTreeMap::new();
        for (name, generator) in &self.generators {
            let (out, trace) = generator.mlp.forward_traced(&row.view());
            params.insert(name.clone(), generator.reshape(out)?);
            traces.insert(name.clone(), trace);
        }
        Ok((params, HyperTrace { traces }))
    }

    /// Backpropagate gradients w.r.t. generated tensors.
    ///
    /// Returns the gradient w.r.t. the embedding and the gradients of every
    /// generator that received one, named `hypernet.<target>.layers.<i>.*`.
    /// Targets absent from `grads` contribute nothing.
    pub fn backward(&self, trace: &HyperTrace, grads: &Gradients) -> Result<(Array1<f32>, Gradients)> {
        let mut grad_z = Array1::zeros(self.config.input_dim);
        let mut weight_grads = Gradients::new();

        for (name, generator) in &self.generators {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            if grad.shape() != generator.target.shape.as_slice() {
                return Err(HyperCmtlError::shape_mismatch(
                    name.as_str(),
                    &generator.target.shape,
                    grad.shape(),
                ));
            }
            let mlp_trace = trace.traces.get(name).ok_or_else(|| {
                HyperCmtlError::invalid_input(format!("no generator trace for '{}'", name))
            })?;

            let (grad_input, layer_grads) = generator.mlp.backward(mlp_trace, &to_row(grad))?;
            grad_z += &grad_input.row(0);

            let prefix = format!("{}.{}", HYPERNET_PREFIX, name);
            for (param, g) in Mlp::named_gradients(&prefix, layer_grads) {
                weight_grads.insert(param, g);
            }
        }

        Ok((grad_z, weight_grads))
    }

    pub(crate) fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for (name, generator) in &self.generators {
            generator.mlp.visit_parameters(&format!("{}.{}", HYPERNET_PREFIX, name), f);
        }
    }

    pub(crate) fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for (name, generator) in self.generators.iter_mut() {
            generator.mlp.visit_parameters_mut(&format!("{}.{}", HYPERNET_PREFIX, name), f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn targets() -> Vec<TargetSpec> {
        vec![
            TargetSpec::new("projection.weight", &[4, 6], 6),
            TargetSpec::new("projection.bias", &[4], 6),
        ]
    }

    fn config(depth: usize) -> GeneratorConfig {
        GeneratorConfig {
            input_dim: 8,
            hidden_width: 16,
            depth,
            activation: Activation::Relu,
        }
    }

    #[test]
    fn test_generate_shapes() {
        let mut rng = StdRng::seed_from_u64(5);
        let net = HyperNetwork::new(config(2), &targets(), &mut rng).unwrap();
        let z = Array1::from_elem(8, 0.01);
        let params = net.generate(&z.view()).unwrap();
        assert_eq!(params.get("projection.weight").unwrap().shape(), &[4, 6]);
        assert_eq!(params.get("projection.bias").unwrap().shape(), &[4]);
    }

    #[test]
    fn test_wrong_embedding_width() {
        let mut rng = StdRng::seed_from_u64(5);
        let net = HyperNetwork::new(config(1), &targets(), &mut rng).unwrap();
        let z = Array1::zeros(7);
        assert!(matches!(
            net.generate(&z.view()),
            Err(HyperCmtlError::DimensionMismatch { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn test_zero_embedding_gives_fan_in_scaled_bias() {
        let mut rng = StdRng::seed_from_u64(5);
        let net = HyperNetwork::new(config(2), &targets(), &mut rng).unwrap();
        let params = net.generate(&Array1::zeros(8).view()).unwrap();
        let bound = 1.0 / 6.0;
        for (_, tensor) in params.iter() {
            assert!(tensor.iter().all(|v| v.abs() <= bound));
        }
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let mut rng = StdRng::seed_from_u64(5);
        let dup = vec![TargetSpec::new("a", &[2], 2), TargetSpec::new("a", &[3], 2)];
        assert!(HyperNetwork::new(config(1), &dup, &mut rng).is_err());
    }

    #[test]
    fn test_embedding_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(21);
        let net = HyperNetwork::new(
            GeneratorConfig {
                activation: Activation::Tanh,
                ..config(1)
            },
            &targets(),
            &mut rng,
        )
        .unwrap();
        let z = Array1::from_shape_fn(8, |i| 0.1 * i as f32 - 0.3);

        // loss = sum of projection.weight
        let (params, trace) = net.generate_traced(&z.view()).unwrap();
        let mut seed = Gradients::new();
        seed.insert("projection.weight", ArrayD::ones(IxDyn(params.get("projection.weight").unwrap().shape())));
        let (grad_z, weight_grads) = net.backward(&trace, &seed).unwrap();

        assert!(weight_grads.contains("hypernet.projection.weight.layers.0.weight"));
        assert!(!weight_grads.names().any(|n| n.starts_with("hypernet.projection.bias")));

        let eps = 1e-2;
        for i in 0..8 {
            let mut plus = z.clone();
            plus[i] += eps;
            let mut minus = z.clone();
            minus[i] -= eps;
            let f = |v: &Array1<f32>| net.generate(&v.view()).unwrap().get("projection.weight").unwrap().sum();
            let numeric = (f(&plus) - f(&minus)) / (2.0 * eps);
            assert_relative_eq!(grad_z[i], numeric, epsilon = 1e-3, max_relative = 5e-2);
        }
    }
}
