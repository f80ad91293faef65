//! Feature extractors
//!
//! The model only sees a backbone through the [`Backbone`] trait: a batch of
//! inputs goes in, a batch of feature vectors comes out. Two dense stand-ins
//! are provided and selected by name through [`build_backbone`].

use crate::config::BackboneConfig;
use crate::error::{HyperCmtlError, Result};
use crate::layer::{Activation, Linear, Mlp, MlpTrace};
use crate::tensor::Gradients;
use ndarray::{Array2, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use std::fmt::Debug;

/// Parameter name prefix for backbone weights
pub const BACKBONE_PREFIX: &str = "backbone";

/// Activations a backbone records for its backward pass
pub type BackboneTrace = MlpTrace;

/// Feature-extraction contract
pub trait Backbone: Debug + Send + Sync {
    /// Identifier used in configuration
    fn name(&self) -> &str;

    /// Expected input width
    fn input_dim(&self) -> usize;

    /// Width of the produced feature vectors
    fn num_features(&self) -> usize;

    /// Extract features for a batch `[batch, input_dim]`
    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>>;

    /// Extract features and record what [`Backbone::backward`] needs
    fn forward_traced(&self, input: &Array2<f32>) -> Result<(Array2<f32>, BackboneTrace)>;

    /// Gradients of every backbone parameter, named `backbone.*`
    fn backward(&self, trace: &BackboneTrace, grad_features: &Array2<f32>) -> Result<Gradients>;

    /// Visit every parameter as `backbone.*`
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>));

    /// Visit every parameter mutably as `backbone.*`
    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>));

    /// Independent copy
    fn boxed_clone(&self) -> Box<dyn Backbone>;
}

impl Clone for Box<dyn Backbone> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

fn check_width(expected: usize, input: &Array2<f32>) -> Result<()> {
    if input.ncols() != expected {
        return Err(HyperCmtlError::dimension_mismatch(expected, input.ncols()));
    }
    Ok(())
}

/// Passes inputs through unchanged; has no parameters
#[derive(Debug, Clone)]
pub struct IdentityBackbone {
    dim: usize,
}

impl IdentityBackbone {
    /// Identity over `dim`-wide inputs
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Backbone for IdentityBackbone {
    fn name(&self) -> &str {
        "identity"
    }

    fn input_dim(&self) -> usize {
        self.dim
    }

    fn num_features(&self) -> usize {
        self.dim
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        check_width(self.dim, input)?;
        Ok(input.clone())
    }

    fn forward_traced(&self, input: &Array2<f32>) -> Result<(Array2<f32>, BackboneTrace)> {
        Ok((self.forward(input)?, BackboneTrace::default()))
    }

    fn backward(&self, _trace: &BackboneTrace, _grad_features: &Array2<f32>) -> Result<Gradients> {
        Ok(Gradients::new())
    }

    fn visit_parameters(&self, _f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {}

    fn visit_parameters_mut(&mut self, _f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {}

    fn boxed_clone(&self) -> Box<dyn Backbone> {
        Box::new(self.clone())
    }
}

/// Dense ReLU stack; every layer, including the last, is followed by ReLU
#[derive(Debug, Clone)]
pub struct MlpBackbone {
    mlp: Mlp,
}

impl MlpBackbone {
    /// Kaiming-initialised stack `input_dim → hidden_dims[0] → ... → hidden_dims[n-1]`
    pub fn new<R: Rng + ?Sized>(input_dim: usize, hidden_dims: &[usize], rng: &mut R) -> Result<Self> {
        if hidden_dims.is_empty() {
            return Err(HyperCmtlError::config("mlp backbone needs at least one hidden width"));
        }
        let mut layers = Vec::with_capacity(hidden_dims.len());
        let mut width = input_dim;
        for &dim in hidden_dims {
            layers.push(Linear::kaiming(width, dim, Activation::Relu, rng)?);
            width = dim;
        }
        Ok(Self {
            mlp: Mlp::new(layers, Activation::Relu, true)?,
        })
    }
}

impl Backbone for MlpBackbone {
    fn name(&self) -> &str {
        "mlp"
    }

    fn input_dim(&self) -> usize {
        self.mlp.input_dim()
    }

    fn num_features(&self) -> usize {
        self.mlp.output_dim()
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        check_width(self.input_dim(), input)?;
        Ok(self.mlp.forward(&input.view()))
    }

    fn forward_traced(&self, input: &Array2<f32>) -> Result<(Array2<f32>, BackboneTrace)> {
        check_width(self.input_dim(), input)?;
        Ok(self.mlp.forward_traced(&input.view()))
    }

    fn backward(&self, trace: &BackboneTrace, grad_features: &Array2<f32>) -> Result<Gradients> {
        let (_, layer_grads) = self.mlp.backward(trace, grad_features)?;
        Ok(Mlp::named_gradients(BACKBONE_PREFIX, layer_grads).into_iter().collect())
    }

    fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.mlp.visit_parameters(BACKBONE_PREFIX, f);
    }

    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.mlp.visit_parameters_mut(BACKBONE_PREFIX, f);
    }

    fn boxed_clone(&self) -> Box<dyn Backbone> {
        Box::new(self.clone())
    }
}

/// Build a backbone by identifier
///
/// # Errors
/// `HyperCmtlError::Config` for an unknown identifier or invalid widths.
pub fn build_backbone<R: Rng + ?Sized>(
    config: &BackboneConfig,
    input_dim: usize,
    rng: &mut R,
) -> Result<Box<dyn Backbone>> {
    match config.name.as_str() {
        "identity" => Ok(Box::new(IdentityBackbone::new(input_dim))),
        "mlp" => Ok(Box::new(MlpBackbone::new(input_dim, &config.hidden_dims, rng)?)),
        other => Err(HyperCmtlError::config(format!(
            "Backbone {} is not supported (expected 'identity' or 'mlp')",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_unknown_backbone_is_config_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = BackboneConfig {
            name: "resnet50".to_string(),
            ..BackboneConfig::default()
        };
        let err = build_backbone(&config, 8, &mut rng).unwrap_err();
        assert!(matches!(err, HyperCmtlError::Config(_)));
        assert!(err.to_string().contains("resnet50"));
    }

    #[test]
    fn test_mlp_feature_width() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = BackboneConfig {
            name: "mlp".to_string(),
            hidden_dims: vec![12, 6],
            frozen: false,
        };
        let backbone = build_backbone(&config, 8, &mut rng).unwrap();
        assert_eq!(backbone.num_features(), 6);
        let features = backbone.forward(&Array2::ones((3, 8))).unwrap();
        assert_eq!(features.dim(), (3, 6));
        assert!(features.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_identity_has_no_parameters() {
        let backbone = IdentityBackbone::new(4);
        let mut count = 0;
        backbone.visit_parameters(&mut |_, _| count += 1);
        assert_eq!(count, 0);
        assert!(backbone.forward(&Array2::zeros((1, 5))).is_err());
    }

    #[test]
    fn test_boxed_clone_is_independent() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut original: Box<dyn Backbone> = Box::new(MlpBackbone::new(3, &[4], &mut rng).unwrap());
        let copy = original.clone();
        original.visit_parameters_mut(&mut |_, mut v| v.fill(0.0));

        let x = Array2::ones((1, 3));
        assert!(original.forward(&x).unwrap().iter().all(|&v| v == 0.0));
        let mut nonzero = false;
        copy.visit_parameters(&mut |_, v| nonzero |= v.iter().any(|&x| x != 0.0));
        assert!(nonzero);
    }

    #[test]
    fn test_backward_names() {
        let mut rng = StdRng::seed_from_u64(2);
        let backbone = MlpBackbone::new(3, &[4, 2], &mut rng).unwrap();
        let (features, trace) = backbone.forward_traced(&Array2::ones((2, 3))).unwrap();
        let grads = backbone.backward(&trace, &Array2::ones(features.raw_dim())).unwrap();
        let names: Vec<_> = grads.names().collect();
        assert_eq!(
            names,
            vec![
                "backbone.layers.0.bias",
                "backbone.layers.0.weight",
                "backbone.layers.1.bias",
                "backbone.layers.1.weight"
            ]
        );
    }
}
