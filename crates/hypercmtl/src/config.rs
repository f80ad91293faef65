//! Configuration for the model, the training loop and experiments
//!
//! Every section is `serde`-derived with defaults taken from the reference
//! training setup and a `validate()` that reports `HyperCmtlError::Config`.

use crate::data::SyntheticTaskConfig;
use crate::error::{HyperCmtlError, Result};
use crate::layer::Activation;
use crate::scheduler::SchedulerType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feature extractor selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Identifier understood by [`crate::backbone::build_backbone`] (`identity`, `mlp`)
    pub name: String,
    /// Hidden widths of the `mlp` backbone; the last one is the feature width
    pub hidden_dims: Vec<usize>,
    /// Exclude backbone weights from optimization and regularization
    pub frozen: bool,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            name: "mlp".to_string(),
            hidden_dims: vec![32],
            frozen: false,
        }
    }
}

/// Construction-time model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Maximum number of tasks (embedding slots)
    pub task_capacity: usize,
    /// Width of raw inputs
    pub input_dim: usize,
    /// Width of task embeddings
    pub embedding_dim: usize,
    /// Std of the Gaussian used to initialise embeddings
    pub embedding_init_std: f32,
    /// Hidden width of every generator
    pub hypernetwork_hidden_width: usize,
    /// Number of hidden layers of every generator
    pub hypernetwork_depth: usize,
    /// Nonlinearity inside generators
    pub hypernetwork_activation: Activation,
    /// Width of the head's projection stage
    pub head_hidden_width: usize,
    /// Number of output classes per task
    pub num_classes: usize,
    /// Dropout after the projection stage (training only)
    pub head_dropout: f32,
    /// Feature extractor
    pub backbone: BackboneConfig,
    /// Seed for every initialisation draw
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            task_capacity: 5,
            input_dim: 16,
            embedding_dim: 64,
            embedding_init_std: 0.01,
            hypernetwork_hidden_width: 64,
            hypernetwork_depth: 2,
            hypernetwork_activation: Activation::Relu,
            head_hidden_width: 32,
            num_classes: 2,
            head_dropout: 0.5,
            backbone: BackboneConfig::default(),
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Check every field
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("task_capacity", self.task_capacity),
            ("input_dim", self.input_dim),
            ("embedding_dim", self.embedding_dim),
            ("head_hidden_width", self.head_hidden_width),
            ("num_classes", self.num_classes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(HyperCmtlError::config(format!("{} must be positive", field)));
            }
        }
        if self.hypernetwork_depth > 0 && self.hypernetwork_hidden_width == 0 {
            return Err(HyperCmtlError::config(
                "hypernetwork_hidden_width must be positive when depth > 0",
            ));
        }
        if !self.embedding_init_std.is_finite() || self.embedding_init_std < 0.0 {
            return Err(HyperCmtlError::config(format!(
                "embedding_init_std must be finite and non-negative, got {}",
                self.embedding_init_std
            )));
        }
        if !(0.0..1.0).contains(&self.head_dropout) {
            return Err(HyperCmtlError::config(format!(
                "head_dropout must be in [0, 1), got {}",
                self.head_dropout
            )));
        }
        if self.backbone.hidden_dims.iter().any(|&d| d == 0) {
            return Err(HyperCmtlError::config("backbone hidden dims must be positive"));
        }
        Ok(())
    }
}

/// Update rule and its hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    /// Stochastic gradient descent with optional momentum and L2 penalty
    Sgd {
        /// Momentum coefficient (0 disables)
        momentum: f32,
        /// L2 penalty added to the gradient
        weight_decay: f32,
    },
    /// Adam with L2 penalty added to the gradient
    Adam {
        /// First moment decay
        beta1: f32,
        /// Second moment decay
        beta2: f32,
        /// Denominator stabiliser
        epsilon: f32,
        /// L2 penalty added to the gradient
        weight_decay: f32,
    },
    /// Adam with decoupled weight decay
    #[serde(rename = "adamw")]
    AdamW {
        /// First moment decay
        beta1: f32,
        /// Second moment decay
        beta2: f32,
        /// Denominator stabiliser
        epsilon: f32,
        /// Decoupled decay rate
        weight_decay: f32,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::AdamW {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 1e-6,
        }
    }
}

impl OptimizerConfig {
    /// Check hyperparameter ranges
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            OptimizerConfig::Sgd { momentum, weight_decay } => {
                (0.0..1.0).contains(momentum) && *weight_decay >= 0.0
            }
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
                weight_decay,
            }
            | OptimizerConfig::AdamW {
                beta1,
                beta2,
                epsilon,
                weight_decay,
            } => {
                (0.0..1.0).contains(beta1)
                    && (0.0..1.0).contains(beta2)
                    && *epsilon > 0.0
                    && *weight_decay >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(HyperCmtlError::config(format!("invalid optimizer settings: {:?}", self)))
        }
    }
}

/// Base learning rate per parameter group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRates {
    /// Task embeddings
    pub embeddings: f32,
    /// Hypernetwork generators, and the owned heads of the baseline model
    pub hypernet: f32,
    /// Backbone (ignored when frozen)
    pub backbone: f32,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            embeddings: 1e-3,
            hypernet: 1e-3,
            backbone: 1e-3,
        }
    }
}

/// What to do when the distillation divergence is NaN or infinite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Log a warning and keep training
    #[default]
    Warn,
    /// Fail the step before the optimizer runs
    Abort,
}

/// Training loop configuration, fixed for a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Epochs per task in [`crate::trainer::ContinualTrainer::fit_task`]
    pub epochs_per_task: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Base learning rate per parameter group
    pub learning_rates: LearningRates,
    /// Update rule
    pub optimizer: OptimizerConfig,
    /// Learning-rate schedule, restarted for every task
    pub scheduler: SchedulerType,
    /// Softmax temperature for distillation
    pub temperature: f32,
    /// Weight of the distillation term (0 disables it)
    pub stability: f32,
    /// Weight of the Fisher penalty (0 disables it)
    pub ewc_lambda: f32,
    /// Batches drawn for Fisher estimation at each task boundary
    pub fisher_max_batches: usize,
    /// Global gradient-norm clip
    pub grad_clip: Option<f32>,
    /// Reaction to a non-finite distillation value
    pub non_finite_policy: NonFinitePolicy,
    /// Seed for shuffling and dropout masks
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs_per_task: 5,
            batch_size: 64,
            learning_rates: LearningRates::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerType::Constant,
            temperature: 2.0,
            stability: 5.0,
            ewc_lambda: 0.0,
            fisher_max_batches: 4,
            grad_clip: None,
            non_finite_policy: NonFinitePolicy::Warn,
            seed: 7,
        }
    }
}

impl TrainingConfig {
    /// Check every field
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HyperCmtlError::config("batch_size must be positive"));
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(HyperCmtlError::config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        for (field, value) in [("stability", self.stability), ("ewc_lambda", self.ewc_lambda)] {
            if !value.is_finite() || value < 0.0 {
                return Err(HyperCmtlError::config(format!(
                    "{} must be finite and non-negative, got {}",
                    field, value
                )));
            }
        }
        let rates = self.learning_rates;
        for (group, lr) in [
            ("embeddings", rates.embeddings),
            ("hypernet", rates.hypernet),
            ("backbone", rates.backbone),
        ] {
            if !lr.is_finite() || lr < 0.0 {
                return Err(HyperCmtlError::config(format!(
                    "learning rate for '{}' must be non-negative, got {}",
                    group, lr
                )));
            }
        }
        if let Some(clip) = self.grad_clip {
            if !clip.is_finite() || clip <= 0.0 {
                return Err(HyperCmtlError::config(format!("grad_clip must be positive, got {}", clip)));
            }
        }
        self.optimizer.validate()?;
        self.scheduler.validate()
    }
}

/// Everything needed to run one continual-learning experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Model architecture
    pub model: ModelConfig,
    /// Training loop
    pub training: TrainingConfig,
    /// Synthetic task stream
    pub data: SyntheticTaskConfig,
}

impl ExperimentConfig {
    /// Check every section, including cross-section consistency
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.data.validate()?;
        if self.data.num_tasks > self.model.task_capacity {
            return Err(HyperCmtlError::config(format!(
                "{} tasks do not fit a model with capacity {}",
                self.data.num_tasks, self.model.task_capacity
            )));
        }
        if self.data.input_dim != self.model.input_dim {
            return Err(HyperCmtlError::config(format!(
                "data input_dim {} differs from model input_dim {}",
                self.data.input_dim, self.model.input_dim
            )));
        }
        if self.model.num_classes < 2 {
            return Err(HyperCmtlError::config("synthetic tasks need at least 2 classes"));
        }
        Ok(())
    }

    /// Load and validate a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty JSON
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
