//! The HyperCMTL model
//!
//! Data flow for one call: task id → embedding → hypernetwork → generated head
//! parameters; input → backbone → features; features + generated parameters →
//! functional head → logits. The head owns nothing trainable, so the trainable
//! state is the embedding table, the generators and (unless frozen) the
//! backbone.

use crate::backbone::{build_backbone, Backbone, BackboneTrace, BACKBONE_PREFIX};
use crate::config::{LearningRates, ModelConfig};
use crate::embedding::{TaskEmbeddingStore, EMBEDDING_PREFIX};
use crate::error::{HyperCmtlError, Result};
use crate::head::{FunctionalHead, HeadSchema, HeadTrace};
use crate::hypernet::{GeneratorConfig, HyperNetwork, HyperTrace, HYPERNET_PREFIX};
use crate::snapshot::ModelSnapshot;
use crate::tensor::{collect_parameters, GeneratedParameterSet, Gradients, ParameterSource, ParameterSourceMut, TensorMap};
use ndarray::{Array2, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// A set of parameters sharing one learning rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    /// Group label (`task_embeddings`, `hypernet`, `backbone`)
    pub name: String,
    /// Parameter names in the group
    pub parameters: Vec<String>,
    /// Base learning rate
    pub learning_rate: f32,
}

/// What training, evaluation and Fisher estimation need from a classifier.
///
/// Implemented by [`HyperCmtl`] and by the multi-head
/// [`BaselineModel`](crate::baseline::BaselineModel).
pub trait TaskModel: ParameterSource + ParameterSourceMut {
    /// Activations recorded by [`TaskModel::forward_traced`]
    type Trace;

    /// Number of task slots
    fn task_capacity(&self) -> usize;

    /// Make `task_id` trainable.
    ///
    /// Returns the group of parameters created for it, if any. Ids at or
    /// beyond the capacity fail with [`HyperCmtlError::Capacity`].
    fn prepare_task(&mut self, task_id: usize, rates: &LearningRates) -> Result<Option<ParameterGroup>>;

    /// Inference-mode logits `[batch, num_classes]` for `task_id`
    fn forward(&self, input: &Array2<f32>, task_id: usize) -> Result<Array2<f32>>;

    /// Forward pass recording activations; `dropout_rng` selects training mode
    fn forward_traced(
        &self,
        input: &Array2<f32>,
        task_id: usize,
        dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, Self::Trace)>;

    /// Gradients of every trainable parameter touched by one traced pass
    fn backward(&self, trace: &Self::Trace, grad_logits: &Array2<f32>) -> Result<Gradients>;

    /// Trainable parameters grouped for one optimizer
    fn parameter_groups(&self, rates: &LearningRates) -> Vec<ParameterGroup>;

    /// Owned copy of every trainable parameter
    fn named_parameters(&self) -> TensorMap {
        collect_parameters(self)
    }
}

/// Everything [`HyperCmtl::backward`] needs from one traced forward pass
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    task_id: usize,
    backbone: BackboneTrace,
    hyper: HyperTrace,
    head: HeadTrace,
}

impl ForwardTrace {
    /// Task whose generated parameters were used
    pub fn task_id(&self) -> usize {
        self.task_id
    }
}

/// Hypernetwork-conditioned multi-task classifier
#[derive(Debug, Clone)]
pub struct HyperCmtl {
    config: ModelConfig,
    backbone: Box<dyn Backbone>,
    head: FunctionalHead,
    hypernet: HyperNetwork,
    embeddings: TaskEmbeddingStore,
}

impl HyperCmtl {
    /// Build a model; every initial value is drawn from `config.seed`
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let backbone = build_backbone(&config.backbone, config.input_dim, &mut rng)?;
        let schema = HeadSchema {
            input_features: backbone.num_features(),
            hidden: config.head_hidden_width,
            num_classes: config.num_classes,
            dropout: config.head_dropout,
        };
        let head = FunctionalHead::new(schema, &mut rng)?;
        let hypernet = HyperNetwork::new(
            GeneratorConfig {
                input_dim: config.embedding_dim,
                hidden_width: config.hypernetwork_hidden_width,
                depth: config.hypernetwork_depth,
                activation: config.hypernetwork_activation,
            },
            &schema.targets(),
            &mut rng,
        )?;
        let embeddings = TaskEmbeddingStore::new(
            config.task_capacity,
            config.embedding_dim,
            config.embedding_init_std,
            &mut rng,
        )?;

        tracing::debug!(
            backbone = backbone.name(),
            features = backbone.num_features(),
            generator_params = hypernet.parameter_count(),
            capacity = config.task_capacity,
            "built HyperCMTL model"
        );

        Ok(Self {
            config,
            backbone,
            head,
            hypernet,
            embeddings,
        })
    }

    /// Construction config
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of task slots
    pub fn task_capacity(&self) -> usize {
        self.embeddings.capacity()
    }

    /// Feature extractor
    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    /// Functional head
    pub fn head(&self) -> &FunctionalHead {
        &self.head
    }

    /// Generator network
    pub fn hypernet(&self) -> &HyperNetwork {
        &self.hypernet
    }

    /// Embedding table
    pub fn embeddings(&self) -> &TaskEmbeddingStore {
        &self.embeddings
    }

    /// Mutable embedding table
    pub fn embeddings_mut(&mut self) -> &mut TaskEmbeddingStore {
        &mut self.embeddings
    }

    /// Whether backbone weights are excluded from training
    pub fn is_backbone_frozen(&self) -> bool {
        self.config.backbone.frozen
    }

    /// Generate the head parameters of `task_id`
    pub fn get_parameters(&self, task_id: usize) -> Result<GeneratedParameterSet> {
        let z = self.embeddings.get(task_id)?;
        self.hypernet.generate(&z)
    }

    fn check_input(&self, input: &Array2<f32>) -> Result<()> {
        if input.nrows() == 0 {
            return Err(HyperCmtlError::invalid_input("empty batch"));
        }
        if input.ncols() != self.config.input_dim {
            return Err(HyperCmtlError::dimension_mismatch(self.config.input_dim, input.ncols()));
        }
        Ok(())
    }

    /// Inference-mode logits `[batch, num_classes]` for `task_id`
    pub fn forward(&self, input: &Array2<f32>, task_id: usize) -> Result<Array2<f32>> {
        self.check_input(input)?;
        let params = self.get_parameters(task_id)?;
        let features = self.backbone.forward(input)?;
        self.head.forward(&features, &params)
    }

    /// Predicted class per row
    pub fn predict(&self, input: &Array2<f32>, task_id: usize) -> Result<Vec<usize>> {
        let logits = self.forward(input, task_id)?;
        Ok(crate::loss::argmax_rows(&logits))
    }

    /// Forward pass recording activations for [`HyperCmtl::backward`].
    ///
    /// `dropout_rng` selects training mode; `None` runs in inference mode.
    pub fn forward_traced(
        &self,
        input: &Array2<f32>,
        task_id: usize,
        dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, ForwardTrace)> {
        self.check_input(input)?;
        let z = self.embeddings.get(task_id)?;
        let (params, hyper) = self.hypernet.generate_traced(&z)?;
        let (features, backbone) = self.backbone.forward_traced(input)?;
        let (logits, head) = self.head.forward_traced(&features, &params, dropout_rng)?;
        Ok((
            logits,
            ForwardTrace {
                task_id,
                backbone,
                hyper,
                head,
            },
        ))
    }

    /// Gradients of every trainable parameter touched by one traced pass.
    ///
    /// Only the embedding of `trace.task_id()` appears; the backbone is
    /// skipped when frozen.
    pub fn backward(&self, trace: &ForwardTrace, grad_logits: &Array2<f32>) -> Result<Gradients> {
        let (grad_features, head_grads) = self.head.backward(&trace.head, grad_logits)?;
        let (grad_z, mut grads) = self.hypernet.backward(&trace.hyper, &head_grads)?;
        grads.insert(TaskEmbeddingStore::parameter_name(trace.task_id), grad_z.into_dyn());

        if !self.is_backbone_frozen() {
            let backbone_grads = self.backbone.backward(&trace.backbone, &grad_features)?;
            grads.merge_scaled(&backbone_grads, 1.0)?;
        }
        Ok(grads)
    }

    /// Independent, read-only copy for teacher evaluation
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot::capture(self)
    }

    /// Trainable parameters grouped for one optimizer
    pub fn parameter_groups(&self, rates: &LearningRates) -> Vec<ParameterGroup> {
        let mut embeddings = Vec::new();
        self.embeddings.visit_parameters(&mut |name, _| embeddings.push(name.to_string()));
        let mut hypernet = Vec::new();
        self.hypernet.visit_parameters(&mut |name, _| hypernet.push(name.to_string()));

        let mut groups = vec![
            ParameterGroup {
                name: EMBEDDING_PREFIX.to_string(),
                parameters: embeddings,
                learning_rate: rates.embeddings,
            },
            ParameterGroup {
                name: HYPERNET_PREFIX.to_string(),
                parameters: hypernet,
                learning_rate: rates.hypernet,
            },
        ];

        if !self.is_backbone_frozen() {
            let mut backbone = Vec::new();
            self.backbone.visit_parameters(&mut |name, _| backbone.push(name.to_string()));
            if !backbone.is_empty() {
                groups.push(ParameterGroup {
                    name: BACKBONE_PREFIX.to_string(),
                    parameters: backbone,
                    learning_rate: rates.backbone,
                });
            }
        }
        groups
    }

    /// Owned copy of every trainable parameter
    pub fn named_parameters(&self) -> TensorMap {
        collect_parameters(self)
    }

    /// Number of trainable scalars
    pub fn num_trainable(&self) -> usize {
        let mut count = 0;
        self.visit_parameters(&mut |_, v| count += v.len());
        count
    }

    /// Visit every parameter, frozen backbone included
    pub fn visit_all_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.embeddings.visit_parameters(f);
        self.hypernet.visit_parameters(f);
        self.backbone.visit_parameters(f);
    }

    /// Mutable counterpart of [`HyperCmtl::visit_all_parameters`]
    pub fn visit_all_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.embeddings.visit_parameters_mut(f);
        self.hypernet.visit_parameters_mut(f);
        self.backbone.visit_parameters_mut(f);
    }
}

impl TaskModel for HyperCmtl {
    type Trace = ForwardTrace;

    fn task_capacity(&self) -> usize {
        HyperCmtl::task_capacity(self)
    }

    fn prepare_task(&mut self, task_id: usize, _rates: &LearningRates) -> Result<Option<ParameterGroup>> {
        // every slot exists from construction
        if task_id >= self.task_capacity() {
            return Err(HyperCmtlError::capacity(task_id, self.task_capacity()));
        }
        Ok(None)
    }

    fn forward(&self, input: &Array2<f32>, task_id: usize) -> Result<Array2<f32>> {
        HyperCmtl::forward(self, input, task_id)
    }

    fn forward_traced(
        &self,
        input: &Array2<f32>,
        task_id: usize,
        dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, ForwardTrace)> {
        HyperCmtl::forward_traced(self, input, task_id, dropout_rng)
    }

    fn backward(&self, trace: &ForwardTrace, grad_logits: &Array2<f32>) -> Result<Gradients> {
        HyperCmtl::backward(self, trace, grad_logits)
    }

    fn parameter_groups(&self, rates: &LearningRates) -> Vec<ParameterGroup> {
        HyperCmtl::parameter_groups(self, rates)
    }

    fn named_parameters(&self) -> TensorMap {
        HyperCmtl::named_parameters(self)
    }
}

impl ParameterSource for HyperCmtl {
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.embeddings.visit_parameters(f);
        self.hypernet.visit_parameters(f);
        if !self.is_backbone_frozen() {
            self.backbone.visit_parameters(f);
        }
    }
}

impl ParameterSourceMut for HyperCmtl {
    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.embeddings.visit_parameters_mut(f);
        self.hypernet.visit_parameters_mut(f);
        if !self.config.backbone.frozen {
            self.backbone.visit_parameters_mut(f);
        }
    }
}
