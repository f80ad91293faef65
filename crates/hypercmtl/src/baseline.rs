//! Multi-head EWC baseline
//!
//! A shared backbone with one classifier head per task, each head owning its
//! weights. Heads live in a map keyed by task id and are registered on first
//! use; ids at or beyond the configured capacity are rejected at insertion.
//!
//! Driven by [`ContinualTrainer`](crate::trainer::ContinualTrainer) with
//! `stability = 0` this is plain EWC: Fisher anchors cover the backbone and
//! every head that existed at the last boundary, and a head registered later
//! trains without penalty.

use crate::backbone::{build_backbone, Backbone, BackboneTrace, BACKBONE_PREFIX};
use crate::config::{LearningRates, ModelConfig};
use crate::error::{HyperCmtlError, Result};
use crate::head::{FunctionalHead, HeadSchema, HeadTrace};
use crate::model::{ParameterGroup, TaskModel};
use crate::tensor::{Gradients, ParameterSource, ParameterSourceMut, TensorMap};
use ndarray::{Array2, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Parameter name prefix for owned task heads
pub const HEADS_PREFIX: &str = "task_heads";

/// Classifier head that owns its weights
#[derive(Debug, Clone)]
pub struct TaskHead {
    head: FunctionalHead,
    weights: TensorMap,
}

impl TaskHead {
    /// Head with fan-in uniform initial weights
    pub fn new<R: Rng + ?Sized>(schema: HeadSchema, rng: &mut R) -> Result<Self> {
        let head = FunctionalHead::new(schema, rng)?;
        let weights = head.defaults().clone();
        Ok(Self { head, weights })
    }

    /// Shape contract
    pub fn schema(&self) -> &HeadSchema {
        self.head.schema()
    }

    /// Current weights, keyed by head schema name
    pub fn weights(&self) -> &TensorMap {
        &self.weights
    }

    /// Number of scalars
    pub fn num_parameters(&self) -> usize {
        self.weights.numel()
    }
}

/// Activations recorded by [`BaselineModel::forward_traced`]
#[derive(Debug, Clone)]
pub struct BaselineTrace {
    task_id: usize,
    backbone: BackboneTrace,
    head: HeadTrace,
}

/// Shared backbone plus one owned head per registered task
#[derive(Debug, Clone)]
pub struct BaselineModel {
    config: ModelConfig,
    schema: HeadSchema,
    backbone: Box<dyn Backbone>,
    heads: BTreeMap<usize, TaskHead>,
    rng: StdRng,
}

impl BaselineModel {
    /// Build the backbone; no head exists until [`BaselineModel::add_task`].
    ///
    /// Uses the capacity, input, head, dropout, backbone and seed fields of
    /// `config`; the embedding and hypernetwork fields are ignored.
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

        tracing::debug!(
            backbone = backbone.name(),
            features = backbone.num_features(),
            capacity = config.task_capacity,
            "built multi-head baseline"
        );

        Ok(Self {
            config,
            schema,
            backbone,
            heads: BTreeMap::new(),
            rng,
        })
    }

    /// Construction config
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of task slots
    pub fn task_capacity(&self) -> usize {
        self.config.task_capacity
    }

    /// Feature extractor
    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    /// Head of `task_id`, if registered
    pub fn head(&self, task_id: usize) -> Option<&TaskHead> {
        self.heads.get(&task_id)
    }

    /// Registered task ids in order
    pub fn task_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.heads.keys().copied()
    }

    /// Parameter name of head tensor `name` for `task_id`
    pub fn parameter_name(task_id: usize, name: &str) -> String {
        format!("{}.{}.{}", HEADS_PREFIX, task_id, name)
    }

    /// Register a freshly initialised head for `task_id`.
    ///
    /// # Errors
    /// [`HyperCmtlError::Capacity`] when `task_id` is outside the capacity,
    /// [`HyperCmtlError::InvalidInput`] when the task already has a head.
    pub fn add_task(&mut self, task_id: usize) -> Result<&TaskHead> {
        if task_id >= self.task_capacity() {
            return Err(HyperCmtlError::capacity(task_id, self.task_capacity()));
        }
        if self.heads.contains_key(&task_id) {
            return Err(HyperCmtlError::invalid_input(format!(
                "task {} already has a head",
                task_id
            )));
        }
        let head = TaskHead::new(self.schema, &mut self.rng)?;
        tracing::debug!(task_id, parameters = head.num_parameters(), "added task head");
        Ok(self.heads.entry(task_id).or_insert(head))
    }

    fn task_head(&self, task_id: usize) -> Result<&TaskHead> {
        if task_id >= self.task_capacity() {
            return Err(HyperCmtlError::capacity(task_id, self.task_capacity()));
        }
        self.heads
            .get(&task_id)
            .ok_or_else(|| HyperCmtlError::invalid_input(format!("no head registered for task {}", task_id)))
    }

    fn head_group(&self, task_id: usize, rates: &LearningRates) -> Option<ParameterGroup> {
        let head = self.heads.get(&task_id)?;
        Some(ParameterGroup {
            name: format!("{}.{}", HEADS_PREFIX, task_id),
            parameters: head.weights.names().map(|n| Self::parameter_name(task_id, n)).collect(),
            learning_rate: rates.hypernet,
        })
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

    /// Inference-mode logits for `task_id`
    pub fn forward(&self, input: &Array2<f32>, task_id: usize) -> Result<Array2<f32>> {
        self.check_input(input)?;
        let head = self.task_head(task_id)?;
        let features = self.backbone.forward(input)?;
        head.head.forward(&features, &head.weights)
    }

    /// Forward pass recording activations; `dropout_rng` selects training mode
    pub fn forward_traced(
        &self,
        input: &Array2<f32>,
        task_id: usize,
        dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, BaselineTrace)> {
        self.check_input(input)?;
        let head = self.task_head(task_id)?;
        let (features, backbone) = self.backbone.forward_traced(input)?;
        let (logits, head_trace) = head.head.forward_traced(&features, &head.weights, dropout_rng)?;
        Ok((
            logits,
            BaselineTrace {
                task_id,
                backbone,
                head: head_trace,
            },
        ))
    }

    /// Gradients of the traced task's head and, unless frozen, the backbone
    pub fn backward(&self, trace: &BaselineTrace, grad_logits: &Array2<f32>) -> Result<Gradients> {
        let head = self.task_head(trace.task_id)?;
        let (grad_features, head_grads) = head.head.backward(&trace.head, grad_logits)?;
        let mut grads: Gradients = head_grads
            .into_iter()
            .map(|(name, grad)| (Self::parameter_name(trace.task_id, &name), grad))
            .collect();

        if !self.config.backbone.frozen {
            let backbone_grads = self.backbone.backward(&trace.backbone, &grad_features)?;
            grads.merge_scaled(&backbone_grads, 1.0)?;
        }
        Ok(grads)
    }

    /// Backbone group (unless frozen) followed by one group per head
    pub fn parameter_groups(&self, rates: &LearningRates) -> Vec<ParameterGroup> {
        let mut groups = Vec::with_capacity(self.heads.len() + 1);
        if !self.config.backbone.frozen {
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
        groups.extend(self.heads.keys().filter_map(|&id| self.head_group(id, rates)));
        groups
    }
}

impl TaskModel for BaselineModel {
    type Trace = BaselineTrace;

    fn task_capacity(&self) -> usize {
        BaselineModel::task_capacity(self)
    }

    fn prepare_task(&mut self, task_id: usize, rates: &LearningRates) -> Result<Option<ParameterGroup>> {
        if self.heads.contains_key(&task_id) {
            return Ok(None);
        }
        self.add_task(task_id)?;
        Ok(self.head_group(task_id, rates))
    }

    fn forward(&self, input: &Array2<f32>, task_id: usize) -> Result<Array2<f32>> {
        BaselineModel::forward(self, input, task_id)
    }

    fn forward_traced(
        &self,
        input: &Array2<f32>,
        task_id: usize,
        dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, BaselineTrace)> {
        BaselineModel::forward_traced(self, input, task_id, dropout_rng)
    }

    fn backward(&self, trace: &BaselineTrace, grad_logits: &Array2<f32>) -> Result<Gradients> {
        BaselineModel::backward(self, trace, grad_logits)
    }

    fn parameter_groups(&self, rates: &LearningRates) -> Vec<ParameterGroup> {
        BaselineModel::parameter_groups(self, rates)
    }
}

impl ParameterSource for BaselineModel {
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        if !self.config.backbone.frozen {
            self.backbone.visit_parameters(f);
        }
        for (&task_id, head) in &self.heads {
            for (name, weight) in head.weights.iter() {
                f(&Self::parameter_name(task_id, name), weight.view());
            }
        }
    }
}

impl ParameterSourceMut for BaselineModel {
    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        if !self.config.backbone.frozen {
            self.backbone.visit_parameters_mut(f);
        }
        for (&task_id, head) in self.heads.iter_mut() {
            for (name, weight) in head.weights.iter_mut() {
                f(&Self::parameter_name(task_id, name), weight.view_mut());
            }
        }
    }
}
