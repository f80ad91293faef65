//! # HyperCMTL
//!
//! Continual multi-task classification with a hypernetwork-generated head.
//!
//! Each task owns a trainable embedding. A hypernetwork turns the embedding
//! into every weight and bias of a small functional head, which is evaluated
//! on top of a shared backbone. Forgetting of earlier tasks is held back by
//! two regularizers applied in the same training step:
//!
//! - **Distillation**: a frozen snapshot taken after the previous task
//!   supplies soft targets for every earlier task, compared with
//!   temperature-scaled KL divergence
//! - **Fisher anchoring**: an EWC-style quadratic penalty around the
//!   parameters of the last task boundary, weighted by a diagonal Fisher
//!   estimate
//!
//! The same trainer also drives [`BaselineModel`], a shared backbone with one
//! owned head per task, which with distillation switched off is the
//! multi-head EWC reference point.
//!
//! ### Usage Example
//!
//! ```rust,ignore
//! use hypercmtl::{
//!     ContinualTrainer, HyperCmtl, ModelConfig, SyntheticTaskConfig, SyntheticTaskStream,
//!     TrainingConfig,
//! };
//!
//! let model = HyperCmtl::new(ModelConfig::default())?;
//! let mut trainer = ContinualTrainer::new(model, TrainingConfig::default())?;
//!
//! let tasks = SyntheticTaskStream::new(SyntheticTaskConfig::default())?.generate()?;
//! for split in &tasks {
//!     trainer.fit_task(&split.train, Some(&split.val))?;
//! }
//! let tests: Vec<_> = tasks.iter().map(|t| t.test.clone()).collect();
//! let report = trainer.evaluate_tasks(&tests)?;
//! println!("average accuracy {:.3}", report.average_accuracy);
//! ```

#![warn(missing_docs)]

pub mod backbone;
pub mod baseline;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distill;
pub mod embedding;
pub mod error;
pub mod fisher;
pub mod head;
pub mod hypernet;
pub mod layer;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod scheduler;
pub mod snapshot;
pub mod tensor;
pub mod trainer;

// Re-export commonly used types
pub use backbone::{build_backbone, Backbone, IdentityBackbone, MlpBackbone};
pub use baseline::{BaselineModel, BaselineTrace, TaskHead};
pub use checkpoint::ModelState;
pub use config::{
    BackboneConfig, ExperimentConfig, LearningRates, ModelConfig, NonFinitePolicy, OptimizerConfig,
    TrainingConfig,
};
pub use data::{Batch, SyntheticTaskConfig, SyntheticTaskStream, TaskDataset, TaskGeometry, TaskSplit};
pub use distill::{DistillationEngine, DistillationLoss};
pub use embedding::TaskEmbeddingStore;
pub use error::{HyperCmtlError, Result};
pub use fisher::{FisherDiagonal, FisherEstimator, FisherStats};
pub use head::{FunctionalHead, HeadSchema};
pub use hypernet::{GeneratorConfig, HyperNetwork, TargetSpec};
pub use layer::Activation;
pub use metrics::{MetricsRecorder, MetricsSink, NullSink, TracingSink};
pub use model::{HyperCmtl, ParameterGroup, TaskModel};
pub use optim::Optimizer;
pub use scheduler::{LearningRateScheduler, SchedulerType};
pub use snapshot::{ModelSnapshot, SnapshotManager};
pub use tensor::{GeneratedParameterSet, Gradients, ParameterSource, ParameterSourceMut, TensorMap};
pub use trainer::{ContinualTrainer, EpochSummary, Evaluation, EvaluationReport, StepMetrics, TaskReport};
