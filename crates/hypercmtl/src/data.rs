//! Task datasets, batching and a synthetic task stream
//!
//! A [`TaskDataset`] holds the inputs and labels of one task. Training code
//! consumes it through [`BatchIterator`]; experiments without real data use
//! [`SyntheticTaskStream`] to produce seeded Gaussian-cluster binary tasks.

use crate::error::{HyperCmtlError, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// One mini-batch of a single task
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs `[batch, input_dim]`
    pub inputs: Array2<f32>,
    /// Class index per row
    pub labels: Vec<usize>,
    /// Task the batch belongs to
    pub task_id: usize,
}

impl Batch {
    /// Create a batch, checking that every row has a label
    pub fn new(inputs: Array2<f32>, labels: Vec<usize>, task_id: usize) -> Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(HyperCmtlError::dimension_mismatch(inputs.nrows(), labels.len()));
        }
        Ok(Self {
            inputs,
            labels,
            task_id,
        })
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// All examples of one task
#[derive(Debug, Clone)]
pub struct TaskDataset {
    task_id: usize,
    inputs: Array2<f32>,
    labels: Vec<usize>,
}

impl TaskDataset {
    /// Create a dataset
    pub fn new(task_id: usize, inputs: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(HyperCmtlError::invalid_input(format!(
                "{} inputs but {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        Ok(Self {
            task_id,
            inputs,
            labels,
        })
    }

    /// Task id
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// Inputs `[n, input_dim]`
    pub fn inputs(&self) -> &Array2<f32> {
        &self.inputs
    }

    /// Labels
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether there are no examples
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Input width
    pub fn input_dim(&self) -> usize {
        self.inputs.ncols()
    }

    /// Rows at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            task_id: self.task_id,
            inputs: self.inputs.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Mini-batches in order or shuffled with `rng`
    pub fn batches<'a, R: Rng + ?Sized>(&'a self, batch_size: usize, shuffle: bool, rng: &mut R) -> BatchIterator<'a> {
        BatchIterator::new(self, batch_size, shuffle, rng)
    }

    /// Mini-batches in storage order
    pub fn batches_in_order(&self, batch_size: usize) -> BatchIterator<'_> {
        BatchIterator::sequential(self, batch_size)
    }

    /// Randomly split off a validation part of `val_ratio` of the examples
    pub fn split<R: Rng + ?Sized>(&self, val_ratio: f32, rng: &mut R) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&val_ratio) {
            return Err(HyperCmtlError::invalid_input(format!(
                "validation ratio must be in [0, 1), got {}",
                val_ratio
            )));
        }
        let n = self.len();
        let n_val = (n as f32 * val_ratio) as usize;
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(rng);
        let (val, train) = indices.split_at(n_val);
        Ok((self.subset(train), self.subset(val)))
    }
}

/// Iterator over the mini-batches of a [`TaskDataset`]
pub struct BatchIterator<'a> {
    dataset: &'a TaskDataset,
    batch_size: usize,
    indices: Vec<usize>,
    position: usize,
}

impl<'a> BatchIterator<'a> {
    /// Create an iterator; a batch size of 0 is treated as 1
    pub fn new<R: Rng + ?Sized>(dataset: &'a TaskDataset, batch_size: usize, shuffle: bool, rng: &mut R) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            indices.shuffle(rng);
        }
        Self {
            dataset,
            batch_size: batch_size.max(1),
            indices,
            position: 0,
        }
    }

    /// Iterator over rows in storage order
    pub fn sequential(dataset: &'a TaskDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            indices: (0..dataset.len()).collect(),
            position: 0,
        }
    }
}

impl Iterator for BatchIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let rows = &self.indices[self.position..end];
        self.position = end;

        Some(Batch {
            inputs: self.dataset.inputs.select(Axis(0), rows),
            labels: rows.iter().map(|&i| self.dataset.labels[i]).collect(),
            task_id: self.dataset.task_id,
        })
    }
}

/// How class centres of successive synthetic tasks relate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskGeometry {
    /// One shared axis; odd tasks swap the two labels, so tasks conflict
    #[default]
    Alternating,
    /// Each task draws its own random axis
    Independent,
}

/// Synthetic task stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticTaskConfig {
    /// Number of tasks
    pub num_tasks: usize,
    /// Input width
    pub input_dim: usize,
    /// Examples per class per task (before splitting)
    pub samples_per_class: usize,
    /// Distance of each class centre from the origin
    pub margin: f32,
    /// Std of the isotropic noise around a centre
    pub noise_std: f32,
    /// Fraction held out for validation
    pub val_fraction: f32,
    /// Fraction held out for testing
    pub test_fraction: f32,
    /// Relation between tasks
    pub geometry: TaskGeometry,
    /// Seed of the generator
    pub seed: u64,
}

impl Default for SyntheticTaskConfig {
    fn default() -> Self {
        Self {
            num_tasks: 3,
            input_dim: 16,
            samples_per_class: 128,
            margin: 1.5,
            noise_std: 1.0,
            val_fraction: 0.2,
            test_fraction: 0.2,
            geometry: TaskGeometry::Alternating,
            seed: 2024,
        }
    }
}

impl SyntheticTaskConfig {
    /// Check every field
    pub fn validate(&self) -> Result<()> {
        if self.num_tasks == 0 || self.input_dim == 0 || self.samples_per_class == 0 {
            return Err(HyperCmtlError::config(
                "num_tasks, input_dim and samples_per_class must be positive",
            ));
        }
        if !self.noise_std.is_finite() || self.noise_std < 0.0 || !self.margin.is_finite() {
            return Err(HyperCmtlError::config("margin and noise_std must be finite, noise_std >= 0"));
        }
        let held_out = self.val_fraction + self.test_fraction;
        if self.val_fraction < 0.0 || self.test_fraction < 0.0 || held_out >= 1.0 {
            return Err(HyperCmtlError::config(format!(
                "val_fraction + test_fraction must be in [0, 1), got {}",
                held_out
            )));
        }
        Ok(())
    }
}

/// Train/validation/test parts of one task
#[derive(Debug, Clone)]
pub struct TaskSplit {
    /// Training examples
    pub train: TaskDataset,
    /// Validation examples
    pub val: TaskDataset,
    /// Test examples
    pub test: TaskDataset,
}

/// Seeded generator of binary Gaussian-cluster tasks
#[derive(Debug, Clone)]
pub struct SyntheticTaskStream {
    config: SyntheticTaskConfig,
}

impl SyntheticTaskStream {
    /// Create a stream
    pub fn new(config: SyntheticTaskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Settings
    pub fn config(&self) -> &SyntheticTaskConfig {
        &self.config
    }

    fn random_axis(&self, rng: &mut StdRng) -> Result<Array1<f32>> {
        let normal = Normal::new(0.0f32, 1.0)
            .map_err(|e| HyperCmtlError::config(format!("axis sampling: {}", e)))?;
        loop {
            let axis = Array1::from_shape_fn(self.config.input_dim, |_| normal.sample(rng));
            let norm = axis.dot(&axis).sqrt();
            if norm > 1e-6 {
                return Ok(axis / norm);
            }
        }
    }

    /// Generate every task, split into train/validation/test
    pub fn generate(&self) -> Result<Vec<TaskSplit>> {
        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let noise = Normal::new(0.0f32, cfg.noise_std)
            .map_err(|e| HyperCmtlError::config(format!("noise sampling: {}", e)))?;
        let shared_axis = self.random_axis(&mut rng)?;

        let mut tasks = Vec::with_capacity(cfg.num_tasks);
        for task_id in 0..cfg.num_tasks {
            let (axis, sign) = match cfg.geometry {
                TaskGeometry::Alternating => {
                    (shared_axis.clone(), if task_id % 2 == 0 { 1.0 } else { -1.0 })
                }
                TaskGeometry::Independent => (self.random_axis(&mut rng)?, 1.0),
            };

            let n = 2 * cfg.samples_per_class;
            let mut inputs = Array2::zeros((n, cfg.input_dim));
            let mut labels = Vec::with_capacity(n);
            for (row_idx, mut row) in inputs.axis_iter_mut(Axis(0)).enumerate() {
                let label = row_idx % 2;
                let side = if label == 1 { sign } else { -sign };
                for (j, value) in row.iter_mut().enumerate() {
                    *value = side * cfg.margin * axis[j] + noise.sample(&mut rng);
                }
                labels.push(label);
            }

            let dataset = TaskDataset::new(task_id, inputs, labels)?;
            let (rest, test) = dataset.split(cfg.test_fraction, &mut rng)?;
            let val_ratio = if cfg.test_fraction < 1.0 {
                cfg.val_fraction / (1.0 - cfg.test_fraction)
            } else {
                0.0
            };
            let (train, val) = rest.split(val_ratio.min(0.99), &mut rng)?;
            tasks.push(TaskSplit { train, val, test });
        }
        Ok(tasks)
    }
}
