//! Task embedding table
//!
//! One trainable vector per task slot. The table has a fixed capacity chosen at
//! construction; ids at or beyond it are rejected.

use crate::error::{HyperCmtlError, Result};
use ndarray::{Array1, ArrayView1, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Parameter name prefix for task embeddings
pub const EMBEDDING_PREFIX: &str = "task_embeddings";

/// Fixed-capacity store of task embeddings
#[derive(Debug, Clone)]
pub struct TaskEmbeddingStore {
    embeddings: Vec<Array1<f32>>,
    dim: usize,
}

impl TaskEmbeddingStore {
    /// Allocate `capacity` embeddings of width `dim`, each drawn from `N(0, std²)`
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tasks
    /// * `dim` - Embedding width (hypernetwork input width)
    /// * `std` - Standard deviation of the initial values
    /// * `rng` - Source of randomness
    pub fn new<R: Rng + ?Sized>(capacity: usize, dim: usize, std: f32, rng: &mut R) -> Result<Self> {
        if capacity == 0 {
            return Err(HyperCmtlError::config("task capacity must be positive"));
        }
        if dim == 0 {
            return Err(HyperCmtlError::config("embedding dimension must be positive"));
        }
        if !std.is_finite() || std < 0.0 {
            return Err(HyperCmtlError::config(format!(
                "embedding init std must be finite and non-negative, got {}",
                std
            )));
        }

        let embeddings = if std == 0.0 {
            (0..capacity).map(|_| Array1::zeros(dim)).collect()
        } else {
            let normal = Normal::new(0.0f32, std)
                .map_err(|e| HyperCmtlError::config(format!("embedding init: {}", e)))?;
            (0..capacity)
                .map(|_| Array1::from_shape_fn(dim, |_| normal.sample(rng)))
                .collect()
        };

        Ok(Self { embeddings, dim })
    }

    /// Embedding of `task_id`
    pub fn get(&self, task_id: usize) -> Result<ArrayView1<'_, f32>> {
        self.embeddings
            .get(task_id)
            .map(|e| e.view())
            .ok_or_else(|| HyperCmtlError::capacity(task_id, self.capacity()))
    }

    /// Mutable embedding of `task_id`
    pub fn get_mut(&mut self, task_id: usize) -> Result<&mut Array1<f32>> {
        let capacity = self.capacity();
        self.embeddings
            .get_mut(task_id)
            .ok_or_else(|| HyperCmtlError::capacity(task_id, capacity))
    }

    /// Number of task slots
    pub fn capacity(&self) -> usize {
        self.embeddings.len()
    }

    /// Embedding width
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Parameter name of the embedding for `task_id`
    pub fn parameter_name(task_id: usize) -> String {
        format!("{}.{}", EMBEDDING_PREFIX, task_id)
    }

    pub(crate) fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for (id, embedding) in self.embeddings.iter().enumerate() {
            f(&Self::parameter_name(id), embedding.view().into_dyn());
        }
    }

    pub(crate) fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for (id, embedding) in self.embeddings.iter_mut().enumerate() {
            f(&Self::parameter_name(id), embedding.view_mut().into_dyn());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_lookup_within_capacity() {
        let mut rng = StdRng::seed_from_u64(1);
        let store = TaskEmbeddingStore::new(3, 8, 0.01, &mut rng).unwrap();
        assert_eq!(store.capacity(), 3);
        assert_eq!(store.get(2).unwrap().len(), 8);
    }

    #[test]
    fn test_capacity_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let store = TaskEmbeddingStore::new(3, 8, 0.01, &mut rng).unwrap();
        match store.get(3) {
            Err(HyperCmtlError::Capacity { task_id, capacity }) => {
                assert_eq!(task_id, 3);
                assert_eq!(capacity, 3);
            }
            other => panic!("expected capacity error, got {:?}", other),
        }
    }

    #[test]
    fn test_small_init_scale() {
        let mut rng = StdRng::seed_from_u64(9);
        let store = TaskEmbeddingStore::new(4, 64, 0.01, &mut rng).unwrap();
        for id in 0..4 {
            assert!(store.get(id).unwrap().iter().all(|v| v.abs() < 0.1));
        }
    }

    #[test]
    fn test_invalid_std() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(TaskEmbeddingStore::new(2, 4, -1.0, &mut rng).is_err());
        assert!(TaskEmbeddingStore::new(2, 4, f32::NAN, &mut rng).is_err());
        assert!(TaskEmbeddingStore::new(0, 4, 0.01, &mut rng).is_err());
    }

    #[test]
    fn test_parameter_names() {
        let mut rng = StdRng::seed_from_u64(1);
        let store = TaskEmbeddingStore::new(2, 4, 0.01, &mut rng).unwrap();
        let mut names = Vec::new();
        store.visit_parameters(&mut |name, _| names.push(name.to_string()));
        assert_eq!(names, vec!["task_embeddings.0", "task_embeddings.1"]);
    }
}
