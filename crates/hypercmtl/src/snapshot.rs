//! Frozen model copies used as distillation teachers

use crate::config::ModelConfig;
use crate::error::Result;
use crate::model::{HyperCmtl, TaskModel};
use crate::tensor::GeneratedParameterSet;
use ndarray::Array2;

/// Detached, read-only copy of a model
///
/// The copy shares no storage with its source, and nothing here hands out
/// mutable access, so later training cannot change a snapshot's outputs.
#[derive(Debug, Clone)]
pub struct ModelSnapshot<M = HyperCmtl> {
    model: M,
}

impl<M: TaskModel + Clone> ModelSnapshot<M> {
    pub(crate) fn capture(model: &M) -> Self {
        Self { model: model.clone() }
    }

    /// Inference-mode logits for `task_id`
    pub fn forward(&self, input: &Array2<f32>, task_id: usize) -> Result<Array2<f32>> {
        self.model.forward(input, task_id)
    }
}

impl ModelSnapshot<HyperCmtl> {
    /// Generated head parameters of `task_id` at capture time
    pub fn get_parameters(&self, task_id: usize) -> Result<GeneratedParameterSet> {
        self.model.get_parameters(task_id)
    }

    /// Config of the captured model
    pub fn config(&self) -> &ModelConfig {
        self.model.config()
    }
}

/// Holds at most one snapshot; capturing replaces the previous one
#[derive(Debug)]
pub struct SnapshotManager<M = HyperCmtl> {
    current: Option<ModelSnapshot<M>>,
    captured_after: Option<usize>,
}

impl<M> Default for SnapshotManager<M> {
    fn default() -> Self {
        Self {
            current: None,
            captured_after: None,
        }
    }
}

impl<M: TaskModel + Clone> SnapshotManager<M> {
    /// Empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `model` right after training `task_id`, discarding the old snapshot
    pub fn capture(&mut self, model: &M, task_id: usize) {
        if let Some(previous) = self.captured_after {
            tracing::debug!(previous, task_id, "replacing snapshot");
        }
        self.current = Some(ModelSnapshot::capture(model));
        self.captured_after = Some(task_id);
    }

    /// Current snapshot, if any
    pub fn current(&self) -> Option<&ModelSnapshot<M>> {
        self.current.as_ref()
    }

    /// Task after which the current snapshot was taken
    pub fn captured_after(&self) -> Option<usize> {
        self.captured_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::ParameterSourceMut;

    fn model() -> HyperCmtl {
        HyperCmtl::new(ModelConfig {
            input_dim: 4,
            embedding_dim: 8,
            hypernetwork_hidden_width: 8,
            head_hidden_width: 6,
            ..ModelConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_snapshot_matches_then_stays_fixed() {
        let mut live = model();
        let snapshot = live.snapshot();
        let x = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32 * 0.1);

        let before = snapshot.forward(&x, 0).unwrap();
        assert_eq!(before, live.forward(&x, 0).unwrap());

        live.visit_parameters_mut(&mut |_, mut v| v.mapv_inplace(|w| w + 0.05));
        assert_ne!(live.forward(&x, 0).unwrap(), before);
        assert_eq!(snapshot.forward(&x, 0).unwrap(), before);
    }

    #[test]
    fn test_manager_keeps_one() {
        let live = model();
        let mut manager: SnapshotManager = SnapshotManager::new();
        assert!(manager.current().is_none());

        manager.capture(&live, 0);
        let x = Array2::from_elem((2, 4), 0.5);
        let first = manager.current().unwrap().forward(&x, 0).unwrap();

        let mut moved = live.clone();
        moved.visit_parameters_mut(&mut |_, mut v| v.mapv_inplace(|w| w * 2.0));
        manager.capture(&moved, 1);
        assert_eq!(manager.captured_after(), Some(1));
        assert_ne!(manager.current().unwrap().forward(&x, 0).unwrap(), first);
    }
}
