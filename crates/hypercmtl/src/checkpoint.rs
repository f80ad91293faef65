//! Model checkpoints
//!
//! A checkpoint is the construction config plus every parameter (frozen
//! backbone included), encoded with `bincode` over `serde`. Restoring builds a
//! fresh model from the config and overwrites its parameters, so a checkpoint
//! never carries optimizer state, snapshots or Fisher anchors.

use crate::config::ModelConfig;
use crate::error::{HyperCmtlError, Result};
use crate::model::HyperCmtl;
use crate::tensor::TensorMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Current checkpoint layout version
pub const FORMAT_VERSION: u32 = 1;

/// Serializable model state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Layout version, checked on load
    pub format_version: u32,
    /// Config the model was built with
    pub config: ModelConfig,
    /// Every named parameter
    pub parameters: TensorMap,
}

impl ModelState {
    /// Encode to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| HyperCmtlError::serialization(e.to_string()))
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (state, _): (Self, usize) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| HyperCmtlError::serialization(e.to_string()))?;
        if state.format_version != FORMAT_VERSION {
            return Err(HyperCmtlError::serialization(format!(
                "checkpoint format {} is not supported (expected {})",
                state.format_version, FORMAT_VERSION
            )));
        }
        Ok(state)
    }

    /// Write to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), &bytes)?;
        debug!(path = %path.as_ref().display(), bytes = bytes.len(), "saved checkpoint");
        Ok(())
    }

    /// Read from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

impl HyperCmtl {
    /// Capture config and every parameter
    pub fn state(&self) -> ModelState {
        let mut parameters = TensorMap::new();
        self.visit_all_parameters(&mut |name, value| {
            parameters.insert(name, value.to_owned());
        });
        ModelState {
            format_version: FORMAT_VERSION,
            config: self.config().clone(),
            parameters,
        }
    }

    /// Build a model from a checkpoint
    pub fn from_state(state: &ModelState) -> Result<Self> {
        let mut model = HyperCmtl::new(state.config.clone())?;
        model.load_parameters(&state.parameters)?;
        Ok(model)
    }

    /// Overwrite parameters from a checkpoint taken from an identically configured model
    pub fn load_state(&mut self, state: &ModelState) -> Result<()> {
        if &state.config != self.config() {
            return Err(HyperCmtlError::config("checkpoint was taken from a differently configured model"));
        }
        self.load_parameters(&state.parameters)
    }

    /// Overwrite every parameter from `parameters`.
    ///
    /// # Errors
    /// Fails, leaving the model unchanged, unless `parameters` holds exactly
    /// the model's names with matching shapes.
    pub fn load_parameters(&mut self, parameters: &TensorMap) -> Result<()> {
        let mut expected: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        self.visit_all_parameters(&mut |name, value| {
            expected.insert(name.to_string(), value.shape().to_vec());
        });

        for (name, shape) in &expected {
            let tensor = parameters
                .get(name)
                .ok_or_else(|| HyperCmtlError::invalid_input(format!("checkpoint is missing '{}'", name)))?;
            if tensor.shape() != shape.as_slice() {
                return Err(HyperCmtlError::shape_mismatch(name.as_str(), shape, tensor.shape()));
            }
        }
        if let Some(extra) = parameters.names().find(|n| !expected.contains_key(*n)) {
            return Err(HyperCmtlError::invalid_input(format!(
                "checkpoint has unknown parameter '{}'",
                extra
            )));
        }

        self.visit_all_parameters_mut(&mut |name, mut value| {
            if let Some(tensor) = parameters.get(name) {
                value.assign(tensor);
            }
        });
        Ok(())
    }
}
