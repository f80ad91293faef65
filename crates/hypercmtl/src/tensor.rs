//! Named tensor collections.
//!
//! Generated parameter sets, gradients, Fisher scores, anchors and checkpoint
//! payloads are all maps from a parameter name to an `f32` tensor. They share
//! one ordered container so iteration order is deterministic everywhere.

use crate::error::{HyperCmtlError, Result};
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, ArrayViewMutD, Ix2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered mapping from parameter name to tensor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorMap {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

/// Parameters produced by the hypernetwork for one task.
///
/// Keys follow the functional head schema (`projection.weight`, ...). The set
/// is recomputed on every call and never stored by the model.
pub type GeneratedParameterSet = TensorMap;

/// Sparse gradient map: only parameters that received a gradient appear.
pub type Gradients = TensorMap;

impl TensorMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, returning the previous value under that name
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Get a tensor by name
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Get a mutable tensor by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    /// Remove a tensor by name
    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    /// Whether a name is present
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Number of named tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Iterate over `(name, tensor)` pairs in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate mutably over `(name, tensor)` pairs
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ArrayD<f32>)> {
        self.tensors.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Shape of every tensor
    pub fn shapes(&self) -> BTreeMap<String, Vec<usize>> {
        self.tensors
            .iter()
            .map(|(k, v)| (k.clone(), v.shape().to_vec()))
            .collect()
    }

    /// Total number of scalars across all tensors
    pub fn numel(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// Add `tensor` into the entry `name`, inserting it if absent
    pub fn accumulate(&mut self, name: &str, tensor: ArrayD<f32>) -> Result<()> {
        match self.tensors.get_mut(name) {
            Some(existing) => {
                if existing.shape() != tensor.shape() {
                    return Err(HyperCmtlError::shape_mismatch(
                        name,
                        existing.shape(),
                        tensor.shape(),
                    ));
                }
                *existing += &tensor;
            }
            None => {
                self.tensors.insert(name.to_string(), tensor);
            }
        }
        Ok(())
    }

    /// Add `scale * other` into this map entry by entry
    pub fn merge_scaled(&mut self, other: &TensorMap, scale: f32) -> Result<()> {
        for (name, tensor) in other.iter() {
            match self.tensors.get_mut(name) {
                Some(existing) => {
                    if existing.shape() != tensor.shape() {
                        return Err(HyperCmtlError::shape_mismatch(
                            name,
                            existing.shape(),
                            tensor.shape(),
                        ));
                    }
                    existing.scaled_add(scale, tensor);
                }
                None => {
                    self.tensors.insert(name.to_string(), tensor * scale);
                }
            }
        }
        Ok(())
    }

    /// Multiply every tensor by `factor`
    pub fn scale(&mut self, factor: f32) {
        for tensor in self.tensors.values_mut() {
            tensor.mapv_inplace(|x| x * factor);
        }
    }

    /// A map with the same names and shapes, filled with zeros
    pub fn zeros_like(&self) -> TensorMap {
        self.tensors
            .iter()
            .map(|(k, v)| (k.clone(), ArrayD::zeros(v.raw_dim())))
            .collect()
    }

    /// Sum of squares of every element
    pub fn squared_norm(&self) -> f32 {
        self.tensors
            .values()
            .map(|t| t.iter().map(|x| x * x).sum::<f32>())
            .sum()
    }

    /// Whether every element is finite
    pub fn is_finite(&self) -> bool {
        self.tensors
            .values()
            .all(|t| t.iter().all(|x| x.is_finite()))
    }

    /// Rescale so the global L2 norm does not exceed `max_norm`.
    ///
    /// Returns the norm measured before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.squared_norm().sqrt();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }
}

impl FromIterator<(String, ArrayD<f32>)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, ArrayD<f32>);
    type IntoIter = std::collections::btree_map::IntoIter<String, ArrayD<f32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

/// Read access to a set of named parameters
pub trait ParameterSource {
    /// Call `f` once per parameter, in a stable order
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>));
}

/// Write access to a set of named parameters
pub trait ParameterSourceMut {
    /// Call `f` once per parameter with a mutable view, in a stable order
    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>));
}

impl ParameterSource for TensorMap {
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for (name, tensor) in self.tensors.iter() {
            f(name, tensor.view());
        }
    }
}

impl ParameterSourceMut for TensorMap {
    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for (name, tensor) in self.tensors.iter_mut() {
            f(name, tensor.view_mut());
        }
    }
}

/// Collect every parameter of a source into an owned map
pub fn collect_parameters<P: ParameterSource + ?Sized>(source: &P) -> TensorMap {
    let mut out = TensorMap::new();
    source.visit_parameters(&mut |name, value| {
        out.insert(name, value.to_owned());
    });
    out
}

/// View a named tensor as a matrix, checking its exact shape
pub(crate) fn as_matrix<'a>(
    name: &str,
    tensor: ArrayViewD<'a, f32>,
    expected: [usize; 2],
) -> Result<ArrayView2<'a, f32>> {
    if tensor.shape() != expected {
        return Err(HyperCmtlError::shape_mismatch(name, &expected, tensor.shape()));
    }
    Ok(tensor.into_dimensionality::<Ix2>()?)
}

/// Flatten a tensor into a single-row matrix (row-major element order)
pub(crate) fn to_row(tensor: &ArrayD<f32>) -> Array2<f32> {
    let data: Vec<f32> = tensor.iter().copied().collect();
    let n = data.len();
    Array2::from_shape_vec((1, n), data).unwrap_or_else(|_| Array2::zeros((1, n)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, IxDyn};

    #[test]
    fn test_accumulate_inserts_then_adds() {
        let mut map = TensorMap::new();
        map.accumulate("w", arr1(&[1.0, 2.0]).into_dyn()).unwrap();
        map.accumulate("w", arr1(&[0.5, 0.5]).into_dyn()).unwrap();
        assert_eq!(map.get("w").unwrap().as_slice().unwrap(), &[1.5, 2.5]);
    }

    #[test]
    fn test_accumulate_shape_mismatch() {
        let mut map = TensorMap::new();
        map.insert("w", ArrayD::zeros(IxDyn(&[2])));
        let result = map.accumulate("w", ArrayD::zeros(IxDyn(&[3])));
        assert!(matches!(result, Err(HyperCmtlError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_merge_scaled() {
        let mut a = TensorMap::new();
        a.insert("x", arr1(&[1.0, 1.0]).into_dyn());
        let mut b = TensorMap::new();
        b.insert("x", arr1(&[2.0, 4.0]).into_dyn());
        b.insert("y", arr1(&[1.0]).into_dyn());

        a.merge_scaled(&b, 0.5).unwrap();

        assert_eq!(a.get("x").unwrap().as_slice().unwrap(), &[2.0, 3.0]);
        assert_eq!(a.get("y").unwrap().as_slice().unwrap(), &[0.5]);
    }

    #[test]
    fn test_clip_global_norm() {
        let mut map = TensorMap::new();
        map.insert("a", arr1(&[3.0, 4.0]).into_dyn());
        let norm = map.clip_global_norm(1.0);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((map.squared_norm().sqrt() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_as_matrix_checks_shape() {
        let t = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn();
        assert!(as_matrix("m", t.view(), [2, 3]).is_ok());
        assert!(as_matrix("m", t.view(), [3, 2]).is_err());
    }

    #[test]
    fn test_to_row_preserves_order() {
        let t = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let row = to_row(&t);
        assert_eq!(row.shape(), &[1, 4]);
        assert_eq!(row.as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
