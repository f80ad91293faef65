//! Error types for HyperCMTL

use thiserror::Error;

/// Result type alias for HyperCMTL operations
pub type Result<T> = std::result::Result<T, HyperCmtlError>;

/// Main error type for HyperCMTL
#[derive(Error, Debug)]
pub enum HyperCmtlError {
    /// Invalid or unsupported configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task id outside the fixed embedding table
    #[error("Task id {task_id} is out of range for capacity {capacity}")]
    Capacity {
        /// Requested task id
        task_id: usize,
        /// Fixed number of task slots
        capacity: usize,
    },

    /// A named tensor does not have the shape its consumer expects
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape required by the consumer
        expected: Vec<usize>,
        /// Shape that was supplied
        actual: Vec<usize>,
    },

    /// Vector or matrix dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// NaN or infinity detected where a finite value is required
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Checkpoint or config (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HyperCmtlError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a capacity error
    pub fn capacity(task_id: usize, capacity: usize) -> Self {
        Self::Capacity { task_id, capacity }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a dimension mismatch error
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a numerical error
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for HyperCmtlError {
    fn from(err: serde_json::Error) -> Self {
        HyperCmtlError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for HyperCmtlError {
    fn from(err: ndarray::ShapeError) -> Self {
        HyperCmtlError::InvalidInput(format!("ndarray shape error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message() {
        let err = HyperCmtlError::capacity(7, 5);
        assert_eq!(err.to_string(), "Task id 7 is out of range for capacity 5");
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = HyperCmtlError::shape_mismatch("projection.weight", &[4, 8], &[8, 4]);
        assert!(err.to_string().contains("projection.weight"));
        assert!(err.to_string().contains("[4, 8]"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: HyperCmtlError = io.into();
        assert!(matches!(err, HyperCmtlError::Io(_)));
    }
}
