//! Hard-label loss and accuracy

use crate::error::{HyperCmtlError, Result};
use ndarray::{Array2, Axis};

/// Row-wise softmax of `logits / temperature`, computed stably
pub fn softmax(logits: &Array2<f32>, temperature: f32) -> Array2<f32> {
    let mut out = logits.mapv(|x| x / temperature);
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    out
}

/// Index of the largest logit per row
pub fn argmax_rows(logits: &Array2<f32>) -> Vec<usize> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, max), (i, &x)| {
                    if x > max {
                        (i, x)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect()
}

fn check_labels(logits: &Array2<f32>, labels: &[usize]) -> Result<()> {
    if logits.nrows() != labels.len() {
        return Err(HyperCmtlError::dimension_mismatch(logits.nrows(), labels.len()));
    }
    if labels.is_empty() {
        return Err(HyperCmtlError::invalid_input("empty batch"));
    }
    let classes = logits.ncols();
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(HyperCmtlError::invalid_input(format!(
            "label {} out of range for {} classes",
            bad, classes
        )));
    }
    Ok(())
}

/// Mean softmax cross-entropy and its gradient w.r.t. the logits
///
/// # Returns
/// `(loss, d loss / d logits)` where the gradient already includes the `1/batch` factor
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<(f32, Array2<f32>)> {
    check_labels(logits, labels)?;
    let batch = labels.len() as f32;
    let probs = softmax(logits, 1.0);

    let loss = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| -probs[[i, label]].max(f32::MIN_POSITIVE).ln())
        .sum::<f32>()
        / batch;

    let mut grad = probs;
    for (i, &label) in labels.iter().enumerate() {
        grad[[i, label]] -= 1.0;
    }
    grad.mapv_inplace(|g| g / batch);
    Ok((loss, grad))
}

/// Fraction of rows whose argmax equals the label
pub fn accuracy(logits: &Array2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = argmax_rows(logits)
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    correct as f32 / labels.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let p = softmax(&arr2(&[[1.0, 2.0, 3.0], [1000.0, 1000.0, 0.0]]), 2.0);
        for row in p.axis_iter(Axis(0)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_relative_eq!(p[[1, 0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let (loss, grad) = cross_entropy(&Array2::zeros((2, 4)), &[0, 3]).unwrap();
        assert_relative_eq!(loss, 4.0f32.ln(), epsilon = 1e-6);
        assert_relative_eq!(grad[[0, 0]], (0.25 - 1.0) / 2.0, epsilon = 1e-6);
        assert_relative_eq!(grad[[0, 1]], 0.25 / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cross_entropy_rejects_bad_labels() {
        assert!(cross_entropy(&Array2::zeros((1, 2)), &[2]).is_err());
        assert!(cross_entropy(&Array2::zeros((2, 2)), &[0]).is_err());
    }

    #[test]
    fn test_accuracy() {
        let logits = arr2(&[[2.0, 1.0], [0.0, 3.0], [5.0, 1.0]]);
        assert_relative_eq!(accuracy(&logits, &[0, 1, 1]), 2.0 / 3.0);
        assert_eq!(argmax_rows(&logits), vec![0, 1, 0]);
    }
}
