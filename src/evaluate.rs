use std::fmt;
use std::path::Path;

use ndarray::parallel::prelude::*;
use ndarray::prelude::*;
use ndarray_npy::read_npy;

use crate::errors::{EnsembleError, Result};
use crate::traits::ReplicaPredictor;

const PROBABILITY_FLOOR: f32 = 1e-7;

/// Labelled patches used to sanity-check a replica before it predicts.
///
/// `patches` is `(N, P, P, C_in)`, `labels` is `(N, P, P)` class indices.
#[derive(Debug, Clone)]
pub struct LabeledPatches {
    patches: Array4<f32>,
    labels: Array3<u8>,
}

impl LabeledPatches {
    pub fn new(patches: Array4<f32>, labels: Array3<u8>) -> Result<Self> {
        let (n, h, w, _) = patches.dim();
        if labels.dim() != (n, h, w) {
            return Err(EnsembleError::shape_mismatch(
                "labelled patch set",
                (n, h, w),
                labels.dim(),
            ));
        }
        Ok(Self { patches, labels })
    }

    pub fn load(patches_path: &Path, labels_path: &Path) -> Result<Self> {
        let patches: Array4<f32> = read_npy(patches_path).map_err(|e| EnsembleError::Artifact {
            path: patches_path.to_path_buf(),
            operation: "read evaluation patches".to_string(),
            source: Box::new(e),
        })?;
        let labels: Array3<u8> = read_npy(labels_path).map_err(|e| EnsembleError::Artifact {
            path: labels_path.to_path_buf(),
            operation: "read evaluation labels".to_string(),
            source: Box::new(e),
        })?;
        Self::new(patches, labels)
    }

    pub fn len(&self) -> usize {
        self.patches.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    /// Mean per-pixel categorical cross-entropy.
    pub loss: f64,
    pub accuracy: f64,
    pub patches: usize,
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} patches - loss: {:.4} - accuracy: {:.4}",
            self.patches, self.loss, self.accuracy
        )
    }
}

#[derive(Default, Clone, Copy)]
struct Tally {
    loss: f64,
    correct: u64,
    pixels: u64,
}

impl Tally {
    fn merge(self, other: Self) -> Self {
        Self {
            loss: self.loss + other.loss,
            correct: self.correct + other.correct,
            pixels: self.pixels + other.pixels,
        }
    }
}

/// Runs `steps` full batches (`len / batch_size` when `None`, as the training
/// scripts do) and reports loss and pixel accuracy.
pub fn evaluate<P: ReplicaPredictor + ?Sized>(
    predictor: &P,
    set: &LabeledPatches,
    batch_size: usize,
    steps: Option<usize>,
) -> Result<EvalReport> {
    let batch_size = batch_size.max(1);
    let steps = steps
        .unwrap_or(set.len() / batch_size)
        .min(set.len().div_ceil(batch_size));
    let n_classes = predictor.n_classes();

    let mut total = Tally::default();
    let mut patches = 0;
    for (batch, labels) in set
        .patches
        .axis_chunks_iter(Axis(0), batch_size)
        .zip(set.labels.axis_chunks_iter(Axis(0), batch_size))
        .take(steps)
    {
        let probs = predictor.predict_on_batch(batch)?;
        let expected = (labels.dim().0, labels.dim().1, labels.dim().2, n_classes);
        if probs.dim() != expected {
            return Err(EnsembleError::shape_mismatch(
                "evaluation output",
                expected,
                probs.dim(),
            ));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= n_classes) {
            return Err(EnsembleError::configuration(format!(
                "label {} out of range for {} classes",
                bad, n_classes
            )));
        }

        let tally = probs
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(labels.axis_iter(Axis(0)).into_par_iter())
            .map(|(patch, truth)| score_patch(patch, truth))
            .reduce(Tally::default, Tally::merge);
        total = total.merge(tally);
        patches += labels.dim().0;
    }

    if total.pixels == 0 {
        return Err(EnsembleError::configuration(
            "evaluation set yields no full batch",
        ));
    }
    Ok(EvalReport {
        loss: total.loss / total.pixels as f64,
        accuracy: total.correct as f64 / total.pixels as f64,
        patches,
    })
}

fn score_patch(probs: ArrayView3<f32>, truth: ArrayView2<u8>) -> Tally {
    let mut tally = Tally::default();
    for ((y, x), &label) in truth.indexed_iter() {
        let pixel = probs.slice(s![y, x, ..]);
        let p = pixel[label as usize].max(PROBABILITY_FLOOR);
        tally.loss -= f64::from(p.ln());
        let argmax = pixel
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            })
            .0;
        if argmax == label as usize {
            tally.correct += 1;
        }
        tally.pixels += 1;
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ConstantPredictor;

    fn one_hot_set(n: usize, p: usize, label: u8) -> LabeledPatches {
        LabeledPatches::new(
            Array4::zeros((n, p, p, 1)),
            Array3::from_elem((n, p, p), label),
        )
        .unwrap()
    }

    #[test]
    fn test_perfect_predictor_has_full_accuracy() -> Result<()> {
        let predictor = ConstantPredictor::one_hot(3, 2);
        let report = evaluate(&predictor, &one_hot_set(5, 4, 2), 2, None)?;

        assert_eq!(report.patches, 4);
        assert_eq!(report.accuracy, 1.0);
        assert!(report.loss < 1e-6);
        Ok(())
    }

    #[test]
    fn test_uniform_predictor_loss() -> Result<()> {
        let predictor = ConstantPredictor::new(0.5, 2);
        let report = evaluate(&predictor, &one_hot_set(4, 3, 1), 4, Some(1))?;

        assert!((report.loss - std::f64::consts::LN_2).abs() < 1e-6);
        // ties resolve to the first class
        assert_eq!(report.accuracy, 0.0);
        Ok(())
    }

    #[test]
    fn test_rejects_out_of_range_labels() {
        let predictor = ConstantPredictor::new(0.5, 2);
        let result = evaluate(&predictor, &one_hot_set(2, 3, 5), 1, None);
        assert!(matches!(result, Err(EnsembleError::Configuration { .. })));
    }

    #[test]
    fn test_rejects_mismatched_labels() {
        let result = LabeledPatches::new(Array4::zeros((2, 4, 4, 3)), Array3::zeros((2, 4, 5)));
        assert!(matches!(result, Err(EnsembleError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_set_smaller_than_batch_is_an_error() {
        let predictor = ConstantPredictor::new(0.5, 2);
        let result = evaluate(&predictor, &one_hot_set(1, 3, 0), 4, None);
        assert!(result.is_err());
    }
}
