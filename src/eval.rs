//! Result Postprocessor.
//!
//! Ranks a score vector, records the top-ranked class against the true label
//! in a [`ConfusionMatrix`], and summarises a run as an [`Evaluation`].
//!
//! The matrix is mutated from one call site per sample. When samples run in
//! parallel ([`evaluate_parallel`]) every worker fills its own matrix and the
//! partial matrices are merged at the end, so no cell is written
//! concurrently.

use core::fmt;

use rayon::prelude::*;
use tracing::{info, trace};

use crate::config::EvalConfig;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::tensors::{FeatureMap, TensorFloat};

/// Pairs `labels` with `scores` and orders them by descending score.
///
/// Bubble passes swap neighbours only when the left score is strictly lower,
/// so equal scores keep their input order. A NaN compares lower than nothing
/// and nothing compares lower than it, so a NaN never moves on its own and
/// the ranking does not depend on the NaN's sign bit. The first pair is the
/// prediction.
///
/// # Errors
/// [`Error::LengthMismatch`] if the slices differ in length.
///
/// # Example
/// ```
/// use pico_cnn::eval::sort_prediction;
/// let ranked = sort_prediction(&[0.1, 0.7, 0.2], &[0, 1, 2]).unwrap();
/// assert_eq!(ranked, vec![(1, 0.7), (2, 0.2), (0, 0.1)]);
/// ```
pub fn sort_prediction(
    scores: &[TensorFloat],
    labels: &[usize],
) -> Result<Vec<(usize, TensorFloat)>> {
    if scores.len() != labels.len() {
        return Err(Error::LengthMismatch {
            op: "sort_prediction",
            expected: scores.len(),
            got: labels.len(),
        });
    }
    let mut ranked: Vec<_> = labels.iter().copied().zip(scores.iter().copied()).collect();
    for pass in 1..ranked.len() {
        for j in 0..ranked.len() - pass {
            if ranked[j].1 < ranked[j + 1].1 {
                ranked.swap(j, j + 1);
            }
        }
    }
    Ok(ranked)
}

/// Counts of (predicted class, actual class) pairs.
///
/// Rows are predicted classes, columns are actual classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    classes: usize,
    cells: Vec<u64>,
}

impl ConfusionMatrix {
    /// An all-zero `classes × classes` matrix.
    #[must_use]
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            cells: vec![0; classes * classes],
        }
    }

    /// Number of classes.
    #[must_use]
    pub const fn classes(&self) -> usize {
        self.classes
    }

    /// Increments cell `(predicted, actual)`.
    ///
    /// # Errors
    /// [`Error::ClassOutOfRange`] if either class is not below [`classes`](Self::classes).
    pub fn record(&mut self, predicted: usize, actual: usize) -> Result<()> {
        for class in [predicted, actual] {
            if class >= self.classes {
                return Err(Error::ClassOutOfRange {
                    class,
                    classes: self.classes,
                });
            }
        }
        self.cells[predicted * self.classes + actual] += 1;
        Ok(())
    }

    /// Count in cell `(predicted, actual)`, or `None` outside the matrix.
    #[must_use]
    pub fn get(&self, predicted: usize, actual: usize) -> Option<u64> {
        if predicted < self.classes && actual < self.classes {
            Some(self.cells[predicted * self.classes + actual])
        } else {
            None
        }
    }

    /// Samples predicted as `predicted`.
    #[must_use]
    pub fn row_sum(&self, predicted: usize) -> u64 {
        if predicted >= self.classes {
            return 0;
        }
        self.cells[predicted * self.classes..(predicted + 1) * self.classes]
            .iter()
            .sum()
    }

    /// Samples whose true class is `actual`.
    #[must_use]
    pub fn column_sum(&self, actual: usize) -> u64 {
        if actual >= self.classes {
            return 0;
        }
        self.cells.iter().skip(actual).step_by(self.classes).sum()
    }

    /// All recorded samples.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.cells.iter().sum()
    }

    /// Samples on the diagonal.
    #[must_use]
    pub fn correct(&self) -> u64 {
        (0..self.classes)
            .map(|c| self.cells[c * self.classes + c])
            .sum()
    }

    /// `1 − correct / total`, or `0` before anything was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        1.0 - self.correct() as f64 / total as f64
    }

    /// Adds every cell of `other` into `self`.
    ///
    /// # Errors
    /// [`Error::Config`] if the class counts differ.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if other.classes != self.classes {
            return Err(Error::Config(format!(
                "cannot merge a {}-class matrix into a {}-class one",
                other.classes, self.classes
            )));
        }
        for (a, b) in self.cells.iter_mut().zip(&other.cells) {
            *a += b;
        }
        Ok(())
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "columns: actual label")?;
        writeln!(f, "rows: predicted label")?;
        write!(f, "*")?;
        for c in 0..self.classes {
            write!(f, "\t{c}")?;
        }
        writeln!(f)?;
        for (p, row) in self.cells.chunks(self.classes.max(1)).enumerate() {
            write!(f, "{p}")?;
            for count in row {
                write!(f, "\t{count}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Outcome of one evaluation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Per-class counts.
    pub matrix: ConfusionMatrix,
}

impl Evaluation {
    /// Samples evaluated.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.matrix.total()
    }

    /// Correct predictions.
    #[must_use]
    pub fn correct(&self) -> u64 {
        self.matrix.correct()
    }

    /// See [`ConfusionMatrix::error_rate`].
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        self.matrix.error_rate()
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "error rate: {:.6} ({}/{})",
            self.error_rate(),
            self.correct(),
            self.samples()
        )?;
        write!(f, "{}", self.matrix)
    }
}

/// Runs `image` through `network` and returns the top-ranked class.
///
/// # Errors
/// Any forward-pass error.
pub fn classify(network: &Network, image: &FeatureMap) -> Result<usize> {
    let scores = network.forward(image.clone())?;
    let labels: Vec<usize> = (0..scores.len()).collect();
    let ranked = sort_prediction(&scores, &labels)?;
    ranked.first().map(|&(label, _)| label).ok_or(Error::LengthMismatch {
        op: "classify",
        expected: 1,
        got: 0,
    })
}

fn check(network: &Network, config: &EvalConfig) -> Result<()> {
    config.validate()?;
    if network.output_len() != config.num_classes {
        return Err(Error::Config(format!(
            "network produces {} scores for {} classes",
            network.output_len(),
            config.num_classes
        )));
    }
    Ok(())
}

fn sample_count(dataset: &Dataset, config: &EvalConfig) -> usize {
    config
        .sample_limit
        .map_or(dataset.len(), |l| l.min(dataset.len()))
}

/// Evaluates samples one after another.
///
/// # Errors
/// [`Error::Config`] if the network's output length differs from the class
/// count, [`Error::ClassOutOfRange`] for a label outside the table, and any
/// forward-pass error. The first error ends the run.
pub fn evaluate(network: &Network, dataset: &Dataset, config: &EvalConfig) -> Result<Evaluation> {
    check(network, config)?;
    let mut matrix = ConfusionMatrix::new(config.num_classes);
    for (i, (image, label)) in dataset.iter().take(sample_count(dataset, config)).enumerate() {
        let predicted = classify(network, image)?;
        trace!(sample = i, predicted, label, "classified");
        matrix.record(predicted, label)?;
    }
    let eval = Evaluation { matrix };
    info!(
        samples = eval.samples(),
        error_rate = eval.error_rate(),
        "evaluation finished"
    );
    Ok(eval)
}

/// Evaluates samples in parallel, one whole forward pass per task.
///
/// Runs inside the network executor's worker pool when it has one, so its
/// thread count bounds the sample fan-out on every backend. Each
/// worker accumulates into a private matrix; the matrices are merged once the
/// workers finish. The result equals that of [`evaluate`].
///
/// # Errors
/// Same as [`evaluate`].
pub fn evaluate_parallel(
    network: &Network,
    dataset: &Dataset,
    config: &EvalConfig,
) -> Result<Evaluation> {
    check(network, config)?;
    let n = sample_count(dataset, config);
    let classes = config.num_classes;
    let matrix = network.executor().install(|| {
        dataset.images()[..n]
            .par_iter()
            .zip(&dataset.labels()[..n])
            .try_fold(
                || ConfusionMatrix::new(classes),
                |mut m, (image, &label)| {
                    m.record(classify(network, image)?, label)?;
                    Ok::<_, Error>(m)
                },
            )
            .try_reduce(
                || ConfusionMatrix::new(classes),
                |mut a, b| {
                    a.merge(&b)?;
                    Ok(a)
                },
            )
    })?;
    let eval = Evaluation { matrix };
    info!(
        samples = eval.samples(),
        error_rate = eval.error_rate(),
        "parallel evaluation finished"
    );
    Ok(eval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_keep_input_order() {
        let ranked = sort_prediction(&[0.5, 0.9, 0.5, 0.5], &[0, 1, 2, 3]).unwrap();
        let labels: Vec<_> = ranked.iter().map(|p| p.0).collect();
        assert_eq!(labels, vec![1, 0, 2, 3]);
    }

    #[test]
    fn overflowing_softmax_keeps_the_nan_in_place() {
        use crate::ops::naive::Naive;
        use crate::ops::{Kernels, SoftmaxMode};

        let mut probs = [0.0; 3];
        Naive
            .softmax(&[100.0, 0.0, 0.0], &mut probs, SoftmaxMode::Naive)
            .unwrap();
        assert!(probs[0].is_nan());
        let ranked = sort_prediction(&probs, &[0, 1, 2]).unwrap();
        assert_eq!(ranked[0].0, 0);

        for nan in [f32::NAN, -f32::NAN] {
            let ranked = sort_prediction(&[nan, 0.0, 0.0], &[0, 1, 2]).unwrap();
            let labels: Vec<_> = ranked.iter().map(|p| p.0).collect();
            assert_eq!(labels, vec![0, 1, 2]);
        }
    }

    #[test]
    fn sort_rejects_unequal_lengths() {
        assert!(sort_prediction(&[0.1, 0.2], &[0]).is_err());
    }

    #[test]
    fn sums_match_records() {
        let mut m = ConfusionMatrix::new(3);
        let pairs = [(0, 0), (1, 1), (1, 2), (2, 2), (1, 0), (0, 0)];
        for (p, a) in pairs {
            m.record(p, a).unwrap();
        }
        assert_eq!(m.total(), 6);
        assert_eq!(m.row_sum(1), 3);
        assert_eq!(m.column_sum(0), 3);
        assert_eq!(m.correct(), 4);
        assert!((m.error_rate() - (1.0 - 4.0 / 6.0)).abs() < 1e-12);
        assert_eq!(m.get(1, 2), Some(1));
        assert_eq!(m.get(3, 0), None);
    }

    #[test]
    fn record_rejects_unknown_class() {
        let mut m = ConfusionMatrix::new(2);
        let err = m.record(0, 2).unwrap_err();
        assert!(matches!(err, Error::ClassOutOfRange { class: 2, classes: 2 }));
        assert_eq!(m.total(), 0);
    }

    #[test]
    fn merge_adds_cells() {
        let mut a = ConfusionMatrix::new(2);
        let mut b = ConfusionMatrix::new(2);
        a.record(0, 1).unwrap();
        b.record(0, 1).unwrap();
        b.record(1, 1).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.get(0, 1), Some(2));
        assert_eq!(a.total(), 3);
        assert!(a.merge(&ConfusionMatrix::new(3)).is_err());
    }

    #[test]
    fn display_is_tab_separated() {
        let mut m = ConfusionMatrix::new(2);
        m.record(1, 0).unwrap();
        let text = m.to_string();
        assert!(text.contains("*\t0\t1\n"));
        assert!(text.contains("1\t1\t0\n"));
    }
}
