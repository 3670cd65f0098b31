use serde::{Deserialize, Serialize};

use crate::model::{predict_rows, Regressor};
use crate::sequence::{TrainingDataset, ValueRange};
use crate::GapFillError;

/// Mean squared and mean absolute error of a model on a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub samples: usize,
    pub mse: f64,
    pub mae: f64,
}

/// Errors expressed relative to a reference magnitude.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetrics {
    pub loss: f64,
    pub mae: f64,
    pub loss_pct: f64,
    pub mae_pct: f64,
}

impl RegressionMetrics {
    fn relative_to(&self, reference: f64) -> Option<NormalizedMetrics> {
        if reference == 0.0 || !reference.is_finite() {
            return None;
        }
        let loss = self.mse / reference;
        let mae = self.mae / reference;
        Some(NormalizedMetrics {
            loss,
            mae,
            loss_pct: loss * 100.0,
            mae_pct: mae * 100.0,
        })
    }

    /// Normalized by the largest value of the reference data.
    pub fn normalized_by_max(&self, range: &ValueRange) -> Option<NormalizedMetrics> {
        self.relative_to(range.max)
    }

    /// Normalized by the spread of the reference data.
    pub fn normalized_by_range(&self, range: &ValueRange) -> Option<NormalizedMetrics> {
        self.relative_to(range.span())
    }
}

pub fn evaluate<R: Regressor + ?Sized>(
    model: &R,
    dataset: &TrainingDataset,
) -> Result<RegressionMetrics, GapFillError> {
    if dataset.is_empty() {
        return Err(GapFillError::InsufficientData);
    }
    let predictions = predict_rows(model, &dataset.windows);
    let residuals = &predictions - &dataset.targets;
    let n = dataset.len() as f64;
    Ok(RegressionMetrics {
        samples: dataset.len(),
        mse: residuals.mapv(|r| r * r).sum() / n,
        mae: residuals.mapv(f64::abs).sum() / n,
    })
}
