use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::sequence::{TrainingDataset, ValueRange};
use crate::GapFillError;

/// A trained sequence regressor: one conditioning window in, one value out.
///
/// Implementations are called concurrently from worker threads and must
/// behave as a pure function of the window.
pub trait Regressor: Sync {
    fn predict(&self, window: &[f64]) -> f64;

    /// Predict every row of `windows`.
    fn predict_batch(&self, windows: ArrayView2<f64>) -> Vec<f64> {
        windows
            .outer_iter()
            .map(|row| match row.as_slice() {
                Some(slice) => self.predict(slice),
                None => self.predict(&row.to_vec()),
            })
            .collect()
    }
}

/// Always predicts the same value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantRegressor(pub f64);

impl Regressor for ConstantRegressor {
    fn predict(&self, _window: &[f64]) -> f64 {
        self.0
    }
}

/// Adapts a closure into a [`Regressor`].
pub struct FnRegressor<F>(pub F);

impl<F> Regressor for FnRegressor<F>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    fn predict(&self, window: &[f64]) -> f64 {
        (self.0)(window)
    }
}

/// Linear autoregression `bias + weights · window`, fitted by ridge least
/// squares. Serves as the reference model when no external one is supplied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Min-max transform the weights were fitted under. Inputs are scaled
    /// with it and predictions mapped back.
    #[serde(default)]
    pub scaler: Option<ValueRange>,
}

impl LinearRegressor {
    /// Solve `(XᵀX + λI) β = Xᵀy` with `X` augmented by a bias column.
    pub fn fit(dataset: &TrainingDataset, ridge_lambda: f64) -> Result<Self, GapFillError> {
        if dataset.is_empty() {
            return Err(GapFillError::InsufficientData);
        }
        let n = dataset.len();
        let l = dataset.sequence_length();

        let mut design = Array2::<f64>::ones((n, l + 1));
        design.slice_mut(s![.., ..l]).assign(&dataset.windows);

        let mut gram = design.t().dot(&design);
        for i in 0..=l {
            gram[[i, i]] += ridge_lambda;
        }
        let rhs = design.t().dot(&dataset.targets);
        let beta = solve_linear_system(gram, rhs)?;

        Ok(Self {
            weights: beta.iter().take(l).copied().collect(),
            bias: beta[l],
            scaler: None,
        })
    }

    /// Attach the transform the training data was normalized with.
    pub fn with_scaler(mut self, scaler: ValueRange) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn sequence_length(&self) -> usize {
        self.weights.len()
    }
}

impl Regressor for LinearRegressor {
    /// # Panics
    ///
    /// Panics if `window` does not hold exactly one value per weight.
    fn predict(&self, window: &[f64]) -> f64 {
        assert_eq!(
            window.len(),
            self.weights.len(),
            "window length does not match the fitted sequence length"
        );
        match self.scaler {
            Some(range) => {
                let raw = self.bias
                    + self
                        .weights
                        .iter()
                        .zip(window)
                        .map(|(w, &x)| w * range.scale(x))
                        .sum::<f64>();
                range.unscale(raw)
            }
            None => {
                self.bias
                    + self
                        .weights
                        .iter()
                        .zip(window)
                        .map(|(w, x)| w * x)
                        .sum::<f64>()
            }
        }
    }
}

/// Gaussian elimination with partial pivoting.
fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>, GapFillError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-12 {
            return Err(GapFillError::InvalidParameter(
                "training system is singular; increase ridge_lambda".into(),
            ));
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Ok(x)
}

/// On-disk form of a trained baseline model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    /// Fingerprint of the configuration the model was trained under.
    pub config_fingerprint: String,
    pub sequence_length: usize,
    pub regressor: LinearRegressor,
}

impl SavedModel {
    pub fn new(regressor: LinearRegressor, config_fingerprint: String) -> Self {
        Self {
            config_fingerprint,
            sequence_length: regressor.sequence_length(),
            regressor,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), GapFillError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| GapFillError::InvalidParameter(e.to_string()))?;
        fs::write(path, text).map_err(|source| GapFillError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, GapFillError> {
        let text = fs::read_to_string(path).map_err(|source| GapFillError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model: SavedModel = serde_json::from_str(&text).map_err(|e| GapFillError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if model.regressor.sequence_length() != model.sequence_length {
            return Err(GapFillError::ShapeMismatch(format!(
                "{} declares sequence_length {} but carries {} weights",
                path.display(),
                model.sequence_length,
                model.regressor.sequence_length()
            )));
        }
        Ok(model)
    }
}

/// Convenience for tests and callers holding many windows at once.
pub fn predict_rows<R: Regressor + ?Sized>(model: &R, windows: &Array2<f64>) -> Array1<f64> {
    Array1::from_vec(model.predict_batch(windows.view()))
}
