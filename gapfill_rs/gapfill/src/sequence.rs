use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::grid::{observed, MonthGrid, MonthlyGrids};
use crate::resolve::MissingIndexMap;
use crate::GapFillError;

/// Pooled `(window, target)` pairs. Row `i` of `windows` predicts `targets[i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingDataset {
    pub windows: Array2<f64>,
    pub targets: Array1<f64>,
}

/// Disjoint train/test partition of a [`TrainingDataset`].
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetSplit {
    pub train: TrainingDataset,
    pub test: TrainingDataset,
}

type Example = (Vec<f64>, f64);

impl TrainingDataset {
    pub fn empty(sequence_length: usize) -> Self {
        Self {
            windows: Array2::zeros((0, sequence_length)),
            targets: Array1::zeros(0),
        }
    }

    fn from_examples(examples: Vec<Example>, sequence_length: usize) -> Self {
        let mut windows = Array2::zeros((examples.len(), sequence_length));
        let mut targets = Array1::zeros(examples.len());
        for (i, (window, target)) in examples.into_iter().enumerate() {
            windows.row_mut(i).assign(&ArrayView1::from(&window[..]));
            targets[i] = target;
        }
        Self { windows, targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn sequence_length(&self) -> usize {
        self.windows.ncols()
    }

    fn select(&self, rows: &[usize]) -> Self {
        Self {
            windows: self.windows.select(Axis(0), rows),
            targets: self.targets.select(Axis(0), rows),
        }
    }

    /// Shuffle rows with a seeded RNG and hold out `ceil(len * test_fraction)`
    /// of them as the test subset.
    pub fn split(&self, test_fraction: f64, seed: u64) -> Result<DatasetSplit, GapFillError> {
        if !(0.0..1.0).contains(&test_fraction) {
            return Err(GapFillError::InvalidParameter(format!(
                "test_fraction {} must lie in [0, 1)",
                test_fraction
            )));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let n_test = (self.len() as f64 * test_fraction).ceil() as usize;
        let (test_rows, train_rows) = order.split_at(n_test.min(order.len()));
        Ok(DatasetSplit {
            train: self.select(train_rows),
            test: self.select(test_rows),
        })
    }
}

impl DatasetSplit {
    /// Apply the same min-max transform to both subsets.
    pub fn normalized(&self, range: &ValueRange) -> DatasetSplit {
        DatasetSplit {
            train: range.scale_dataset(&self.train),
            test: range.scale_dataset(&self.test),
        }
    }
}

/// Observed value range of a dataset; doubles as a min-max scaler.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    /// Range over every window value and target. `None` for an empty dataset.
    pub fn of(dataset: &TrainingDataset) -> Option<Self> {
        dataset
            .windows
            .iter()
            .chain(dataset.targets.iter())
            .fold(None, |acc: Option<ValueRange>, &v| {
                Some(match acc {
                    None => ValueRange { min: v, max: v },
                    Some(r) => ValueRange {
                        min: r.min.min(v),
                        max: r.max.max(v),
                    },
                })
            })
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Map into `[0, 1]`; a degenerate range maps everything to 0.
    pub fn scale(&self, value: f64) -> f64 {
        let span = self.span();
        if span > 0.0 {
            (value - self.min) / span
        } else {
            0.0
        }
    }

    pub fn unscale(&self, value: f64) -> f64 {
        value * self.span() + self.min
    }

    pub fn scale_dataset(&self, dataset: &TrainingDataset) -> TrainingDataset {
        TrainingDataset {
            windows: dataset.windows.mapv(|v| self.scale(v)),
            targets: dataset.targets.mapv(|v| self.scale(v)),
        }
    }
}

/// Build the training examples of one month.
///
/// Every cell contributes windows `[t, t + L)` with target `t + L` for
/// `t in 0..time_steps - L`, except candidates whose target is the month's
/// gap and candidates touching an unobserved value.
pub fn prepare_month_sequences(
    grid: &MonthGrid,
    missing_index: usize,
    sequence_length: usize,
) -> Result<TrainingDataset, GapFillError> {
    if sequence_length == 0 {
        return Err(GapFillError::InvalidParameter(
            "sequence_length must be > 0".into(),
        ));
    }
    Ok(TrainingDataset::from_examples(
        month_examples(grid, missing_index, sequence_length),
        sequence_length,
    ))
}

/// Pool the examples of every month that has a gap, in calendar order.
pub fn build_training_dataset(
    grids: &MonthlyGrids,
    missing: &MissingIndexMap,
    sequence_length: usize,
) -> Result<TrainingDataset, GapFillError> {
    if sequence_length == 0 {
        return Err(GapFillError::InvalidParameter(
            "sequence_length must be > 0".into(),
        ));
    }
    let mut pooled = Vec::new();
    for (month, &missing_index) in missing.iter() {
        let grid = grids.get(month).ok_or(GapFillError::MissingMonth(month))?;
        let examples = month_examples(grid, missing_index, sequence_length);
        debug!("month {}: {} training sequences", month, examples.len());
        pooled.extend(examples);
    }
    Ok(TrainingDataset::from_examples(pooled, sequence_length))
}

fn month_examples(grid: &MonthGrid, missing_index: usize, sequence_length: usize) -> Vec<Example> {
    let (rows, cols, steps) = grid.dim();
    if steps <= sequence_length {
        return Vec::new();
    }
    (0..rows * cols)
        .into_par_iter()
        .map(|cell| {
            let series = grid.slice(s![cell / cols, cell % cols, ..]);
            cell_examples(series, missing_index, sequence_length)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

fn cell_examples(
    series: ArrayView1<Option<f64>>,
    missing_index: usize,
    sequence_length: usize,
) -> Vec<Example> {
    let mut out = Vec::new();
    for start in 0..series.len() - sequence_length {
        let target_index = start + sequence_length;
        if target_index == missing_index {
            continue;
        }
        let Some(target) = observed(series[target_index]) else {
            continue;
        };
        let window: Option<Vec<f64>> = series
            .slice(s![start..target_index])
            .iter()
            .map(|v| observed(*v))
            .collect();
        if let Some(window) = window {
            out.push((window, target));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::month::Month;
    use ndarray::Array3;

    fn m(n: u8) -> Month {
        Month::new(n).unwrap()
    }

    /// Single-cell grid whose value at step `t` is `t`.
    fn ramp(steps: usize) -> MonthGrid {
        Array3::from_shape_fn((1, 1, steps), |(_, _, t)| Some(t as f64))
    }

    #[test]
    fn slides_every_offset_and_excludes_gap_target() {
        let grid = ramp(10);
        let ds = prepare_month_sequences(&grid, 7, 3).unwrap();
        // Offsets 0..=6 give targets 3..=9; target 7 is the gap.
        assert_eq!(ds.len(), 6);
        let targets: Vec<f64> = ds.targets.to_vec();
        assert_eq!(targets, vec![3.0, 4.0, 5.0, 6.0, 8.0, 9.0]);
        assert_eq!(ds.windows.row(0).to_vec(), vec![0.0, 1.0, 2.0]);
        // Target 8 is kept even though its window covers the gap position.
        assert_eq!(ds.windows.row(4).to_vec(), vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn missing_values_reject_candidates() {
        let mut grid = ramp(8);
        grid[[0, 0, 2]] = None;
        grid[[0, 0, 6]] = Some(f64::NAN);
        let ds = prepare_month_sequences(&grid, 0, 2).unwrap();
        for (row, &target) in ds.windows.outer_iter().zip(ds.targets.iter()) {
            assert!(row.iter().all(|v| v.is_finite()));
            assert!(target.is_finite());
        }
        // Candidates (targets 2..=7): only target 5 (window [3,4]) survives.
        assert_eq!(ds.targets.to_vec(), vec![5.0]);
    }

    #[test]
    fn no_produced_target_is_the_gap() {
        let steps = 19;
        // Value encodes the cell in the thousands and the time step below.
        let grid = Array3::from_shape_fn((3, 4, steps), |(r, c, t)| {
            Some(((r * 4 + c) * 1000 + t) as f64)
        });
        for gap in 0..steps {
            let ds = prepare_month_sequences(&grid, gap, 6).unwrap();
            let per_cell = if gap >= 6 { 12 } else { 13 };
            assert_eq!(ds.len(), 12 * per_cell);
            for (row, &target) in ds.windows.outer_iter().zip(ds.targets.iter()) {
                assert_ne!(target as usize % 1000, gap);
                assert_eq!(target, row[5] + 1.0);
            }
        }
    }

    #[test]
    fn short_series_yield_nothing() {
        let ds = prepare_month_sequences(&ramp(6), 0, 6).unwrap();
        assert!(ds.is_empty());
        assert_eq!(ds.sequence_length(), 6);
        assert!(prepare_month_sequences(&ramp(6), 0, 0).is_err());
    }

    #[test]
    fn pools_months_with_gaps_only() {
        let mut grids = MonthlyGrids::new();
        grids.insert(m(1), ramp(5)).unwrap();
        grids.insert(m(2), ramp(5)).unwrap();
        let mut missing = MissingIndexMap::new();
        missing.insert(m(2), 4);
        let ds = build_training_dataset(&grids, &missing, 2).unwrap();
        // Targets 2, 3 (4 is the gap).
        assert_eq!(ds.targets.to_vec(), vec![2.0, 3.0]);

        missing.insert(m(5), 1);
        assert!(matches!(
            build_training_dataset(&grids, &missing, 2),
            Err(GapFillError::MissingMonth(_))
        ));
    }

    #[test]
    fn split_is_deterministic_and_partitions_rows() {
        let grid = Array3::from_shape_fn((5, 5, 12), |(r, c, t)| Some((r * 1000 + c * 100 + t) as f64));
        let ds = prepare_month_sequences(&grid, 11, 3).unwrap();
        assert_eq!(ds.len(), 25 * 8);

        let a = ds.split(0.2, 42).unwrap();
        let b = ds.split(0.2, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.test.len(), 40);
        assert_eq!(a.train.len(), 160);

        let mut all: Vec<f64> = a.train.targets.iter().chain(a.test.targets.iter()).copied().collect();
        let mut original = ds.targets.to_vec();
        all.sort_by(|x, y| x.partial_cmp(y).unwrap());
        original.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(all, original);

        let c = ds.split(0.2, 7).unwrap();
        assert_ne!(a.test.targets, c.test.targets);
        assert!(ds.split(1.0, 42).is_err());
    }

    #[test]
    fn split_keeps_window_target_pairs_together() {
        let ds = prepare_month_sequences(&ramp(30), 29, 4).unwrap();
        let split = ds.split(0.25, 3).unwrap();
        for subset in [&split.train, &split.test] {
            for (row, &target) in subset.windows.outer_iter().zip(subset.targets.iter()) {
                assert_eq!(target, row[3] + 1.0);
            }
        }
    }

    #[test]
    fn normalization_uses_one_transform_for_both_subsets() {
        let ds = prepare_month_sequences(&ramp(11), 10, 2).unwrap();
        let range = ValueRange::of(&ds).unwrap();
        assert_eq!(range, ValueRange { min: 0.0, max: 9.0 });

        let split = ds.split(0.3, 1).unwrap().normalized(&range);
        for subset in [&split.train, &split.test] {
            assert!(subset.windows.iter().all(|v| (0.0..=1.0).contains(v)));
            for (row, &target) in subset.windows.outer_iter().zip(subset.targets.iter()) {
                approx::assert_abs_diff_eq!(target, row[1] + 1.0 / 9.0, epsilon = 1e-12);
            }
        }
        approx::assert_abs_diff_eq!(range.unscale(range.scale(4.5)), 4.5, epsilon = 1e-12);

        let flat = ValueRange { min: 3.0, max: 3.0 };
        assert_eq!(flat.scale(3.0), 0.0);
        assert!(ValueRange::of(&TrainingDataset::empty(3)).is_none());
    }
}
