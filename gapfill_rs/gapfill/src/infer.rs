use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{s, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::grid::{observed, MonthGrid, MonthlyGrids};
use crate::model::Regressor;
use crate::month::Month;
use crate::resolve::MissingIndexMap;
use crate::{GapFillError, MISSING_VALUE_FLAG, PAD_VALUE};

/// Receives `(completed, total)` cell counts while gaps are being filled.
/// Called from worker threads.
pub trait Progress: Sync {
    fn update(&self, completed: usize, total: usize);
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&self, _completed: usize, _total: usize) {}
}

/// Logs each crossed tenth of the work.
#[derive(Default)]
pub struct LogProgress {
    last_decile: AtomicUsize,
}

impl Progress for LogProgress {
    fn update(&self, completed: usize, total: usize) {
        if total == 0 {
            return;
        }
        let decile = completed * 10 / total;
        if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            info!("Progress: {}/{} gap cells processed", completed, total);
        }
    }
}

/// Per-month outcome of a fill pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonthFill {
    pub month: Month,
    pub index: usize,
    /// Cells whose gap value was predicted.
    pub filled: usize,
    /// Cells already observed at the gap.
    pub skipped: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub months: Vec<MonthFill>,
}

impl FillReport {
    pub fn filled(&self) -> usize {
        self.months.iter().map(|m| m.filled).sum()
    }
}

/// Window of length `sequence_length` conditioning the prediction at `index`.
///
/// Takes the values just before `index`; unobserved entries become
/// [`MISSING_VALUE_FLAG`]. When fewer than `sequence_length` values precede
/// the gap the available prefix is left-padded with [`PAD_VALUE`].
///
/// Panics if `index` lies past the end of `series`.
pub fn conditioning_window(
    series: ArrayView1<Option<f64>>,
    index: usize,
    sequence_length: usize,
) -> Vec<f64> {
    let start = index.saturating_sub(sequence_length);
    let mut window = vec![PAD_VALUE; sequence_length - (index - start)];
    window.extend(
        series
            .slice(s![start..index])
            .iter()
            .map(|v| observed(*v).unwrap_or(MISSING_VALUE_FLAG)),
    );
    assert!(
        window.len() == sequence_length && window.iter().all(|v| !v.is_nan()),
        "conditioning window for index {} is malformed: {:?}",
        index,
        window
    );
    window
}

struct WorkItem<'a> {
    slot: usize,
    grid: &'a MonthGrid,
    index: usize,
    row: usize,
    col: usize,
}

/// Predict every gap cell of every mapped month.
///
/// The input is left untouched; the returned collection differs from it only
/// at gap positions that were unobserved. Cells already observed at the gap
/// are skipped, so a second pass over a filled collection changes nothing.
pub fn fill_gaps<R, P>(
    model: &R,
    grids: &MonthlyGrids,
    missing: &MissingIndexMap,
    sequence_length: usize,
    progress: &P,
) -> Result<(MonthlyGrids, FillReport), GapFillError>
where
    R: Regressor + ?Sized,
    P: Progress + ?Sized,
{
    if sequence_length == 0 {
        return Err(GapFillError::InvalidParameter(
            "sequence_length must be > 0".into(),
        ));
    }

    let mut report = FillReport::default();
    let mut items = Vec::new();
    for (month, &index) in missing.iter() {
        let grid = grids.get(month).ok_or(GapFillError::MissingMonth(month))?;
        let (rows, cols, steps) = grid.dim();
        if index >= steps {
            return Err(GapFillError::IndexOutOfBounds {
                month,
                index,
                time_steps: steps,
            });
        }
        let slot = report.months.len();
        report.months.push(MonthFill {
            month,
            index,
            filled: 0,
            skipped: 0,
        });
        for row in 0..rows {
            for col in 0..cols {
                items.push(WorkItem {
                    slot,
                    grid,
                    index,
                    row,
                    col,
                });
            }
        }
    }

    let total = items.len();
    let completed = AtomicUsize::new(0);
    let predictions: Vec<Option<f64>> = items
        .par_iter()
        .map(|item| {
            let series = item.grid.slice(s![item.row, item.col, ..]);
            let prediction = if observed(series[item.index]).is_some() {
                None
            } else {
                let window = conditioning_window(series, item.index, sequence_length);
                Some(model.predict(&window))
            };
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            progress.update(done, total);
            prediction
        })
        .collect();

    let mut output = grids.clone();
    for (item, prediction) in items.iter().zip(predictions) {
        let entry = &mut report.months[item.slot];
        match prediction {
            Some(value) => {
                if let Some(grid) = output.get_mut(entry.month) {
                    grid[[item.row, item.col, item.index]] = Some(value);
                }
                entry.filled += 1;
            }
            None => entry.skipped += 1,
        }
    }
    for month in &report.months {
        info!(
            "Month {}: filled {} cells at step {} ({} already observed)",
            month.month, month.filled, month.index, month.skipped
        );
    }
    Ok((output, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConstantRegressor, FnRegressor};
    use ndarray::{Array1, Array3};
    use std::sync::Mutex;

    fn m(n: u8) -> Month {
        Month::new(n).unwrap()
    }

    fn series(values: &[Option<f64>]) -> Array1<Option<f64>> {
        Array1::from_vec(values.to_vec())
    }

    #[test]
    fn full_window_takes_preceding_values() {
        let mut values: Vec<Option<f64>> = (0..19).map(|t| Some(t as f64 * 1.5)).collect();
        values[11] = None;
        values[15] = None;
        let s = series(&values);
        let window = conditioning_window(s.view(), 15, 6);
        assert_eq!(
            window,
            vec![13.5, 15.0, MISSING_VALUE_FLAG, 18.0, 19.5, 21.0]
        );
    }

    #[test]
    fn short_prefix_is_left_padded() {
        let s = series(&[Some(4.0), None, None, Some(7.0)]);
        let window = conditioning_window(s.view(), 2, 6);
        assert_eq!(
            window,
            vec![PAD_VALUE, PAD_VALUE, PAD_VALUE, PAD_VALUE, 4.0, MISSING_VALUE_FLAG]
        );
        assert_ne!(PAD_VALUE, MISSING_VALUE_FLAG);

        let at_start = conditioning_window(s.view(), 0, 3);
        assert_eq!(at_start, vec![PAD_VALUE; 3]);

        let exact = conditioning_window(s.view(), 3, 3);
        assert_eq!(exact, vec![4.0, MISSING_VALUE_FLAG, MISSING_VALUE_FLAG]);
    }

    fn grids_with_gaps(constant_gap: &[(u8, usize)]) -> (MonthlyGrids, MissingIndexMap) {
        let mut grids = MonthlyGrids::new();
        let mut missing = MissingIndexMap::new();
        for &(month, gap) in constant_gap {
            let mut grid = Array3::from_shape_fn((3, 2, 19), |(r, c, t)| {
                Some(month as f64 * 100.0 + (r * 2 + c) as f64 * 10.0 + t as f64)
            });
            grid.slice_mut(s![.., .., gap]).fill(None);
            grids.insert(m(month), grid).unwrap();
            missing.insert(m(month), gap);
        }
        (grids, missing)
    }

    #[test]
    fn constant_model_fills_every_gap_and_nothing_else() {
        let (grids, missing) = grids_with_gaps(&[(1, 15), (7, 2), (12, 0)]);
        let (filled, report) =
            fill_gaps(&ConstantRegressor(-42.0), &grids, &missing, 6, &NoProgress).unwrap();

        for (month, grid) in grids.iter() {
            let gap = *missing.get(month).unwrap();
            let out = filled.get(month).unwrap();
            for ((r, c, t), value) in grid.indexed_iter() {
                if t == gap {
                    assert_eq!(out[[r, c, t]], Some(-42.0));
                } else {
                    assert_eq!(
                        out[[r, c, t]].map(f64::to_bits),
                        value.map(f64::to_bits)
                    );
                }
            }
        }
        assert_eq!(report.filled(), 18);
        assert_eq!(report.months.len(), 3);
        assert!(report.months.iter().all(|m| m.skipped == 0));
        // input untouched
        assert_eq!(grids.missing_count(), 18);
        assert_eq!(filled.missing_count(), 0);
    }

    #[test]
    fn model_sees_the_expected_windows() {
        let (grids, missing) = grids_with_gaps(&[(3, 15), (4, 2)]);
        let seen = Mutex::new(Vec::new());
        let model = FnRegressor(|w: &[f64]| {
            seen.lock().unwrap().push(w.to_vec());
            w.len() as f64
        });
        let (filled, _) = fill_gaps(&model, &grids, &missing, 6, &NoProgress).unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 12);
        // Month 3, cell (0, 0): values 300 + t for t in 9..15.
        assert!(seen.contains(&vec![309.0, 310.0, 311.0, 312.0, 313.0, 314.0]));
        // Month 4, cell (2, 1): prefix t = 0, 1 padded on the left.
        assert!(seen.contains(&vec![0.0, 0.0, 0.0, 0.0, 450.0, 451.0]));
        assert_eq!(filled.get(m(3)).unwrap()[[1, 1, 15]], Some(6.0));
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let (grids, missing) = grids_with_gaps(&[(5, 8)]);
        let (once, _) = fill_gaps(&ConstantRegressor(1.0), &grids, &missing, 4, &NoProgress).unwrap();
        let (twice, report) =
            fill_gaps(&ConstantRegressor(99.0), &once, &missing, 4, &NoProgress).unwrap();
        assert_eq!(once, twice);
        assert_eq!(report.filled(), 0);
        assert_eq!(report.months[0].skipped, 6);
    }

    #[test]
    fn observed_gap_cells_are_skipped() {
        let (mut grids, missing) = grids_with_gaps(&[(2, 10)]);
        let mut grid = grids.get(m(2)).unwrap().clone();
        grid[[0, 0, 10]] = Some(5.0);
        grids.insert(m(2), grid).unwrap();

        let (filled, report) =
            fill_gaps(&ConstantRegressor(0.5), &grids, &missing, 6, &NoProgress).unwrap();
        assert_eq!(filled.get(m(2)).unwrap()[[0, 0, 10]], Some(5.0));
        assert_eq!(filled.get(m(2)).unwrap()[[0, 1, 10]], Some(0.5));
        assert_eq!(report.months[0].filled, 5);
        assert_eq!(report.months[0].skipped, 1);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let (grids, mut missing) = grids_with_gaps(&[(1, 3)]);
        missing.insert(m(1), 19);
        assert!(matches!(
            fill_gaps(&ConstantRegressor(0.0), &grids, &missing, 6, &NoProgress),
            Err(GapFillError::IndexOutOfBounds { index: 19, .. })
        ));

        missing.insert(m(1), 3);
        missing.insert(m(8), 3);
        assert!(matches!(
            fill_gaps(&ConstantRegressor(0.0), &grids, &missing, 6, &NoProgress),
            Err(GapFillError::MissingMonth(_))
        ));
        assert!(fill_gaps(&ConstantRegressor(0.0), &grids, &MissingIndexMap::new(), 0, &NoProgress).is_err());
    }

    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl Progress for Recorder {
        fn update(&self, completed: usize, total: usize) {
            self.0.lock().unwrap().push((completed, total));
        }
    }

    #[test]
    fn progress_counts_gaps_times_cells() {
        let (grids, missing) = grids_with_gaps(&[(1, 5), (2, 6)]);
        let recorder = Recorder(Mutex::new(Vec::new()));
        fill_gaps(&ConstantRegressor(0.0), &grids, &missing, 6, &recorder).unwrap();
        let mut calls = recorder.0.into_inner().unwrap();
        calls.sort();
        assert_eq!(calls.len(), 12);
        assert!(calls.iter().all(|&(_, total)| total == 12));
        assert_eq!(calls.last(), Some(&(12, 12)));
    }

    #[test]
    fn nan_at_the_gap_is_filled() {
        let mut grid = Array3::from_shape_fn((1, 2, 8), |(_, c, t)| Some((c * 10 + t) as f64));
        grid[[0, 0, 5]] = Some(f64::NAN);
        grid[[0, 1, 5]] = None;
        let mut grids = MonthlyGrids::new();
        grids.insert(m(6), grid).unwrap();
        let mut missing = MissingIndexMap::new();
        missing.insert(m(6), 5);

        let (filled, report) =
            fill_gaps(&ConstantRegressor(3.25), &grids, &missing, 3, &NoProgress).unwrap();
        let out = filled.get(m(6)).unwrap();
        assert_eq!(out[[0, 0, 5]], Some(3.25));
        assert_eq!(out[[0, 1, 5]], Some(3.25));
        assert_eq!(report.filled(), 2);
        assert_eq!(report.months[0].skipped, 0);
    }
}
