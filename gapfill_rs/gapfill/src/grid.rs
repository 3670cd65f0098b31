use ndarray::Array3;

use crate::month::{Month, MonthMap};
use crate::GapFillError;

/// `[row, col, time_step]` cube for one month; `None` marks an unobserved cell.
pub type MonthGrid = Array3<Option<f64>>;

/// Gridded time series for up to twelve months sharing one shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonthlyGrids {
    grids: MonthMap<MonthGrid>,
    shape: Option<(usize, usize, usize)>,
}

impl MonthlyGrids {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `grid` for `month`, returning the grid it replaces.
    ///
    /// Every month must share the `(rows, cols, time_steps)` shape of the
    /// first grid inserted.
    pub fn insert(
        &mut self,
        month: Month,
        grid: MonthGrid,
    ) -> Result<Option<MonthGrid>, GapFillError> {
        let dim = grid.dim();
        match self.shape {
            Some(shape) if shape != dim => {
                return Err(GapFillError::ShapeMismatch(format!(
                    "month {} grid is {:?}, expected {:?}",
                    month, dim, shape
                )));
            }
            _ => {}
        }
        let previous = self.grids.insert(month, grid);
        self.shape = Some(dim);
        Ok(previous)
    }

    /// Convenience for NaN-encoded inputs: NaN cells become `None`.
    pub fn insert_nan_encoded(
        &mut self,
        month: Month,
        values: &Array3<f64>,
    ) -> Result<Option<MonthGrid>, GapFillError> {
        self.insert(month, values.mapv(|v| observed(Some(v))))
    }

    pub fn get(&self, month: Month) -> Option<&MonthGrid> {
        self.grids.get(month)
    }

    pub(crate) fn get_mut(&mut self, month: Month) -> Option<&mut MonthGrid> {
        self.grids.get_mut(month)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Month, &MonthGrid)> + '_ {
        self.grids.iter()
    }

    /// Shared `(rows, cols, time_steps)` of the stored grids.
    pub fn shape(&self) -> Option<(usize, usize, usize)> {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    /// Count of unobserved cells across all months.
    pub fn missing_count(&self) -> usize {
        self.grids
            .iter()
            .map(|(_, g)| g.iter().filter(|v| observed(**v).is_none()).count())
            .sum()
    }
}

/// A cell value that counts as an observation: present and not NaN.
pub(crate) fn observed(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(n: u8) -> Month {
        Month::new(n).unwrap()
    }

    #[test]
    fn nan_cells_become_missing() {
        let mut values = Array3::<f64>::zeros((2, 2, 3));
        values[[0, 1, 2]] = f64::NAN;
        let mut grids = MonthlyGrids::new();
        grids.insert_nan_encoded(m(1), &values).unwrap();

        let grid = grids.get(m(1)).unwrap();
        assert_eq!(grid[[0, 1, 2]], None);
        assert_eq!(grid[[0, 0, 0]], Some(0.0));
        assert_eq!(grids.missing_count(), 1);
    }

    #[test]
    fn shapes_must_agree() {
        let mut grids = MonthlyGrids::new();
        grids.insert(m(1), Array3::from_elem((2, 3, 5), None)).unwrap();
        let err = grids
            .insert(m(2), Array3::from_elem((2, 3, 4), None))
            .unwrap_err();
        assert!(matches!(err, GapFillError::ShapeMismatch(_)));
        assert_eq!(grids.shape(), Some((2, 3, 5)));
        assert_eq!(grids.len(), 1);
    }

    #[test]
    fn nan_inside_some_is_not_an_observation() {
        assert_eq!(observed(Some(f64::NAN)), None);
        assert_eq!(observed(Some(-3.5)), Some(-3.5));
        assert_eq!(observed(None), None);
    }
}
