use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis};

use crate::grid::{observed, MonthlyGrids};
use crate::month::Month;
use crate::resolve::MissingIndexMap;
use crate::{GapFillError, EXPORT_NODATA};

/// One reconstructed `[row, col]` slice, ready for a downstream writer.
#[derive(Clone, Debug, PartialEq)]
pub struct GapSlice {
    pub month: Month,
    pub year: i32,
    pub values: Array2<Option<f64>>,
}

impl GapSlice {
    pub fn file_name(&self, prefix: &str) -> String {
        format!("{}_{}_{}.csv", prefix, self.year, self.month)
    }

    /// Write as comma-separated rows; unobserved cells are left empty.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut out = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        for row in self.values.outer_iter() {
            out.write_record(row.iter().map(|v| match v {
                Some(value) => value.to_string(),
                None => String::new(),
            }))?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write into `dir` under [`GapSlice::file_name`], returning the path.
    pub fn save(&self, dir: &Path, prefix: &str) -> Result<PathBuf, GapFillError> {
        let path = dir.join(self.file_name(prefix));
        let file = File::create(&path).map_err(|source| GapFillError::Io {
            path: path.clone(),
            source,
        })?;
        self.write_csv(file).map_err(|e| GapFillError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;
        Ok(path)
    }
}

/// Extract the gap slice of every mapped month from a filled collection.
///
/// Cells equal to [`EXPORT_NODATA`] are reported as unobserved.
pub fn gap_slices(
    filled: &MonthlyGrids,
    missing: &MissingIndexMap,
    start_year: i32,
) -> Result<Vec<GapSlice>, GapFillError> {
    let mut slices = Vec::with_capacity(missing.len());
    for (month, &index) in missing.iter() {
        let grid = filled.get(month).ok_or(GapFillError::MissingMonth(month))?;
        let steps = grid.len_of(Axis(2));
        if index >= steps {
            return Err(GapFillError::IndexOutOfBounds {
                month,
                index,
                time_steps: steps,
            });
        }
        let values = grid
            .index_axis(Axis(2), index)
            .mapv(|v| observed(v).filter(|&x| x != EXPORT_NODATA));
        slices.push(GapSlice {
            month,
            year: start_year + index as i32,
            values,
        });
    }
    Ok(slices)
}
