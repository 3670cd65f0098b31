use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Axis};
use tracing::debug;

use crate::grid::{MonthGrid, MonthlyGrids};
use crate::month::Month;
use crate::GapFillError;

/// Why a single year/month input did not contribute to the collection.
#[derive(Clone, Debug, PartialEq)]
pub enum GridWarning {
    /// Listed as known-missing and not read.
    Skipped { path: PathBuf },
    /// Expected file does not exist.
    Missing { path: PathBuf },
    /// File exists but could not be used.
    Unreadable { path: PathBuf, reason: String },
}

impl fmt::Display for GridWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridWarning::Skipped { path } => write!(f, "skipped listed file {}", path.display()),
            GridWarning::Missing { path } => write!(f, "missing file {}", path.display()),
            GridWarning::Unreadable { path, reason } => {
                write!(f, "unreadable file {}: {}", path.display(), reason)
            }
        }
    }
}

/// A loaded collection together with the per-file problems that were
/// recovered from by leaving the affected slices unobserved.
#[derive(Clone, Debug)]
pub struct GridLoad {
    pub grids: MonthlyGrids,
    pub warnings: Vec<GridWarning>,
}

/// Supplies the monthly cubes for `start_year..=end_year`.
pub trait GridSource {
    fn load(&self, start_year: i32, end_year: i32) -> Result<GridLoad, GapFillError>;
}

/// Reads one comma-separated 2-D grid per year and month from a directory,
/// named `{prefix}_{YYYY}{MM}.csv`.
///
/// Empty fields, `nan` and the optional `nodata` value are unobserved.
#[derive(Clone, Debug)]
pub struct CsvDirectorySource {
    pub dir: PathBuf,
    pub prefix: String,
    pub nodata: Option<f64>,
    /// File names to treat as known-missing without reading them.
    pub skip_files: HashSet<String>,
}

impl CsvDirectorySource {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            nodata: None,
            skip_files: HashSet::new(),
        }
    }

    pub fn file_name(&self, year: i32, month: Month) -> String {
        format!("{}_{}{}.csv", self.prefix, year, month)
    }

    fn read_slice(&self, path: &Path) -> Result<Array2<Option<f64>>, String> {
        read_csv_grid(path, self.nodata)
    }
}

impl GridSource for CsvDirectorySource {
    fn load(&self, start_year: i32, end_year: i32) -> Result<GridLoad, GapFillError> {
        if end_year < start_year {
            return Err(GapFillError::InvalidParameter(format!(
                "end_year {} precedes start_year {}",
                end_year, start_year
            )));
        }
        let total_years = (end_year - start_year + 1) as usize;

        let mut warnings = Vec::new();
        let mut slices: Vec<(Month, usize, Array2<Option<f64>>)> = Vec::new();
        let mut shape: Option<(usize, usize)> = None;

        for year in start_year..=end_year {
            for month in Month::all() {
                let name = self.file_name(year, month);
                let path = self.dir.join(&name);
                if self.skip_files.contains(&name) {
                    debug!("skipping listed file {}", path.display());
                    warnings.push(GridWarning::Skipped { path });
                    continue;
                }
                if !path.exists() {
                    warnings.push(GridWarning::Missing { path });
                    continue;
                }
                let slice = match self.read_slice(&path) {
                    Ok(slice) => slice,
                    Err(reason) => {
                        warnings.push(GridWarning::Unreadable { path, reason });
                        continue;
                    }
                };
                let dim = slice.dim();
                match shape {
                    None => shape = Some(dim),
                    Some(expected) if expected != dim => {
                        warnings.push(GridWarning::Unreadable {
                            path,
                            reason: format!("grid is {:?}, expected {:?}", dim, expected),
                        });
                        continue;
                    }
                    _ => {}
                }
                slices.push((month, (year - start_year) as usize, slice));
            }
        }

        let (rows, cols) = shape.ok_or_else(|| {
            GapFillError::NoSourceGrid(format!(
                "no readable {}_YYYYMM.csv files in {} for {}-{}",
                self.prefix,
                self.dir.display(),
                start_year,
                end_year
            ))
        })?;

        let mut cubes: Vec<MonthGrid> = Month::all()
            .map(|_| Array3::from_elem((rows, cols, total_years), None))
            .collect();
        for (month, year_index, slice) in slices {
            cubes[month.slot()]
                .index_axis_mut(Axis(2), year_index)
                .assign(&slice);
        }

        let mut grids = MonthlyGrids::new();
        for (month, cube) in Month::all().zip(cubes) {
            grids.insert(month, cube)?;
        }
        Ok(GridLoad { grids, warnings })
    }
}

/// Parse a headerless CSV grid into rows of optional values.
pub fn read_csv_grid(path: &Path, nodata: Option<f64>) -> Result<Array2<Option<f64>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| e.to_string())?;

    let mut values = Vec::new();
    let mut cols: Option<usize> = None;
    let mut rows = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        match cols {
            None => cols = Some(record.len()),
            Some(n) if n != record.len() => {
                return Err(format!(
                    "row {} has {} columns, expected {}",
                    line + 1,
                    record.len(),
                    n
                ));
            }
            _ => {}
        }
        for field in record.iter() {
            values.push(parse_cell(field, nodata).map_err(|e| format!("row {}: {}", line + 1, e))?);
        }
        rows += 1;
    }
    let cols = cols.unwrap_or(0);
    if rows == 0 || cols == 0 {
        return Err("grid is empty".into());
    }
    Array2::from_shape_vec((rows, cols), values).map_err(|e| e.to_string())
}

fn parse_cell(field: &str, nodata: Option<f64>) -> Result<Option<f64>, String> {
    if field.is_empty() || field.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let value: f64 = field
        .parse()
        .map_err(|_| format!("invalid number '{}'", field))?;
    if value.is_nan() || nodata.map_or(false, |nd| value == nd) {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}
