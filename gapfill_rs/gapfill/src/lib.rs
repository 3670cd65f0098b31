//! Gap filling for monthly gridded time series.
//!
//! Each calendar month owns a `[row, col, year]` cube with one designated
//! unknown year. The crate resolves those years into time-step indices,
//! derives leakage-free training windows from the observed values, and
//! queries a [`Regressor`] to reconstruct the missing slice of every month.

use std::path::PathBuf;

use thiserror::Error;

pub mod config;
pub mod export;
pub mod grid;
pub mod infer;
pub mod metrics;
pub mod model;
pub mod month;
pub mod resolve;
pub mod sequence;
pub mod source;

pub use config::GapFillConfig;
pub use export::{gap_slices, GapSlice};
pub use grid::MonthlyGrids;
pub use infer::{
    conditioning_window, fill_gaps, FillReport, LogProgress, MonthFill, NoProgress, Progress,
};
pub use metrics::{evaluate, NormalizedMetrics, RegressionMetrics};
pub use model::{ConstantRegressor, FnRegressor, LinearRegressor, Regressor, SavedModel};
pub use month::{Month, MonthMap};
pub use resolve::{resolve_missing_indices, MissingIndexMap, MissingYears};
pub use sequence::{
    build_training_dataset, prepare_month_sequences, DatasetSplit, TrainingDataset, ValueRange,
};
pub use source::{CsvDirectorySource, GridLoad, GridSource, GridWarning};

/// Substituted for unobserved values inside a conditioning window.
pub const MISSING_VALUE_FLAG: f64 = -9999.0;

/// Left padding for windows whose gap sits closer to the start of the
/// series than the window length.
pub const PAD_VALUE: f64 = 0.0;

/// Nodata marker used by downstream raster writers. Exported cells equal to
/// it are written as empty.
pub const EXPORT_NODATA: f64 = -12417.8330078125;

#[derive(Error, Debug)]
pub enum GapFillError {
    #[error("missing year {year} for month {month} is out of the data range {start_year}-{end_year}")]
    OutOfRange {
        month: Month,
        year: i32,
        start_year: i32,
        end_year: i32,
    },
    #[error("missing index {index} for month {month} exceeds the {time_steps} available time steps")]
    IndexOutOfBounds {
        month: Month,
        index: usize,
        time_steps: usize,
    },
    #[error("no usable source grid found: {0}")]
    NoSourceGrid(String),
    #[error("no grid loaded for month {0}")]
    MissingMonth(Month),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data for training")]
    InsufficientData,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}
