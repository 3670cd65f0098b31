use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use gapfill::{
    build_training_dataset, evaluate, fill_gaps, gap_slices, resolve_missing_indices,
    CsvDirectorySource, GapFillConfig, GridSource, LinearRegressor, LogProgress,
    MissingIndexMap, MissingYears, Month, MonthlyGrids, RegressionMetrics, SavedModel,
    TrainingDataset, ValueRange,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Monthly grid gap-filling CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the time-step index of each month's gap
    Resolve(ResolveArgs),
    /// Build the leakage-free training set and write train/test CSVs
    Prepare(PrepareArgs),
    /// Fit the baseline linear model and report held-out metrics
    Train(TrainArgs),
    /// Fill every gap with a trained model and export the gap slices
    Fill(FillArgs),
    /// Train the baseline model and fill in one pass
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// First year of the series
    #[arg(long)]
    start_year: Option<i32>,

    /// Last year of the series
    #[arg(long)]
    end_year: Option<i32>,

    /// Conditioning window length
    #[arg(long)]
    sequence_length: Option<usize>,

    /// Missing years as month=year pairs (comma separated, e.g. 1=2018,7=2017)
    #[arg(long)]
    missing: Option<String>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Directory holding `{prefix}_{YYYY}{MM}.csv` grids
    #[arg(long, value_hint = ValueHint::DirPath)]
    grid_dir: PathBuf,

    /// Grid file name prefix
    #[arg(long, default_value = "TWSA")]
    prefix: String,

    /// Source nodata value treated as unobserved
    #[arg(long, allow_hyphen_values = true)]
    nodata: Option<f64>,

    /// Known-missing file names to skip (comma separated)
    #[arg(long)]
    skip: Option<String>,
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Share of the pooled dataset held out for testing
    #[arg(long)]
    test_fraction: Option<f64>,

    /// Seed for the train/test shuffle
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct FitArgs {
    /// Min-max normalize training data before fitting
    #[arg(long, action = ArgAction::SetTrue)]
    normalize: bool,

    /// Ridge penalty of the linear model
    #[arg(long)]
    ridge_lambda: Option<f64>,

    /// Output model JSON path
    #[arg(long, default_value = "model.json", value_hint = ValueHint::FilePath)]
    model: PathBuf,

    /// Optional JSON path for the evaluation summary
    #[arg(long, value_hint = ValueHint::FilePath)]
    metrics_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Directory for the filled gap slices
    #[arg(short, long, default_value = "filled", value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,

    /// File name prefix of the exported slices
    #[arg(long, default_value = "filled_TWSA")]
    output_prefix: String,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    split: SplitArgs,

    /// Output CSV for the training subset
    #[arg(long, default_value = "train.csv", value_hint = ValueHint::FilePath)]
    train_output: PathBuf,

    /// Output CSV for the test subset
    #[arg(long, default_value = "test.csv", value_hint = ValueHint::FilePath)]
    test_output: PathBuf,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    split: SplitArgs,
    #[command(flatten)]
    fit: FitArgs,
}

#[derive(Args, Debug)]
struct FillArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    export: ExportArgs,

    /// Trained model JSON
    #[arg(long, default_value = "model.json", value_hint = ValueHint::FilePath)]
    model: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    split: SplitArgs,
    #[command(flatten)]
    fit: FitArgs,
    #[command(flatten)]
    export: ExportArgs,
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Resolve(args) => args.config.verbose,
            Command::Prepare(args) => args.config.verbose,
            Command::Train(args) => args.config.verbose,
            Command::Fill(args) => args.config.verbose,
            Command::Run(args) => args.config.verbose,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.command.verbose() { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Resolve(args) => handle_resolve(args),
        Command::Prepare(args) => handle_prepare(args),
        Command::Train(args) => handle_train(args),
        Command::Fill(args) => handle_fill(args),
        Command::Run(args) => handle_run(args),
    }
}

fn handle_resolve(args: ResolveArgs) -> Result<()> {
    let cfg = load_config(&args.config, None, None)?;
    let missing = resolve(&cfg)?;
    for (month, index) in missing.iter() {
        info!("Month {}: missing year {} -> index {}", month, cfg.start_year + *index as i32, index);
    }
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, &missing)?;
    writeln!(handle)?;
    Ok(())
}

fn handle_prepare(args: PrepareArgs) -> Result<()> {
    let cfg = load_config(&args.config, Some(&args.split), None)?;
    let missing = resolve(&cfg)?;
    let grids = load_grids(&args.source, &cfg)?;

    let dataset = build_dataset(&grids, &missing, &cfg)?;
    let split = dataset
        .split(cfg.test_fraction, cfg.seed)
        .context("failed to split training dataset")?;
    info!(
        "Split: {} train / {} test sequences (test_fraction {}, seed {})",
        split.train.len(),
        split.test.len(),
        cfg.test_fraction,
        cfg.seed
    );

    write_dataset_csv(&split.train, &args.train_output)?;
    info!("Wrote training set: {}", args.train_output.display());
    write_dataset_csv(&split.test, &args.test_output)?;
    info!("Wrote test set: {}", args.test_output.display());
    Ok(())
}

fn handle_train(args: TrainArgs) -> Result<()> {
    let cfg = load_config(&args.config, Some(&args.split), Some(&args.fit))?;
    let missing = resolve(&cfg)?;
    let grids = load_grids(&args.source, &cfg)?;
    train_and_save(&cfg, &grids, &missing, &args.fit)?;
    Ok(())
}

fn handle_fill(args: FillArgs) -> Result<()> {
    let cfg = load_config(&args.config, None, None)?;
    let missing = resolve(&cfg)?;
    let saved = load_model(&args.model, &cfg)?;
    let grids = load_grids(&args.source, &cfg)?;
    fill_and_export(&cfg, &grids, &missing, &saved.regressor, &args.export)
}

/// Load a trained model and check it against the fill configuration.
///
/// A window length mismatch is fatal. A model fitted for another series
/// layout is only reported.
fn load_model(path: &Path, cfg: &GapFillConfig) -> Result<SavedModel> {
    let saved = SavedModel::load(path)
        .with_context(|| format!("failed to load model {}", path.display()))?;
    if saved.sequence_length != cfg.sequence_length {
        bail!(
            "model {} expects windows of {} values but sequence_length is {}",
            path.display(),
            saved.sequence_length,
            cfg.sequence_length
        );
    }
    if !fingerprint_matches(&saved, cfg)? {
        warn!(
            "Model {} was trained for a different series layout",
            path.display()
        );
    }
    Ok(saved)
}

fn fingerprint_matches(saved: &SavedModel, cfg: &GapFillConfig) -> Result<bool> {
    Ok(saved.config_fingerprint == cfg.fingerprint()?)
}

fn handle_run(args: RunArgs) -> Result<()> {
    let cfg = load_config(&args.config, Some(&args.split), Some(&args.fit))?;
    let missing = resolve(&cfg)?;
    let grids = load_grids(&args.source, &cfg)?;
    let model = train_and_save(&cfg, &grids, &missing, &args.fit)?;
    fill_and_export(&cfg, &grids, &missing, &model, &args.export)
}

fn load_config(
    args: &ConfigArgs,
    split: Option<&SplitArgs>,
    fit: Option<&FitArgs>,
) -> Result<GapFillConfig> {
    let mut cfg = match args.config.as_ref() {
        Some(path) => GapFillConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GapFillConfig::default(),
    };
    if let Some(year) = args.start_year {
        cfg.start_year = year;
    }
    if let Some(year) = args.end_year {
        cfg.end_year = year;
    }
    if let Some(length) = args.sequence_length {
        cfg.sequence_length = length;
    }
    if let Some(text) = args.missing.as_ref() {
        cfg.missing_years = parse_missing_years(text)?;
    }
    if let Some(split) = split {
        if let Some(fraction) = split.test_fraction {
            cfg.test_fraction = fraction;
        }
        if let Some(seed) = split.seed {
            cfg.seed = seed;
        }
    }
    if let Some(fit) = fit {
        cfg.normalize |= fit.normalize;
        if let Some(lambda) = fit.ridge_lambda {
            cfg.ridge_lambda = lambda;
        }
    }
    cfg.validate()?;
    debug!("Configuration: {:?}", cfg);
    Ok(cfg)
}

fn parse_missing_years(input: &str) -> Result<MissingYears> {
    let mut out = MissingYears::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (month, year) = trimmed
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid missing entry '{}': expected month=year", trimmed))?;
        let month: u8 = month
            .trim()
            .parse()
            .with_context(|| format!("invalid month in '{}'", trimmed))?;
        let year: i32 = year
            .trim()
            .parse()
            .with_context(|| format!("invalid year in '{}'", trimmed))?;
        if out.insert(Month::new(month)?, year).is_some() {
            return Err(anyhow!("month {} listed more than once", month));
        }
    }
    if out.is_empty() {
        return Err(anyhow!("--missing list was empty"));
    }
    Ok(out)
}

fn resolve(cfg: &GapFillConfig) -> Result<MissingIndexMap> {
    let missing = resolve_missing_indices(cfg.start_year, cfg.end_year, &cfg.missing_years)?;
    if missing.is_empty() {
        warn!("No missing years configured; nothing to fill");
    }
    Ok(missing)
}

fn load_grids(args: &SourceArgs, cfg: &GapFillConfig) -> Result<MonthlyGrids> {
    let mut source = CsvDirectorySource::new(&args.grid_dir, args.prefix.clone());
    source.nodata = args.nodata;
    if let Some(skip) = args.skip.as_ref() {
        source.skip_files = skip
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let t_load = Instant::now();
    let load = source
        .load(cfg.start_year, cfg.end_year)
        .with_context(|| format!("failed to load grids from {}", args.grid_dir.display()))?;
    for warning in &load.warnings {
        match warning {
            gapfill::GridWarning::Missing { .. } => debug!("{}", warning),
            _ => warn!("{}", warning),
        }
    }
    let missing_files = load
        .warnings
        .iter()
        .filter(|w| matches!(w, gapfill::GridWarning::Missing { .. }))
        .count();
    if missing_files > 0 {
        warn!("{} expected grid files were absent", missing_files);
    }
    if let Some((rows, cols, steps)) = load.grids.shape() {
        info!(
            "Loaded grids: {}x{} cells, {} years ({:.1} ms)",
            rows,
            cols,
            steps,
            t_load.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(load.grids)
}

fn build_dataset(
    grids: &MonthlyGrids,
    missing: &MissingIndexMap,
    cfg: &GapFillConfig,
) -> Result<TrainingDataset> {
    let dataset = build_training_dataset(grids, missing, cfg.sequence_length)?;
    info!(
        "Built {} training sequences of length {} from {} months",
        dataset.len(),
        cfg.sequence_length,
        missing.len()
    );
    if dataset.is_empty() {
        bail!("no complete training sequences could be built");
    }
    Ok(dataset)
}

#[derive(Serialize, Debug)]
struct TrainSummary {
    train_samples: usize,
    test_samples: usize,
    value_range: Option<ValueRange>,
    train: RegressionMetrics,
    test: Option<RegressionMetrics>,
}

fn train_and_save(
    cfg: &GapFillConfig,
    grids: &MonthlyGrids,
    missing: &MissingIndexMap,
    fit: &FitArgs,
) -> Result<LinearRegressor> {
    let dataset = build_dataset(grids, missing, cfg)?;
    let range = ValueRange::of(&dataset);
    let split = dataset.split(cfg.test_fraction, cfg.seed)?;

    let t_fit = Instant::now();
    let model = match (cfg.normalize, range) {
        (true, Some(range)) => {
            let scaled = split.normalized(&range);
            LinearRegressor::fit(&scaled.train, cfg.ridge_lambda)?.with_scaler(range)
        }
        _ => LinearRegressor::fit(&split.train, cfg.ridge_lambda)?,
    };
    info!(
        "Fitted linear model on {} sequences ({:.1} ms)",
        split.train.len(),
        t_fit.elapsed().as_secs_f64() * 1000.0
    );

    let train_metrics = evaluate(&model, &split.train)?;
    let test_metrics = if split.test.is_empty() {
        None
    } else {
        Some(evaluate(&model, &split.test)?)
    };
    log_metrics("train", &train_metrics, range.as_ref());
    if let Some(metrics) = test_metrics.as_ref() {
        log_metrics("test", metrics, range.as_ref());
    }

    let saved = SavedModel::new(model.clone(), cfg.fingerprint()?);
    saved
        .save(&fit.model)
        .with_context(|| format!("failed to write model {}", fit.model.display()))?;
    info!("Wrote model: {}", fit.model.display());

    if let Some(path) = fit.metrics_output.as_ref() {
        let summary = TrainSummary {
            train_samples: split.train.len(),
            test_samples: split.test.len(),
            value_range: range,
            train: train_metrics,
            test: test_metrics,
        };
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &summary)?;
        info!("Wrote metrics: {}", path.display());
    }
    Ok(model)
}

fn log_metrics(label: &str, metrics: &RegressionMetrics, range: Option<&ValueRange>) {
    info!(
        "{} metrics: mse={:.4} mae={:.4} ({} samples)",
        label, metrics.mse, metrics.mae, metrics.samples
    );
    let Some(range) = range else {
        return;
    };
    match metrics.normalized_by_max(range) {
        Some(n) => info!(
            "{} normalized by max: loss={:.4} ({:.2}%) mae={:.4} ({:.2}%)",
            label, n.loss, n.loss_pct, n.mae, n.mae_pct
        ),
        None => warn!("{} metrics cannot be normalized by a zero maximum", label),
    }
    match metrics.normalized_by_range(range) {
        Some(n) => info!(
            "{} normalized by range: loss={:.4} ({:.2}%) mae={:.4} ({:.2}%)",
            label, n.loss, n.loss_pct, n.mae, n.mae_pct
        ),
        None => warn!("{} metrics cannot be normalized by a zero range", label),
    }
}

fn fill_and_export(
    cfg: &GapFillConfig,
    grids: &MonthlyGrids,
    missing: &MissingIndexMap,
    model: &LinearRegressor,
    export: &ExportArgs,
) -> Result<()> {
    let t_fill = Instant::now();
    let progress = LogProgress::default();
    let (filled, report) = fill_gaps(model, grids, missing, cfg.sequence_length, &progress)?;
    info!(
        "Filled {} gap cells across {} months ({:.1} ms)",
        report.filled(),
        report.months.len(),
        t_fill.elapsed().as_secs_f64() * 1000.0
    );

    fs::create_dir_all(&export.output_dir)
        .with_context(|| format!("failed to create {}", export.output_dir.display()))?;
    let slices = gap_slices(&filled, missing, cfg.start_year)?;
    let written = slices
        .par_iter()
        .map(|slice| {
            slice
                .save(&export.output_dir, &export.output_prefix)
                .with_context(|| format!("failed to export {}-{}", slice.year, slice.month))
        })
        .collect::<Result<Vec<_>>>()?;
    for path in &written {
        info!("Wrote gap slice: {}", path.display());
    }
    Ok(())
}

fn write_dataset_csv(dataset: &TrainingDataset, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_dataset_rows(dataset, &mut writer)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn write_dataset_rows<W: Write>(dataset: &TrainingDataset, writer: &mut csv::Writer<W>) -> Result<()> {
    let mut header: Vec<String> = (0..dataset.sequence_length())
        .map(|i| format!("w{}", i))
        .collect();
    header.push("target".to_string());
    writer.write_record(&header)?;
    for (window, target) in dataset.windows.outer_iter().zip(dataset.targets.iter()) {
        let mut row: Vec<String> = window.iter().map(|v| v.to_string()).collect();
        row.push(target.to_string());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}
