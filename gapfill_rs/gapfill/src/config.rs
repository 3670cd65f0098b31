use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::month::Month;
use crate::resolve::MissingYears;
use crate::GapFillError;

/// Run configuration shared by dataset preparation, training and filling.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GapFillConfig {
    /// First year of the series (inclusive).
    pub start_year: i32,
    /// Last year of the series (inclusive).
    pub end_year: i32,
    /// Conditioning window length fed to the regressor.
    pub sequence_length: usize,
    /// Unknown year per month.
    pub missing_years: MissingYears,
    /// Share of the pooled dataset held out for evaluation.
    pub test_fraction: f64,
    /// Seed for the train/test shuffle.
    pub seed: u64,
    /// Min-max normalize training data before fitting the baseline model.
    pub normalize: bool,
    /// Ridge penalty of the baseline linear regressor.
    pub ridge_lambda: f64,
}

impl Default for GapFillConfig {
    fn default() -> Self {
        let mut missing_years = MissingYears::new();
        for month in Month::all() {
            match month.number() {
                1..=5 => {
                    missing_years.insert(month, 2018);
                }
                7..=12 => {
                    missing_years.insert(month, 2017);
                }
                _ => {}
            }
        }
        Self {
            start_year: 2003,
            end_year: 2021,
            sequence_length: 6,
            missing_years,
            test_fraction: 0.2,
            seed: 42,
            normalize: false,
            ridge_lambda: 1e-6,
        }
    }
}

impl GapFillConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, GapFillError> {
        let text = fs::read_to_string(path).map_err(|source| GapFillError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GapFillConfig =
            serde_json::from_str(&text).map_err(|e| GapFillError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Number of yearly time steps in every monthly cube.
    pub fn total_time_steps(&self) -> usize {
        if self.end_year < self.start_year {
            0
        } else {
            (self.end_year - self.start_year + 1) as usize
        }
    }

    pub fn validate(&self) -> Result<(), GapFillError> {
        if self.end_year < self.start_year {
            return Err(GapFillError::InvalidParameter(format!(
                "end_year {} precedes start_year {}",
                self.end_year, self.start_year
            )));
        }
        if self.sequence_length == 0 {
            return Err(GapFillError::InvalidParameter(
                "sequence_length must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(GapFillError::InvalidParameter(format!(
                "test_fraction {} must lie in [0, 1)",
                self.test_fraction
            )));
        }
        if !self.ridge_lambda.is_finite() || self.ridge_lambda < 0.0 {
            return Err(GapFillError::InvalidParameter(format!(
                "ridge_lambda {} must be a non-negative number",
                self.ridge_lambda
            )));
        }
        Ok(())
    }

    /// SHA-256 over the settings that shape inference inputs, recorded with
    /// trained models so filling can detect a model fitted for another series
    /// layout. Split and fitting settings are excluded.
    pub fn fingerprint(&self) -> Result<String, GapFillError> {
        let layout = SeriesLayout {
            start_year: self.start_year,
            end_year: self.end_year,
            sequence_length: self.sequence_length,
            missing_years: &self.missing_years,
        };
        let bytes = serde_json::to_vec(&layout)
            .map_err(|e| GapFillError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

#[derive(Serialize)]
struct SeriesLayout<'a> {
    start_year: i32,
    end_year: i32,
    sequence_length: usize,
    missing_years: &'a MissingYears,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_run() {
        let cfg = GapFillConfig::default();
        assert_eq!(cfg.total_time_steps(), 19);
        assert_eq!(cfg.missing_years.len(), 11);
        assert_eq!(cfg.missing_years.get(Month::new(6).unwrap()), None);
        assert_eq!(cfg.missing_years.get(Month::new(3).unwrap()), Some(&2018));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: GapFillConfig =
            serde_json::from_str(r#"{"sequence_length": 4, "missing_years": {"2": 2010}}"#)
                .unwrap();
        assert_eq!(cfg.sequence_length, 4);
        assert_eq!(cfg.start_year, 2003);
        assert_eq!(cfg.missing_years.len(), 1);
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        let mut cfg = GapFillConfig::default();
        cfg.sequence_length = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GapFillConfig::default();
        cfg.test_fraction = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = GapFillConfig::default();
        cfg.end_year = 2000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fingerprint_tracks_settings() {
        let a = GapFillConfig::default();
        let mut b = GapFillConfig::default();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        b.sequence_length = 7;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);

        let mut c = GapFillConfig::default();
        c.missing_years.insert(Month::new(6).unwrap(), 2019);
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_ignores_training_settings() {
        let a = GapFillConfig::default();
        let mut b = GapFillConfig::default();
        b.seed = 7;
        b.test_fraction = 0.5;
        b.normalize = true;
        b.ridge_lambda = 1e-3;
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"start_year": 2005, "end_year": 2010}"#).unwrap();
        let cfg = GapFillConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.total_time_steps(), 6);

        fs::write(&path, r#"{"start_year": 2010, "end_year": 2005}"#).unwrap();
        assert!(GapFillConfig::from_json_file(&path).is_err());
    }
}
