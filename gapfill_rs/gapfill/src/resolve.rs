use crate::month::{Month, MonthMap};
use crate::GapFillError;

/// Calendar year known to be unobserved, per month.
pub type MissingYears = MonthMap<i32>;

/// Zero-based time-step index of the unobserved year, per month.
pub type MissingIndexMap = MonthMap<usize>;

/// Translate missing calendar years into time-step offsets from `start_year`.
///
/// Fails as a whole on the first month whose year falls outside
/// `start_year..=end_year`; no partial map is returned.
pub fn resolve_missing_indices(
    start_year: i32,
    end_year: i32,
    missing_years: &MissingYears,
) -> Result<MissingIndexMap, GapFillError> {
    if end_year < start_year {
        return Err(GapFillError::InvalidParameter(format!(
            "end_year {} precedes start_year {}",
            end_year, start_year
        )));
    }
    let total_years = i64::from(end_year) - i64::from(start_year) + 1;

    let mut indices = MissingIndexMap::new();
    for (month, &year) in missing_years.iter() {
        let index = i64::from(year) - i64::from(start_year);
        if !(0..total_years).contains(&index) {
            return Err(GapFillError::OutOfRange {
                month,
                year,
                start_year,
                end_year,
            });
        }
        indices.insert(month, index as usize);
    }
    Ok(indices)
}

impl MonthMap<usize> {
    /// Calendar year of the gap for `month`, if one is mapped.
    pub fn year_of(&self, month: Month, start_year: i32) -> Option<i32> {
        self.get(month).map(|&index| start_year + index as i32)
    }
}
