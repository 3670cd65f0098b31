use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::GapFillError;

/// Calendar month, always within 1..=12.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Month(u8);

impl Month {
    pub fn new(number: u8) -> Result<Self, GapFillError> {
        if (1..=12).contains(&number) {
            Ok(Month(number))
        } else {
            Err(GapFillError::InvalidParameter(format!(
                "month {} is not within 1..=12",
                number
            )))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// January through December.
    pub fn all() -> impl Iterator<Item = Month> {
        (1..=12).map(Month)
    }

    pub(crate) fn slot(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for Month {
    type Error = GapFillError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Month::new(value)
    }
}

impl From<Month> for u8 {
    fn from(month: Month) -> Self {
        month.0
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Fixed twelve-slot map keyed by [`Month`].
///
/// Serialized as a JSON object keyed by month number (`{"1": 2018, ...}`);
/// keys outside 1..=12 are rejected on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<u8, T>",
    into = "BTreeMap<u8, T>",
    bound(serialize = "T: Clone + Serialize", deserialize = "T: Deserialize<'de>")
)]
pub struct MonthMap<T> {
    slots: [Option<T>; 12],
}

impl<T> MonthMap<T> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn get(&self, month: Month) -> Option<&T> {
        self.slots[month.slot()].as_ref()
    }

    pub fn get_mut(&mut self, month: Month) -> Option<&mut T> {
        self.slots[month.slot()].as_mut()
    }

    pub fn insert(&mut self, month: Month, value: T) -> Option<T> {
        self.slots[month.slot()].replace(value)
    }

    pub fn remove(&mut self, month: Month) -> Option<T> {
        self.slots[month.slot()].take()
    }

    pub fn contains(&self, month: Month) -> bool {
        self.slots[month.slot()].is_some()
    }

    /// Occupied entries in calendar order.
    pub fn iter(&self) -> impl Iterator<Item = (Month, &T)> + '_ {
        Month::all().filter_map(move |m| self.get(m).map(|v| (m, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl<T> Default for MonthMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(Month, T)> for MonthMap<T> {
    fn from_iter<I: IntoIterator<Item = (Month, T)>>(iter: I) -> Self {
        let mut map = MonthMap::new();
        for (month, value) in iter {
            map.insert(month, value);
        }
        map
    }
}

impl<T> TryFrom<BTreeMap<u8, T>> for MonthMap<T> {
    type Error = GapFillError;

    fn try_from(value: BTreeMap<u8, T>) -> Result<Self, Self::Error> {
        let mut map = MonthMap::new();
        for (number, v) in value {
            map.insert(Month::new(number)?, v);
        }
        Ok(map)
    }
}

impl<T> From<MonthMap<T>> for BTreeMap<u8, T> {
    fn from(map: MonthMap<T>) -> Self {
        Month::all()
            .zip(map.slots)
            .filter_map(|(m, v)| v.map(|v| (m.number(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_rejects_out_of_range_numbers() {
        assert!(Month::new(0).is_err());
        assert!(Month::new(13).is_err());
        assert_eq!(Month::new(12).unwrap().number(), 12);
        assert_eq!(Month::all().count(), 12);
    }

    #[test]
    fn month_map_round_trips_through_json_object() {
        let map: MonthMap<i32> = serde_json::from_str(r#"{"1": 2018, "12": 2017}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(Month::new(1).unwrap()), Some(&2018));
        assert_eq!(map.get(Month::new(6).unwrap()), None);

        let text = serde_json::to_string(&map).unwrap();
        assert_eq!(text, r#"{"1":2018,"12":2017}"#);
    }

    #[test]
    fn month_map_rejects_invalid_month_keys() {
        let parsed: Result<MonthMap<i32>, _> = serde_json::from_str(r#"{"13": 2018}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn iteration_follows_calendar_order() {
        let map: MonthMap<&str> = [(Month::new(7).unwrap(), "jul"), (Month::new(2).unwrap(), "feb")]
            .into_iter()
            .collect();
        let order: Vec<u8> = map.iter().map(|(m, _)| m.number()).collect();
        assert_eq!(order, vec![2, 7]);
    }

    #[test]
    fn slots_follow_calendar_order() {
        let slots: Vec<usize> = Month::all().map(Month::slot).collect();
        assert_eq!(slots, (0..12).collect::<Vec<_>>());
    }
}
