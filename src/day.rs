//! Canonical day keys for day-scoped resources.
//!
//! A day key is a calendar day in the viewer's local time zone rendered as
//! `DD-MM-YYYY`. Resolution never fails: anything that is not a valid day
//! falls back to today.

use chrono::{Local, NaiveDate, NaiveTime};
use std::fmt;

use crate::cache::KeyPart;

const DAY_FORMAT: &str = "%d-%m-%Y";

/// Canonical `DD-MM-YYYY` calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey(NaiveDate);

impl DayKey {
  pub fn new(date: NaiveDate) -> Self {
    Self(date)
  }

  /// Today's local calendar day.
  pub fn today() -> Self {
    Self(Local::now().date_naive())
  }

  pub fn date(&self) -> NaiveDate {
    self.0
  }
}

impl fmt::Display for DayKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.format(DAY_FORMAT))
  }
}

impl From<DayKey> for KeyPart {
  fn from(day: DayKey) -> Self {
    KeyPart::Str(day.to_string())
  }
}

/// Resolve `raw` against the current local day.
pub fn resolve_day_key(raw: Option<&str>) -> DayKey {
  resolve_day_key_at(raw, Local::now().date_naive())
}

/// Resolve `raw`, using `today` as the fallback.
///
/// Accepts `D-M-YYYY` / `DD-MM-YYYY`, optionally followed by a time of day
/// (`HH:MM` or `HH:MM:SS`, separated by a space or `T`). The time is
/// dropped, so every instant of a day maps to the same key.
pub fn resolve_day_key_at(raw: Option<&str>, today: NaiveDate) -> DayKey {
  DayKey(raw.and_then(parse_day).unwrap_or(today))
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
  let raw = raw.trim();

  let date_part = match raw.find([' ', 'T']) {
    Some(idx) => {
      let time = raw[idx + 1..].trim();
      if !is_time_of_day(time) {
        return None;
      }
      &raw[..idx]
    }
    None => raw,
  };

  let fields: Vec<&str> = date_part.split('-').collect();
  let [day, month, year] = fields.as_slice() else {
    return None;
  };

  if !is_number(day, 1, 2) || !is_number(month, 1, 2) || !is_number(year, 4, 4) {
    return None;
  }

  NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn is_number(s: &str, min_len: usize, max_len: usize) -> bool {
  (min_len..=max_len).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_time_of_day(s: &str) -> bool {
  NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok() || NaiveTime::parse_from_str(s, "%H:%M").is_ok()
}
