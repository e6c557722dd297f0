use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;
use std::str::FromStr;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// A calendar year-month. Ordered chronologically; subtracting two periods
/// yields the signed number of whole months between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthPeriod {
    year: i32,
    month: u32,
}

/// Raw representations accepted by [`to_month_period`].
#[derive(Debug, Clone, Copy)]
pub enum PeriodSource<'a> {
    /// Date or datetime text, e.g. `2024-03-05` or `2024-03-05 10:00:00`.
    Timestamp(&'a str),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Integer encoded as `YYYYMM`.
    YearMonth(i64),
}

pub fn to_month_period(source: PeriodSource<'_>) -> PipelineResult<MonthPeriod> {
    match source {
        PeriodSource::Timestamp(raw) => parse_timestamp(raw).map(MonthPeriod::from_datetime),
        PeriodSource::Date(date) => Ok(MonthPeriod::from_date(date)),
        PeriodSource::DateTime(datetime) => Ok(MonthPeriod::from_datetime(datetime)),
        PeriodSource::YearMonth(value) => MonthPeriod::from_yyyymm(value),
    }
}

/// Parses date or datetime text into a naive datetime (dates map to midnight).
pub fn parse_timestamp(raw: &str) -> PipelineResult<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::invalid_period(raw, "empty timestamp"));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.naive_utc());
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| PipelineError::invalid_period(raw, "unparseable timestamp"))
}

pub fn parse_date(raw: &str) -> PipelineResult<NaiveDate> {
    parse_timestamp(raw).map(|datetime| datetime.date())
}

impl MonthPeriod {
    pub fn new(year: i32, month: u32) -> PipelineResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(PipelineError::invalid_period(
                format!("{year:04}-{month:02}"),
                "month must be between 1 and 12",
            ));
        }
        Ok(Self { year, month })
    }

    /// Decodes a `YYYYMM` integer. Exactly six digits are required.
    pub fn from_yyyymm(value: i64) -> PipelineResult<Self> {
        if !(100_000..=999_999).contains(&value) {
            return Err(PipelineError::invalid_period(
                value,
                "expected exactly 6 digits (YYYYMM)",
            ));
        }
        let year = (value / 100) as i32;
        let month = (value % 100) as u32;
        if !(1..=12).contains(&month) {
            return Err(PipelineError::invalid_period(
                value,
                "month must be between 1 and 12",
            ));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn from_datetime(datetime: NaiveDateTime) -> Self {
        Self::from_date(datetime.date())
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    pub fn to_yyyymm(self) -> i64 {
        self.year as i64 * 100 + self.month as i64
    }

    /// Months elapsed since year 0, used for arithmetic.
    fn ordinal(self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    fn from_ordinal(ordinal: i64) -> Self {
        Self {
            year: ordinal.div_euclid(12) as i32,
            month: (ordinal.rem_euclid(12) + 1) as u32,
        }
    }

    pub fn add_months(self, months: i64) -> Self {
        Self::from_ordinal(self.ordinal() + months)
    }

    pub fn previous(self) -> Self {
        self.add_months(-1)
    }

    pub fn next(self) -> Self {
        self.add_months(1)
    }

    /// Signed number of whole months from `earlier` to `self`.
    pub fn months_since(self, earlier: MonthPeriod) -> i64 {
        self.ordinal() - earlier.ordinal()
    }

    pub fn first_day(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl Sub for MonthPeriod {
    type Output = i64;

    fn sub(self, rhs: MonthPeriod) -> i64 {
        self.months_since(rhs)
    }
}

impl fmt::Display for MonthPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthPeriod {
    type Err = PipelineError;

    /// Accepts `YYYY-MM` or `YYYYMM`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Some((year, month)) = trimmed.split_once('-') {
            let year = year
                .parse::<i32>()
                .map_err(|_| PipelineError::invalid_period(raw, "year is not a number"))?;
            let month = month
                .parse::<u32>()
                .map_err(|_| PipelineError::invalid_period(raw, "month is not a number"))?;
            if !(1000..=9999).contains(&year) {
                return Err(PipelineError::invalid_period(raw, "year must have 4 digits"));
            }
            return MonthPeriod::new(year, month);
        }
        if trimmed.len() != 6 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(PipelineError::invalid_period(
                raw,
                "expected YYYY-MM or exactly 6 digits (YYYYMM)",
            ));
        }
        let value = trimmed
            .parse::<i64>()
            .map_err(|_| PipelineError::invalid_period(raw, "not a number"))?;
        MonthPeriod::from_yyyymm(value)
    }
}
