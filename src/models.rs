use crate::error::{PipelineError, PipelineResult};
use crate::period::MonthPeriod;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

pub type AdvertiserId = i64;

pub const CHURN_COLUMN: &str = "churn";
pub const PUBLISHED_ADS_COLUMN: &str = "monthly_published_ads";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalType {
    Total,
    Partial,
    Other(String),
}

impl WithdrawalType {
    /// Exact, case-sensitive match on the source vocabulary.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "TOTAL" => Self::Total,
            "PARCIAL" => Self::Partial,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Total => "TOTAL",
            Self::Partial => "PARCIAL",
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Approved,
    Denied,
    Other(String),
}

impl WithdrawalStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Aprobada" => Self::Approved,
            "Denegada" => Self::Denied,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "Aprobada",
            Self::Denied => "Denegada",
            Self::Other(raw) => raw,
        }
    }
}

/// One contract-withdrawal request, with its creation date already reduced
/// to a month.
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    pub advertiser_id: AdvertiserId,
    pub withdrawal_month: MonthPeriod,
    pub withdrawal_type: Option<WithdrawalType>,
    pub withdrawal_status: Option<WithdrawalStatus>,
    pub withdrawal_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabeledWithdrawal {
    pub advertiser_id: AdvertiserId,
    pub withdrawal_month: MonthPeriod,
    pub predict_month: MonthPeriod,
    pub churn: u8,
}

/// Advertiser dimension row. Reference data: never modified by the pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Advertiser {
    pub advertiser_id: AdvertiserId,
    pub min_start_contract_date: Option<NaiveDate>,
    pub max_start_contract_new_date: Option<NaiveDate>,
    pub contract_churn_date: Option<NaiveDate>,
    pub province_id: Option<i64>,
    pub advertiser_province: Option<String>,
    pub advertiser_group_id: Option<i64>,
    pub updated_at: Option<NaiveDateTime>,
}

impl Advertiser {
    pub fn new(advertiser_id: AdvertiserId) -> Self {
        Self {
            advertiser_id,
            ..Self::default()
        }
    }

    pub fn min_start_month(&self) -> Option<MonthPeriod> {
        self.min_start_contract_date.map(MonthPeriod::from_date)
    }

    pub fn max_start_new_month(&self) -> Option<MonthPeriod> {
        self.max_start_contract_new_date.map(MonthPeriod::from_date)
    }

    pub fn contract_churn_month(&self) -> Option<MonthPeriod> {
        self.contract_churn_date.map(MonthPeriod::from_date)
    }
}

/// One advertiser-month observation. `values` is aligned with the owning
/// frame's `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertiserMonth {
    pub advertiser_id: AdvertiserId,
    pub month_period: MonthPeriod,
    pub has_active_contract: bool,
    pub churn: u8,
    pub values: Vec<f64>,
}

/// Table of advertiser-month rows sharing one numeric schema.
///
/// The key columns (`advertiser_id`, `month_period`, `has_active_contract`)
/// are typed fields on every row; all metric and feature columns live in
/// `values`. `labeled` records whether the churn column has been attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertiserMonthFrame {
    table: String,
    columns: Vec<String>,
    rows: Vec<AdvertiserMonth>,
    labeled: bool,
}

impl AdvertiserMonthFrame {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
            labeled: false,
        }
    }

    pub fn from_rows(
        table: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<AdvertiserMonth>,
    ) -> Self {
        let mut frame = Self::new(table, columns);
        for row in rows {
            frame.push_row(row);
        }
        frame
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[AdvertiserMonth] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_labeled(&self) -> bool {
        self.labeled
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    pub fn column_index(&self, name: &str) -> PipelineResult<usize> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| PipelineError::missing_column(&self.table, name))
    }

    /// Values of one column in row order.
    pub fn column(&self, name: &str) -> PipelineResult<Vec<f64>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row.values[idx]).collect())
    }

    pub fn churn_labels(&self) -> PipelineResult<Vec<u8>> {
        self.require_churn()?;
        Ok(self.rows.iter().map(|row| row.churn).collect())
    }

    pub fn require_churn(&self) -> PipelineResult<()> {
        if self.labeled {
            Ok(())
        } else {
            Err(PipelineError::missing_column(&self.table, CHURN_COLUMN))
        }
    }

    /// Pads or truncates `values` to the frame width so the schema stays
    /// rectangular.
    pub fn push_row(&mut self, mut row: AdvertiserMonth) {
        row.values.resize(self.columns.len(), f64::NAN);
        self.rows.push(row);
    }

    pub fn advertiser_count(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.advertiser_id)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn latest_period(&self) -> Option<MonthPeriod> {
        self.rows.iter().map(|row| row.month_period).max()
    }

    /// Returns a copy with the same schema and the rows accepted by `keep`,
    /// in their original order.
    pub fn filtered<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&AdvertiserMonth) -> bool,
    {
        Self {
            table: self.table.clone(),
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|row| keep(row)).cloned().collect(),
            labeled: self.labeled,
        }
    }

    pub fn with_churn<F>(&self, mut label: F) -> Self
    where
        F: FnMut(&AdvertiserMonth) -> u8,
    {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut labeled_row = row.clone();
                labeled_row.churn = label(row);
                labeled_row
            })
            .collect();
        Self {
            table: self.table.clone(),
            columns: self.columns.clone(),
            rows,
            labeled: true,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn mark_labeled(mut self) -> Self {
        self.labeled = true;
        self
    }

    /// Returns a copy with extra columns appended. `columns[i]` receives
    /// `values[i]`, which must hold one entry per row.
    pub fn with_columns(&self, names: Vec<String>, values: Vec<Vec<f64>>) -> Self {
        debug_assert_eq!(names.len(), values.len());
        let mut columns = self.columns.clone();
        let mut rows = self.rows.clone();
        for (name, column_values) in names.into_iter().zip(values) {
            debug_assert_eq!(column_values.len(), rows.len());
            columns.push(name);
            for (row, value) in rows.iter_mut().zip(column_values) {
                row.values.push(value);
            }
        }
        Self {
            table: self.table.clone(),
            columns,
            rows,
            labeled: self.labeled,
        }
    }

    /// Returns a copy sorted by (advertiser_id, month_period) ascending.
    pub fn sorted(&self) -> Self {
        let mut sorted = self.clone();
        sorted
            .rows
            .sort_by(|a, b| (a.advertiser_id, a.month_period).cmp(&(b.advertiser_id, b.month_period)));
        sorted
    }

    /// Fails on the first repeated (advertiser_id, month_period) key.
    pub fn ensure_unique_keys(&self) -> PipelineResult<()> {
        let mut seen = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            if !seen.insert((row.advertiser_id, row.month_period)) {
                return Err(PipelineError::DuplicateAdvertiserMonth {
                    table: self.table.clone(),
                    advertiser_id: row.advertiser_id,
                    month_period: row.month_period.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Contiguous row ranges per advertiser. Only meaningful on a frame
    /// returned by [`AdvertiserMonthFrame::sorted`].
    pub fn advertiser_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0usize;
        for idx in 1..=self.rows.len() {
            if idx == self.rows.len() || self.rows[idx].advertiser_id != self.rows[start].advertiser_id
            {
                if idx > start {
                    ranges.push(start..idx);
                }
                start = idx;
            }
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(advertiser_id: AdvertiserId, period: i64, value: f64) -> AdvertiserMonth {
        AdvertiserMonth {
            advertiser_id,
            month_period: MonthPeriod::from_yyyymm(period).unwrap(),
            has_active_contract: true,
            churn: 0,
            values: vec![value],
        }
    }

    #[test]
    fn sorted_frame_groups_rows_by_advertiser() {
        let frame = AdvertiserMonthFrame::from_rows(
            "test",
            vec!["value".to_string()],
            vec![
                row(2, 202402, 4.0),
                row(1, 202402, 2.0),
                row(2, 202401, 3.0),
                row(1, 202401, 1.0),
                row(3, 202401, 5.0),
            ],
        )
        .sorted();

        assert_eq!(frame.column("value").unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(frame.advertiser_ranges(), vec![0..2, 2..4, 4..5]);
        assert_eq!(frame.advertiser_count(), 3);
    }

    #[test]
    fn empty_frame_has_no_ranges() {
        let frame = AdvertiserMonthFrame::new("test", vec![]);
        assert!(frame.advertiser_ranges().is_empty());
        assert!(frame.latest_period().is_none());
        assert!(frame.ensure_unique_keys().is_ok());
    }

    #[test]
    fn duplicate_keys_are_reported() {
        let frame = AdvertiserMonthFrame::from_rows(
            "snapshot",
            vec!["value".to_string()],
            vec![row(1, 202401, 1.0), row(1, 202401, 2.0)],
        );
        assert!(matches!(
            frame.ensure_unique_keys(),
            Err(PipelineError::DuplicateAdvertiserMonth { advertiser_id: 1, .. })
        ));
    }

    #[test]
    fn missing_columns_name_the_table() {
        let frame = AdvertiserMonthFrame::new("snapshot", vec!["value".to_string()]);
        assert_eq!(
            frame.column_index("monthly_leads"),
            Err(PipelineError::missing_column("snapshot", "monthly_leads"))
        );
        assert_eq!(
            frame.require_churn(),
            Err(PipelineError::missing_column("snapshot", CHURN_COLUMN))
        );
    }

    #[test]
    fn appended_columns_do_not_touch_the_source_frame() {
        let frame = AdvertiserMonthFrame::from_rows(
            "test",
            vec!["value".to_string()],
            vec![row(1, 202401, 1.0)],
        );
        let extended = frame.with_columns(vec!["double".to_string()], vec![vec![2.0]]);
        assert_eq!(frame.columns().len(), 1);
        assert_eq!(extended.column("double").unwrap(), vec![2.0]);
        assert_eq!(extended.rows()[0].values, vec![1.0, 2.0]);
    }
}
