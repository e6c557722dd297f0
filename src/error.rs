use thiserror::Error;

/// Errors raised by the pipeline stages.
///
/// Stages are strict on schema and lenient on values: a missing column is
/// fatal, a missing cell is not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("missing required column `{column}` in {table}")]
    MissingRequiredColumn { table: String, column: String },

    #[error("invalid period format `{value}`: {reason}")]
    InvalidPeriodFormat { value: String, reason: String },

    #[error("duplicate row for advertiser {advertiser_id} at {month_period} in {table}")]
    DuplicateAdvertiserMonth {
        table: String,
        advertiser_id: i64,
        month_period: String,
    },

    #[error("rolling window must cover at least one month (got {months})")]
    InvalidWindow { months: usize },
}

impl PipelineError {
    pub fn missing_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::MissingRequiredColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn invalid_period(value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidPeriodFormat {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
