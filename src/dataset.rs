use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Advertiser, AdvertiserId, AdvertiserMonth, AdvertiserMonthFrame, Withdrawal,
    WithdrawalStatus, WithdrawalType, CHURN_COLUMN,
};
use crate::period::{parse_date, parse_timestamp, to_month_period, MonthPeriod, PeriodSource};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub const WITHDRAWALS_TABLE: &str = "withdrawals";
pub const ADVERTISERS_TABLE: &str = "advertiser dimension";
pub const MONTHLY_TABLE: &str = "monthly snapshot";
pub const MODELING_TABLE: &str = "modeling frame";

pub const ADVERTISER_ID_COLUMN: &str = "advertiser_zrive_id";
pub const PERIOD_INT_COLUMN: &str = "period_int";
pub const MONTH_PERIOD_COLUMN: &str = "month_period";
pub const ACTIVE_CONTRACT_COLUMN: &str = "has_active_contract";

const WITHDRAWAL_COLUMNS: [&str; 5] = [
    ADVERTISER_ID_COLUMN,
    "withdrawal_creation_date",
    "withdrawal_type",
    "withdrawal_status",
    "withdrawal_reason",
];

const ADVERTISER_COLUMNS: [&str; 8] = [
    ADVERTISER_ID_COLUMN,
    "min_start_contrato_date",
    "max_start_contrato_nuevo_date",
    "contrato_churn_date",
    "province_id",
    "advertiser_province",
    "advertiser_group_id",
    "updated_at",
];

const MONTHLY_KEY_COLUMNS: [&str; 3] = [
    ADVERTISER_ID_COLUMN,
    PERIOD_INT_COLUMN,
    ACTIVE_CONTRACT_COLUMN,
];

const MODELING_KEY_COLUMNS: [&str; 5] = [
    ADVERTISER_ID_COLUMN,
    PERIOD_INT_COLUMN,
    MONTH_PERIOD_COLUMN,
    ACTIVE_CONTRACT_COLUMN,
    CHURN_COLUMN,
];

const MODELING_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ModelingFrameSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    frame: AdvertiserMonthFrame,
}

struct Header {
    table: &'static str,
    names: Vec<String>,
}

impl Header {
    fn read(table: &'static str, record: &StringRecord) -> Self {
        Self {
            table,
            names: record.iter().map(|name| name.trim().to_string()).collect(),
        }
    }

    fn require(&self, column: &str) -> PipelineResult<usize> {
        self.position(column)
            .ok_or_else(|| PipelineError::missing_column(self.table, column))
    }

    fn require_all<const N: usize>(&self, columns: [&str; N]) -> PipelineResult<[usize; N]> {
        let mut indices = [0usize; N];
        for (slot, column) in indices.iter_mut().zip(columns) {
            *slot = self.require(column)?;
        }
        Ok(indices)
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.names.iter().position(|name| name == column)
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<File>> {
    ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn cell(record: &StringRecord, idx: usize) -> Option<&str> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_integer(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite() && value.fract() == 0.0)
            .map(|value| value as i64)
    })
}

fn parse_advertiser_id(record: &StringRecord, idx: usize) -> Result<AdvertiserId> {
    let raw = cell(record, idx).ok_or_else(|| anyhow!("{} is empty", ADVERTISER_ID_COLUMN))?;
    parse_integer(raw).ok_or_else(|| {
        anyhow!(
            "{} must be an integer (value: {})",
            ADVERTISER_ID_COLUMN,
            raw
        )
    })
}

fn parse_bool(raw: Option<&str>) -> Result<bool> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("true") | Some("1") | Some("1.0") => Ok(true),
        Some("false") | Some("0") | Some("0.0") => Ok(false),
        Some(other) => Err(anyhow!("expected a boolean (value: {})", other)),
    }
}

fn parse_metric(raw: Option<&str>, column: &str) -> Result<f64> {
    match raw {
        None => Ok(f64::NAN),
        Some(value) => value
            .parse::<f64>()
            .map_err(|_| anyhow!("{} must be numeric (value: {})", column, value)),
    }
}

fn parse_period_int(raw: Option<&str>) -> PipelineResult<MonthPeriod> {
    let raw = raw.unwrap_or_default();
    let value =
        parse_integer(raw).ok_or_else(|| PipelineError::invalid_period(raw, "expected YYYYMM"))?;
    to_month_period(PeriodSource::YearMonth(value))
}

fn optional_date(raw: Option<&str>) -> PipelineResult<Option<chrono::NaiveDate>> {
    raw.map(parse_date).transpose()
}

fn row_context(path: &Path, row_number: usize) -> String {
    format!("{} data row {}", path.display(), row_number)
}

pub fn load_withdrawals(path: &Path) -> Result<Vec<Withdrawal>> {
    load_withdrawals_with_report(path).map(|(withdrawals, _)| withdrawals)
}

/// Withdrawals plus the number of rows skipped for an empty creation date.
/// A creation date that is present but malformed still rejects the file.
pub fn load_withdrawals_with_report(path: &Path) -> Result<(Vec<Withdrawal>, usize)> {
    let mut reader = open_reader(path)?;
    let header = Header::read(WITHDRAWALS_TABLE, reader.headers()?);
    let [id_idx, date_idx, type_idx, status_idx, reason_idx] =
        header.require_all(WITHDRAWAL_COLUMNS)?;

    let mut withdrawals = Vec::new();
    let mut skipped = 0usize;
    for (idx, record) in reader.records().enumerate() {
        let row_number = idx + 1;
        let record = record.with_context(|| row_context(path, row_number))?;
        let Some(creation) = cell(&record, date_idx) else {
            debug!("Skipping {}: empty creation date", row_context(path, row_number));
            skipped += 1;
            continue;
        };
        let withdrawal = (|| -> Result<Withdrawal> {
            Ok(Withdrawal {
                advertiser_id: parse_advertiser_id(&record, id_idx)?,
                withdrawal_month: to_month_period(PeriodSource::Timestamp(creation))?,
                withdrawal_type: cell(&record, type_idx).map(WithdrawalType::parse),
                withdrawal_status: cell(&record, status_idx).map(WithdrawalStatus::parse),
                withdrawal_reason: cell(&record, reason_idx).map(str::to_string),
            })
        })()
        .with_context(|| row_context(path, row_number))?;
        withdrawals.push(withdrawal);
    }

    debug!(
        "Loaded {} withdrawal(s) from {}, skipped {} without a creation date",
        withdrawals.len(),
        path.display(),
        skipped
    );
    Ok((withdrawals, skipped))
}

pub fn load_advertisers(path: &Path) -> Result<Vec<Advertiser>> {
    let mut reader = open_reader(path)?;
    let header = Header::read(ADVERTISERS_TABLE, reader.headers()?);
    let [id_idx, min_start_idx, max_start_idx, churn_idx, province_id_idx, province_idx, group_idx, updated_idx] =
        header.require_all(ADVERTISER_COLUMNS)?;

    let mut advertisers = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let row_number = idx + 1;
        let record = record.with_context(|| row_context(path, row_number))?;
        let advertiser = (|| -> Result<Advertiser> {
            Ok(Advertiser {
                advertiser_id: parse_advertiser_id(&record, id_idx)?,
                min_start_contract_date: optional_date(cell(&record, min_start_idx))?,
                max_start_contract_new_date: optional_date(cell(&record, max_start_idx))?,
                contract_churn_date: optional_date(cell(&record, churn_idx))?,
                province_id: cell(&record, province_id_idx).and_then(parse_integer),
                advertiser_province: cell(&record, province_idx).map(str::to_string),
                advertiser_group_id: cell(&record, group_idx).and_then(parse_integer),
                updated_at: cell(&record, updated_idx)
                    .map(parse_timestamp)
                    .transpose()?,
            })
        })()
        .with_context(|| row_context(path, row_number))?;
        advertisers.push(advertiser);
    }

    debug!(
        "Loaded {} advertiser(s) from {}",
        advertisers.len(),
        path.display()
    );
    Ok(advertisers)
}

/// Every column other than the key columns is read as a numeric metric.
pub fn load_monthly_snapshot(path: &Path) -> Result<AdvertiserMonthFrame> {
    let mut reader = open_reader(path)?;
    let header = Header::read(MONTHLY_TABLE, reader.headers()?);
    let [id_idx, period_idx, active_idx] = header.require_all(MONTHLY_KEY_COLUMNS)?;
    let metric_columns: Vec<(usize, String)> = header
        .names
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            !MONTHLY_KEY_COLUMNS.contains(&name.as_str()) && name.as_str() != MONTH_PERIOD_COLUMN
        })
        .map(|(idx, name)| (idx, name.clone()))
        .collect();

    let mut frame = AdvertiserMonthFrame::new(
        MONTHLY_TABLE,
        metric_columns.iter().map(|(_, name)| name.clone()).collect(),
    );
    for (idx, record) in reader.records().enumerate() {
        let row_number = idx + 1;
        let record = record.with_context(|| row_context(path, row_number))?;
        let row = (|| -> Result<AdvertiserMonth> {
            let values = metric_columns
                .iter()
                .map(|(column_idx, name)| parse_metric(cell(&record, *column_idx), name))
                .collect::<Result<Vec<f64>>>()?;
            Ok(AdvertiserMonth {
                advertiser_id: parse_advertiser_id(&record, id_idx)?,
                month_period: parse_period_int(cell(&record, period_idx))?,
                has_active_contract: parse_bool(cell(&record, active_idx))
                    .with_context(|| format!("invalid {}", ACTIVE_CONTRACT_COLUMN))?,
                churn: 0,
                values,
            })
        })()
        .with_context(|| row_context(path, row_number))?;
        frame.push_row(row);
    }

    debug!(
        "Loaded {} monthly row(s) with {} metric column(s) from {}",
        frame.len(),
        frame.columns().len(),
        path.display()
    );
    Ok(frame)
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Writes the key columns followed by every feature column. The churn
/// column is left empty for unlabeled frames.
pub fn write_modeling_frame(frame: &AdvertiserMonthFrame, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Unable to create {}", path.display()))?;

    let header: Vec<&str> = MODELING_KEY_COLUMNS
        .iter()
        .copied()
        .chain(frame.columns().iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;

    for row in frame.rows() {
        let mut record = Vec::with_capacity(header.len());
        record.push(row.advertiser_id.to_string());
        record.push(row.month_period.to_yyyymm().to_string());
        record.push(row.month_period.to_string());
        record.push(row.has_active_contract.to_string());
        record.push(if frame.is_labeled() {
            row.churn.to_string()
        } else {
            String::new()
        });
        record.extend(row.values.iter().map(|value| format_value(*value)));
        writer.write_record(&record)?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;

    info!(
        "Wrote {} rows x {} feature columns to {}",
        frame.len(),
        frame.columns().len(),
        path.display()
    );
    Ok(())
}

/// Reads a frame written by [`write_modeling_frame`]. The frame is labeled
/// when every row carries a churn value.
pub fn load_modeling_frame(path: &Path) -> Result<AdvertiserMonthFrame> {
    let mut reader = open_reader(path)?;
    let header = Header::read(MODELING_TABLE, reader.headers()?);
    let id_idx = header.require(ADVERTISER_ID_COLUMN)?;
    let period_idx = header.require(PERIOD_INT_COLUMN)?;
    let active_idx = header.require(ACTIVE_CONTRACT_COLUMN)?;
    let churn_idx = header.position(CHURN_COLUMN);
    let feature_columns: Vec<(usize, String)> = header
        .names
        .iter()
        .enumerate()
        .filter(|(_, name)| !MODELING_KEY_COLUMNS.contains(&name.as_str()))
        .map(|(idx, name)| (idx, name.clone()))
        .collect();

    let mut frame = AdvertiserMonthFrame::new(
        MODELING_TABLE,
        feature_columns.iter().map(|(_, name)| name.clone()).collect(),
    );
    let mut labeled = churn_idx.is_some();
    for (idx, record) in reader.records().enumerate() {
        let row_number = idx + 1;
        let record = record.with_context(|| row_context(path, row_number))?;
        let row = (|| -> Result<AdvertiserMonth> {
            let churn = match churn_idx.and_then(|churn_idx| cell(&record, churn_idx)) {
                Some(raw) => u8::from(parse_bool(Some(raw)).context("invalid churn")?),
                None => {
                    labeled = false;
                    0
                }
            };
            Ok(AdvertiserMonth {
                advertiser_id: parse_advertiser_id(&record, id_idx)?,
                month_period: parse_period_int(cell(&record, period_idx))?,
                has_active_contract: parse_bool(cell(&record, active_idx))?,
                churn,
                values: feature_columns
                    .iter()
                    .map(|(column_idx, name)| parse_metric(cell(&record, *column_idx), name))
                    .collect::<Result<Vec<f64>>>()?,
            })
        })()
        .with_context(|| row_context(path, row_number))?;
        frame.push_row(row);
    }

    Ok(if labeled { frame.mark_labeled() } else { frame })
}

pub fn save_snapshot(frame: &AdvertiserMonthFrame, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let file = File::create(path)
        .with_context(|| format!("Unable to create modeling snapshot at {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let snapshot = ModelingFrameSnapshot {
        version: MODELING_SNAPSHOT_VERSION,
        generated_at: Utc::now(),
        frame: frame.clone(),
    };
    bincode::serialize_into(&mut writer, &snapshot)
        .context("Failed to serialize modeling snapshot")?;
    writer
        .flush()
        .context("Failed to flush modeling snapshot to disk")?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<AdvertiserMonthFrame> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open modeling snapshot at {}", path.display()))?;
    let snapshot: ModelingFrameSnapshot =
        bincode::deserialize_from(BufReader::new(file)).context("Snapshot decode failed")?;
    if snapshot.version != MODELING_SNAPSHOT_VERSION {
        return Err(anyhow!(
            "Modeling snapshot version mismatch (found {}, expected {})",
            snapshot.version,
            MODELING_SNAPSHOT_VERSION
        ));
    }
    debug!(
        "Loaded modeling snapshot generated at {} from {}",
        snapshot.generated_at,
        path.display()
    );
    Ok(snapshot.frame)
}

/// `.bin` files are snapshots, everything else is CSV.
pub fn load_frame_auto(path: &Path) -> Result<AdvertiserMonthFrame> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("bin") => load_snapshot(path),
        _ => load_modeling_frame(path),
    }
}
