use crate::error::PipelineResult;
use crate::labeling::{apply_contract_lifecycle_churn, join_churn_target};
use crate::models::{
    AdvertiserId, Advertiser, AdvertiserMonthFrame, LabeledWithdrawal, PUBLISHED_ADS_COLUMN,
};
use crate::period::MonthPeriod;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub const TARGET_TABLE: &str = "target frame";

/// Row accounting for one pipeline stage, returned to the caller for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub stage: &'static str,
    pub rows_in: usize,
    pub rows_out: usize,
    pub advertisers_out: usize,
}

impl StageSummary {
    pub fn between(
        stage: &'static str,
        input: &AdvertiserMonthFrame,
        output: &AdvertiserMonthFrame,
    ) -> Self {
        Self {
            stage,
            rows_in: input.len(),
            rows_out: output.len(),
            advertisers_out: output.advertiser_count(),
        }
    }

    pub fn rows_dropped(&self) -> usize {
        self.rows_in.saturating_sub(self.rows_out)
    }
}

/// Drops every row after an advertiser's first churned month. The churned
/// row itself is kept.
pub fn remove_activity_after_first_churn(
    frame: &AdvertiserMonthFrame,
) -> PipelineResult<AdvertiserMonthFrame> {
    frame.require_churn()?;
    frame.ensure_unique_keys()?;

    let mut first_churn: HashMap<AdvertiserId, MonthPeriod> = HashMap::new();
    for row in frame.rows().iter().filter(|row| row.churn == 1) {
        first_churn
            .entry(row.advertiser_id)
            .and_modify(|month| *month = (*month).min(row.month_period))
            .or_insert(row.month_period);
    }

    Ok(frame.filtered(|row| {
        first_churn
            .get(&row.advertiser_id)
            .map(|churn_month| row.month_period <= *churn_month)
            .unwrap_or(true)
    }))
}

/// Drops right-censored advertisers: those whose last observed month is
/// before `latest_period` without a churn label on that last month.
///
/// `latest_period` defaults to the latest month present in the frame.
pub fn remove_incomplete_users(
    frame: &AdvertiserMonthFrame,
    latest_period: Option<MonthPeriod>,
) -> PipelineResult<AdvertiserMonthFrame> {
    frame.require_churn()?;
    let Some(latest_period) = latest_period.or_else(|| frame.latest_period()) else {
        return Ok(frame.clone());
    };

    let mut last_seen: HashMap<AdvertiserId, (MonthPeriod, u8)> = HashMap::new();
    for row in frame.rows() {
        last_seen
            .entry(row.advertiser_id)
            .and_modify(|(month, churn)| {
                if row.month_period > *month {
                    *month = row.month_period;
                    *churn = row.churn;
                } else if row.month_period == *month {
                    *churn = (*churn).max(row.churn);
                }
            })
            .or_insert((row.month_period, row.churn));
    }

    let incomplete: HashSet<AdvertiserId> = last_seen
        .into_iter()
        .filter(|(_, (month, churn))| *month < latest_period && *churn == 0)
        .map(|(advertiser_id, _)| advertiser_id)
        .collect();

    Ok(frame.filtered(|row| !incomplete.contains(&row.advertiser_id)))
}

/// Keeps a row iff it has an active contract or at least one published ad.
pub fn remove_inactive_periods_without_contract(
    frame: &AdvertiserMonthFrame,
) -> PipelineResult<AdvertiserMonthFrame> {
    let published_idx = frame.column_index(PUBLISHED_ADS_COLUMN)?;
    Ok(frame.filtered(|row| row.has_active_contract || row.values[published_idx] > 0.0))
}

/// Builds the clean modeling target from the monthly snapshot, labeled
/// withdrawals and the advertiser dimension.
///
/// Stages run in order: churn join, contract lifecycle churn, post-churn
/// removal, censored-advertiser removal, inactive-period removal. The result
/// is sorted by (advertiser, month).
pub fn build_target_frame(
    monthly: &AdvertiserMonthFrame,
    withdrawals: &[LabeledWithdrawal],
    advertisers: &[Advertiser],
    latest_period: Option<MonthPeriod>,
) -> PipelineResult<(AdvertiserMonthFrame, Vec<StageSummary>)> {
    monthly.ensure_unique_keys()?;
    let mut summaries = Vec::with_capacity(5);

    let joined = join_churn_target(monthly, withdrawals).with_table(TARGET_TABLE);
    summaries.push(StageSummary::between("join_churn_target", monthly, &joined));

    let lifecycle = apply_contract_lifecycle_churn(&joined, advertisers)?;
    summaries.push(StageSummary::between(
        "apply_contract_lifecycle_churn",
        &joined,
        &lifecycle,
    ));

    let truncated = remove_activity_after_first_churn(&lifecycle)?;
    summaries.push(StageSummary::between(
        "remove_activity_after_first_churn",
        &lifecycle,
        &truncated,
    ));

    let complete = remove_incomplete_users(&truncated, latest_period)?;
    summaries.push(StageSummary::between(
        "remove_incomplete_users",
        &truncated,
        &complete,
    ));

    let active = remove_inactive_periods_without_contract(&complete)?;
    summaries.push(StageSummary::between(
        "remove_inactive_periods_without_contract",
        &complete,
        &active,
    ));

    Ok((active.sorted(), summaries))
}
