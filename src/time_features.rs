use crate::error::PipelineResult;
use crate::models::{AdvertiserId, Advertiser, AdvertiserMonthFrame};
use crate::period::MonthPeriod;
use rayon::prelude::*;
use std::collections::HashMap;

pub const TENURE_COLUMN: &str = "tenure";
pub const MONTHS_SINCE_LAST_CONTRACT_COLUMN: &str = "months_since_last_contract";
pub const HAS_RENEWED_COLUMN: &str = "has_renewed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenureFeatures {
    pub tenure: i64,
    pub months_since_last_contract: i64,
    pub has_renewed: u8,
}

/// Lifecycle features for one advertiser-month.
///
/// Tenure counts from the earlier of first observed activity and first
/// contract start. Recency counts from the latest contract start when that
/// start is not in the future, and otherwise equals tenure.
pub fn tenure_features(
    month: MonthPeriod,
    earliest_activity: MonthPeriod,
    advertiser: Option<&Advertiser>,
) -> TenureFeatures {
    let contract_start = advertiser.and_then(Advertiser::min_start_month);
    let earliest_start = contract_start
        .map(|start| start.min(earliest_activity))
        .unwrap_or(earliest_activity);
    let tenure = (month - earliest_start).max(0);

    let months_since_last_contract = match advertiser.and_then(Advertiser::max_start_new_month) {
        Some(latest_start) if latest_start <= month => month - latest_start,
        _ => tenure,
    };

    TenureFeatures {
        tenure,
        months_since_last_contract,
        has_renewed: advertiser.map(has_renewed).unwrap_or(0),
    }
}

pub fn has_renewed(advertiser: &Advertiser) -> u8 {
    match (
        advertiser.min_start_contract_date,
        advertiser.max_start_contract_new_date,
    ) {
        (Some(first_start), Some(latest_start)) => u8::from(latest_start > first_start),
        _ => 0,
    }
}

/// Earliest month with a row, per advertiser, over the whole frame.
pub fn earliest_activity_by_advertiser(
    frame: &AdvertiserMonthFrame,
) -> HashMap<AdvertiserId, MonthPeriod> {
    let mut earliest: HashMap<AdvertiserId, MonthPeriod> = HashMap::new();
    for row in frame.rows() {
        earliest
            .entry(row.advertiser_id)
            .and_modify(|month| *month = (*month).min(row.month_period))
            .or_insert(row.month_period);
    }
    earliest
}

/// Appends `tenure`, `months_since_last_contract` and `has_renewed`.
pub fn create_time_features(
    frame: &AdvertiserMonthFrame,
    advertisers: &[Advertiser],
) -> PipelineResult<AdvertiserMonthFrame> {
    let earliest_activity = earliest_activity_by_advertiser(frame);
    let by_id: HashMap<AdvertiserId, &Advertiser> = advertisers
        .iter()
        .map(|advertiser| (advertiser.advertiser_id, advertiser))
        .collect();

    let features: Vec<TenureFeatures> = frame
        .rows()
        .par_iter()
        .map(|row| {
            let first_seen = earliest_activity
                .get(&row.advertiser_id)
                .copied()
                .unwrap_or(row.month_period);
            tenure_features(
                row.month_period,
                first_seen,
                by_id.get(&row.advertiser_id).copied(),
            )
        })
        .collect();

    let tenure = features.iter().map(|f| f.tenure as f64).collect();
    let since_contract = features
        .iter()
        .map(|f| f.months_since_last_contract as f64)
        .collect();
    let renewed = features.iter().map(|f| f.has_renewed as f64).collect();

    Ok(frame.with_columns(
        vec![
            TENURE_COLUMN.to_string(),
            MONTHS_SINCE_LAST_CONTRACT_COLUMN.to_string(),
            HAS_RENEWED_COLUMN.to_string(),
        ],
        vec![tenure, since_contract, renewed],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AdvertiserMonth;
    use chrono::NaiveDate;

    fn period(value: i64) -> MonthPeriod {
        MonthPeriod::from_yyyymm(value).unwrap()
    }

    fn advertiser(
        advertiser_id: AdvertiserId,
        min_start: Option<(i32, u32)>,
        max_start_new: Option<(i32, u32)>,
        churn: Option<(i32, u32)>,
    ) -> Advertiser {
        let date = |(year, month): (i32, u32)| NaiveDate::from_ymd_opt(year, month, 1);
        let mut advertiser = Advertiser::new(advertiser_id);
        advertiser.min_start_contract_date = min_start.and_then(date);
        advertiser.max_start_contract_new_date = max_start_new.and_then(date);
        advertiser.contract_churn_date = churn.and_then(date);
        advertiser
    }

    fn frame(rows: &[(AdvertiserId, i64, bool)]) -> AdvertiserMonthFrame {
        AdvertiserMonthFrame::from_rows(
            "target frame",
            Vec::new(),
            rows.iter()
                .map(|(advertiser_id, month, active)| AdvertiserMonth {
                    advertiser_id: *advertiser_id,
                    month_period: period(*month),
                    has_active_contract: *active,
                    churn: 0,
                    values: Vec::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn activity_before_contract_extends_tenure() {
        let df = frame(&[(2, 202312, false), (2, 202402, false)]);
        let advertisers = [advertiser(2, Some((2024, 1)), Some((2024, 3)), Some((2024, 6)))];

        let result = create_time_features(&df, &advertisers).unwrap();

        // Tenure counts whole months from the Dec 2023 activity, the earliest start.
        assert_eq!(result.column(TENURE_COLUMN).unwrap(), vec![0.0, 2.0]);
        // No contract start on or before either row, so recency falls back to tenure.
        assert_eq!(
            result.column(MONTHS_SINCE_LAST_CONTRACT_COLUMN).unwrap(),
            vec![0.0, 2.0]
        );
        assert_eq!(result.column(HAS_RENEWED_COLUMN).unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn contract_dates_drive_features_after_renewal() {
        let df = frame(&[(2, 202407, true)]);
        let advertisers = [advertiser(2, Some((2024, 1)), Some((2024, 3)), Some((2024, 6)))];

        let result = create_time_features(&df, &advertisers).unwrap();

        assert_eq!(result.column(TENURE_COLUMN).unwrap(), vec![6.0]);
        assert_eq!(
            result.column(MONTHS_SINCE_LAST_CONTRACT_COLUMN).unwrap(),
            vec![4.0]
        );
        assert_eq!(result.column(HAS_RENEWED_COLUMN).unwrap(), vec![1.0]);
    }

    #[test]
    fn without_renewal_recency_falls_back_to_tenure() {
        let df = frame(&[(3, 202501, false)]);
        let advertisers = [advertiser(3, Some((2024, 1)), None, Some((2024, 6)))];

        let result = create_time_features(&df, &advertisers).unwrap();

        assert_eq!(result.column(TENURE_COLUMN).unwrap(), vec![12.0]);
        assert_eq!(
            result.column(MONTHS_SINCE_LAST_CONTRACT_COLUMN).unwrap(),
            vec![12.0]
        );
        assert_eq!(result.column(HAS_RENEWED_COLUMN).unwrap(), vec![0.0]);
    }

    #[test]
    fn unknown_advertiser_uses_activity_only() {
        let df = frame(&[(9, 202401, true), (9, 202404, true)]);

        let result = create_time_features(&df, &[]).unwrap();

        assert_eq!(result.column(TENURE_COLUMN).unwrap(), vec![0.0, 3.0]);
        assert_eq!(
            result.column(MONTHS_SINCE_LAST_CONTRACT_COLUMN).unwrap(),
            vec![0.0, 3.0]
        );
        assert_eq!(result.column(HAS_RENEWED_COLUMN).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn renewal_requires_a_strictly_later_start() {
        assert_eq!(has_renewed(&advertiser(1, Some((2024, 1)), Some((2024, 1)), None)), 0);
        assert_eq!(has_renewed(&advertiser(1, None, Some((2024, 1)), None)), 0);
        assert_eq!(has_renewed(&advertiser(1, Some((2024, 1)), Some((2024, 2)), None)), 1);
    }

    #[test]
    fn tenure_is_floored_at_zero() {
        let features = tenure_features(period(202401), period(202403), None);
        assert_eq!(features.tenure, 0);
        assert_eq!(features.months_since_last_contract, 0);
    }

    #[test]
    fn empty_frame_keeps_schema() {
        let result = create_time_features(&frame(&[]), &[]).unwrap();
        assert!(result.is_empty());
        assert_eq!(
            result.columns(),
            &[
                TENURE_COLUMN.to_string(),
                MONTHS_SINCE_LAST_CONTRACT_COLUMN.to_string(),
                HAS_RENEWED_COLUMN.to_string()
            ]
        );
    }
}
