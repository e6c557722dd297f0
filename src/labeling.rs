use crate::error::PipelineResult;
use crate::models::{
    AdvertiserId, Advertiser, AdvertiserMonthFrame, LabeledWithdrawal, Withdrawal,
    WithdrawalStatus, WithdrawalType,
};
use crate::period::MonthPeriod;
use std::collections::{HashMap, HashSet};

/// Reasons recorded on approved total withdrawals that are contract
/// changes rather than the advertiser leaving.
pub const EXCLUDED_WITHDRAWAL_REASONS: [&str; 5] = [
    "Upselling-cambio de contrato",
    "Cambio a Bundle Online",
    "Cambio de Contrato/propuesta/producto",
    "Cambio de Contrato",
    "Upselling",
];

/// 1 for an approved, total withdrawal whose reason is not a contract
/// change; 0 otherwise. Missing values never count as churn.
pub fn label_withdrawal_churn(
    withdrawal_type: Option<&WithdrawalType>,
    withdrawal_status: Option<&WithdrawalStatus>,
    withdrawal_reason: Option<&str>,
) -> u8 {
    let approved = matches!(withdrawal_status, Some(WithdrawalStatus::Approved));
    let total = matches!(withdrawal_type, Some(WithdrawalType::Total));
    let churn_reason = withdrawal_reason
        .map(|reason| !EXCLUDED_WITHDRAWAL_REASONS.contains(&reason))
        .unwrap_or(false);
    u8::from(approved && total && churn_reason)
}

/// Month the label is attached to: one month before the withdrawal was filed.
pub fn predict_month(withdrawal_month: MonthPeriod) -> MonthPeriod {
    withdrawal_month.previous()
}

/// Labels every withdrawal independently.
pub fn label_withdrawals(withdrawals: &[Withdrawal]) -> Vec<LabeledWithdrawal> {
    withdrawals
        .iter()
        .map(|withdrawal| LabeledWithdrawal {
            advertiser_id: withdrawal.advertiser_id,
            withdrawal_month: withdrawal.withdrawal_month,
            predict_month: predict_month(withdrawal.withdrawal_month),
            churn: label_withdrawal_churn(
                withdrawal.withdrawal_type.as_ref(),
                withdrawal.withdrawal_status.as_ref(),
                withdrawal.withdrawal_reason.as_deref(),
            ),
        })
        .collect()
}

/// Left join of the monthly frame against withdrawal labels on
/// (advertiser, month_period = predict_month).
///
/// Withdrawals sharing a predict month are collapsed to their maximum label
/// first, so the output has exactly one row per input row.
pub fn join_churn_target(
    monthly: &AdvertiserMonthFrame,
    withdrawals: &[LabeledWithdrawal],
) -> AdvertiserMonthFrame {
    let mut churn_by_key: HashMap<(AdvertiserId, MonthPeriod), u8> = HashMap::new();
    for withdrawal in withdrawals {
        let slot = churn_by_key
            .entry((withdrawal.advertiser_id, withdrawal.predict_month))
            .or_insert(0);
        *slot = (*slot).max(withdrawal.churn);
    }

    monthly.with_churn(|row| {
        churn_by_key
            .get(&(row.advertiser_id, row.month_period))
            .copied()
            .unwrap_or(0)
    })
}

/// Marks churn on the month preceding each advertiser's contract churn date.
///
/// Only rows that exist are marked: an advertiser with no activity in that
/// exact month keeps its labels. Labels are only ever raised from 0 to 1.
pub fn apply_contract_lifecycle_churn(
    target: &AdvertiserMonthFrame,
    advertisers: &[Advertiser],
) -> PipelineResult<AdvertiserMonthFrame> {
    target.require_churn()?;

    let churn_attach_month: HashMap<AdvertiserId, MonthPeriod> = advertisers
        .iter()
        .filter_map(|advertiser| {
            advertiser
                .contract_churn_month()
                .map(|month| (advertiser.advertiser_id, predict_month(month)))
        })
        .collect();

    Ok(target.with_churn(|row| {
        let lifecycle_churn = churn_attach_month
            .get(&row.advertiser_id)
            .map(|month| *month == row.month_period)
            .unwrap_or(false);
        if lifecycle_churn {
            1
        } else {
            row.churn
        }
    }))
}

/// Advertisers with at least one churned withdrawal.
pub fn churned_advertisers(withdrawals: &[LabeledWithdrawal]) -> HashSet<AdvertiserId> {
    withdrawals
        .iter()
        .filter(|withdrawal| withdrawal.churn == 1)
        .map(|withdrawal| withdrawal.advertiser_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AdvertiserMonth;
    use chrono::NaiveDate;

    fn period(value: i64) -> MonthPeriod {
        MonthPeriod::from_yyyymm(value).unwrap()
    }

    fn label(kind: Option<&str>, status: Option<&str>, reason: Option<&str>) -> u8 {
        let kind = kind.map(WithdrawalType::parse);
        let status = status.map(WithdrawalStatus::parse);
        label_withdrawal_churn(kind.as_ref(), status.as_ref(), reason)
    }

    fn monthly_frame(keys: &[(AdvertiserId, i64)]) -> AdvertiserMonthFrame {
        AdvertiserMonthFrame::from_rows(
            "monthly snapshot",
            Vec::new(),
            keys.iter()
                .map(|(advertiser_id, month)| AdvertiserMonth {
                    advertiser_id: *advertiser_id,
                    month_period: period(*month),
                    has_active_contract: true,
                    churn: 0,
                    values: Vec::new(),
                })
                .collect(),
        )
    }

    fn labeled(advertiser_id: AdvertiserId, predict: i64, churn: u8) -> LabeledWithdrawal {
        LabeledWithdrawal {
            advertiser_id,
            withdrawal_month: period(predict).next(),
            predict_month: period(predict),
            churn,
        }
    }

    #[test]
    fn test_label_basic_cases() {
        assert_eq!(label(Some("TOTAL"), Some("Aprobada"), Some("Otra razón")), 1);
        assert_eq!(label(Some("TOTAL"), Some("Denegada"), Some("Cambio de Contrato")), 0);
        assert_eq!(label(Some("PARCIAL"), Some("Aprobada"), Some("Upselling")), 0);
        assert_eq!(label(Some("TOTAL"), Some("Aprobada"), Some("Motivo de churn")), 1);
    }

    #[test]
    fn test_label_excluded_reasons() {
        for reason in [
            "Upselling-cambio de contrato",
            "Cambio a Bundle Online",
            "Cambio de Contrato/propuesta/producto",
        ] {
            assert_eq!(label(Some("TOTAL"), Some("Aprobada"), Some(reason)), 0, "{reason}");
        }
    }

    #[test]
    fn test_label_is_case_sensitive() {
        assert_eq!(label(Some("total"), Some("Aprobada"), Some("Razón")), 0);
        assert_eq!(label(Some("TOTAL"), Some("aprobada"), Some("Razón")), 0);
        assert_eq!(
            label(Some("TOTAL"), Some("Aprobada"), Some("cambio a bundle online")),
            1
        );
    }

    #[test]
    fn test_label_missing_values_are_not_churn() {
        assert_eq!(label(Some("TOTAL"), None, Some("Razón")), 0);
        assert_eq!(label(None, Some("Aprobada"), Some("Cambio de Contrato")), 0);
        assert_eq!(label(Some("TOTAL"), Some("Aprobada"), None), 0);
    }

    #[test]
    fn test_predict_month_is_one_month_back() {
        assert_eq!(predict_month(period(202301)), period(202212));
        assert_eq!(predict_month(period(202303)), period(202302));
        assert_eq!(predict_month(period(202406)), period(202405));
        assert_eq!(predict_month(period(202406)).next(), period(202406));
    }

    #[test]
    fn test_label_withdrawals_attaches_predict_month() {
        let withdrawals = vec![Withdrawal {
            advertiser_id: 7,
            withdrawal_month: period(202405),
            withdrawal_type: Some(WithdrawalType::Total),
            withdrawal_status: Some(WithdrawalStatus::Approved),
            withdrawal_reason: Some("Precio".to_string()),
        }];
        let labeled = label_withdrawals(&withdrawals);
        assert_eq!(labeled.len(), 1);
        assert_eq!(labeled[0].predict_month, period(202404));
        assert_eq!(labeled[0].churn, 1);
        assert!(churned_advertisers(&labeled).contains(&7));
    }

    #[test]
    fn test_join_churn_target_merges_correctly() {
        let monthly = monthly_frame(&[(1, 202401), (2, 202402), (3, 202403)]);
        let withdrawals = vec![labeled(1, 202401, 1), labeled(3, 202403, 1)];

        let result = join_churn_target(&monthly, &withdrawals);

        assert_eq!(result.len(), 3);
        assert!(result.is_labeled());
        assert_eq!(result.churn_labels().unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn test_join_churn_target_deduplicates_withdrawals() {
        let monthly = monthly_frame(&[(1, 202401), (1, 202402)]);
        let withdrawals = vec![
            labeled(1, 202401, 0),
            labeled(1, 202401, 1),
            labeled(1, 202401, 0),
        ];

        let result = join_churn_target(&monthly, &withdrawals);

        assert_eq!(result.len(), 2);
        assert_eq!(result.churn_labels().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_join_churn_target_on_empty_frame() {
        let monthly = monthly_frame(&[]);
        let result = join_churn_target(&monthly, &[labeled(1, 202401, 1)]);
        assert!(result.is_empty());
        assert!(result.is_labeled());
    }

    #[test]
    fn test_lifecycle_churn_marks_previous_month() {
        let target = join_churn_target(&monthly_frame(&[(1, 202401), (1, 202402)]), &[]);
        let mut advertiser = Advertiser::new(1);
        advertiser.contract_churn_date = NaiveDate::from_ymd_opt(2024, 3, 5);

        let result = apply_contract_lifecycle_churn(&target, &[advertiser]).unwrap();

        assert_eq!(result.churn_labels().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_lifecycle_churn_without_activity_previous_month() {
        let target = join_churn_target(&monthly_frame(&[(3, 202401)]), &[]);
        let mut advertiser = Advertiser::new(3);
        advertiser.contract_churn_date = NaiveDate::from_ymd_opt(2024, 4, 1);

        let result = apply_contract_lifecycle_churn(&target, &[advertiser]).unwrap();

        assert_eq!(result, target);
    }

    #[test]
    fn test_lifecycle_churn_never_downgrades() {
        let target = join_churn_target(
            &monthly_frame(&[(1, 202401), (1, 202402)]),
            &[labeled(1, 202401, 1)],
        );
        let mut advertiser = Advertiser::new(1);
        advertiser.contract_churn_date = NaiveDate::from_ymd_opt(2024, 3, 1);

        let result = apply_contract_lifecycle_churn(&target, &[advertiser]).unwrap();

        assert_eq!(result.churn_labels().unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_lifecycle_churn_requires_churn_column() {
        let unlabeled = monthly_frame(&[(1, 202401)]);
        assert!(apply_contract_lifecycle_churn(&unlabeled, &[]).is_err());
    }
}
