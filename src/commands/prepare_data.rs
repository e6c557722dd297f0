use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::context::AppContext;
use crate::dataset::{
    load_advertisers, load_monthly_snapshot, load_withdrawals_with_report, save_snapshot,
    write_modeling_frame,
};
use crate::features::{engineer_features_with_report, FeatureConfig};
use crate::labeling::{churned_advertisers, label_withdrawals};
use crate::models::AdvertiserMonthFrame;
use crate::target::{build_target_frame, StageSummary};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrepareInputSummary {
    withdrawals: usize,
    skipped_withdrawals: usize,
    churning_withdrawals: usize,
    churning_advertisers: usize,
    advertisers: usize,
    monthly_rows: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrepareSummary {
    inputs: PrepareInputSummary,
    stages: Vec<StageSummary>,
    rows: usize,
    advertisers: usize,
    feature_columns: usize,
    churn_rate: f64,
    latest_period: Option<String>,
    modeling_frame: String,
    snapshot: Option<String>,
}

/// Feature catalog from a JSON file, or the default catalog. The rolling std
/// mode setting applies only to the default catalog.
pub fn resolve_feature_config(app: &AppContext, path: Option<&Path>) -> Result<FeatureConfig> {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read feature config {}", path.display()))?;
            FeatureConfig::from_json_str(&raw)
                .with_context(|| format!("Invalid feature config {}", path.display()))
        }
        None => Ok(FeatureConfig::default().with_std_mode(app.settings().rolling_std_mode)),
    }
}

fn churn_rate(frame: &AdvertiserMonthFrame) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let churned = frame.rows().iter().filter(|row| row.churn == 1).count();
    churned as f64 / frame.len() as f64
}

fn log_stages(stages: &[StageSummary]) {
    for stage in stages {
        info!(
            "{}: {} -> {} rows ({} dropped, {} advertisers)",
            stage.stage,
            stage.rows_in,
            stage.rows_out,
            stage.rows_dropped(),
            stage.advertisers_out
        );
    }
}

pub fn run(app: &AppContext, feature_config: &FeatureConfig, write_snapshot: bool) -> Result<()> {
    info!("Preparing modeling frame from {}", app.data_dir().display());

    let (withdrawals, skipped_withdrawals) = load_withdrawals_with_report(&app.withdrawals_path())?;
    if skipped_withdrawals > 0 {
        warn!("Skipped {skipped_withdrawals} withdrawal(s) without a creation date");
    }
    let advertisers = load_advertisers(&app.advertisers_path())?;
    let monthly = load_monthly_snapshot(&app.monthly_snapshot_path())?;

    let labeled = label_withdrawals(&withdrawals);
    let churning_withdrawals = labeled.iter().filter(|w| w.churn == 1).count();
    let churning_advertisers = churned_advertisers(&labeled).len();
    info!(
        "Labeled {} withdrawals: {} churn events across {} advertisers",
        labeled.len(),
        churning_withdrawals,
        churning_advertisers
    );

    let latest_period = app
        .settings()
        .latest_period
        .or_else(|| monthly.latest_period());
    match latest_period {
        Some(period) => info!("Censoring advertisers inactive before {period}"),
        None => warn!("Monthly snapshot is empty; no latest period to censor against"),
    }

    let (target, mut stages) =
        build_target_frame(&monthly, &labeled, &advertisers, latest_period)
            .context("Failed to build target frame")?;
    let (modeling, feature_stages) =
        engineer_features_with_report(&target, &advertisers, feature_config)
            .context("Failed to engineer features")?;
    stages.extend(feature_stages);
    log_stages(&stages);

    let rate = churn_rate(&modeling);
    info!(
        "Modeling frame: {} rows, {} advertisers, {} feature columns, churn rate {:.4}",
        modeling.len(),
        modeling.advertiser_count(),
        modeling.columns().len(),
        rate
    );
    if modeling.is_empty() {
        warn!("Modeling frame is empty after filtering");
    }

    let frame_path = app.modeling_frame_path();
    write_modeling_frame(&modeling, &frame_path)?;

    let snapshot_path = if write_snapshot {
        let path = app.modeling_snapshot_path();
        save_snapshot(&modeling, &path)?;
        info!("Saved modeling snapshot to {}", path.display());
        Some(path)
    } else {
        None
    };

    let summary = PrepareSummary {
        inputs: PrepareInputSummary {
            withdrawals: withdrawals.len(),
            skipped_withdrawals,
            churning_withdrawals,
            churning_advertisers,
            advertisers: advertisers.len(),
            monthly_rows: monthly.len(),
        },
        stages,
        rows: modeling.len(),
        advertisers: modeling.advertiser_count(),
        feature_columns: modeling.columns().len(),
        churn_rate: rate,
        latest_period: latest_period.map(|period| period.to_string()),
        modeling_frame: frame_path.display().to_string(),
        snapshot: snapshot_path.map(|path| path.display().to_string()),
    };
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("CHURN_PREPARE_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize prepare summary: {err}"),
    }

    Ok(())
}
