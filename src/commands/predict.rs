use anyhow::{anyhow, Context, Result};
use csv::WriterBuilder;
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::train::{build_feature_matrix, format_metric, DECISION_THRESHOLD};
use crate::context::AppContext;
use crate::dataset::{load_frame_auto, ADVERTISER_ID_COLUMN, PERIOD_INT_COLUMN};
use crate::evaluation::{evaluate_binary, BinaryMetrics};
use crate::lightgbm::{FeatureManifest, LightGbmBooster};
use crate::models::{AdvertiserMonthFrame, CHURN_COLUMN};
use crate::period::MonthPeriod;

pub const PREDICTION_COLUMN: &str = "prediction";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictSummary {
    model: String,
    frame: String,
    from_month: Option<String>,
    rows: usize,
    advertisers: usize,
    mean_prediction: Option<f64>,
    predictions: String,
    metrics: Option<BinaryMetrics>,
}

/// Churn probability per matrix row.
pub fn score_matrix(booster: &LightGbmBooster, matrix: &[Vec<f64>]) -> Result<Vec<f64>> {
    matrix
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            booster.predict_probability(row).ok_or_else(|| {
                anyhow!(
                    "Row {} has {} features, model expects {}",
                    idx + 1,
                    row.len(),
                    booster.num_features()
                )
            })
        })
        .collect()
}

pub fn predictions_path(app: &AppContext, model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("model");
    app.predictions_dir().join(format!("{stem}_predictions.csv"))
}

/// `advertiser_zrive_id, period_int, churn, prediction`; churn is empty for
/// unlabeled frames.
pub fn write_predictions(frame: &AdvertiserMonthFrame, scores: &[f64], path: &Path) -> Result<()> {
    if frame.len() != scores.len() {
        return Err(anyhow!(
            "{} predictions for {} rows",
            scores.len(),
            frame.len()
        ));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Unable to create {}", path.display()))?;
    writer.write_record([
        ADVERTISER_ID_COLUMN,
        PERIOD_INT_COLUMN,
        CHURN_COLUMN,
        PREDICTION_COLUMN,
    ])?;
    for (row, score) in frame.rows().iter().zip(scores) {
        let churn = if frame.is_labeled() {
            row.churn.to_string()
        } else {
            String::new()
        };
        writer.write_record([
            row.advertiser_id.to_string(),
            row.month_period.to_yyyymm().to_string(),
            churn,
            format!("{score:.10}"),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

pub fn run(
    app: &AppContext,
    model: Option<PathBuf>,
    frame_path: Option<&Path>,
    from_month: Option<MonthPeriod>,
) -> Result<()> {
    let model_path = match model {
        Some(path) => path,
        None => app.latest_model_path()?,
    };
    let manifest = FeatureManifest::load(&model_path)?;
    let booster = LightGbmBooster::load(&model_path)?;
    if booster.num_features() > manifest.features.len() {
        return Err(anyhow!(
            "Model {} uses {} features but its manifest lists {}",
            model_path.display(),
            booster.num_features(),
            manifest.features.len()
        ));
    }
    info!(
        "Loaded model {} ({} trees, {} features, trained {})",
        model_path.display(),
        booster.num_trees(),
        manifest.features.len(),
        manifest.trained_at
    );

    let frame_path = frame_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| app.modeling_frame_path());
    let frame = load_frame_auto(&frame_path)?;
    let frame = match from_month {
        Some(month) => frame.filtered(|row| row.month_period >= month),
        None => frame,
    };
    if frame.is_empty() {
        warn!("No rows to score in {}", frame_path.display());
    }

    let matrix = build_feature_matrix(&frame, &manifest.features)
        .with_context(|| format!("{} does not match the model features", frame_path.display()))?;
    let scores = score_matrix(&booster, &matrix)?;

    let metrics = if frame.is_labeled() && !frame.is_empty() {
        let labels = frame.churn_labels()?;
        let metrics = evaluate_binary(&labels, &scores, DECISION_THRESHOLD);
        info!(
            "Scored {} rows: log loss {}, ROC AUC {}, average precision {}, recall {}",
            metrics.rows,
            format_metric(metrics.log_loss),
            format_metric(metrics.roc_auc),
            format_metric(metrics.average_precision),
            format_metric(metrics.recall)
        );
        Some(metrics)
    } else {
        info!("Scored {} unlabeled rows", frame.len());
        None
    };

    let output = predictions_path(app, &model_path);
    write_predictions(&frame, &scores, &output)?;
    info!("Wrote predictions to {}", output.display());

    let summary = PredictSummary {
        model: model_path.display().to_string(),
        frame: frame_path.display().to_string(),
        from_month: from_month.map(|month| month.to_string()),
        rows: frame.len(),
        advertisers: frame.advertiser_count(),
        mean_prediction: (!scores.is_empty())
            .then(|| scores.iter().sum::<f64>() / scores.len() as f64),
        predictions: output.display().to_string(),
        metrics,
    };
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("CHURN_PREDICT_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize prediction summary: {err}"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AdvertiserMonth;
    use uuid::Uuid;

    fn frame(labeled: bool) -> AdvertiserMonthFrame {
        let frame = AdvertiserMonthFrame::from_rows(
            "modeling frame",
            vec!["tenure".to_string()],
            vec![
                AdvertiserMonth {
                    advertiser_id: 4,
                    month_period: MonthPeriod::from_yyyymm(202403).unwrap(),
                    has_active_contract: true,
                    churn: 1,
                    values: vec![2.0],
                },
                AdvertiserMonth {
                    advertiser_id: 5,
                    month_period: MonthPeriod::from_yyyymm(202404).unwrap(),
                    has_active_contract: false,
                    churn: 0,
                    values: vec![0.0],
                },
            ],
        );
        if labeled {
            frame.mark_labeled()
        } else {
            frame
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("churn_predict_{}", Uuid::new_v4()))
            .join("out.csv")
    }

    #[test]
    fn writes_one_line_per_row() {
        let path = temp_path();
        write_predictions(&frame(true), &[0.75, 0.125], &path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines,
            vec![
                "advertiser_zrive_id,period_int,churn,prediction",
                "4,202403,1,0.7500000000",
                "5,202404,0,0.1250000000",
            ]
        );
    }

    #[test]
    fn unlabeled_rows_leave_churn_empty() {
        let path = temp_path();
        write_predictions(&frame(false), &[0.5, 0.5], &path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().nth(1), Some("4,202403,,0.5000000000"));
    }

    #[test]
    fn rejects_mismatched_scores() {
        assert!(write_predictions(&frame(true), &[0.5], &temp_path()).is_err());
    }
}
