use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::commands::predict::score_matrix;
use crate::context::{AppContext, MODEL_FILE_SUFFIX};
use crate::dataset::{load_frame_auto, ACTIVE_CONTRACT_COLUMN};
use crate::error::PipelineResult;
use crate::evaluation::{evaluate_binary, BinaryMetrics};
use crate::lightgbm::{
    resolve_lightgbm_executable, train_model, write_libsvm_dataset, FeatureManifest,
    LightGbmBooster, LightGbmParams,
};
use crate::models::AdvertiserMonthFrame;
use crate::period::MonthPeriod;

pub const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrainDatasetSummary {
    rows: usize,
    advertisers: usize,
    feature_count: usize,
    first_month: Option<String>,
    last_month: Option<String>,
    positives: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrainSummary {
    model: String,
    feature_manifest: String,
    execution_month: String,
    training_window_months: usize,
    hyperparameters: LightGbmParams,
    dataset: TrainDatasetSummary,
    trees: usize,
    in_sample_metrics: BinaryMetrics,
}

/// Rows whose month falls in the `n_training_months` months ending at
/// `execution_month`, inclusive.
pub fn split_train_by_period(
    frame: &AdvertiserMonthFrame,
    execution_month: MonthPeriod,
    n_training_months: usize,
) -> AdvertiserMonthFrame {
    let first = execution_month.add_months(-(n_training_months as i64));
    frame.filtered(|row| row.month_period > first && row.month_period <= execution_month)
}

/// Model inputs in training order: every frame column, then the active
/// contract flag.
pub fn model_feature_names(frame: &AdvertiserMonthFrame) -> Vec<String> {
    frame
        .columns()
        .iter()
        .cloned()
        .chain(std::iter::once(ACTIVE_CONTRACT_COLUMN.to_string()))
        .collect()
}

/// One row of model inputs per frame row, in the order of `names`.
pub fn build_feature_matrix(
    frame: &AdvertiserMonthFrame,
    names: &[String],
) -> PipelineResult<Vec<Vec<f64>>> {
    // None stands for the typed has_active_contract field.
    let sources = names
        .iter()
        .map(|name| {
            if name == ACTIVE_CONTRACT_COLUMN {
                Ok(None)
            } else {
                frame.column_index(name).map(Some)
            }
        })
        .collect::<PipelineResult<Vec<Option<usize>>>>()?;

    Ok(frame
        .rows()
        .iter()
        .map(|row| {
            sources
                .iter()
                .map(|source| match source {
                    Some(idx) => row.values[*idx],
                    None => f64::from(u8::from(row.has_active_contract)),
                })
                .collect()
        })
        .collect())
}

pub fn feature_label_split(
    frame: &AdvertiserMonthFrame,
) -> PipelineResult<(Vec<String>, Vec<Vec<f64>>, Vec<u8>)> {
    let labels = frame.churn_labels()?;
    let names = model_feature_names(frame);
    let matrix = build_feature_matrix(frame, &names)?;
    Ok((names, matrix, labels))
}

fn model_destination(app: &AppContext, output: Option<PathBuf>) -> PathBuf {
    output.unwrap_or_else(|| {
        app.models_dir().join(format!(
            "{}{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            MODEL_FILE_SUFFIX
        ))
    })
}

fn training_months(frame: &AdvertiserMonthFrame) -> Vec<String> {
    frame
        .rows()
        .iter()
        .map(|row| row.month_period)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|month| month.to_string())
        .collect()
}

pub fn run(
    app: &AppContext,
    frame_path: Option<&Path>,
    output: Option<PathBuf>,
    params: &LightGbmParams,
) -> Result<()> {
    params.validate()?;
    let settings = app.settings();
    let frame_path = frame_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| app.modeling_frame_path());
    info!("Loading modeling frame from {}", frame_path.display());
    let frame = load_frame_auto(&frame_path)?;
    frame
        .require_churn()
        .with_context(|| format!("{} has no churn labels", frame_path.display()))?;

    let execution_month = settings.last_training_month;
    let train = split_train_by_period(&frame, execution_month, settings.training_window_months);
    if train.is_empty() {
        return Err(anyhow!(
            "No training rows in the {} months ending {}",
            settings.training_window_months,
            execution_month
        ));
    }
    let (names, matrix, labels) = feature_label_split(&train)?;
    let positives = labels.iter().filter(|label| **label == 1).count();
    let months = training_months(&train);
    info!(
        "Training on {} rows ({} churned) from {} advertisers, {} features, months {}..={}",
        train.len(),
        positives,
        train.advertiser_count(),
        names.len(),
        months.first().map(String::as_str).unwrap_or("-"),
        months.last().map(String::as_str).unwrap_or("-")
    );
    if positives == 0 || positives == labels.len() {
        warn!("Training labels contain a single class; the model will be constant");
    }

    let exe_path = resolve_lightgbm_executable(settings.lightgbm_executable.as_deref())?;
    let destination = model_destination(app, output);
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let dataset_path = std::env::temp_dir().join(format!("churn_train_{}.svm", Uuid::new_v4()));
    write_libsvm_dataset(&matrix, &labels, &dataset_path)?;
    let trained = train_model(&exe_path, params, &dataset_path, &destination);
    let _ = fs::remove_file(&dataset_path);
    trained?;
    info!("Saved LightGBM model to {}", destination.display());

    let manifest = FeatureManifest {
        features: names.clone(),
        trained_at: Utc::now().to_rfc3339(),
        training_months: months.clone(),
    };
    let manifest_path = manifest.save(&destination)?;

    let booster = LightGbmBooster::load(&destination)?;
    if booster.num_features() > names.len() {
        return Err(anyhow!(
            "Model {} expects {} features but {} were exported",
            destination.display(),
            booster.num_features(),
            names.len()
        ));
    }
    let scores = score_matrix(&booster, &matrix)?;
    let metrics = evaluate_binary(&labels, &scores, DECISION_THRESHOLD);
    info!(
        "In-sample: log loss {}, ROC AUC {}, average precision {}",
        format_metric(metrics.log_loss),
        format_metric(metrics.roc_auc),
        format_metric(metrics.average_precision)
    );

    let summary = TrainSummary {
        model: destination.display().to_string(),
        feature_manifest: manifest_path.display().to_string(),
        execution_month: execution_month.to_string(),
        training_window_months: settings.training_window_months,
        hyperparameters: params.clone(),
        dataset: TrainDatasetSummary {
            rows: train.len(),
            advertisers: train.advertiser_count(),
            feature_count: names.len(),
            first_month: months.first().cloned(),
            last_month: months.last().cloned(),
            positives,
        },
        trees: booster.num_trees(),
        in_sample_metrics: metrics,
    };
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("CHURN_TRAIN_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize training summary: {err}"),
    }

    Ok(())
}

pub(crate) fn format_metric(value: Option<f64>) -> String {
    value
        .map(|value| format!("{value:.4}"))
        .unwrap_or_else(|| "n/a".to_string())
}
