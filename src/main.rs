use anyhow::Result;
use churn_engine::{
    commands::{predict, prepare_data, train},
    config::{PipelineSettings, SETTING_KEYS},
    context::AppContext,
    lightgbm::LightGbmParams,
    period::MonthPeriod,
};
use clap::{Parser, Subcommand};
use log::info;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "churn-engine")]
#[command(about = "Advertiser churn labeling, feature engineering and scoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the labeled modeling frame from the raw tables in the data directory
    PrepareData {
        /// JSON feature catalog (defaults to the built-in catalog)
        #[arg(long = "feature-config", value_name = "PATH")]
        feature_config: Option<PathBuf>,
        /// Also write a binary snapshot of the modeling frame
        #[arg(long)]
        snapshot: bool,
    },
    /// Train a LightGBM churn model on the configured training window
    Train {
        /// Modeling frame to train on (CSV or .bin snapshot)
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Destination for the trained model (defaults to a timestamped file in the models directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of boosting iterations
        #[arg(long)]
        num_iterations: Option<u32>,
        /// Learning rate
        #[arg(long)]
        learning_rate: Option<f64>,
        /// Number of leaves in one tree
        #[arg(long)]
        num_leaves: Option<u32>,
        /// Maximum tree depth (-1 means no limit)
        #[arg(long)]
        max_depth: Option<i32>,
        /// Minimum sum of hessians in one leaf
        #[arg(long)]
        min_sum_hessian_in_leaf: Option<f64>,
        /// Bagging fraction (0..=1)
        #[arg(long)]
        bagging_fraction: Option<f64>,
        /// Bagging frequency (0 disables bagging)
        #[arg(long)]
        bagging_freq: Option<u32>,
        /// Feature fraction (0..=1)
        #[arg(long)]
        feature_fraction: Option<f64>,
        /// L1 regularization
        #[arg(long)]
        lambda_l1: Option<f64>,
        /// L2 regularization
        #[arg(long)]
        lambda_l2: Option<f64>,
        /// Training threads
        #[arg(long)]
        num_threads: Option<u32>,
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score the modeling frame with a trained model
    Predict {
        /// Model file (defaults to the latest model in the models directory)
        #[arg(long, value_name = "PATH")]
        model: Option<PathBuf>,
        /// Modeling frame to score (CSV or .bin snapshot)
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Only score months on or after this one (YYYY-MM or YYYYMM)
        #[arg(long = "from-month", value_name = "MONTH")]
        from_month: Option<MonthPeriod>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = PipelineSettings::from_settings_map(&environment_settings())?;
    let app_context = AppContext::initialize(settings);
    info!(
        "Data directory {}, models directory {}",
        app_context.data_dir().display(),
        app_context.models_dir().display()
    );

    match cli.command {
        Commands::PrepareData {
            feature_config,
            snapshot,
        } => {
            let config =
                prepare_data::resolve_feature_config(&app_context, feature_config.as_deref())?;
            prepare_data::run(&app_context, &config, snapshot)?;
        }
        Commands::Train {
            data_file,
            output,
            num_iterations,
            learning_rate,
            num_leaves,
            max_depth,
            min_sum_hessian_in_leaf,
            bagging_fraction,
            bagging_freq,
            feature_fraction,
            lambda_l1,
            lambda_l2,
            num_threads,
            seed,
        } => {
            let defaults = LightGbmParams::default();
            let params = LightGbmParams {
                num_iterations: num_iterations.unwrap_or(defaults.num_iterations),
                learning_rate: learning_rate.unwrap_or(defaults.learning_rate),
                num_leaves: num_leaves.unwrap_or(defaults.num_leaves),
                max_depth: max_depth.unwrap_or(defaults.max_depth),
                min_sum_hessian_in_leaf: min_sum_hessian_in_leaf
                    .unwrap_or(defaults.min_sum_hessian_in_leaf),
                bagging_fraction: bagging_fraction.unwrap_or(defaults.bagging_fraction),
                bagging_freq: bagging_freq.unwrap_or(defaults.bagging_freq),
                feature_fraction: feature_fraction.unwrap_or(defaults.feature_fraction),
                lambda_l1: lambda_l1.unwrap_or(defaults.lambda_l1),
                lambda_l2: lambda_l2.unwrap_or(defaults.lambda_l2),
                num_threads: num_threads.unwrap_or(defaults.num_threads),
                seed: seed.unwrap_or(defaults.seed),
            };
            train::run(&app_context, data_file.as_deref(), output, &params)?;
        }
        Commands::Predict {
            model,
            data_file,
            from_month,
        } => {
            predict::run(&app_context, model, data_file.as_deref(), from_month)?;
        }
    }

    Ok(())
}

fn environment_settings() -> HashMap<String, String> {
    SETTING_KEYS
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}
