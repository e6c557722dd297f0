use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

const CATEGORICAL_MASK: i32 = 1;
const DEFAULT_LEFT_MASK: i32 = 2;
const ZERO_THRESHOLD: f64 = 1e-35;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightGbmParams {
    pub num_iterations: u32,
    pub learning_rate: f64,
    pub num_leaves: u32,
    pub max_depth: i32,
    pub min_sum_hessian_in_leaf: f64,
    pub bagging_fraction: f64,
    pub bagging_freq: u32,
    pub feature_fraction: f64,
    pub lambda_l1: f64,
    pub lambda_l2: f64,
    pub num_threads: u32,
    pub seed: u64,
}

impl Default for LightGbmParams {
    fn default() -> Self {
        Self {
            num_iterations: 150,
            learning_rate: 0.01,
            num_leaves: 8,
            max_depth: 3,
            min_sum_hessian_in_leaf: 10.0,
            bagging_fraction: 0.8,
            bagging_freq: 1,
            feature_fraction: 0.8,
            lambda_l1: 1.0,
            lambda_l2: 1.0,
            num_threads: 10,
            seed: 1,
        }
    }
}

impl LightGbmParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_iterations == 0 {
            return Err(anyhow!("num_iterations must be >= 1"));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(anyhow!(
                "learning_rate must be > 0 (value: {})",
                self.learning_rate
            ));
        }
        for (name, value) in [
            ("bagging_fraction", self.bagging_fraction),
            ("feature_fraction", self.feature_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("{name} must be in (0, 1] (value: {value})"));
            }
        }
        Ok(())
    }

    pub fn cli_args(&self) -> Vec<String> {
        vec![
            String::from("objective=binary"),
            String::from("metric=binary_logloss"),
            format!("num_iterations={}", self.num_iterations),
            format!("learning_rate={}", self.learning_rate),
            format!("num_leaves={}", self.num_leaves),
            format!("max_depth={}", self.max_depth),
            format!("min_sum_hessian_in_leaf={}", self.min_sum_hessian_in_leaf),
            format!("bagging_fraction={}", self.bagging_fraction),
            format!("bagging_freq={}", self.bagging_freq),
            format!("feature_fraction={}", self.feature_fraction),
            format!("lambda_l1={}", self.lambda_l1),
            format!("lambda_l2={}", self.lambda_l2),
            format!("num_threads={}", self.num_threads),
            format!("seed={}", self.seed),
            String::from("deterministic=true"),
        ]
    }
}

/// Explicit path first, then `vendor/` next to the manifest, then `PATH`.
pub fn resolve_lightgbm_executable(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(anyhow!(
            "LightGBM executable not found at {}",
            path.display()
        ));
    }

    let binary = if cfg!(windows) {
        "lightgbm.exe"
    } else {
        "lightgbm"
    };
    let vendor_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("vendor")
        .join(binary);
    if vendor_path.exists() {
        return Ok(vendor_path);
    }

    if let Some(path) = find_in_path(binary) {
        return Ok(path);
    }

    Err(anyhow!(
        "{binary} not found in vendor/ or PATH; install the LightGBM CLI or set LIGHTGBM_EXECUTABLE"
    ))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_value = std::env::var_os("PATH")?;
    std::env::split_paths(&path_value)
        .map(|entry| entry.join(binary))
        .find(|candidate| candidate.exists())
}

fn format_feature(value: f64) -> String {
    if value.is_nan() {
        String::from("nan")
    } else {
        format!("{:.10}", value)
    }
}

/// One line per row: `label idx:value ...`, zero-based feature indices.
pub fn write_libsvm_dataset(features: &[Vec<f64>], labels: &[u8], path: &Path) -> Result<()> {
    if features.len() != labels.len() {
        return Err(anyhow!(
            "feature rows ({}) and labels ({}) differ in length",
            features.len(),
            labels.len()
        ));
    }
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Unable to create {}", path.display()))?,
    );

    for (row, label) in features.iter().zip(labels) {
        let mut line = label.to_string();
        for (idx, value) in row.iter().enumerate() {
            line.push(' ');
            line.push_str(&format!("{}:{}", idx, format_feature(*value)));
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }

    writer.flush()?;
    Ok(())
}

/// Runs `task=train` and leaves the text model at `output_model`.
pub fn train_model(
    executable: &Path,
    params: &LightGbmParams,
    dataset_path: &Path,
    output_model: &Path,
) -> Result<()> {
    params.validate()?;
    let mut args = vec![String::from("task=train")];
    args.extend(params.cli_args());
    args.push(format!("data={}", dataset_path.to_string_lossy()));
    args.push(format!("output_model={}", output_model.to_string_lossy()));
    args.push(String::from("verbosity=1"));

    info!(
        "Launching LightGBM: num_iterations={}, learning_rate={}, max_depth={}, min_sum_hessian_in_leaf={}, bagging_fraction={}, feature_fraction={}, lambda_l1={}, lambda_l2={}",
        params.num_iterations,
        params.learning_rate,
        params.max_depth,
        params.min_sum_hessian_in_leaf,
        params.bagging_fraction,
        params.feature_fraction,
        params.lambda_l1,
        params.lambda_l2,
    );

    let status = Command::new(executable)
        .args(&args)
        .status()
        .with_context(|| format!("Failed to spawn {}", executable.display()))?;
    if !status.success() {
        return Err(anyhow!("LightGBM training failed with status {status}"));
    }
    Ok(())
}

/// Feature column order a model was trained with, stored next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureManifest {
    pub features: Vec<String>,
    pub trained_at: String,
    pub training_months: Vec<String>,
}

impl FeatureManifest {
    pub fn path_for(model_path: &Path) -> PathBuf {
        let mut os: OsString = model_path.as_os_str().to_os_string();
        os.push(".features.json");
        PathBuf::from(os)
    }

    pub fn save(&self, model_path: &Path) -> Result<PathBuf> {
        let path = Self::path_for(model_path);
        let payload = serde_json::to_string_pretty(self)?;
        fs::write(&path, payload)
            .with_context(|| format!("Failed to write feature manifest {}", path.display()))?;
        Ok(path)
    }

    pub fn load(model_path: &Path) -> Result<Self> {
        let path = Self::path_for(model_path);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read feature manifest {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid feature manifest {}", path.display()))
    }
}

#[derive(Debug)]
struct LightGbmTree {
    split_features: Vec<usize>,
    thresholds: Vec<f64>,
    decision_types: Vec<i32>,
    left_child: Vec<i32>,
    right_child: Vec<i32>,
    leaf_values: Vec<f64>,
}

impl LightGbmTree {
    fn from_lines(lines: &mut std::iter::Peekable<std::str::Lines<'_>>) -> Result<Self> {
        let mut num_leaves: Option<usize> = None;
        let mut split_features = Vec::new();
        let mut thresholds = Vec::new();
        let mut decision_types = Vec::new();
        let mut left_child = Vec::new();
        let mut right_child = Vec::new();
        let mut leaf_values = Vec::new();

        while let Some(peeked) = lines.peek() {
            if peeked.starts_with("Tree=") || peeked.starts_with("end of trees") {
                break;
            }
            let Some(raw_line) = lines.next() else {
                break;
            };
            let Some((key, raw)) = model_field(raw_line) else {
                continue;
            };
            match key {
                "num_leaves" => num_leaves = Some(parse_scalar(key, raw)?),
                "split_feature" => split_features = parse_list(key, raw)?,
                "threshold" => thresholds = parse_list(key, raw)?,
                "decision_type" => decision_types = parse_list(key, raw)?,
                "left_child" => left_child = parse_list(key, raw)?,
                "right_child" => right_child = parse_list(key, raw)?,
                "leaf_value" => leaf_values = parse_list(key, raw)?,
                _ => {}
            }
        }

        let internal_nodes = split_features.len();
        if thresholds.len() != internal_nodes
            || left_child.len() != internal_nodes
            || right_child.len() != internal_nodes
        {
            return Err(anyhow!(
                "LightGBM tree definition invalid: split/child/threshold length mismatch"
            ));
        }
        if decision_types.is_empty() {
            decision_types = vec![0; internal_nodes];
        } else if decision_types.len() != internal_nodes {
            return Err(anyhow!(
                "LightGBM tree definition invalid: decision_type length mismatch"
            ));
        }
        if decision_types
            .iter()
            .any(|decision| decision & CATEGORICAL_MASK != 0)
        {
            return Err(anyhow!("Categorical LightGBM splits are not supported"));
        }

        let declared_leaves = num_leaves.unwrap_or(leaf_values.len());
        if declared_leaves != leaf_values.len() {
            return Err(anyhow!(
                "LightGBM tree leaf count mismatch: expected {declared_leaves}, found {}",
                leaf_values.len()
            ));
        }

        Ok(Self {
            split_features,
            thresholds,
            decision_types,
            left_child,
            right_child,
            leaf_values,
        })
    }

    fn go_left(&self, node_idx: usize, value: f64) -> bool {
        let decision = self.decision_types[node_idx];
        let missing_type = (decision >> 2) & 3;
        let value = if value.is_nan() && missing_type != 2 {
            0.0
        } else {
            value
        };
        let is_missing = (missing_type == 1 && value.abs() <= ZERO_THRESHOLD)
            || (missing_type == 2 && value.is_nan());
        if is_missing {
            decision & DEFAULT_LEFT_MASK != 0
        } else {
            value <= self.thresholds[node_idx]
        }
    }

    fn predict(&self, features: &[f64]) -> f64 {
        if self.split_features.is_empty() {
            return self.leaf_values.first().copied().unwrap_or_default();
        }
        let mut node_idx = 0usize;
        loop {
            let feature_idx = self.split_features[node_idx];
            let value = features.get(feature_idx).copied().unwrap_or(f64::NAN);
            let child = if self.go_left(node_idx, value) {
                self.left_child[node_idx]
            } else {
                self.right_child[node_idx]
            };

            if child < 0 {
                let leaf_idx = (-child - 1) as usize;
                return self.leaf_values.get(leaf_idx).copied().unwrap_or_default();
            }

            node_idx = child as usize;
        }
    }
}

/// Binary LightGBM model loaded from its text format.
#[derive(Debug)]
pub struct LightGbmBooster {
    trees: Vec<LightGbmTree>,
    feature_count: usize,
    feature_names: Vec<String>,
    sigmoid: f64,
}

impl LightGbmBooster {
    pub fn from_model_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;
        let mut feature_names = Vec::new();
        let mut sigmoid = 1.0;
        let mut objective: Option<String> = None;

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.starts_with("end of trees") {
                break;
            }
            let Some((key, raw)) = model_field(trimmed) else {
                continue;
            };
            match key {
                "objective" => {
                    sigmoid = objective_sigmoid(raw);
                    objective = Some(raw.to_string());
                }
                "num_class" => {
                    let num_class: usize = parse_scalar(key, raw)?;
                    if num_class != 1 {
                        return Err(anyhow!(
                            "Expected a binary LightGBM model, found num_class={num_class}"
                        ));
                    }
                }
                "max_feature_idx" => max_feature_idx = Some(parse_scalar(key, raw)?),
                "feature_names" => feature_names = parse_list(key, raw)?,
                "Tree" => trees.push(LightGbmTree::from_lines(&mut lines)?),
                _ => {}
            }
        }

        match objective.as_deref() {
            Some(raw) if raw.split_whitespace().next() == Some("binary") => {}
            Some(raw) => return Err(anyhow!("Unsupported LightGBM objective: {raw}")),
            None => return Err(anyhow!("LightGBM model is missing its objective")),
        }
        if trees.is_empty() {
            return Err(anyhow!("LightGBM model contained no trees"));
        }

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_features.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let feature_count = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);

        debug!(
            "Parsed LightGBM model with {} trees over {} features",
            trees.len(),
            feature_count
        );
        Ok(Self {
            trees,
            feature_count,
            feature_names,
            sigmoid,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read LightGBM model {}", path.display()))?;
        Self::from_model_text(&text)
            .with_context(|| format!("Failed to parse LightGBM model {}", path.display()))
    }

    pub fn num_features(&self) -> usize {
        self.feature_count
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Names recorded by LightGBM (`Column_0`... for libsvm input).
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn predict_raw(&self, features: &[f64]) -> f64 {
        self.trees.iter().map(|tree| tree.predict(features)).sum()
    }

    /// Churn probability, `None` when the row is narrower than the model.
    pub fn predict_probability(&self, features: &[f64]) -> Option<f64> {
        if features.len() < self.feature_count {
            return None;
        }
        let logit = self.predict_raw(features) * self.sigmoid;
        Some((1.0 / (1.0 + (-logit).exp())).clamp(0.0, 1.0))
    }
}

/// Splits a `key=value` line of the model text. Lines without `=` carry no field.
fn model_field(line: &str) -> Option<(&str, &str)> {
    line.trim()
        .split_once('=')
        .map(|(key, raw)| (key.trim(), raw.trim()))
}

fn parse_scalar<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| anyhow!("LightGBM model field {key} has invalid value \"{raw}\": {err}"))
}

fn parse_list<T>(key: &str, raw: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    raw.split_whitespace()
        .enumerate()
        .map(|(position, token)| {
            token.parse::<T>().map_err(|err| {
                anyhow!("LightGBM model field {key} has invalid entry {position} \"{token}\": {err}")
            })
        })
        .collect()
}

/// `sigmoid:<k>` option of a binary objective. Missing or unusable values scale by 1.
fn objective_sigmoid(objective: &str) -> f64 {
    let mut scale = 1.0;
    for option in objective.split_whitespace().skip(1) {
        if let Some(("sigmoid", value)) = option.split_once(':') {
            match value.parse::<f64>() {
                Ok(parsed) if parsed.is_finite() && parsed > 0.0 => scale = parsed,
                _ => {}
            }
        }
    }
    scale
}
