use crate::config::PipelineSettings;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const WITHDRAWALS_FILE: &str = "zrive_advertiser_withdrawals.csv";
pub const ADVERTISERS_FILE: &str = "zrive_dim_advertiser.csv";
pub const MONTHLY_SNAPSHOT_FILE: &str = "zrive_fct_monthly_snapshot_advertiser.csv";
pub const MODELING_FRAME_FILE: &str = "modeling_frame.csv";
pub const MODELING_SNAPSHOT_FILE: &str = "modeling_frame.bin";
pub const MODEL_FILE_SUFFIX: &str = "_lightgbm.txt";

/// Settings plus the on-disk layout every command works against.
#[derive(Debug, Clone)]
pub struct AppContext {
    settings: PipelineSettings,
}

impl AppContext {
    pub fn initialize(settings: PipelineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }

    pub fn models_dir(&self) -> &Path {
        &self.settings.models_dir
    }

    pub fn withdrawals_path(&self) -> PathBuf {
        self.data_dir().join(WITHDRAWALS_FILE)
    }

    pub fn advertisers_path(&self) -> PathBuf {
        self.data_dir().join(ADVERTISERS_FILE)
    }

    pub fn monthly_snapshot_path(&self) -> PathBuf {
        self.data_dir().join(MONTHLY_SNAPSHOT_FILE)
    }

    pub fn modeling_frame_path(&self) -> PathBuf {
        self.data_dir().join(MODELING_FRAME_FILE)
    }

    pub fn modeling_snapshot_path(&self) -> PathBuf {
        self.data_dir().join(MODELING_SNAPSHOT_FILE)
    }

    pub fn predictions_dir(&self) -> PathBuf {
        self.models_dir().join("predictions")
    }

    /// Most recent `*_lightgbm.txt` in the models directory. Model names
    /// start with a sortable timestamp, so the greatest name wins.
    pub fn latest_model_path(&self) -> Result<PathBuf> {
        let models_dir = self.models_dir();
        let entries = fs::read_dir(models_dir)
            .with_context(|| format!("Failed to list models in {}", models_dir.display()))?;
        let mut latest: Option<PathBuf> = None;
        for entry in entries {
            let path = entry?.path();
            let is_model = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(MODEL_FILE_SUFFIX))
                .unwrap_or(false);
            if is_model && latest.as_ref().map(|best| path > *best).unwrap_or(true) {
                latest = Some(path);
            }
        }
        latest.ok_or_else(|| {
            anyhow!(
                "No trained model (*{}) found in {}",
                MODEL_FILE_SUFFIX,
                models_dir.display()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn context_in(models_dir: &Path) -> AppContext {
        let mut settings = PipelineSettings::from_settings_map(&HashMap::new()).unwrap();
        settings.models_dir = models_dir.to_path_buf();
        AppContext::initialize(settings)
    }

    #[test]
    fn latest_model_is_the_newest_timestamp() {
        let dir = std::env::temp_dir().join(format!("churn_models_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for name in [
            "20250101-000000_lightgbm.txt",
            "20250518-233011_lightgbm.txt",
            "20250601-000000_lightgbm.txt.features.json",
            "notes.txt",
        ] {
            fs::write(dir.join(name), "").unwrap();
        }

        let context = context_in(&dir);

        assert_eq!(
            context.latest_model_path().unwrap(),
            dir.join("20250518-233011_lightgbm.txt")
        );
        assert_eq!(context.predictions_dir(), dir.join("predictions"));
    }

    #[test]
    fn missing_models_are_an_error() {
        let dir = std::env::temp_dir().join(format!("churn_models_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        assert!(context_in(&dir).latest_model_path().is_err());
    }
}
