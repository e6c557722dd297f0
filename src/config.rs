use crate::period::MonthPeriod;
use crate::rolling::StdMode;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DATA_DIR_SETTING: &str = "CHURN_DATA_DIR";
pub const MODELS_DIR_SETTING: &str = "CHURN_MODELS_DIR";
pub const LAST_TRAINING_MONTH_SETTING: &str = "LAST_TRAINING_MONTH";
pub const TRAINING_WINDOW_SETTING: &str = "TRAINING_WINDOW_MONTHS";
pub const LATEST_PERIOD_SETTING: &str = "LATEST_PERIOD";
pub const ROLLING_STD_MODE_SETTING: &str = "ROLLING_STD_MODE";
pub const LIGHTGBM_EXECUTABLE_SETTING: &str = "LIGHTGBM_EXECUTABLE";

/// Every key [`PipelineSettings::from_settings_map`] reads.
pub const SETTING_KEYS: [&str; 7] = [
    DATA_DIR_SETTING,
    MODELS_DIR_SETTING,
    LAST_TRAINING_MONTH_SETTING,
    TRAINING_WINDOW_SETTING,
    LATEST_PERIOD_SETTING,
    ROLLING_STD_MODE_SETTING,
    LIGHTGBM_EXECUTABLE_SETTING,
];

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_LAST_TRAINING_MONTH: &str = "2024-11";
const DEFAULT_TRAINING_WINDOW_MONTHS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub last_training_month: MonthPeriod,
    pub training_window_months: usize,
    /// Cut-off for censored-advertiser removal; the frame's latest month
    /// when unset.
    pub latest_period: Option<MonthPeriod>,
    pub rolling_std_mode: StdMode,
    pub lightgbm_executable: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let data_dir =
            PathBuf::from(setting(settings, DATA_DIR_SETTING).unwrap_or(DEFAULT_DATA_DIR));
        let models_dir =
            PathBuf::from(setting(settings, MODELS_DIR_SETTING).unwrap_or(DEFAULT_MODELS_DIR));
        let last_training_month = match setting_month(settings, LAST_TRAINING_MONTH_SETTING)? {
            Some(month) => month,
            None => DEFAULT_LAST_TRAINING_MONTH.parse::<MonthPeriod>()?,
        };
        let training_window_months = setting_usize(
            settings,
            TRAINING_WINDOW_SETTING,
            DEFAULT_TRAINING_WINDOW_MONTHS,
            1,
        )?;
        let latest_period = setting_month(settings, LATEST_PERIOD_SETTING)?;
        let rolling_std_mode = match setting(settings, ROLLING_STD_MODE_SETTING) {
            Some(raw) => raw.parse::<StdMode>().map_err(|err| {
                anyhow!(
                    "Setting {} is invalid: {} (value: {})",
                    ROLLING_STD_MODE_SETTING,
                    err,
                    raw
                )
            })?,
            None => StdMode::Filled,
        };
        let lightgbm_executable =
            setting(settings, LIGHTGBM_EXECUTABLE_SETTING).map(PathBuf::from);

        Ok(Self {
            data_dir,
            models_dir,
            last_training_month,
            training_window_months,
            latest_period,
            rolling_std_mode,
            lightgbm_executable,
        })
    }
}

fn setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_month(settings: &HashMap<String, String>, key: &str) -> Result<Option<MonthPeriod>> {
    setting(settings, key)
        .map(|raw| {
            raw.parse::<MonthPeriod>().map_err(|_| {
                anyhow!(
                    "Setting {} must be a month in YYYY-MM or YYYYMM format (value: {})",
                    key,
                    raw
                )
            })
        })
        .transpose()
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<usize>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let parsed = PipelineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(parsed.data_dir, PathBuf::from("data"));
        assert_eq!(parsed.models_dir, PathBuf::from("models"));
        assert_eq!(parsed.last_training_month.to_yyyymm(), 202411);
        assert_eq!(parsed.training_window_months, 6);
        assert_eq!(parsed.latest_period, None);
        assert_eq!(parsed.rolling_std_mode, StdMode::Filled);
        assert_eq!(parsed.lightgbm_executable, None);
    }

    #[test]
    fn reads_overrides() {
        let parsed = PipelineSettings::from_settings_map(&settings(&[
            (DATA_DIR_SETTING, "/tmp/churn"),
            (LAST_TRAINING_MONTH_SETTING, "202403"),
            (TRAINING_WINDOW_SETTING, "3"),
            (LATEST_PERIOD_SETTING, "2024-05"),
            (ROLLING_STD_MODE_SETTING, "raw"),
            (LIGHTGBM_EXECUTABLE_SETTING, " /opt/lightgbm "),
        ]))
        .unwrap();
        assert_eq!(parsed.data_dir, PathBuf::from("/tmp/churn"));
        assert_eq!(parsed.last_training_month.to_yyyymm(), 202403);
        assert_eq!(parsed.training_window_months, 3);
        assert_eq!(parsed.latest_period.map(|m| m.to_yyyymm()), Some(202405));
        assert_eq!(parsed.rolling_std_mode, StdMode::Raw);
        assert_eq!(parsed.lightgbm_executable, Some(PathBuf::from("/opt/lightgbm")));
    }

    #[test]
    fn rejects_invalid_values() {
        for (key, value) in [
            (TRAINING_WINDOW_SETTING, "0"),
            (TRAINING_WINDOW_SETTING, "six"),
            (LAST_TRAINING_MONTH_SETTING, "2024-13"),
            (ROLLING_STD_MODE_SETTING, "median"),
        ] {
            let err = PipelineSettings::from_settings_map(&settings(&[(key, value)])).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }
}
