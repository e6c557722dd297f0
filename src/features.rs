use crate::error::{PipelineError, PipelineResult};
use crate::models::{Advertiser, AdvertiserMonthFrame};
use crate::rolling::{create_agg_stats, Aggregation, StdMode};
use crate::target::StageSummary;
use crate::time_features::create_time_features;
use serde::{Deserialize, Serialize};

/// `name = numerator / denominator`, with a zero denominator giving 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedRatio {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

impl DerivedRatio {
    pub fn new(name: &str, numerator: &str, denominator: &str) -> Self {
        Self {
            name: name.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        }
    }
}

pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureConfig {
    pub base_features: Vec<String>,
    pub ratios: Vec<DerivedRatio>,
    pub windows: Vec<usize>,
    pub aggregations: Vec<Aggregation>,
    pub add_deltas: bool,
    pub std_mode: StdMode,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            base_features: [
                "monthly_leads",
                "monthly_visits",
                "monthly_total_invoice",
                "monthly_avg_ad_price",
                "monthly_published_ads",
                "monthly_shows",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            ratios: vec![
                DerivedRatio::new("leads_per_visit", "monthly_leads", "monthly_visits"),
                DerivedRatio::new("visits_per_show", "monthly_visits", "monthly_shows"),
                DerivedRatio::new(
                    "invoice_per_published_ad",
                    "monthly_total_invoice",
                    "monthly_published_ads",
                ),
            ],
            windows: vec![2, 3],
            aggregations: Aggregation::ALL.to_vec(),
            add_deltas: true,
            std_mode: StdMode::Filled,
        }
    }
}

impl FeatureConfig {
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn with_std_mode(mut self, std_mode: StdMode) -> Self {
        self.std_mode = std_mode;
        self
    }

    /// Columns the rolling step aggregates: base features, then ratios.
    pub fn rolling_inputs(&self) -> Vec<String> {
        self.base_features
            .iter()
            .cloned()
            .chain(self.ratios.iter().map(|ratio| ratio.name.clone()))
            .collect()
    }

    pub fn validate(&self) -> PipelineResult<()> {
        match self.windows.iter().find(|months| **months == 0) {
            Some(months) => Err(PipelineError::InvalidWindow { months: *months }),
            None => Ok(()),
        }
    }
}

/// Appends one column per configured ratio.
pub fn add_ratio_features(
    frame: &AdvertiserMonthFrame,
    ratios: &[DerivedRatio],
) -> PipelineResult<AdvertiserMonthFrame> {
    let mut names = Vec::with_capacity(ratios.len());
    let mut values = Vec::with_capacity(ratios.len());
    for ratio in ratios {
        let numerator = frame.column_index(&ratio.numerator)?;
        let denominator = frame.column_index(&ratio.denominator)?;
        names.push(ratio.name.clone());
        values.push(
            frame
                .rows()
                .iter()
                .map(|row| safe_ratio(row.values[numerator], row.values[denominator]))
                .collect(),
        );
    }
    Ok(frame.with_columns(names, values))
}

/// Ratios, then tenure features, then rolling aggregates for every window.
pub fn engineer_features(
    frame: &AdvertiserMonthFrame,
    advertisers: &[Advertiser],
    config: &FeatureConfig,
) -> PipelineResult<AdvertiserMonthFrame> {
    engineer_features_with_report(frame, advertisers, config).map(|(frame, _)| frame)
}

pub fn engineer_features_with_report(
    frame: &AdvertiserMonthFrame,
    advertisers: &[Advertiser],
    config: &FeatureConfig,
) -> PipelineResult<(AdvertiserMonthFrame, Vec<StageSummary>)> {
    config.validate()?;
    let mut summaries = Vec::with_capacity(config.windows.len() + 2);

    let with_ratios = add_ratio_features(frame, &config.ratios)?;
    summaries.push(StageSummary::between("add_ratio_features", frame, &with_ratios));

    let with_time = create_time_features(&with_ratios, advertisers)?;
    summaries.push(StageSummary::between(
        "create_time_features",
        &with_ratios,
        &with_time,
    ));

    let inputs = config.rolling_inputs();
    let mut current = with_time.sorted();
    for months in &config.windows {
        let next = create_agg_stats(
            &current,
            &inputs,
            *months,
            &config.aggregations,
            config.add_deltas,
            config.std_mode,
        )?;
        summaries.push(StageSummary::between("create_agg_stats", &current, &next));
        current = next;
    }

    Ok((current, summaries))
}
