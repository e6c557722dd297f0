use crate::error::{PipelineError, PipelineResult};
use crate::models::AdvertiserMonthFrame;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Mean,
    Min,
    Max,
    Std,
}

impl Aggregation {
    pub const ALL: [Aggregation; 4] = [Self::Mean, Self::Min, Self::Max, Self::Std];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Std => "std",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "std" => Ok(Self::Std),
            other => Err(format!("unsupported aggregation {other}")),
        }
    }
}

/// How undefined statistics are emitted.
///
/// `Filled` writes 0.0 for the sample standard deviation of a single-value
/// window and for undefined deltas; `Raw` leaves them as NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdMode {
    #[default]
    Filled,
    Raw,
}

impl FromStr for StdMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "filled" | "fill" | "zero" => Ok(Self::Filled),
            "raw" | "nan" => Ok(Self::Raw),
            other => Err(format!("unsupported std mode {other} (expected filled or raw)")),
        }
    }
}

pub fn agg_column_name(feature: &str, months: usize, aggregation: Aggregation) -> String {
    format!("{feature}_{months}_months_{aggregation}")
}

pub fn delta_column_name(feature: &str, months: usize, aggregation: Aggregation) -> String {
    format!("{}_delta", agg_column_name(feature, months, aggregation))
}

fn trailing_window(values: &[f64], end_idx: usize, window: usize) -> &[f64] {
    let start = (end_idx + 1).saturating_sub(window);
    &values[start..=end_idx]
}

fn aggregate_window(window: &[f64], aggregation: Aggregation, std_mode: StdMode) -> f64 {
    let finite: Vec<f64> = window.iter().copied().filter(|v| v.is_finite()).collect();
    match aggregation {
        Aggregation::Mean => Statistics::mean(finite.iter()),
        Aggregation::Min => Statistics::min(finite.iter()),
        Aggregation::Max => Statistics::max(finite.iter()),
        Aggregation::Std => {
            // Sample standard deviation (n - 1); NaN below two values.
            let std = Statistics::std_dev(finite.iter());
            match std_mode {
                StdMode::Filled if !std.is_finite() => 0.0,
                _ => std,
            }
        }
    }
}

/// Rolling statistic over one advertiser's series.
pub fn rolling_aggregate(
    values: &[f64],
    window: usize,
    aggregation: Aggregation,
    std_mode: StdMode,
) -> Vec<f64> {
    (0..values.len())
        .map(|idx| aggregate_window(trailing_window(values, idx, window), aggregation, std_mode))
        .collect()
}

/// Raw value minus its own window statistic, row by row. For mean, min and
/// max the first row of an advertiser is 0.
pub fn series_deltas(series: &[f64], rolled: &[f64], std_mode: StdMode) -> Vec<f64> {
    series
        .iter()
        .zip(rolled)
        .map(|(value, aggregate)| {
            let delta = value - aggregate;
            match std_mode {
                StdMode::Filled if !delta.is_finite() => 0.0,
                _ => delta,
            }
        })
        .collect()
}

/// Appends `{feature}_{months}_months_{agg}` columns (and `_delta` columns
/// when `add_deltas` is set) for every feature and aggregation.
///
/// Windows are row based: the window ending at a row holds that row and up
/// to `months - 1` earlier rows of the same advertiser. The returned frame is
/// sorted by (advertiser, month).
pub fn create_agg_stats<S: AsRef<str>>(
    frame: &AdvertiserMonthFrame,
    features: &[S],
    months: usize,
    aggregations: &[Aggregation],
    add_deltas: bool,
    std_mode: StdMode,
) -> PipelineResult<AdvertiserMonthFrame> {
    if months == 0 {
        return Err(PipelineError::InvalidWindow { months });
    }
    let feature_indices = features
        .iter()
        .map(|feature| frame.column_index(feature.as_ref()))
        .collect::<PipelineResult<Vec<usize>>>()?;

    let sorted = frame.sorted();
    sorted.ensure_unique_keys()?;

    let mut names = Vec::new();
    for feature in features {
        for aggregation in aggregations {
            names.push(agg_column_name(feature.as_ref(), months, *aggregation));
            if add_deltas {
                names.push(delta_column_name(feature.as_ref(), months, *aggregation));
            }
        }
    }

    let ranges = sorted.advertiser_ranges();
    let per_advertiser: Vec<Vec<Vec<f64>>> = ranges
        .par_iter()
        .map(|range| {
            let rows = &sorted.rows()[range.clone()];
            let mut columns = Vec::with_capacity(names.len());
            for &feature_idx in &feature_indices {
                let series: Vec<f64> = rows.iter().map(|row| row.values[feature_idx]).collect();
                for aggregation in aggregations {
                    let rolled = rolling_aggregate(&series, months, *aggregation, std_mode);
                    if add_deltas {
                        let deltas = series_deltas(&series, &rolled, std_mode);
                        columns.push(rolled);
                        columns.push(deltas);
                    } else {
                        columns.push(rolled);
                    }
                }
            }
            columns
        })
        .collect();

    let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(sorted.len()); names.len()];
    for advertiser_columns in per_advertiser {
        for (column, values) in columns.iter_mut().zip(advertiser_columns) {
            column.extend(values);
        }
    }

    Ok(sorted.with_columns(names, columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AdvertiserMonth;
    use crate::period::MonthPeriod;

    fn frame(rows: &[(i64, i64, f64)]) -> AdvertiserMonthFrame {
        AdvertiserMonthFrame::from_rows(
            "target frame",
            vec!["value".to_string()],
            rows.iter()
                .map(|(advertiser_id, month, value)| AdvertiserMonth {
                    advertiser_id: *advertiser_id,
                    month_period: MonthPeriod::from_yyyymm(*month).unwrap(),
                    has_active_contract: true,
                    churn: 0,
                    values: vec![*value],
                })
                .collect(),
        )
    }

    fn rounded(values: Vec<f64>) -> Vec<f64> {
        values.into_iter().map(|v| (v * 100.0).round() / 100.0).collect()
    }

    #[test]
    fn test_create_agg_stats_all_aggs_with_delta() {
        let df = frame(&[(1, 202401, 10.0), (1, 202402, 20.0), (1, 202403, 30.0)]);

        let result = create_agg_stats(&df, &["value"], 2, &Aggregation::ALL, true, StdMode::Filled)
            .unwrap();

        assert_eq!(result.column("value_2_months_mean").unwrap(), vec![10.0, 15.0, 25.0]);
        assert_eq!(result.column("value_2_months_mean_delta").unwrap(), vec![0.0, 5.0, 5.0]);
        assert_eq!(result.column("value_2_months_min").unwrap(), vec![10.0, 10.0, 20.0]);
        assert_eq!(result.column("value_2_months_max").unwrap(), vec![10.0, 20.0, 30.0]);
        assert_eq!(
            rounded(result.column("value_2_months_std").unwrap()),
            vec![0.0, 7.07, 7.07]
        );
    }

    #[test]
    fn raw_mode_keeps_undefined_std() {
        let df = frame(&[(1, 202401, 10.0), (1, 202402, 20.0)]);

        let result =
            create_agg_stats(&df, &["value"], 2, &[Aggregation::Std], true, StdMode::Raw).unwrap();

        let std = result.column("value_2_months_std").unwrap();
        assert!(std[0].is_nan());
        assert!((std[1] - 50f64.sqrt()).abs() < 1e-9);
        let deltas = result.column("value_2_months_std_delta").unwrap();
        assert!(deltas[0].is_nan());
        assert!((deltas[1] - (20.0 - 50f64.sqrt())).abs() < 1e-9);
    }

    #[test]
    fn deltas_compare_each_value_with_its_window() {
        let df = frame(&[(1, 202401, 10.0), (1, 202402, 20.0), (1, 202403, 30.0)]);

        let result = create_agg_stats(&df, &["value"], 2, &Aggregation::ALL, true, StdMode::Filled)
            .unwrap();

        assert_eq!(result.column("value_2_months_min_delta").unwrap(), vec![0.0, 10.0, 10.0]);
        assert_eq!(result.column("value_2_months_max_delta").unwrap(), vec![0.0, 0.0, 0.0]);
        let std_deltas = result.column("value_2_months_std_delta").unwrap();
        assert_eq!(std_deltas[0], 10.0);
        assert!((std_deltas[2] - (30.0 - 50f64.sqrt())).abs() < 1e-9);

        let with_gap = series_deltas(&[f64::NAN, 4.0], &[f64::NAN, 4.0], StdMode::Filled);
        assert_eq!(with_gap, vec![0.0, 0.0]);
    }

    #[test]
    fn windows_do_not_cross_advertisers() {
        let df = frame(&[
            (2, 202401, 100.0),
            (1, 202402, 20.0),
            (1, 202401, 10.0),
            (2, 202402, 200.0),
        ]);

        let result =
            create_agg_stats(&df, &["value"], 3, &[Aggregation::Mean], true, StdMode::Filled)
                .unwrap();

        let advertisers: Vec<i64> = result.rows().iter().map(|row| row.advertiser_id).collect();
        assert_eq!(advertisers, vec![1, 1, 2, 2]);
        assert_eq!(
            result.column("value_3_months_mean").unwrap(),
            vec![10.0, 15.0, 100.0, 150.0]
        );
        assert_eq!(
            result.column("value_3_months_mean_delta").unwrap(),
            vec![0.0, 5.0, 0.0, 50.0]
        );
    }

    #[test]
    fn missing_values_are_skipped_inside_windows() {
        let values = [1.0, f64::NAN, 3.0];
        assert_eq!(
            rolling_aggregate(&values, 2, Aggregation::Mean, StdMode::Filled)[1],
            1.0
        );
        assert_eq!(
            rolling_aggregate(&values, 2, Aggregation::Max, StdMode::Filled)[2],
            3.0
        );
    }

    #[test]
    fn column_names_follow_convention() {
        let df = frame(&[(1, 202401, 1.0)]);
        let result = create_agg_stats(
            &df,
            &["value"],
            3,
            &[Aggregation::Mean, Aggregation::Std],
            false,
            StdMode::Filled,
        )
        .unwrap();
        assert_eq!(
            result.columns(),
            &["value", "value_3_months_mean", "value_3_months_std"]
        );
    }

    #[test]
    fn rejects_unknown_features_and_empty_windows() {
        let df = frame(&[(1, 202401, 1.0)]);
        assert_eq!(
            create_agg_stats(&df, &["leads"], 2, &[Aggregation::Mean], false, StdMode::Filled),
            Err(PipelineError::missing_column("target frame", "leads"))
        );
        assert_eq!(
            create_agg_stats(&df, &["value"], 0, &[Aggregation::Mean], false, StdMode::Filled),
            Err(PipelineError::InvalidWindow { months: 0 })
        );
    }

    #[test]
    fn empty_frame_gets_full_schema() {
        let df = frame(&[]);
        let result =
            create_agg_stats(&df, &["value"], 2, &[Aggregation::Max], true, StdMode::Filled)
                .unwrap();
        assert!(result.is_empty());
        assert_eq!(
            result.columns(),
            &["value", "value_2_months_max", "value_2_months_max_delta"]
        );
    }

    #[test]
    fn parses_aggregations_and_modes() {
        assert_eq!("MEAN".parse::<Aggregation>(), Ok(Aggregation::Mean));
        assert!("median".parse::<Aggregation>().is_err());
        assert_eq!("raw".parse::<StdMode>(), Ok(StdMode::Raw));
        assert_eq!("filled".parse::<StdMode>(), Ok(StdMode::Filled));
    }
}
