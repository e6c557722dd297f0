use serde::Serialize;
use std::cmp::Ordering;

const PROBABILITY_EPSILON: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryMetrics {
    pub rows: usize,
    pub positives: usize,
    pub positive_rate: f64,
    pub threshold: f64,
    pub log_loss: Option<f64>,
    pub roc_auc: Option<f64>,
    pub average_precision: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

pub fn log_loss(labels: &[u8], scores: &[f64]) -> Option<f64> {
    if labels.is_empty() {
        return None;
    }
    let total: f64 = labels
        .iter()
        .zip(scores)
        .map(|(label, score)| {
            let p = score.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
            if *label == 1 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    Some(total / labels.len() as f64)
}

/// Area under the ROC curve from average ranks, so tied scores count half.
/// `None` unless both classes are present.
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> Option<f64> {
    let positives = labels.iter().filter(|label| **label == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].partial_cmp(&scores[*b]).unwrap_or(Ordering::Equal));

    let mut positive_rank_sum = 0.0;
    let mut start = 0usize;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; a tie block shares the mean of its ranks.
        let average_rank = (start + 1 + end) as f64 / 2.0;
        let tied_positives = order[start..end]
            .iter()
            .filter(|idx| labels[**idx] == 1)
            .count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Step-wise area under the precision/recall curve, one step per distinct
/// score. `None` without positives.
pub fn average_precision(labels: &[u8], scores: &[f64]) -> Option<f64> {
    let positives = labels.iter().filter(|label| **label == 1).count();
    if positives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*b].partial_cmp(&scores[*a]).unwrap_or(Ordering::Equal));

    let mut true_positives = 0usize;
    let mut seen = 0usize;
    let mut previous_recall = 0.0;
    let mut area = 0.0;
    let mut start = 0usize;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        true_positives += order[start..end]
            .iter()
            .filter(|idx| labels[**idx] == 1)
            .count();
        seen += end - start;
        let recall = true_positives as f64 / positives as f64;
        let precision = true_positives as f64 / seen as f64;
        area += (recall - previous_recall) * precision;
        previous_recall = recall;
        start = end;
    }
    Some(area)
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

pub fn evaluate_binary(labels: &[u8], scores: &[f64], threshold: f64) -> BinaryMetrics {
    let rows = labels.len().min(scores.len());
    let (labels, scores) = (&labels[..rows], &scores[..rows]);
    let positives = labels.iter().filter(|label| **label == 1).count();

    let mut true_positives = 0usize;
    let mut predicted_positives = 0usize;
    for (label, score) in labels.iter().zip(scores) {
        if *score >= threshold {
            predicted_positives += 1;
            if *label == 1 {
                true_positives += 1;
            }
        }
    }
    let precision = ratio(true_positives, predicted_positives);
    let recall = ratio(true_positives, positives);
    let f1 = match (precision, recall) {
        (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
        (Some(_), Some(_)) => Some(0.0),
        _ => None,
    };

    BinaryMetrics {
        rows,
        positives,
        positive_rate: ratio(positives, rows).unwrap_or(0.0),
        threshold,
        log_loss: log_loss(labels, scores),
        roc_auc: roc_auc(labels, scores),
        average_precision: average_precision(labels, scores),
        precision,
        recall,
        f1,
    }
}
