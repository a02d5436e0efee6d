//! Posterior mean predictions and their comparison with the naive base rate.
//!
//! A lake with a recorded outburst is scored against the positive base rate,
//! `ln((p / (1 - p)) / (b / (1 - b)))`; a lake without one against the negative
//! base rate with the odds inverted, `ln(((1 - p) / p) / (b' / (1 - b')))`.
//! Either way a positive value means the model beats naive chance for that
//! lake. A prediction of exactly 0 or 1 gives an infinite ratio; such rows are
//! counted as degenerate and left out of every aggregate.

use crate::bayes::design::{Design, GroupLevels};
use crate::bayes::draws::PosteriorDraws;
use crate::bayes::fit::FitError;
use crate::bayes::posterior::{linear_predictor_draws, sigmoid};
use crate::lakes::derive::quantile_sorted;
use ndarray::{Array1, Axis};
use serde::Serialize;

/// Posterior mean of `P(glof = 1)` for every design row.
pub fn posterior_mean_prediction(
    draws: &PosteriorDraws,
    predictors: &[String],
    design: &Design,
    groups: &[GroupLevels],
) -> Result<Array1<f64>, FitError> {
    let eta = linear_predictor_draws(draws, predictors, design, groups)?;
    let probabilities = eta.mapv(sigmoid);
    Ok(probabilities
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::from_elem(design.n_rows(), f64::NAN)))
}

/// Log of the predicted odds over the base-rate odds.
pub fn log_odds_ratio(predicted: f64, base_rate: f64) -> f64 {
    ((predicted / (1.0 - predicted)) / (base_rate / (1.0 - base_rate))).ln()
}

/// Log odds ratio for a lake without a recorded outburst, against the
/// negative base rate.
pub fn negative_log_odds_ratio(predicted: f64, negative_base_rate: f64) -> f64 {
    (((1.0 - predicted) / predicted) / (negative_base_rate / (1.0 - negative_base_rate))).ln()
}

fn fraction_positive(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.iter().filter(|&&v| v > 0.0).count() as f64 / finite.len() as f64
}

/// Fraction of finite log odds ratios of positive lakes above zero.
pub fn true_positive_rate(log_odds: &[f64]) -> f64 {
    fraction_positive(log_odds)
}

/// Fraction of finite log odds ratios of negative lakes above zero.
pub fn true_negative_rate(log_odds: &[f64]) -> f64 {
    fraction_positive(log_odds)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsetEvaluation {
    pub rows: usize,
    /// Base rate the subset is compared against.
    pub base_rate: f64,
    /// Rows with a finite log odds ratio.
    pub finite: usize,
    /// Rows predicted at exactly 0 or 1.
    pub degenerate: usize,
    pub mean_log_odds_ratio: f64,
    pub median_log_odds_ratio: f64,
    /// True positive rate for positives, true negative rate for negatives, in percent.
    pub rate_percent: f64,
}

impl SubsetEvaluation {
    fn from_values(values: &[f64], base_rate: f64) -> Self {
        let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        finite.sort_by(f64::total_cmp);
        let mean = if finite.is_empty() {
            f64::NAN
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };
        Self {
            rows: values.len(),
            base_rate,
            finite: finite.len(),
            degenerate: values.len() - finite.len(),
            mean_log_odds_ratio: mean,
            median_log_odds_ratio: quantile_sorted(&finite, 0.5),
            rate_percent: 100.0 * fraction_positive(&finite),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogOddsEvaluation {
    pub positives: SubsetEvaluation,
    pub negatives: SubsetEvaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowPrediction {
    pub glims_id: String,
    pub glof: f64,
    pub predicted_probability: f64,
    pub log_odds_ratio: f64,
}

/// Scores every row against the base rate of its outcome.
///
/// # Panics
/// Panics if the three slices differ in length.
pub fn evaluate(
    ids: &[String],
    observed: &[f64],
    predicted: &[f64],
) -> (LogOddsEvaluation, Vec<RowPrediction>) {
    assert_eq!(ids.len(), observed.len());
    assert_eq!(observed.len(), predicted.len());

    let positive_rate = if observed.is_empty() {
        f64::NAN
    } else {
        observed.iter().sum::<f64>() / observed.len() as f64
    };
    let negative_rate = 1.0 - positive_rate;

    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    let rows = ids
        .iter()
        .zip(observed)
        .zip(predicted)
        .map(|((id, &y), &p)| {
            let ratio = if y == 1.0 {
                let r = log_odds_ratio(p, positive_rate);
                positives.push(r);
                r
            } else {
                let r = negative_log_odds_ratio(p, negative_rate);
                negatives.push(r);
                r
            };
            RowPrediction {
                glims_id: id.clone(),
                glof: y,
                predicted_probability: p,
                log_odds_ratio: ratio,
            }
        })
        .collect();

    let evaluation = LogOddsEvaluation {
        positives: SubsetEvaluation::from_values(&positives, positive_rate),
        negatives: SubsetEvaluation::from_values(&negatives, negative_rate),
    };
    (evaluation, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn log_odds_ratio_properties() {
        for b in [0.05, 0.3, 0.8] {
            assert_abs_diff_eq!(log_odds_ratio(b, b), 0.0, epsilon = 1e-12);
            assert!(log_odds_ratio(b + 0.01, b) > 0.0);
            assert!(log_odds_ratio(b - 0.01, b) < 0.0);
            let grid: Vec<f64> = (1..100).map(|i| i as f64 / 100.0).collect();
            for w in grid.windows(2) {
                assert!(log_odds_ratio(w[1], b) > log_odds_ratio(w[0], b));
            }
        }
        assert_eq!(log_odds_ratio(1.0, 0.2), f64::INFINITY);
        assert_eq!(log_odds_ratio(0.0, 0.2), f64::NEG_INFINITY);
    }

    #[test]
    fn negative_ratio_inverts_odds() {
        // p = 0.1 against a negative base rate of 0.8: odds 9 vs 4
        assert_abs_diff_eq!(
            negative_log_odds_ratio(0.1, 0.8),
            (9.0f64 / 4.0).ln(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(negative_log_odds_ratio(0.2, 0.8), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rates_ignore_infinite_values() {
        let values = [1.0, -0.5, f64::INFINITY, 2.0, f64::NEG_INFINITY];
        assert_abs_diff_eq!(true_positive_rate(&values), 2.0 / 3.0, epsilon = 1e-12);
        assert!(true_negative_rate(&[]).is_nan());
    }

    #[test]
    fn evaluation_splits_by_outcome_and_counts_degenerate_rows() {
        let ids: Vec<String> = (0..5).map(|i| format!("L{i}")).collect();
        let observed = [1.0, 1.0, 0.0, 0.0, 0.0];
        let predicted = [0.9, 1.0, 0.1, 0.5, 0.3];
        let (evaluation, rows) = evaluate(&ids, &observed, &predicted);

        assert_eq!(evaluation.positives.rows, 2);
        assert_eq!(evaluation.positives.degenerate, 1);
        assert_eq!(evaluation.positives.finite, 1);
        assert_abs_diff_eq!(evaluation.positives.base_rate, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(evaluation.positives.rate_percent, 100.0, epsilon = 1e-12);
        assert!(evaluation.positives.mean_log_odds_ratio.is_finite());

        assert_eq!(evaluation.negatives.rows, 3);
        assert_abs_diff_eq!(evaluation.negatives.base_rate, 0.6, epsilon = 1e-12);
        // 0.1 and 0.3 beat a 0.4 chance of outburst, 0.5 does not
        assert_abs_diff_eq!(evaluation.negatives.rate_percent, 200.0 / 3.0, epsilon = 1e-9);

        assert_eq!(rows[1].log_odds_ratio, f64::INFINITY);
        assert_eq!(rows[4].glims_id, "L4");
    }

    #[test]
    fn posterior_mean_averages_probabilities_not_logits() {
        let names = vec!["b_Intercept".to_string()];
        let draws = PosteriorDraws::new(names, vec![array![[0.0], [100.0]]]);
        let design = Design {
            ids: vec!["L0".into()],
            rows: vec![0],
            x: ndarray::Array2::zeros((1, 0)),
            group_codes: Vec::new(),
        };
        let p = posterior_mean_prediction(&draws, &[], &design, &[]).unwrap();
        assert_abs_diff_eq!(p[0], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn unseen_level_contributes_no_offset() {
        let names = vec![
            "b_Intercept".to_string(),
            "sd_g__Intercept".to_string(),
            "r_g[a,Intercept]".to_string(),
        ];
        let draws = PosteriorDraws::new(names, vec![array![[0.0, 1.0, 2.0]]]);
        let design = Design {
            ids: vec!["seen".into(), "unseen".into()],
            rows: vec![0, 1],
            x: ndarray::Array2::zeros((2, 0)),
            group_codes: vec![vec![Some(0), None]],
        };
        let groups = vec![GroupLevels {
            factor: "g".into(),
            levels: vec!["a".into()],
        }];
        let p = posterior_mean_prediction(&draws, &[], &design, &groups).unwrap();
        assert_abs_diff_eq!(p[0], sigmoid(2.0), epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], 0.5, epsilon = 1e-12);
    }
}
