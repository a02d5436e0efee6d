//! Point and interval summaries of population-level and group-level effects.
//!
//! All values are on the logit scale.

use crate::bayes::design::GroupLevels;
use crate::bayes::draws::PosteriorDraws;
use crate::bayes::fit::FitError;
use crate::bayes::posterior::{INTERCEPT, effect_name, offset_name, sd_name};
use crate::lakes::derive::quantile_sorted;
use ndarray::Array1;
use serde::Serialize;

/// Label of the pseudo-level that stands for the population intercept alone.
pub const POOLED_LEVEL: &str = "Pooled";

/// Mean, standard deviation and central 95% credible interval of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub mean: f64,
    pub sd: f64,
    pub lower_95: f64,
    pub upper_95: f64,
}

impl Estimate {
    pub fn from_draws(values: &Array1<f64>) -> Self {
        let n = values.len() as f64;
        let mean = values.mean().unwrap_or(f64::NAN);
        let sd = if values.len() > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self {
            mean,
            sd,
            lower_95: quantile_sorted(&sorted, 0.025),
            upper_95: quantile_sorted(&sorted, 0.975),
        }
    }

    /// A point mass at zero.
    pub fn zero() -> Self {
        Self {
            mean: 0.0,
            sd: 0.0,
            lower_95: 0.0,
            upper_95: 0.0,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower_95 <= value && value <= self.upper_95
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixedEffect {
    /// `Intercept` or the predictor column.
    pub term: String,
    pub parameter: String,
    #[serde(flatten)]
    pub estimate: Estimate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEffect {
    pub level: String,
    /// Offset from the population intercept.
    pub offset: Estimate,
    /// Population intercept plus offset.
    pub combined: Estimate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEffectTable {
    pub factor: String,
    pub sd: Estimate,
    /// Trained levels in factor order.
    pub levels: Vec<GroupEffect>,
}

impl GroupEffectTable {
    pub fn level(&self, level: &str) -> Option<&GroupEffect> {
        self.levels.iter().find(|e| e.level == level)
    }

    /// Every level plus the pooled pseudo-level, ascending by combined mean.
    pub fn ordered_with_pooled(&self, intercept: &Estimate) -> Vec<GroupEffect> {
        let mut rows = self.levels.clone();
        rows.push(GroupEffect {
            level: POOLED_LEVEL.to_string(),
            offset: Estimate::zero(),
            combined: *intercept,
        });
        rows.sort_by(|a, b| a.combined.mean.total_cmp(&b.combined.mean));
        rows
    }
}

fn pooled(draws: &PosteriorDraws, name: &str) -> Result<Array1<f64>, FitError> {
    draws
        .pooled(name)
        .ok_or_else(|| FitError::MissingParameter(name.to_string()))
}

/// Intercept followed by every predictor, in model order.
pub fn fixed_effects(
    draws: &PosteriorDraws,
    predictors: &[String],
) -> Result<Vec<FixedEffect>, FitError> {
    let mut effects = vec![FixedEffect {
        term: "Intercept".to_string(),
        parameter: INTERCEPT.to_string(),
        estimate: Estimate::from_draws(&pooled(draws, INTERCEPT)?),
    }];
    for predictor in predictors {
        let parameter = effect_name(predictor);
        effects.push(FixedEffect {
            term: predictor.clone(),
            estimate: Estimate::from_draws(&pooled(draws, &parameter)?),
            parameter,
        });
    }
    Ok(effects)
}

/// Offsets and combined intercepts of every trained level of one factor.
pub fn group_effects(
    draws: &PosteriorDraws,
    group: &GroupLevels,
) -> Result<GroupEffectTable, FitError> {
    let intercept = pooled(draws, INTERCEPT)?;
    let levels = group
        .levels
        .iter()
        .map(|level| {
            let offset = pooled(draws, &offset_name(&group.factor, level))?;
            let combined = &intercept + &offset;
            Ok(GroupEffect {
                level: level.clone(),
                offset: Estimate::from_draws(&offset),
                combined: Estimate::from_draws(&combined),
            })
        })
        .collect::<Result<Vec<_>, FitError>>()?;
    Ok(GroupEffectTable {
        factor: group.factor.clone(),
        sd: Estimate::from_draws(&pooled(draws, &sd_name(&group.factor))?),
        levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn draws() -> PosteriorDraws {
        let names = vec![
            "b_Intercept".to_string(),
            "b_x".to_string(),
            "sd_g__Intercept".to_string(),
            "r_g[low,Intercept]".to_string(),
            "r_g[high,Intercept]".to_string(),
        ];
        PosteriorDraws::new(
            names,
            vec![
                array![
                    [0.0, 1.0, 0.5, -1.0, 2.0],
                    [1.0, 2.0, 0.7, -2.0, 3.0]
                ],
                array![
                    [2.0, 3.0, 0.9, -3.0, 4.0],
                    [1.0, 2.0, 0.5, -2.0, 3.0]
                ],
            ],
        )
    }

    fn groups() -> GroupLevels {
        GroupLevels {
            factor: "g".into(),
            levels: vec!["low".into(), "high".into()],
        }
    }

    #[test]
    fn estimate_by_hand() {
        let e = Estimate::from_draws(&array![1.0, 2.0, 3.0, 4.0]);
        assert_abs_diff_eq!(e.mean, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(e.sd, (5.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(e.lower_95, 1.075, epsilon = 1e-12);
        assert_abs_diff_eq!(e.upper_95, 3.925, epsilon = 1e-12);
        assert!(e.contains(2.0));
        assert!(!e.contains(4.0));
    }

    #[test]
    fn fixed_effects_are_named() {
        let effects = fixed_effects(&draws(), &["x".to_string()]).unwrap();
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0].term, "Intercept");
        assert_eq!(effects[1].parameter, "b_x");
        assert_abs_diff_eq!(effects[1].estimate.mean, 2.0, epsilon = 1e-12);
        assert!(matches!(
            fixed_effects(&draws(), &["nope".to_string()]),
            Err(FitError::MissingParameter(_))
        ));
    }

    #[test]
    fn combined_is_intercept_plus_offset() {
        let table = group_effects(&draws(), &groups()).unwrap();
        let low = table.level("low").unwrap();
        assert_abs_diff_eq!(low.offset.mean, -2.0, epsilon = 1e-12);
        // intercept draws 0, 1, 2, 1; offsets -1, -2, -3, -2
        assert_abs_diff_eq!(low.combined.mean, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(low.combined.sd, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.sd.mean, 0.65, epsilon = 1e-12);
    }

    #[test]
    fn pooled_level_sorts_with_groups() {
        let d = draws();
        let table = group_effects(&d, &groups()).unwrap();
        let intercept = fixed_effects(&d, &[]).unwrap()[0].estimate;
        let ordered: Vec<String> = table
            .ordered_with_pooled(&intercept)
            .into_iter()
            .map(|e| e.level)
            .collect();
        assert_eq!(ordered, vec!["low", POOLED_LEVEL, "high"]);
    }
}
