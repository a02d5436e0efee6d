//! Model specifications: response, fixed effects, varying intercepts, priors.
//!
//! The four hypotheses are fixed specifications. Their predictor sets, grouping
//! factors, row filters and prior table are part of the reproducible contract
//! and are built only through [`Hypothesis::spec`].

use crate::lakes::data::columns;
use crate::lakes::derive::TemporalBucket;
use crate::lakes::frame::LakeFrame;
use crate::lakes::prepare::derived;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prior distribution families used by the models.
///
/// Log densities are unnormalized: constants that do not depend on the
/// parameter are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Prior {
    StudentT { df: f64, location: f64, scale: f64 },
    Normal { mean: f64, sd: f64 },
    Exponential { rate: f64 },
}

impl Prior {
    /// Student-t(3, 0, 2.5), the default for intercepts and fixed effects.
    pub const WEAKLY_INFORMATIVE: Prior = Prior::StudentT {
        df: 3.0,
        location: 0.0,
        scale: 2.5,
    };
    /// Normal(1, 1): larger lakes are expected to be more hazardous.
    pub const LARGER_IS_RISKIER: Prior = Prior::Normal { mean: 1.0, sd: 1.0 };
    /// Exponential(1) on every group-level standard deviation.
    pub const GROUP_SD: Prior = Prior::Exponential { rate: 1.0 };

    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::StudentT {
                df,
                location,
                scale,
            } => {
                let z = (x - location) / scale;
                -0.5 * (df + 1.0) * (z * z / df).ln_1p()
            }
            Prior::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                -0.5 * z * z
            }
            Prior::Exponential { rate } => {
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    -rate * x
                }
            }
        }
    }

    /// d/dx of [`Prior::log_density`].
    pub fn grad_log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::StudentT {
                df,
                location,
                scale,
            } => {
                let d = x - location;
                -(df + 1.0) * d / (df * scale * scale + d * d)
            }
            Prior::Normal { mean, sd } => -(x - mean) / (sd * sd),
            Prior::Exponential { rate } => -rate,
        }
    }

    /// Whether the prior supports negative values; group standard deviations need `false`.
    pub fn is_positive(&self) -> bool {
        matches!(self, Prior::Exponential { .. })
    }
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prior::StudentT {
                df,
                location,
                scale,
            } => write!(f, "student_t({df}, {location}, {scale})"),
            Prior::Normal { mean, sd } => write!(f, "normal({mean}, {sd})"),
            Prior::Exponential { rate } => write!(f, "exponential({rate})"),
        }
    }
}

/// The coefficient classes a prior can be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoefficientClass {
    Intercept,
    Effect(String),
    GroupSd(String),
}

impl fmt::Display for CoefficientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoefficientClass::Intercept => f.write_str("Intercept"),
            CoefficientClass::Effect(name) => write!(f, "b[{name}]"),
            CoefficientClass::GroupSd(group) => write!(f, "sd[{group}]"),
        }
    }
}

/// Row selection applied before the missingness filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    All,
    /// Lakes with a known 1990 to 2005 area change and no outburst before 2005.
    ForecastWindow,
}

impl RowFilter {
    /// Rows of `frame` that pass the filter.
    pub fn select(&self, frame: &LakeFrame) -> Result<Vec<usize>, crate::lakes::data::DataError> {
        match self {
            RowFilter::All => Ok((0..frame.height()).collect()),
            RowFilter::ForecastWindow => {
                let change = frame.numeric(derived::AREA_CHANGE_1990_2005)?;
                let periods = frame.categorical(derived::GLOF_PERIOD)?;
                Ok((0..frame.height())
                    .filter(|&row| {
                        let period = periods.code(row).and_then(TemporalBucket::from_code);
                        change[row].is_finite()
                            && !matches!(
                                period,
                                Some(TemporalBucket::Before) | Some(TemporalBucket::Mid)
                            )
                    })
                    .collect())
            }
        }
    }
}

/// A multi-level logistic regression: `logit P(y = 1) = a + X b + sum_g u_g[level]`.
///
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    name: String,
    response: String,
    predictors: Vec<String>,
    groups: Vec<String>,
    intercept_prior: Prior,
    effect_priors: Vec<Prior>,
    group_sd_priors: Vec<Prior>,
    row_filter: RowFilter,
}

impl ModelSpec {
    /// Starts a specification with only an intercept and the default priors.
    pub fn new(name: &str, response: &str) -> Self {
        Self {
            name: name.to_string(),
            response: response.to_string(),
            predictors: Vec::new(),
            groups: Vec::new(),
            intercept_prior: Prior::WEAKLY_INFORMATIVE,
            effect_priors: Vec::new(),
            group_sd_priors: Vec::new(),
            row_filter: RowFilter::All,
        }
    }

    pub fn with_predictor(self, column: &str) -> Self {
        self.with_predictor_prior(column, Prior::WEAKLY_INFORMATIVE)
    }

    pub fn with_predictor_prior(mut self, column: &str, prior: Prior) -> Self {
        self.predictors.push(column.to_string());
        self.effect_priors.push(prior);
        self
    }

    pub fn with_group(mut self, column: &str) -> Self {
        self.groups.push(column.to_string());
        self.group_sd_priors.push(Prior::GROUP_SD);
        self
    }

    pub fn with_intercept_prior(mut self, prior: Prior) -> Self {
        self.intercept_prior = prior;
        self
    }

    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn predictors(&self) -> &[String] {
        &self.predictors
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn row_filter(&self) -> RowFilter {
        self.row_filter
    }

    pub fn intercept_prior(&self) -> Prior {
        self.intercept_prior
    }

    pub fn effect_priors(&self) -> &[Prior] {
        &self.effect_priors
    }

    pub fn group_sd_priors(&self) -> &[Prior] {
        &self.group_sd_priors
    }

    /// The prior of a coefficient class, if the class exists in this model.
    pub fn prior_for(&self, class: &CoefficientClass) -> Option<Prior> {
        match class {
            CoefficientClass::Intercept => Some(self.intercept_prior),
            CoefficientClass::Effect(name) => self
                .predictors
                .iter()
                .position(|p| p == name)
                .map(|i| self.effect_priors[i]),
            CoefficientClass::GroupSd(group) => self
                .groups
                .iter()
                .position(|g| g == group)
                .map(|i| self.group_sd_priors[i]),
        }
    }

    /// Every coefficient class with its prior, intercept first.
    pub fn prior_table(&self) -> Vec<(CoefficientClass, Prior)> {
        std::iter::once((CoefficientClass::Intercept, self.intercept_prior))
            .chain(
                self.predictors
                    .iter()
                    .zip(&self.effect_priors)
                    .map(|(p, &prior)| (CoefficientClass::Effect(p.clone()), prior)),
            )
            .chain(
                self.groups
                    .iter()
                    .zip(&self.group_sd_priors)
                    .map(|(g, &prior)| (CoefficientClass::GroupSd(g.clone()), prior)),
            )
            .collect()
    }

    /// Response, predictors and grouping factors: a row must have all of them.
    pub fn required_columns(&self) -> Vec<&str> {
        std::iter::once(self.response.as_str())
            .chain(self.predictors.iter().map(String::as_str))
            .chain(self.groups.iter().map(String::as_str))
            .collect()
    }

    /// A brms-style formula string, e.g. `glof ~ 1 + lake_area_z + (1 | region)`.
    pub fn formula(&self) -> String {
        let mut terms = vec!["1".to_string()];
        terms.extend(self.predictors.iter().cloned());
        terms.extend(self.groups.iter().map(|g| format!("(1 | {g})")));
        format!("{} ~ {}", self.response, terms.join(" + "))
    }
}

/// The four scientific hypotheses, one model each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hypothesis {
    /// Elevation-dependent warming.
    ElevationDependentWarming,
    /// Area change between 1990 and 2005 forecasts outbursts after 2005.
    Forecasting,
    /// Regional glacier mass balance.
    MassBalance,
    /// Monsoon-dominated precipitation regimes.
    Monsoonality,
}

impl Hypothesis {
    pub const ALL: [Hypothesis; 4] = [
        Self::ElevationDependentWarming,
        Self::Forecasting,
        Self::MassBalance,
        Self::Monsoonality,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Self::ElevationDependentWarming => "edw",
            Self::Forecasting => "forecasting",
            Self::MassBalance => "mass_balance",
            Self::Monsoonality => "monsoonality",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.slug() == slug)
    }

    pub fn spec(self) -> ModelSpec {
        match self {
            Self::ElevationDependentWarming => ModelSpec::new(self.slug(), columns::GLOF)
                .with_predictor_prior(derived::LAKE_AREA_Z, Prior::LARGER_IS_RISKIER)
                .with_predictor(derived::AREA_GROWTH_FLAG)
                .with_group(derived::ELEVATION_QUINTILE),
            Self::Forecasting => ModelSpec::new(self.slug(), columns::GLOF)
                .with_predictor_prior(derived::LAKE_AREA_2005_Z, Prior::LARGER_IS_RISKIER)
                .with_predictor(derived::AREA_CHANGE_1990_2005_Z)
                .with_predictor(derived::AREA_X_CHANGE)
                .with_group(derived::ELEVATION_QUINTILE)
                .with_row_filter(RowFilter::ForecastWindow),
            Self::MassBalance => ModelSpec::new(self.slug(), columns::GLOF)
                .with_predictor(derived::CATCHMENT_AREA_Z)
                .with_predictor(derived::AREA_CHANGE_2005_2018_Z)
                .with_predictor(columns::MASS_BALANCE)
                .with_group(columns::REGION)
                .with_group(derived::ELEVATION_QUINTILE),
            Self::Monsoonality => ModelSpec::new(self.slug(), columns::GLOF)
                .with_predictor(derived::CATCHMENT_AREA_Z)
                .with_predictor(derived::AREA_CHANGE_1990_2018_Z)
                .with_group(derived::MONSOONALITY_QUARTILE)
                .with_group(columns::REGION),
        }
    }
}

impl fmt::Display for Hypothesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn prior_gradients_match_finite_differences() {
        let priors = [
            Prior::WEAKLY_INFORMATIVE,
            Prior::LARGER_IS_RISKIER,
            Prior::GROUP_SD,
            Prior::StudentT {
                df: 7.0,
                location: -1.0,
                scale: 0.5,
            },
        ];
        let h = 1e-6;
        for prior in priors {
            for x in [0.1, 0.7, 2.3, 4.0] {
                let fd = (prior.log_density(x + h) - prior.log_density(x - h)) / (2.0 * h);
                assert_abs_diff_eq!(prior.grad_log_density(x), fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn prior_table_contract() {
        let edw = Hypothesis::ElevationDependentWarming.spec();
        assert_eq!(
            edw.prior_for(&CoefficientClass::Effect(derived::LAKE_AREA_Z.into())),
            Some(Prior::Normal { mean: 1.0, sd: 1.0 })
        );
        assert_eq!(
            edw.prior_for(&CoefficientClass::Effect(derived::AREA_GROWTH_FLAG.into())),
            Some(Prior::WEAKLY_INFORMATIVE)
        );
        assert_eq!(
            edw.prior_for(&CoefficientClass::GroupSd(derived::ELEVATION_QUINTILE.into())),
            Some(Prior::Exponential { rate: 1.0 })
        );

        let forecasting = Hypothesis::Forecasting.spec();
        assert_eq!(
            forecasting.prior_for(&CoefficientClass::Effect(derived::LAKE_AREA_2005_Z.into())),
            Some(Prior::LARGER_IS_RISKIER)
        );
        assert_eq!(forecasting.row_filter(), RowFilter::ForecastWindow);

        for hypothesis in [Hypothesis::MassBalance, Hypothesis::Monsoonality] {
            let spec = hypothesis.spec();
            assert_eq!(spec.groups().len(), 2);
            for (class, prior) in spec.prior_table() {
                match class {
                    CoefficientClass::GroupSd(_) => assert_eq!(prior, Prior::GROUP_SD),
                    _ => assert_eq!(prior, Prior::WEAKLY_INFORMATIVE),
                }
            }
        }
    }

    #[test]
    fn required_columns_and_formula() {
        let spec = Hypothesis::Monsoonality.spec();
        assert_eq!(
            spec.required_columns(),
            vec![
                "glof",
                derived::CATCHMENT_AREA_Z,
                derived::AREA_CHANGE_1990_2018_Z,
                derived::MONSOONALITY_QUARTILE,
                "region"
            ]
        );
        assert_eq!(
            spec.formula(),
            "glof ~ 1 + catchment_area_z + area_change_1990_2018_z + (1 | monsoonality_quartile) + (1 | region)"
        );
    }

    #[test]
    fn slugs_round_trip() {
        for h in Hypothesis::ALL {
            assert_eq!(Hypothesis::from_slug(h.slug()), Some(h));
        }
        assert_eq!(Hypothesis::from_slug("nope"), None);
    }
}
