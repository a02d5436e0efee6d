//! Column derivations: standardization, area-change ratios, growth flags,
//! quantile buckets and GLOF periods.
//!
//! Every function is pure. Missing input (NaN) and inputs a transform cannot
//! handle (log of a non-positive area) produce NaN, never an error.

use crate::lakes::data::DataError;
use crate::lakes::frame::Categorical;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Location and scale used to standardize a column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f64,
    pub sd: f64,
}

impl Standardization {
    /// Sample mean and sample standard deviation (n - 1) of the finite values.
    pub fn fit(values: ArrayView1<f64>) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let n = finite.len();
        if n == 0 {
            return Self {
                mean: f64::NAN,
                sd: f64::NAN,
            };
        }
        let mean = finite.iter().sum::<f64>() / n as f64;
        let sd = if n > 1 {
            (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Self { mean, sd }
    }

    /// z-score of one value. A zero or undefined scale yields NaN.
    pub fn apply(&self, value: f64) -> f64 {
        if !value.is_finite() || !(self.sd > 0.0) {
            return f64::NAN;
        }
        (value - self.mean) / self.sd
    }
}

/// Applies `transform`, then z-scores the result with statistics of the whole column.
pub fn standardize<F>(column: ArrayView1<f64>, transform: F) -> Array1<f64>
where
    F: Fn(f64) -> f64,
{
    standardize_with_stats(column, transform).0
}

/// Like [`standardize`], also returning the statistics that were used.
pub fn standardize_with_stats<F>(
    column: ArrayView1<f64>,
    transform: F,
) -> (Array1<f64>, Standardization)
where
    F: Fn(f64) -> f64,
{
    let transformed = column.mapv(|v| {
        if v.is_finite() {
            let t = transform(v);
            if t.is_finite() { t } else { f64::NAN }
        } else {
            f64::NAN
        }
    });
    let stats = Standardization::fit(transformed.view());
    if !(stats.sd > 0.0) {
        log::warn!(
            "Standardization has no spread (mean {:.4}, sd {:.4}); every value becomes missing",
            stats.mean,
            stats.sd
        );
    }
    (transformed.mapv(|v| stats.apply(v)), stats)
}

/// Natural log that is undefined (NaN) for non-positive input.
pub fn log_positive(value: f64) -> f64 {
    if value > 0.0 { value.ln() } else { f64::NAN }
}

/// `log10(area_t1 / area_t0)` element-wise; NaN when either area is missing or not positive.
pub fn ratio_change(area_t1: ArrayView1<f64>, area_t0: ArrayView1<f64>) -> Array1<f64> {
    ndarray::Zip::from(&area_t1)
        .and(&area_t0)
        .map_collect(|&a1, &a0| {
            if a1.is_finite() && a0.is_finite() && a1 > 0.0 && a0 > 0.0 {
                (a1 / a0).log10()
            } else {
                f64::NAN
            }
        })
}

/// Default threshold on `|log10 ratio|` above which a lake counts as changed.
pub const GROWTH_THRESHOLD: f64 = 0.1;

/// 1 when the lake grew or shrank beyond `threshold` in log10 space, else 0. NaN propagates.
pub fn growth_flag(log_ratio: ArrayView1<f64>, threshold: f64) -> Array1<f64> {
    log_ratio.mapv(|r| {
        if r.is_nan() {
            f64::NAN
        } else if r.abs() > threshold {
            1.0
        } else {
            0.0
        }
    })
}

/// Linearly interpolated quantile of sorted data (Hyndman & Fan type 7).
pub fn quantile_sorted(sorted: &[f64], prob: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * prob.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = h - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Assigns each finite value to one of `n_buckets` quantile intervals.
///
/// Cut points are the type-7 quantiles at `k / n_buckets`. Intervals are
/// closed on the right, `(c[k-1], c[k]]`, except the first, which is
/// `[c[0], c[1]]`, so the minimum lands in the lowest bucket. Labels name the
/// buckets from lowest to highest.
pub fn bucket_by_quantile(
    column_name: &str,
    column: ArrayView1<f64>,
    n_buckets: usize,
    labels: &[&str],
) -> Result<Categorical, DataError> {
    if n_buckets == 0 || labels.len() != n_buckets {
        return Err(DataError::LabelCountMismatch {
            column: column_name.to_string(),
            buckets: n_buckets,
            labels: labels.len(),
        });
    }
    let mut sorted: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);

    let cuts: Vec<f64> = (0..=n_buckets)
        .map(|k| quantile_sorted(&sorted, k as f64 / n_buckets as f64))
        .collect();
    if sorted.is_empty() || cuts.windows(2).any(|pair| !(pair[1] > pair[0])) {
        return Err(DataError::NotEnoughDistinctValues {
            column: column_name.to_string(),
            buckets: n_buckets,
        });
    }
    log::debug!("Quantile cut points for '{column_name}': {cuts:?}");

    let codes = column
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                return None;
            }
            // cuts[1..] is increasing and its last entry is the maximum.
            let bucket = cuts[1..].partition_point(|&c| c < v);
            Some(bucket.min(n_buckets - 1))
        })
        .collect();
    Ok(Categorical::with_levels(
        labels.iter().map(|s| s.to_string()).collect(),
        codes,
    ))
}

/// Period of a lake's recorded outburst relative to the three area censuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalBucket {
    /// Outburst before the 1990 census.
    Before,
    /// Outburst between the 1990 and 2005 censuses.
    Mid,
    /// Outburst in or after 2005.
    Late,
    /// No recorded outburst.
    NoRecord,
}

impl TemporalBucket {
    pub const ALL: [TemporalBucket; 4] = [Self::Before, Self::Mid, Self::Late, Self::NoRecord];

    pub fn label(self) -> &'static str {
        match self {
            Self::Before => "before_1990",
            Self::Mid => "1990_2005",
            Self::Late => "2005_2018",
            Self::NoRecord => "none",
        }
    }

    fn code(self) -> usize {
        Self::ALL.iter().position(|&b| b == self).unwrap_or(3)
    }

    pub fn from_code(code: usize) -> Option<Self> {
        Self::ALL.get(code).copied()
    }
}

impl fmt::Display for TemporalBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn assign_temporal_bucket(glof_year: f64) -> TemporalBucket {
    if !glof_year.is_finite() {
        TemporalBucket::NoRecord
    } else if glof_year < 1990.0 {
        TemporalBucket::Before
    } else if glof_year < 2005.0 {
        TemporalBucket::Mid
    } else {
        TemporalBucket::Late
    }
}

/// The temporal bucket of every row as an ordinal factor; every row has a level.
pub fn temporal_buckets(glof_year: ArrayView1<f64>) -> Categorical {
    Categorical::with_levels(
        TemporalBucket::ALL
            .iter()
            .map(|b| b.label().to_string())
            .collect(),
        glof_year
            .iter()
            .map(|&y| Some(assign_temporal_bucket(y).code()))
            .collect(),
    )
}
