//! Derived predictor columns shared by all four models.
//!
//! `prepare_dataset` runs once over the full merged table, before any model
//! filters rows, so every model sees z-scores and quantile buckets computed on
//! the same working set. The result is frozen: models select rows from it but
//! never add to it.

use crate::lakes::data::{DataError, columns};
use crate::lakes::derive::{
    GROWTH_THRESHOLD, Standardization, bucket_by_quantile, growth_flag, log_positive,
    ratio_change, standardize_with_stats, temporal_buckets,
};
use crate::lakes::frame::{Column, LakeFrame};
use ndarray::Array1;

/// Names of the derived columns added by [`prepare_dataset`].
pub mod derived {
    /// Standardized log lake area in 2018.
    pub const LAKE_AREA_Z: &str = "lake_area_z";
    /// Standardized log lake area in 2005, the forecasting origin.
    pub const LAKE_AREA_2005_Z: &str = "lake_area_2005_z";
    pub const CATCHMENT_AREA_Z: &str = "catchment_area_z";
    pub const AREA_CHANGE_1990_2005: &str = "area_change_1990_2005";
    pub const AREA_CHANGE_1990_2005_Z: &str = "area_change_1990_2005_z";
    pub const AREA_CHANGE_2005_2018: &str = "area_change_2005_2018";
    pub const AREA_CHANGE_2005_2018_Z: &str = "area_change_2005_2018_z";
    pub const AREA_CHANGE_1990_2018: &str = "area_change_1990_2018";
    pub const AREA_CHANGE_1990_2018_Z: &str = "area_change_1990_2018_z";
    /// Lake grew or shrank by more than 10 % in log10 space between 1990 and 2018.
    pub const AREA_GROWTH_FLAG: &str = "area_growth_flag";
    /// Product of `LAKE_AREA_2005_Z` and `AREA_CHANGE_1990_2005_Z`.
    pub const AREA_X_CHANGE: &str = "lake_area_2005_z:area_change_1990_2005_z";
    pub const SUMMER_PRECIPITATION_FRACTION: &str = "summer_precipitation_fraction";
    pub const ELEVATION_QUINTILE: &str = "elevation_quintile";
    pub const MONSOONALITY_QUARTILE: &str = "monsoonality_quartile";
    pub const GLOF_PERIOD: &str = "glof_period";
}

pub const ELEVATION_LEVELS: [&str; 5] = ["lowest", "low", "middle", "high", "highest"];
pub const MONSOONALITY_LEVELS: [&str; 4] = ["weak", "moderate", "strong", "extreme"];

/// Standardization statistics of every z-scored column, for the report.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparationSummary {
    pub scales: Vec<(String, Standardization)>,
    pub rows: usize,
}

/// Adds every derived predictor to the merged table.
pub fn prepare_dataset(raw: &LakeFrame) -> Result<(LakeFrame, PreparationSummary), DataError> {
    let area_1990 = raw.numeric(columns::AREA_1990)?;
    let area_2005 = raw.numeric(columns::AREA_2005)?;
    let area_2018 = raw.numeric(columns::AREA_2018)?;
    let catchment = raw.numeric(columns::CATCHMENT_AREA)?;

    let mut scales = Vec::new();
    let mut frame = raw.clone();
    let add = |frame: &LakeFrame, name: &str, values: Array1<f64>| {
        frame.with_column(name, Column::Numeric(values))
    };

    let (lake_area_z, stats) = standardize_with_stats(area_2018.view(), log_positive);
    scales.push((derived::LAKE_AREA_Z.to_string(), stats));
    frame = add(&frame, derived::LAKE_AREA_Z, lake_area_z)?;

    let (lake_area_2005_z, stats) = standardize_with_stats(area_2005.view(), log_positive);
    scales.push((derived::LAKE_AREA_2005_Z.to_string(), stats));
    frame = add(&frame, derived::LAKE_AREA_2005_Z, lake_area_2005_z.clone())?;

    let (catchment_z, stats) = standardize_with_stats(catchment.view(), log_positive);
    scales.push((derived::CATCHMENT_AREA_Z.to_string(), stats));
    frame = add(&frame, derived::CATCHMENT_AREA_Z, catchment_z)?;

    let change_1990_2005 = ratio_change(area_2005.view(), area_1990.view());
    let (change_1990_2005_z, stats) = standardize_with_stats(change_1990_2005.view(), |v| v);
    scales.push((derived::AREA_CHANGE_1990_2005_Z.to_string(), stats));
    frame = add(&frame, derived::AREA_CHANGE_1990_2005, change_1990_2005)?;
    frame = add(
        &frame,
        derived::AREA_CHANGE_1990_2005_Z,
        change_1990_2005_z.clone(),
    )?;

    let change_2005_2018 = ratio_change(area_2018.view(), area_2005.view());
    let (change_2005_2018_z, stats) = standardize_with_stats(change_2005_2018.view(), |v| v);
    scales.push((derived::AREA_CHANGE_2005_2018_Z.to_string(), stats));
    frame = add(&frame, derived::AREA_CHANGE_2005_2018, change_2005_2018)?;
    frame = add(&frame, derived::AREA_CHANGE_2005_2018_Z, change_2005_2018_z)?;

    let change_1990_2018 = ratio_change(area_2018.view(), area_1990.view());
    let (change_1990_2018_z, stats) = standardize_with_stats(change_1990_2018.view(), |v| v);
    scales.push((derived::AREA_CHANGE_1990_2018_Z.to_string(), stats));
    let flag = growth_flag(change_1990_2018.view(), GROWTH_THRESHOLD);
    frame = add(&frame, derived::AREA_CHANGE_1990_2018, change_1990_2018)?;
    frame = add(&frame, derived::AREA_CHANGE_1990_2018_Z, change_1990_2018_z)?;
    frame = add(&frame, derived::AREA_GROWTH_FLAG, flag)?;

    // NaN in either factor keeps the product missing
    frame = add(
        &frame,
        derived::AREA_X_CHANGE,
        &lake_area_2005_z * &change_1990_2005_z,
    )?;

    let summer = raw.numeric(columns::SUMMER_PRECIPITATION)?;
    let annual = raw.numeric(columns::ANNUAL_PRECIPITATION)?;
    let fraction = ndarray::Zip::from(summer)
        .and(annual)
        .map_collect(|&s, &a| if a > 0.0 && s.is_finite() { s / a } else { f64::NAN });
    let monsoonality = bucket_by_quantile(
        derived::SUMMER_PRECIPITATION_FRACTION,
        fraction.view(),
        MONSOONALITY_LEVELS.len(),
        &MONSOONALITY_LEVELS,
    )?;
    frame = add(&frame, derived::SUMMER_PRECIPITATION_FRACTION, fraction)?;
    frame = frame.with_column(
        derived::MONSOONALITY_QUARTILE,
        Column::Categorical(monsoonality),
    )?;

    let elevation = bucket_by_quantile(
        columns::MIN_ELEVATION,
        raw.numeric(columns::MIN_ELEVATION)?.view(),
        ELEVATION_LEVELS.len(),
        &ELEVATION_LEVELS,
    )?;
    frame = frame.with_column(derived::ELEVATION_QUINTILE, Column::Categorical(elevation))?;

    let periods = temporal_buckets(raw.numeric(columns::GLOF_YEAR)?.view());
    frame = frame.with_column(derived::GLOF_PERIOD, Column::Categorical(periods))?;

    for (name, stats) in &scales {
        log::debug!(
            "Standardized '{}' with mean {:.4} and sd {:.4}",
            name,
            stats.mean,
            stats.sd
        );
    }
    log::info!(
        "Prepared {} lakes with {} columns",
        frame.height(),
        frame.column_names().count()
    );

    Ok((
        frame,
        PreparationSummary {
            scales,
            rows: raw.height(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lakes::frame::Categorical;
    use approx::assert_abs_diff_eq;

    fn raw_frame(n: usize) -> LakeFrame {
        let ids: Vec<String> = (0..n).map(|i| format!("G{i:03}")).collect();
        let num = |f: &dyn Fn(usize) -> f64| -> Column {
            Column::Numeric((0..n).map(f).collect::<Array1<f64>>())
        };
        LakeFrame::new(ids)
            .with_column(
                columns::REGION,
                Column::Categorical(Categorical::from_labels(
                    (0..n).map(|i| Some(if i % 2 == 0 { "east" } else { "west" })),
                )),
            )
            .unwrap()
            .with_column(columns::MIN_ELEVATION, num(&|i| 4000.0 + 37.0 * i as f64))
            .unwrap()
            .with_column(columns::CATCHMENT_AREA, num(&|i| 1.0 + i as f64))
            .unwrap()
            .with_column(columns::AREA_1990, num(&|i| 0.05 * (1.0 + i as f64)))
            .unwrap()
            .with_column(columns::AREA_2005, num(&|i| 0.05 * (1.0 + i as f64) * (1.0 + 0.05 * (i % 5) as f64)))
            .unwrap()
            .with_column(
                columns::AREA_2018,
                num(&|i| 0.05 * (1.0 + i as f64) * if i % 3 == 0 { 1.5 } else { 1.0 }),
            )
            .unwrap()
            .with_column(columns::GLOF, num(&|i| (i % 4 == 0) as u8 as f64))
            .unwrap()
            .with_column(
                columns::GLOF_YEAR,
                num(&|i| if i % 4 == 0 { 1980.0 + 4.0 * i as f64 } else { f64::NAN }),
            )
            .unwrap()
            .with_column(columns::MASS_BALANCE, num(&|i| -0.2 - 0.01 * i as f64))
            .unwrap()
            .with_column(
                columns::SUMMER_PRECIPITATION,
                num(&|i| 300.0 + 11.0 * ((i * 7) % n) as f64),
            )
            .unwrap()
            .with_column(columns::ANNUAL_PRECIPITATION, num(&|_| 1000.0))
            .unwrap()
    }

    #[test]
    fn derived_columns_are_added_without_touching_the_input() {
        let raw = raw_frame(20);
        let (prepared, summary) = prepare_dataset(&raw).unwrap();
        assert!(raw.column(derived::LAKE_AREA_Z).is_none());
        assert_eq!(summary.rows, 20);
        for name in [
            derived::LAKE_AREA_Z,
            derived::LAKE_AREA_2005_Z,
            derived::CATCHMENT_AREA_Z,
            derived::AREA_CHANGE_1990_2005_Z,
            derived::AREA_CHANGE_2005_2018_Z,
            derived::AREA_CHANGE_1990_2018_Z,
            derived::AREA_GROWTH_FLAG,
            derived::AREA_X_CHANGE,
        ] {
            assert!(prepared.numeric(name).is_ok(), "{name}");
        }
        let elevation = prepared.categorical(derived::ELEVATION_QUINTILE).unwrap();
        assert_eq!(elevation.levels().len(), 5);
        assert_eq!(elevation.label(0), Some("lowest"));
        assert_eq!(elevation.label(19), Some("highest"));
        let monsoon = prepared.categorical(derived::MONSOONALITY_QUARTILE).unwrap();
        assert_eq!(monsoon.levels().len(), 4);
    }

    #[test]
    fn growth_flag_marks_fifty_percent_growth() {
        let (prepared, _) = prepare_dataset(&raw_frame(12)).unwrap();
        let flag = prepared.numeric(derived::AREA_GROWTH_FLAG).unwrap();
        for i in 0..12 {
            let expected = if i % 3 == 0 { 1.0 } else { 0.0 };
            assert_eq!(flag[i], expected, "row {i}");
        }
    }

    #[test]
    fn interaction_is_the_product_of_its_parts() {
        let (prepared, _) = prepare_dataset(&raw_frame(15)).unwrap();
        let area = prepared.numeric(derived::LAKE_AREA_2005_Z).unwrap();
        let change = prepared.numeric(derived::AREA_CHANGE_1990_2005_Z).unwrap();
        let product = prepared.numeric(derived::AREA_X_CHANGE).unwrap();
        for i in 0..15 {
            if product[i].is_finite() {
                assert_abs_diff_eq!(product[i], area[i] * change[i], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn glof_periods_follow_outburst_year() {
        let (prepared, _) = prepare_dataset(&raw_frame(12)).unwrap();
        let periods = prepared.categorical(derived::GLOF_PERIOD).unwrap();
        assert_eq!(periods.label(0), Some("before_1990"));
        assert_eq!(periods.label(1), Some("none"));
        assert_eq!(periods.label(4), Some("1990_2005"));
        assert_eq!(periods.label(8), Some("2005_2018"));
    }
}
