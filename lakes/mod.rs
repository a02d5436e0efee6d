//! Data preparation: loading and merging the lake tables, record corrections,
//! and the derived predictor columns the models consume.

pub mod corrections;
pub mod data;
pub mod derive;
pub mod frame;
pub mod prepare;
