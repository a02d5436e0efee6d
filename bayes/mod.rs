//! Multi-level logistic models of outburst occurrence: specification, NUTS
//! sampling, diagnostics, summaries and predictive evaluation.

pub mod design;
pub mod diagnostics;
pub mod draws;
pub mod fit;
pub mod hmc;
pub mod loo;
pub mod posterior;
pub mod predict;
pub mod progress;
pub mod report;
pub mod spec;
pub mod summary;
