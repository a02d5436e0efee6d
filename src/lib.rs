#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
#[path = "../lakes/mod.rs"]
pub mod lakes;

#[path = "../bayes/mod.rs"]
pub mod bayes;

pub mod config;
pub mod pipeline;
