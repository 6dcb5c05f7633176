#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

//! Leakage-safe construction of model-ready feature matrices.
//!
//! The crate turns a raw per-observation feature table into train/test
//! datasets that share no entity, then drives predictor training and
//! evaluation through narrow trait interfaces. The entry point is
//! [`pipeline::MatrixPipeline`]; the supporting modules are usable on their
//! own for the individual processing stages.

pub mod cache;
pub mod config;
pub mod engineer;
pub mod impute;
pub mod matrix;
pub mod pipeline;
pub mod report;
pub mod select;
pub mod split;
pub mod train;
