pub mod commands;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod labeling;
pub mod lightgbm;
pub mod models;
pub mod period;
pub mod rolling;
pub mod target;
pub mod time_features;
