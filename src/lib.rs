pub mod adapter;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod http;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod predictor;
