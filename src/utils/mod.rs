//! Logging, metrics and chart rendering helpers.

pub mod charts;
pub mod logging;
pub mod metrics;
