//! Contract-driven monitor runtime: configuration normalization, status
//! polling, log tailing and action execution for external targets.

pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod runtime;
pub mod services;

#[cfg(test)]
mod test_support;

pub use runtime::{Monitor, MonitorSnapshot, TargetView};
pub use services::config_loader::{load, LoadedConfig};
pub use services::jsonpath::{evaluate, render_value};
