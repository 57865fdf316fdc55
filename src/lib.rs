pub mod cache;
pub mod collector;
pub mod config;
pub mod cve;
pub mod error;
pub mod filter;
pub mod github;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod natsort;
pub mod registry;
pub mod scheduler;
pub mod server;

pub use cache::ReportCache;
pub use config::Config;
pub use error::{Error, Result};
pub use metrics::MetricsStore;
