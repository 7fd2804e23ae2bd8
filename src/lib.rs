//! Shaped HTTP load generation: steady load, periodic spikes, and long endurance runs
//! against a set of `METHOD:/path` endpoints, with latency and error statistics.

pub mod config;
pub mod endpoint;
pub mod executor;
pub mod metrics;
pub mod report;
pub mod runner;

pub use config::{ Config, ConfigError, ReportFormat, TestType };
pub use endpoint::{ Endpoint, EndpointError, Method };
pub use executor::{ HttpExecutor, Outcome, RequestExecutor };
pub use metrics::{ Metrics, Snapshot };
pub use runner::{ RunError, Runner };
