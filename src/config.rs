use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ Parser, ValueEnum };
use thiserror::Error;
use url::Url;

use crate::endpoint::{ parse_endpoints, EndpointError };

const RESULTS_DIR: &str = "results";
const STDOUT_TARGET: &str = "-";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server address {addr:?}: {reason}")]
    InvalidServerAddress { addr: String, reason: String },

    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("failed to create results directory: {0}")]
    ResultsDir(#[source] std::io::Error),
}

/// Shape of the load applied during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TestType {
    /// Sustained load at the target rate
    Load,
    /// Baseline load with periodic bursts at the spike rate
    Spike,
    /// Sustained load over a long duration
    Endurance,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Load => "load",
            TestType::Spike => "spike",
            TestType::Endurance => "endurance",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => f.write_str("text"),
            ReportFormat::Json => f.write_str("json"),
        }
    }
}

/// Run configuration, from command-line flags with environment fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(name = "loadshape", version, about)]
pub struct Config {
    /// Server address to test (`:8080`, `host:port` or a full http(s) URL)
    #[arg(long, env = "SERVER_ADDR", default_value = ":8080")]
    pub server_addr: String,

    /// Test type
    #[arg(long = "type", env = "TEST_TYPE", value_enum, default_value_t = TestType::Load)]
    pub test_type: TestType,

    /// Test duration
    #[arg(short, long, env = "DURATION", default_value = "60s", value_parser = parse_duration)]
    pub duration: Duration,

    /// Target requests per second
    #[arg(long = "rps", env = "TARGET_RPS", default_value_t = 100)]
    pub target_rps: u32,

    /// Number of concurrent workers
    #[arg(short, long = "concurrent", env = "CONCURRENT", default_value_t = 10)]
    pub concurrency: usize,

    /// Length of each burst in spike tests
    #[arg(long, env = "SPIKE_DURATION", default_value = "5s", value_parser = parse_duration)]
    pub spike_duration: Duration,

    /// Requests per second during bursts in spike tests
    #[arg(long, env = "SPIKE_RPS", default_value_t = 1000)]
    pub spike_rps: u32,

    /// Request timeout, covering the whole request/response cycle
    #[arg(short = 'T', long, env = "TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Timeout for establishing a connection to the host
    #[arg(short = 'C', long, env = "CONNECTION_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub connection_timeout: Duration,

    /// Runtime worker threads (defaults to the available parallelism)
    #[arg(short, long, env = "THREADS")]
    pub threads: Option<usize>,

    /// Report format
    #[arg(long = "format", env = "REPORT_FORMAT", value_enum, default_value_t = ReportFormat::Text)]
    pub report_format: ReportFormat,

    /// Report file (default: results/{type}-test.{format}, `-` for stdout)
    #[arg(short = 'o', long = "output", env = "REPORT_FILE")]
    pub report_file: Option<PathBuf>,

    /// Comma-separated endpoints, e.g. GET:/,POST:/items
    #[arg(long, env = "ENDPOINTS", value_delimiter = ',', default_values_t = default_endpoints())]
    pub endpoints: Vec<String>,

    /// Size of the target's dataset, used to resolve {id}, {random_id} and {delete_id}
    #[arg(long, env = "DATASET_SIZE", default_value_t = 10_000)]
    pub dataset_size: usize,

    /// Do not print the live progress line
    #[arg(long)]
    pub no_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_addr: ":8080".to_string(),
            test_type: TestType::Load,
            duration: Duration::from_secs(60),
            target_rps: 100,
            concurrency: 10,
            spike_duration: Duration::from_secs(5),
            spike_rps: 1000,
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            threads: None,
            report_format: ReportFormat::Text,
            report_file: None,
            endpoints: default_endpoints(),
            dataset_size: 10_000,
            no_progress: false,
        }
    }
}

impl Config {
    /*-------------------- Public Functions -------------------*/
    /// Parse flags and environment, validate, and fill in the default report path.
    pub fn load() -> Result<Config, ConfigError> {
        let mut config = Config::parse();
        config.normalize();
        config.validate()?;
        config.ensure_report_target()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        resolve_base_url(&self.server_addr)?;

        if self.duration.is_zero() {
            return Err(ConfigError::NotPositive("duration"));
        }
        if self.target_rps == 0 {
            return Err(ConfigError::NotPositive("target RPS"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::NotPositive("concurrent workers"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NotPositive("timeout"));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::NotPositive("connection timeout"));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::NotPositive("threads"));
        }
        if self.test_type == TestType::Spike {
            if self.spike_duration.is_zero() {
                return Err(ConfigError::NotPositive("spike duration"));
            }
            if self.spike_rps == 0 {
                return Err(ConfigError::NotPositive("spike RPS"));
            }
        }

        parse_endpoints(&self.endpoints)?;
        Ok(())
    }

    /// Report destination, `None` meaning stdout.
    pub fn report_path(&self) -> Option<PathBuf> {
        match &self.report_file {
            Some(path) if path.as_os_str() == STDOUT_TARGET => None,
            Some(path) => Some(path.clone()),
            None => Some(
                PathBuf::from(RESULTS_DIR).join(format!(
                    "{}-test.{}",
                    self.test_type,
                    self.report_format.extension()
                )),
            ),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        })
    }

    /*---------------- Private/Helpers ------------------*/
    // drop blanks left by "GET:/, ,POST:/items" style lists
    fn normalize(&mut self) {
        self.endpoints = self
            .endpoints
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
    }

    fn ensure_report_target(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.report_path().as_deref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(ConfigError::ResultsDir)?;
            }
        }
        Ok(())
    }
}

pub fn default_endpoints() -> Vec<String> {
    [
        "GET:/",
        "GET:/ping",
        "GET:/users/123",
        "GET:/search?q=test&limit=10",
        "GET:/items/1",
        "POST:/items",
        "PUT:/items/1",
        "DELETE:/items/1",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Absolute base URL for a server address.
///
/// `:8080` targets the loopback host, `host:port` gets an `http://` scheme and
/// explicit `http://` or `https://` URLs are taken as they are.
pub fn resolve_base_url(addr: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidServerAddress {
        addr: addr.to_string(),
        reason,
    };

    let addr = addr.trim();
    if addr.is_empty() {
        return Err(invalid("server address cannot be empty".to_string()));
    }

    let url = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else if addr.starts_with(':') {
        format!("http://localhost{addr}")
    } else {
        format!("http://{addr}")
    };

    let url = Url::parse(&url).map_err(|e| invalid(e.to_string()))?;
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Parse durations like `250ms`, `10s`, `5m` or `1h`. A bare number is seconds.
pub fn parse_duration(duration_str: &str) -> Result<Duration, String> {
    let duration_str = duration_str.trim();
    if duration_str.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    // split into value and unit
    let split = duration_str
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(duration_str.len());
    let (value_str, unit) = duration_str.split_at(split);
    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid duration: {duration_str}"))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(format!("invalid duration unit in {duration_str} (use ms, s, m or h)")),
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: {duration_str}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn oversized_durations_are_errors() {
        assert_eq!(
            parse_duration("5124095576030432h"),
            Err("duration out of range: 5124095576030432h".to_string())
        );
        assert!(parse_duration("307445734561825861m").is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
        assert_eq!(parse_duration("18446744073709551615s"), Ok(Duration::from_secs(u64::MAX)));

        let err = Config::try_parse_from(["loadshape", "--duration", "5124095576030432h"]).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn resolves_server_addresses() {
        assert_eq!(
            resolve_base_url(":8080").unwrap().as_str(),
            "http://localhost:8080/"
        );
        assert_eq!(
            resolve_base_url("10.0.0.2:9000").unwrap().as_str(),
            "http://10.0.0.2:9000/"
        );
        assert_eq!(
            resolve_base_url("https://api.example.com").unwrap().as_str(),
            "https://api.example.com/"
        );
        assert!(resolve_base_url("").is_err());
        assert!(resolve_base_url("host:notaport").is_err());
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_positive_values() {
        let cases: [(&str, fn(&mut Config)); 5] = [
            ("duration", |c| c.duration = Duration::ZERO),
            ("target RPS", |c| c.target_rps = 0),
            ("concurrent workers", |c| c.concurrency = 0),
            ("timeout", |c| c.timeout = Duration::ZERO),
            ("threads", |c| c.threads = Some(0)),
        ];
        for (field, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::NotPositive(name)) => assert_eq!(name, field),
                other => panic!("{field}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn spike_settings_only_matter_for_spike_tests() {
        let mut config = Config {
            spike_rps: 0,
            ..Config::default()
        };
        config.validate().unwrap();

        config.test_type = TestType::Spike;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("spike RPS"))
        ));
    }

    #[test]
    fn rejects_invalid_endpoints() {
        let config = Config {
            endpoints: vec!["GET:/".to_string(), "TRACE:/".to_string()],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Endpoint(EndpointError::InvalidMethod(_)))
        ));

        let config = Config {
            endpoints: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Endpoint(EndpointError::Empty))
        ));
    }

    #[test]
    fn parses_flags() {
        let mut config = Config::try_parse_from([
            "loadshape",
            "--type",
            "spike",
            "--rps",
            "50",
            "--concurrent",
            "4",
            "--duration",
            "2m",
            "--spike-duration",
            "500ms",
            "--endpoints",
            "GET:/, ,POST:/items",
            "--format",
            "json",
        ])
        .unwrap();
        config.normalize();

        assert_eq!(config.test_type, TestType::Spike);
        assert_eq!(config.target_rps, 50);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.duration, Duration::from_secs(120));
        assert_eq!(config.spike_duration, Duration::from_millis(500));
        assert_eq!(config.endpoints, vec!["GET:/", "POST:/items"]);
        assert_eq!(
            config.report_path(),
            Some(PathBuf::from("results/spike-test.json"))
        );
    }

    #[test]
    fn dash_reports_to_stdout() {
        let config = Config {
            report_file: Some(PathBuf::from("-")),
            ..Config::default()
        };
        assert_eq!(config.report_path(), None);
    }
}
