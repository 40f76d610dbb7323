use crate::policy::LoggingMode;
use crate::remote::Credentials;
use crate::supervisor::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkBackend {
    Jsonl,
    Tcp,
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub sink_backend: SinkBackend,
    pub sink_path: PathBuf,
    pub sink_addr: Option<String>,
    pub output_max_size_mb: u64,
    pub output_max_rotations: u32,
    pub query_url: Option<String>,
    pub query_credentials: Option<Credentials>,
    pub connect_max_attempts: u32,
    pub connect_retry_delay_secs: u64,
    pub write_period_secs: i64,
    pub logging_mode: LoggingMode,
    pub rust_log: String,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. `from_env` reads the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sink_backend = match lookup("SINK_BACKEND")
            .unwrap_or_else(|| "jsonl".to_string())
            .to_lowercase()
            .as_str()
        {
            "jsonl" => SinkBackend::Jsonl,
            "tcp" => SinkBackend::Tcp,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "SINK_BACKEND must be jsonl or tcp, got '{}'",
                    other
                )))
            }
        };

        let sink_path = PathBuf::from(lookup("SINK_PATH").unwrap_or_else(|| "./watchlog.jsonl".to_string()));

        let sink_addr = lookup("SINK_ADDR").filter(|addr| !addr.trim().is_empty());
        if sink_backend == SinkBackend::Tcp && sink_addr.is_none() {
            return Err(ConfigError::MissingVariable("SINK_ADDR".to_string()));
        }

        let output_max_size_mb = parse_or(&lookup, "OUTPUT_MAX_SIZE_MB", 100u64)?;
        let output_max_rotations = parse_or(&lookup, "OUTPUT_MAX_ROTATIONS", 10u32)?;

        let query_url = lookup("QUERY_URL").filter(|url| !url.trim().is_empty());
        if let Some(url) = &query_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "QUERY_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let query_credentials = match (lookup("QUERY_USERNAME"), lookup("QUERY_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (Some(_), None) => return Err(ConfigError::MissingVariable("QUERY_PASSWORD".to_string())),
            (None, _) => None,
        };

        let connect_max_attempts = parse_or(&lookup, "CONNECT_MAX_ATTEMPTS", 5u32)?;
        if connect_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "CONNECT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        let connect_retry_delay_secs = parse_or(&lookup, "CONNECT_RETRY_DELAY_SECS", 3u64)?;

        let write_period_secs = parse_or(&lookup, "WRITE_PERIOD_SECS", 5i64)?.max(0);

        let logging_interval_secs = parse_or(&lookup, "LOGGING_INTERVAL_SECS", 5i64)?;
        let mode_name = lookup("LOGGING_MODE").unwrap_or_else(|| "All data".to_string());
        let logging_mode = LoggingMode::from_name(mode_name.trim(), logging_interval_secs).ok_or_else(|| {
            ConfigError::InvalidValue(format!("LOGGING_MODE '{}' is not a known logging mode", mode_name))
        })?;

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            sink_backend,
            sink_path,
            sink_addr,
            output_max_size_mb,
            output_max_rotations,
            query_url,
            query_credentials,
            connect_max_attempts,
            connect_retry_delay_secs,
            write_period_secs,
            logging_mode,
            rust_log,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_max_attempts,
            delay: Duration::from_secs(self.connect_retry_delay_secs),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(format!("{}='{}'", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<RuntimeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.sink_backend, SinkBackend::Jsonl);
        assert_eq!(config.sink_path, PathBuf::from("./watchlog.jsonl"));
        assert_eq!(config.output_max_size_mb, 100);
        assert_eq!(config.output_max_rotations, 10);
        assert_eq!(config.write_period_secs, 5);
        assert_eq!(config.logging_mode, LoggingMode::AllData);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_tcp_requires_address() {
        assert!(matches!(
            config(&[("SINK_BACKEND", "tcp")]),
            Err(ConfigError::MissingVariable(v)) if v == "SINK_ADDR"
        ));
        let config = config(&[("SINK_BACKEND", "TCP"), ("SINK_ADDR", "127.0.0.1:9000")]).unwrap();
        assert_eq!(config.sink_backend, SinkBackend::Tcp);
    }

    #[test]
    fn test_logging_mode_and_period() {
        let config = config(&[
            ("LOGGING_MODE", "Interval"),
            ("LOGGING_INTERVAL_SECS", "30"),
            ("WRITE_PERIOD_SECS", "-4"),
        ])
        .unwrap();
        assert_eq!(config.logging_mode, LoggingMode::Interval(30_000));
        assert_eq!(config.write_period_secs, 0);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(config(&[("SINK_BACKEND", "kafka")]), Err(ConfigError::InvalidValue(_))));
        assert!(matches!(config(&[("OUTPUT_MAX_SIZE_MB", "lots")]), Err(ConfigError::InvalidValue(_))));
        assert!(matches!(config(&[("LOGGING_MODE", "Sometimes")]), Err(ConfigError::InvalidValue(_))));
        assert!(matches!(config(&[("QUERY_URL", "ftp://x")]), Err(ConfigError::InvalidValue(_))));
        assert!(matches!(config(&[("CONNECT_MAX_ATTEMPTS", "0")]), Err(ConfigError::InvalidValue(_))));
        assert!(matches!(
            config(&[("QUERY_USERNAME", "admin")]),
            Err(ConfigError::MissingVariable(_))
        ));
    }
}
