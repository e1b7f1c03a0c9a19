use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

const PREFIX: &str = "BATCH_EXPORTER_";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(String),

    #[error("BATCH_EXPORTER_ENDPOINT is not a valid URL: {0}")]
    EndpointInvalidUrl(String),

    #[error("BATCH_EXPORTER_ENDPOINT must use http or https: {0}")]
    EndpointUnsupportedScheme(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    Zero(String),

    #[error("BATCH_EXPORTER_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),
}

/// Where rows land: `project/dataset/table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Url,
    pub destination: Destination,
    /// Rows per insert request, and the queue length that triggers a drain.
    pub batch_size: usize,
    /// Longest the buffer may go without a flush attempt.
    pub batch_timeout: Duration,
    pub flush_tick: Duration,
    pub export_timeout: Duration,
    pub compression: Compression,
    pub export_headers: Vec<(String, String)>,
    pub listener_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Self::parse(&vars)
    }

    pub(crate) fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let endpoint = parse_endpoint(vars)?;
        let destination = Destination {
            project: required(vars, "BATCH_EXPORTER_PROJECT")?,
            dataset: required(vars, "BATCH_EXPORTER_DATASET")?,
            table: required(vars, "BATCH_EXPORTER_TABLE")?,
        };
        let batch_size = parse_nonzero(vars, "BATCH_EXPORTER_BATCH_SIZE", 500)?;
        let batch_timeout = parse_duration_ms(vars, "BATCH_EXPORTER_BATCH_TIMEOUT_MS", 10_000)?;
        let flush_tick = parse_duration_ms(vars, "BATCH_EXPORTER_FLUSH_TICK_MS", 1000)?;
        if flush_tick.is_zero() {
            return Err(ConfigError::Zero("BATCH_EXPORTER_FLUSH_TICK_MS".to_owned()));
        }
        let export_timeout = parse_duration_ms(vars, "BATCH_EXPORTER_EXPORT_TIMEOUT_MS", 5000)?;
        let compression = parse_compression(vars)?;
        let export_headers = parse_headers(vars);
        let listener_port = parse_port(vars, "BATCH_EXPORTER_LISTENER_PORT", 4320)?;

        Ok(Self {
            endpoint,
            destination,
            batch_size,
            batch_timeout,
            flush_tick,
            export_timeout,
            compression,
            export_headers,
            listener_port,
        })
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|s| !s.is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::Missing(name.to_owned()))
}

fn parse_endpoint(vars: &HashMap<String, String>) -> Result<Url, ConfigError> {
    let raw = required(vars, "BATCH_EXPORTER_ENDPOINT")?;
    let url = Url::parse(&raw).map_err(|_| ConfigError::EndpointInvalidUrl(raw.clone()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ConfigError::EndpointUnsupportedScheme(raw)),
    }
}

fn parse_port(
    vars: &HashMap<String, String>,
    name: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_nonzero(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    let n = match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?,
        None => default,
    };
    if n == 0 {
        return Err(ConfigError::Zero(name.to_owned()));
    }
    Ok(n)
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let ms: u64 = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(Duration::from_millis(default_ms)),
    }
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars.get("BATCH_EXPORTER_COMPRESSION").map(|s| s.as_str()) {
        Some("gzip") | None => Ok(Compression::Gzip),
        Some("none") => Ok(Compression::None),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}

fn parse_headers(vars: &HashMap<String, String>) -> Vec<(String, String)> {
    vars.get("BATCH_EXPORTER_EXPORT_HEADERS")
        .filter(|s| !s.is_empty())
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    let k = k.trim();
                    let v = v.trim();
                    if k.is_empty() {
                        return None;
                    }
                    Some((k.to_owned(), v.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}
