use adm_core::stream_ipc::DEFAULT_MAX_FRAME_BYTES;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_EVENT_CAPACITY: usize = 100;
pub const DEFAULT_UPDATE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid gateway url '{value}': {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub endpoint: Url,
    /// Fixed pause between a link ending and the next connect attempt.
    pub reconnect_delay: Duration,
    /// Cap applied on live `event` inserts.
    pub event_capacity: usize,
    pub max_frame_bytes: usize,
    /// Per-subscriber backlog of `SessionUpdate`s before a slow reader lags.
    pub update_buffer: usize,
}

impl StreamConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            update_buffer: DEFAULT_UPDATE_BUFFER,
        }
    }

    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_endpoint(endpoint)?))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves `ADM_*` settings through `lookup`, falling back to defaults
    /// for unset or blank values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = parse_endpoint(&resolve_gateway_url(&lookup))?;
        let mut config = Self::new(endpoint);
        if let Some(ms) = resolve_number::<u64, _>(&lookup, "ADM_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(capacity) = resolve_number(&lookup, "ADM_EVENT_CAPACITY")? {
            config.event_capacity = capacity;
        }
        if let Some(max) = resolve_number(&lookup, "ADM_MAX_FRAME_BYTES")? {
            config.max_frame_bytes = max;
        }
        Ok(config)
    }
}

pub fn parse_endpoint(value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|source| ConfigError::InvalidUrl {
        value: value.to_string(),
        source,
    })
}

fn resolve_gateway_url<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("ADM_GATEWAY_URL") {
        Some(value) if !value.trim().is_empty() => value,
        _ => DEFAULT_GATEWAY_URL.to_string(),
    }
}

/// Parses straight into the target width so out-of-range values are
/// rejected instead of truncated.
fn resolve_number<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        _ => Ok(None),
    }
}
