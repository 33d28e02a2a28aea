use std::time::Duration;

use jobstream_core::playback::PlaybackConfig;

use crate::backoff::RetryConfig;
use crate::source::PollParams;

pub const DEFAULT_EVENTS_MAX_WAIT: Duration = Duration::from_secs(20);
pub const DEFAULT_EVENTS_BATCH_LIMIT: usize = 50;
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the jobs API, without a trailing slash.
    pub api_url: String,
    /// Optional bearer token sent with every request.
    pub api_token: Option<String>,
    pub poll: PollParams,
    /// Period of the out-of-band job status check.
    pub status_poll_interval: Duration,
    pub retry: RetryConfig,
    pub playback: PlaybackConfig,
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default    |
    /// |-----------------------------|------------|
    /// | `JOBSTREAM_API_URL`         | (required) |
    /// | `JOBSTREAM_API_TOKEN`       | none       |
    /// | `EVENTS_MAX_WAIT_SECS`      | `20`       |
    /// | `EVENTS_BATCH_LIMIT`        | `50`       |
    /// | `STATUS_POLL_INTERVAL_MS`   | `2000`     |
    /// | `RETRY_BASE_DELAY_MS`       | `1000`     |
    /// | `RETRY_MAX_DELAY_MS`        | `10000`    |
    /// | `RETRY_MAX_FAILURES`        | `5`        |
    /// | `PLAYBACK_MIN_DELAY_MS`     | `5`        |
    /// | `PLAYBACK_MAX_DELAY_MS`     | `30`       |
    /// | `PLAYBACK_FAST_THRESHOLD`   | `50`       |
    /// | `PLAYBACK_BURST_THRESHOLD`  | `200`      |
    /// | `PLAYBACK_BURST_CHARS`      | `5`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("JOBSTREAM_API_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("JOBSTREAM_API_URL"))?;
        let api_token = lookup("JOBSTREAM_API_TOKEN").filter(|t| !t.trim().is_empty());

        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { key, value: raw }),
                None => Ok(default),
            }
        };
        let millis = |key: &'static str, default: Duration| {
            number(key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let poll = PollParams {
            max_wait: Duration::from_secs(number(
                "EVENTS_MAX_WAIT_SECS",
                DEFAULT_EVENTS_MAX_WAIT.as_secs(),
            )?),
            limit: number("EVENTS_BATCH_LIMIT", DEFAULT_EVENTS_BATCH_LIMIT as u64)? as usize,
        };
        if poll.limit == 0 {
            return Err(ConfigError::Invalid {
                key: "EVENTS_BATCH_LIMIT",
                value: "0".into(),
            });
        }

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            base_delay: millis("RETRY_BASE_DELAY_MS", retry_defaults.base_delay)?,
            max_delay: millis("RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
            max_failures: number(
                "RETRY_MAX_FAILURES",
                retry_defaults.max_failures as u64,
            )? as u32,
        };

        let playback_defaults = PlaybackConfig::default();
        let playback = PlaybackConfig {
            min_delay: millis("PLAYBACK_MIN_DELAY_MS", playback_defaults.min_delay)?,
            max_delay: millis("PLAYBACK_MAX_DELAY_MS", playback_defaults.max_delay)?,
            fast_threshold: number(
                "PLAYBACK_FAST_THRESHOLD",
                playback_defaults.fast_threshold as u64,
            )? as usize,
            burst_threshold: number(
                "PLAYBACK_BURST_THRESHOLD",
                playback_defaults.burst_threshold as u64,
            )? as usize,
            burst_chars: number("PLAYBACK_BURST_CHARS", playback_defaults.burst_chars as u64)?
                as usize,
        };

        Ok(Self {
            api_url,
            api_token,
            poll,
            status_poll_interval: millis(
                "STATUS_POLL_INTERVAL_MS",
                DEFAULT_STATUS_POLL_INTERVAL,
            )?,
            retry,
            playback,
        })
    }
}
