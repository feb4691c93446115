//! Settings structs for each configuration concern.

use super::ConfigError;
use crate::distill::DistillationMode;
use crate::endpoint::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;

/// Reads an env var, returning the default when unset or empty.
pub(crate) fn env_or_default(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Parses an env var into `T`, erroring on malformed values (an unset
/// variable silently takes the default).
fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value.parse::<T>().map_err(|err| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                message: err.to_string(),
            }
        }),
        _ => Ok(default),
    }
}

/// Queue URIs and polling behavior.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub image_queue: String,
    pub region_queue: String,
    /// Lease duration for received messages.
    pub visibility_timeout: Duration,
    /// Deliveries before a message is dead-lettered.
    pub max_receive_count: u32,
    /// Consecutive polls of the region queue per cycle.
    pub region_poll_weight: u32,
    /// Consecutive polls of the image queue per cycle.
    pub image_poll_weight: u32,
    /// Long-poll wait per receive call.
    pub poll_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            image_queue: "geoscout-image-requests".to_string(),
            region_queue: "geoscout-region-requests".to_string(),
            visibility_timeout: Duration::from_secs(60),
            max_receive_count: 3,
            region_poll_weight: 4,
            image_poll_weight: 1,
            poll_wait: Duration::from_secs(2),
        }
    }
}

impl QueueSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            image_queue: env_or_default("IMAGE_QUEUE", &defaults.image_queue),
            region_queue: env_or_default("REGION_QUEUE", &defaults.region_queue),
            visibility_timeout: Duration::from_secs(env_parse(
                "VISIBILITY_TIMEOUT_SECONDS",
                defaults.visibility_timeout.as_secs(),
            )?),
            max_receive_count: env_parse("MAX_RECEIVE_COUNT", defaults.max_receive_count)?,
            region_poll_weight: env_parse("REGION_POLL_WEIGHT", defaults.region_poll_weight)?
                .max(1),
            image_poll_weight: env_parse("IMAGE_POLL_WEIGHT", defaults.image_poll_weight)?.max(1),
            poll_wait: defaults.poll_wait,
        })
    }

    /// Heartbeat cadence: half the visibility timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.visibility_timeout / 2
    }
}

/// Ledger table names.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub job_table: String,
    pub region_table: String,
    pub feature_table: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            job_table: "geoscout-jobs".to_string(),
            region_table: "geoscout-regions".to_string(),
            feature_table: "geoscout-features".to_string(),
        }
    }
}

impl LedgerSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            job_table: env_or_default("JOB_TABLE", &defaults.job_table),
            region_table: env_or_default("REGION_TABLE", &defaults.region_table),
            feature_table: env_or_default("FEATURE_TABLE", &defaults.feature_table),
        }
    }
}

/// Decomposition and aggregation behavior.
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    /// Maximum region side in pixels (requests may override per job).
    pub region_size: u32,
    /// Concurrent endpoint calls per region.
    pub tile_pool_size: usize,
    /// Fraction of failed tiles above which a region is marked ERROR.
    pub tile_error_rate_threshold: f64,
    /// Distillation applied when a request does not choose one.
    pub default_distillation: DistillationMode,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            region_size: 8192,
            tile_pool_size: 4,
            tile_error_rate_threshold: 0.10,
            default_distillation: DistillationMode::Nms,
        }
    }
}

impl ProcessingSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_distillation = match env_or_default("FEATURE_DISTILLATION", "NMS").as_str() {
            "NONE" => DistillationMode::None,
            "NMS" => DistillationMode::Nms,
            "SOFT-NMS" => DistillationMode::SoftNms,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "FEATURE_DISTILLATION".to_string(),
                    value: other.to_string(),
                    message: "expected NONE, NMS, or SOFT-NMS".to_string(),
                })
            }
        };
        Ok(Self {
            region_size: env_parse("REGION_SIZE", defaults.region_size)?.max(1),
            tile_pool_size: env_parse("TILE_POOL_SIZE", defaults.tile_pool_size)?.max(1),
            tile_error_rate_threshold: env_parse(
                "TILE_ERROR_RATE_THRESHOLD",
                defaults.tile_error_rate_threshold,
            )?,
            default_distillation,
        })
    }
}

/// Endpoint client behavior.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl EndpointSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut retry = defaults.retry;
        retry.max_attempts = env_parse("ENDPOINT_RETRY_ATTEMPTS", retry.max_attempts)?.max(1);
        Ok(Self {
            retry,
            connect_timeout: Duration::from_secs(env_parse(
                "ENDPOINT_CONNECT_TIMEOUT_SECONDS",
                defaults.connect_timeout.as_secs(),
            )?),
            request_timeout: Duration::from_secs(env_parse(
                "ENDPOINT_REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout.as_secs(),
            )?),
        })
    }
}

/// Output delivery behavior.
#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Default features per stream batch.
    pub stream_batch_size: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            stream_batch_size: crate::sink::DEFAULT_STREAM_BATCH_SIZE,
        }
    }
}

impl OutputSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            stream_batch_size: env_parse("STREAM_BATCH_SIZE", defaults.stream_batch_size)?.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_is_half_visibility() {
        let settings = QueueSettings {
            visibility_timeout: Duration::from_secs(90),
            ..QueueSettings::default()
        };
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_env_or_default_prefers_set_value() {
        std::env::set_var("GEOSCOUT_TEST_KEY", "custom");
        assert_eq!(env_or_default("GEOSCOUT_TEST_KEY", "fallback"), "custom");
        std::env::remove_var("GEOSCOUT_TEST_KEY");
        assert_eq!(env_or_default("GEOSCOUT_TEST_KEY", "fallback"), "fallback");
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("GEOSCOUT_TEST_NUM", "not-a-number");
        let result = env_parse::<u32>("GEOSCOUT_TEST_NUM", 7);
        assert!(result.is_err());
        std::env::remove_var("GEOSCOUT_TEST_NUM");
        assert_eq!(env_parse("GEOSCOUT_TEST_NUM", 7).unwrap(), 7);
    }
}
