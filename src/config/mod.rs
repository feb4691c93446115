//! Service configuration.
//!
//! Workers are configured through environment variables; every knob has a
//! default so a bare environment still yields a runnable configuration.
//! Settings are grouped per concern, pure data with no behavior beyond
//! parsing.

mod settings;

pub use settings::{
    EndpointSettings, LedgerSettings, OutputSettings, ProcessingSettings, QueueSettings,
};

use crate::distill::DistillationMode;
use settings::env_or_default;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },
}

/// Complete worker configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub queues: QueueSettings,
    pub ledger: LedgerSettings,
    pub processing: ProcessingSettings,
    pub endpoint: EndpointSettings,
    pub output: OutputSettings,
    /// Namespace prepended to emitted metrics.
    pub metrics_namespace: String,
    /// Identity recorded on region claims.
    pub worker_id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queues: QueueSettings::default(),
            ledger: LedgerSettings::default(),
            processing: ProcessingSettings::default(),
            endpoint: EndpointSettings::default(),
            output: OutputSettings::default(),
            metrics_namespace: "geoscout".to_string(),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.queues = QueueSettings::from_env()?;
        config.ledger = LedgerSettings::from_env();
        config.processing = ProcessingSettings::from_env()?;
        config.endpoint = EndpointSettings::from_env()?;
        config.output = OutputSettings::from_env()?;
        config.metrics_namespace = env_or_default("METRICS_NAMESPACE", "geoscout");
        if let Ok(worker_id) = std::env::var("WORKER_ID") {
            if !worker_id.is_empty() {
                config.worker_id = worker_id;
            }
        }
        Ok(config)
    }

    /// Shares the configuration across workflow tasks.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The distillation mode for a job: request override, else service
    /// default.
    pub fn distillation_mode(&self, request_mode: Option<DistillationMode>) -> DistillationMode {
        request_mode.unwrap_or(self.processing.default_distillation)
    }
}
