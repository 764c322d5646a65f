use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SvqError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of every bounded row channel (operator edges and the service bridge).
    pub channel_capacity: usize,
    /// Row cap applied to every generated pipeline; `0` disables the cap.
    pub max_rows: usize,
    /// Prefix for generated pipeline names.
    pub generated_pipeline_prefix: String,
    /// Optional JSON service catalog to load at startup.
    #[serde(default)]
    pub service_catalog: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_rows: 0,
            generated_pipeline_prefix: "sql".to_string(),
            service_catalog: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SVQ_CHANNEL_CAPACITY`, `SVQ_MAX_ROWS` and `SVQ_SERVICE_CATALOG`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("SVQ_CHANNEL_CAPACITY")? {
            if v == 0 {
                return Err(SvqError::InvalidConfig(
                    "SVQ_CHANNEL_CAPACITY must be greater than zero".to_string(),
                ));
            }
            cfg.channel_capacity = v;
        }
        if let Some(v) = env_usize("SVQ_MAX_ROWS")? {
            cfg.max_rows = v;
        }
        if let Ok(path) = env::var("SVQ_SERVICE_CATALOG") {
            if !path.trim().is_empty() {
                cfg.service_catalog = Some(path);
            }
        }
        Ok(cfg)
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| SvqError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
