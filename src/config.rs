use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pipeline_config::PipelineConfig;

/// Application-level constants
pub const APP_NAME: &str = "clinical-extractor";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Agent service used when `CLINICAL_EXTRACTOR_AGENT_URL` is unset.
pub const DEFAULT_AGENT_URL: &str = "http://127.0.0.1:8080";

/// Environment variables
pub const ENV_AGENT_URL: &str = "CLINICAL_EXTRACTOR_AGENT_URL";
pub const ENV_FALLBACK_URL: &str = "CLINICAL_EXTRACTOR_FALLBACK_URL";
pub const ENV_API_KEY: &str = "CLINICAL_EXTRACTOR_API_KEY";
pub const ENV_CONFIG_FILE: &str = "CLINICAL_EXTRACTOR_CONFIG";
pub const ENV_MAX_CONCURRENT: &str = "MAX_CONCURRENT_REQUESTS";
pub const ENV_RATE_LIMIT: &str = "RATE_LIMIT_PER_MINUTE";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Process settings: where the agents live plus the pipeline tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub agent_url: String,
    pub fallback_url: Option<String>,
    pub api_key: Option<String>,
    pub log_level: String,
    pub pipeline: PipelineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_string(),
            fallback_url: None,
            api_key: None,
            log_level: "info".to_string(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// `CLINICAL_EXTRACTOR_CONFIG` names an optional JSON file that seeds the
    /// pipeline config; `MAX_CONCURRENT_REQUESTS` and `RATE_LIMIT_PER_MINUTE`
    /// override it afterwards.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut pipeline = match get(ENV_CONFIG_FILE) {
            Some(path) => load_pipeline_file(Path::new(&path))?,
            None => PipelineConfig::default(),
        };

        if let Some(raw) = get(ENV_MAX_CONCURRENT) {
            pipeline.max_concurrency = parse_positive(ENV_MAX_CONCURRENT, &raw)? as usize;
        }
        if let Some(raw) = get(ENV_RATE_LIMIT) {
            let per_minute = parse_positive(ENV_RATE_LIMIT, &raw)?;
            pipeline.rate_limit.calls_per_second = per_minute as f64 / 60.0;
        }

        let settings = Self {
            agent_url: get(ENV_AGENT_URL).unwrap_or_else(|| DEFAULT_AGENT_URL.to_string()),
            fallback_url: get(ENV_FALLBACK_URL),
            api_key: get(ENV_API_KEY),
            log_level: get(ENV_LOG_LEVEL)
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|| "info".to_string()),
            pipeline,
        };

        tracing::debug!(
            agent_url = %settings.agent_url,
            has_fallback = settings.fallback_url.is_some(),
            max_concurrency = settings.pipeline.max_concurrency,
            calls_per_second = settings.pipeline.rate_limit.calls_per_second,
            "Settings loaded"
        );
        Ok(settings)
    }
}

fn load_pipeline_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

/// Default tracing filter, used when `RUST_LOG` is unset.
pub fn default_log_filter() -> String {
    let level = std::env::var(ENV_LOG_LEVEL)
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    log_filter_for(&level)
}

fn log_filter_for(level: &str) -> String {
    let level = match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        "warning" => "warn",
        "critical" => "error",
        _ => "info",
    };
    format!("clinical_extractor_lib={level},clinical_extractor={level},warn")
}
