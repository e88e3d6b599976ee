use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_CACHE_DIR: &str = ".banana/ImageCache";

const DEFAULT_MIN_REQUEST_INTERVAL_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_S: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY or GOOGLE_API_KEY not set")]
    MissingApiKey,
    #[error("{key} must be a non-negative integer (got '{value}')")]
    InvalidNumber { key: String, value: String },
}

/// Provider API key. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Input validation bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_prompt_chars: usize,
    /// Ceiling for the input image after JPEG re-encoding.
    pub max_image_bytes: usize,
    pub jpeg_quality: u8,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 2000,
            max_image_bytes: 4 * 1024 * 1024,
            jpeg_quality: 80,
        }
    }
}

/// Bounds for the in-memory cache tier. Whichever binds first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 50,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub model: String,
    pub api_key: Option<ApiKey>,
    pub cache_dir: PathBuf,
    pub min_request_interval: Duration,
    pub request_timeout: Duration,
    pub limits: GenerationLimits,
    pub cache_limits: CacheLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_IMAGE_MODEL.to_string(),
            api_key: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            min_request_interval: Duration::from_millis(DEFAULT_MIN_REQUEST_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_S),
            limits: GenerationLimits::default(),
            cache_limits: CacheLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Resolve from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(api_base) = non_empty_env("GEMINI_API_BASE") {
            config.api_base = api_base.trim_end_matches('/').to_string();
        }
        if let Some(model) = non_empty_env("GEMINI_IMAGE_MODEL") {
            config.model = model;
        }
        config.api_key = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .map(ApiKey::new);
        if let Some(cache_dir) = non_empty_env("BANANA_CACHE_DIR") {
            config.cache_dir = PathBuf::from(cache_dir);
        }
        config.min_request_interval = Duration::from_millis(env_u64(
            "BANANA_MIN_REQUEST_INTERVAL_MS",
            DEFAULT_MIN_REQUEST_INTERVAL_MS,
        )?);
        config.request_timeout =
            Duration::from_secs(env_u64("BANANA_REQUEST_TIMEOUT_S", DEFAULT_REQUEST_TIMEOUT_S)?);
        Ok(config)
    }

    pub fn require_api_key(&self) -> Result<&ApiKey, ConfigError> {
        self.api_key.as_ref().ok_or(ConfigError::MissingApiKey)
    }

    /// `generateContent` URL for the configured model.
    pub fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!(
            "{}/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            model_path
        )
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match non_empty_env(key) {
        None => Ok(default),
        Some(raw) => parse_u64(key, &raw),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
