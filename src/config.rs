use std::env;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::BoothError;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_analysis_model: String,
    pub gemini_transform_model: String,
    pub gemini_timeout_seconds: u64,
    pub database_url: String,
    pub gallery_capacity: usize,
    pub jpeg_quality: u8,
    pub bridge_timeout_seconds: u64,
    pub output_dir: PathBuf,
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::load);

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_jpeg_quality(value: u64) -> u8 {
    if value == 0 || value > 100 {
        warn!("JPEG_QUALITY must be within 1..=100 (got {value}); using 90.");
        return 90;
    }
    value as u8
}

fn normalize_base_url(value: String) -> String {
    value.trim().trim_end_matches('/').to_string()
}

impl Config {
    pub fn load() -> Self {
        Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_key: env_string("GEMINI_API_KEY", "").trim().to_string(),
            gemini_base_url: normalize_base_url(env_string(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            )),
            gemini_analysis_model: env_string("GEMINI_ANALYSIS_MODEL", "gemini-1.5-pro"),
            gemini_transform_model: env_string(
                "GEMINI_TRANSFORM_MODEL",
                "gemini-2.0-flash-preview-image-generation",
            ),
            gemini_timeout_seconds: env_u64("GEMINI_TIMEOUT_SECONDS", 90),
            database_url: env_string("DATABASE_URL", "sqlite://chronos_booth.db?mode=rwc"),
            gallery_capacity: env_usize("GALLERY_CAPACITY", 12).max(1),
            jpeg_quality: normalize_jpeg_quality(env_u64("JPEG_QUALITY", 90)),
            bridge_timeout_seconds: env_u64("BRIDGE_TIMEOUT_SECONDS", 120),
            output_dir: PathBuf::from(env_string("OUTPUT_DIR", "output")),
        }
    }

    pub fn require_api_key(&self) -> Result<&str, BoothError> {
        if self.gemini_api_key.is_empty() {
            return Err(BoothError::Config(
                "GEMINI_API_KEY is not set. Add it to the environment or a .env file.".to_string(),
            ));
        }
        Ok(&self.gemini_api_key)
    }
}

pub const ANALYSIS_PROMPT: &str = "Analyze this person in detail: facial structure, expression, hair, and clothing. \
Keep it concise in 4-6 bullet points and include pose, lighting and a short background summary. \
Return a rich identity description optimized for likeness preservation.";

pub const TRANSFORM_INSTRUCTION: &str = "Preserve identity and face likeness. Keep the face structure, change clothing and background to match the scene. Output a single polished image.";

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(key: &str) -> Config {
        Config {
            log_level: "info".to_string(),
            gemini_api_key: key.to_string(),
            gemini_base_url: "http://localhost".to_string(),
            gemini_analysis_model: "a".to_string(),
            gemini_transform_model: "t".to_string(),
            gemini_timeout_seconds: 5,
            database_url: "sqlite::memory:".to_string(),
            gallery_capacity: 12,
            jpeg_quality: 90,
            bridge_timeout_seconds: 5,
            output_dir: PathBuf::from("output"),
        }
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let err = config_with_key("").require_api_key().unwrap_err();
        assert!(matches!(err, BoothError::Config(_)));
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn present_api_key_is_returned() {
        let config = config_with_key("abc");
        assert_eq!(config.require_api_key().unwrap(), "abc");
    }

    #[test]
    fn out_of_range_jpeg_quality_falls_back() {
        assert_eq!(normalize_jpeg_quality(0), 90);
        assert_eq!(normalize_jpeg_quality(250), 90);
        assert_eq!(normalize_jpeg_quality(75), 75);
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        assert_eq!(
            normalize_base_url(" https://example.com/v1beta/ ".to_string()),
            "https://example.com/v1beta"
        );
    }
}
