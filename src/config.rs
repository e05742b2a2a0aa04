use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for the selection and progression engine. Anything product might
/// want to pin without a code change lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How many recent attempt scores feed the calibrator's rolling average.
    pub rolling_window: usize,
    /// Dedup window: a conversation served within the last K is not repeated.
    pub history_window: usize,
    /// Probability of serving stretch content one tier up.
    pub stretch_probability: f64,
    /// Clamp on a single session's reported duration, in minutes.
    pub max_session_minutes: u32,
    /// Whether attempts against a completed conversation are accepted.
    pub allow_post_completion_attempts: bool,
    /// Internal retries on a versioned-row conflict before surfacing failure.
    pub conflict_retries: u32,
    /// Backoff between conflict retries, in milliseconds.
    pub conflict_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            rolling_window: 5,
            history_window: 10,
            stretch_probability: 0.3,
            max_session_minutes: 180,
            allow_post_completion_attempts: false,
            conflict_retries: 3,
            conflict_backoff_ms: 25,
        }
    }
}

/// Connection settings for the external content-generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Hard bound on a generation call; a slow collaborator falls back to the
    /// pool rather than stalling the request.
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            timeout_secs: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Config {
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("talkpath")
        });

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let config_str =
                std::fs::read_to_string(&config_path).context("Failed to read config.json")?;
            let mut config: Config =
                serde_json::from_str(&config_str).context("Failed to parse config.json")?;
            config.data_dir = data_dir;
            if config
                .generation
                .api_key
                .as_ref()
                .map_or(true, |key| key.is_empty())
            {
                config.generation.api_key = std::env::var("OPENAI_API_KEY").ok();
            }
            return Ok(config);
        }

        let config = Config {
            data_dir,
            engine: EngineConfig::default(),
            generation: GenerationConfig::default(),
        };
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = self.data_dir.join("config.json");
        let json_str = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, json_str).context("Failed to write config.json")?;
        Ok(())
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join("talkpath.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.rolling_window, 5);
        assert_eq!(engine.history_window, 10);
        assert_eq!(engine.max_session_minutes, 180);
        assert!(!engine.allow_post_completion_attempts);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        assert!(dir.path().join("config.json").exists());

        let reloaded = Config::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(reloaded.engine.history_window, config.engine.history_window);
        assert_eq!(reloaded.generation.model, config.generation.model);
    }
}
