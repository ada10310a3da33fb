use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, anyhow};

use crate::session::SessionConfig;

pub const DEFAULT_MODEL: &str = "llama3.2:1b";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that can help me with my tasks";

pub const MODEL_ENV: &str = "LOCAL_CHAT_MODEL";
pub const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub model: Option<String>,
    pub ollama_url: Option<String>,
    pub system_prompt: Option<String>,
    pub init_timeout_secs: Option<u64>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_content)
            .map_err(|e| anyhow!("Invalid config file {:?}: {}", config_path, e))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, config_content)?;
        Ok(())
    }

    pub fn save_default_model(model: &str) -> Result<()> {
        let mut config = Self::load().unwrap_or_else(|_| Self::new());
        config.model = Some(model.to_string());
        config.save()
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("local-chat").join("config.json"))
    }
}

/// Values given on the command line, which win over everything else
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub ollama_url: Option<String>,
    pub system_prompt: Option<String>,
    pub init_timeout_secs: Option<u64>,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model: String,
    pub ollama_url: String,
    pub system_prompt: String,
    pub init_timeout: Option<Duration>,
}

impl Settings {
    /// Resolve each field: command line, then environment, then config file,
    /// then the built-in default.
    pub fn resolve(
        overrides: Overrides,
        config: &Config,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let model = non_empty(overrides.model)
            .or_else(|| non_empty(env(MODEL_ENV)))
            .or_else(|| non_empty(config.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let ollama_url = non_empty(overrides.ollama_url)
            .or_else(|| non_empty(env(OLLAMA_HOST_ENV)).map(normalize_host))
            .or_else(|| non_empty(config.ollama_url.clone()))
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        let system_prompt = non_empty(overrides.system_prompt)
            .or_else(|| non_empty(config.system_prompt.clone()))
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        Self {
            model,
            ollama_url,
            system_prompt,
            init_timeout: overrides
                .init_timeout_secs
                .or(config.init_timeout_secs)
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            init_timeout: self.init_timeout,
        }
    }
}

/// `OLLAMA_HOST` is often just `host:port`
fn normalize_host(host: String) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host
    } else {
        format!("http://{}", host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::new());

        let settings = Settings::resolve(Overrides::default(), &config, no_env);
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.ollama_url, DEFAULT_OLLAMA_URL);
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(settings.init_timeout, None);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            model: Some("qwen2.5:0.5b".to_string()),
            ollama_url: None,
            system_prompt: Some("Be terse.".to_string()),
            init_timeout_secs: Some(120),
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_resolution_order() {
        let config = Config {
            model: Some("from-config".to_string()),
            ollama_url: Some("http://config:1".to_string()),
            system_prompt: Some("config prompt".to_string()),
            init_timeout_secs: Some(0),
        };
        let env = |key: &str| match key {
            MODEL_ENV => Some("from-env".to_string()),
            OLLAMA_HOST_ENV => Some("gpu-box:11434".to_string()),
            _ => None,
        };

        let from_env = Settings::resolve(Overrides::default(), &config, env);
        assert_eq!(from_env.model, "from-env");
        assert_eq!(from_env.ollama_url, "http://gpu-box:11434");
        assert_eq!(from_env.system_prompt, "config prompt");
        assert_eq!(from_env.init_timeout, None);

        let overrides = Overrides {
            model: Some("from-cli".to_string()),
            ollama_url: Some("http://cli:2".to_string()),
            system_prompt: Some("cli prompt".to_string()),
            init_timeout_secs: Some(15),
        };
        let from_cli = Settings::resolve(overrides, &config, env);
        assert_eq!(from_cli.model, "from-cli");
        assert_eq!(from_cli.ollama_url, "http://cli:2");
        assert_eq!(from_cli.system_prompt, "cli prompt");
        assert_eq!(from_cli.init_timeout, Some(Duration::from_secs(15)));

        let from_config = Settings::resolve(Overrides::default(), &config, no_env);
        assert_eq!(from_config.model, "from-config");
        assert_eq!(from_config.ollama_url, "http://config:1");
    }

    #[test]
    fn test_blank_values_fall_through() {
        let config = Config {
            model: Some("  ".to_string()),
            init_timeout_secs: Some(90),
            ..Config::new()
        };
        let env = |key: &str| (key == MODEL_ENV).then(String::new);
        let settings = Settings::resolve(Overrides::default(), &config, env);
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.init_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.session_config().init_timeout, Some(Duration::from_secs(90)));
    }
}
