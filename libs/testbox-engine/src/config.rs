// Language configuration management for the sandbox
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    /// Base interpreter image for ephemeral runs and custom image builds
    pub image: String,
    pub interpreter: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_pids_limit() -> i64 {
    128
}

impl LanguageConfig {
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read languages.json")?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .context("Failed to parse languages.json")?;

        Self::from_configs(languages_json.languages)
    }

    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self> {
        if languages.is_empty() {
            bail!("No languages configured");
        }

        let mut configs = HashMap::new();
        for lang in languages {
            if lang.memory_limit_mb == 0 || lang.cpu_limit <= 0.0 {
                bail!("Language '{}' has non-positive resource limits", lang.name);
            }
            configs.insert(lang.name.clone(), lang);
        }

        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &str) -> Option<&LanguageConfig> {
        self.configs.get(language)
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
pub(crate) fn python_config() -> LanguageConfig {
    LanguageConfig {
        name: "python".to_string(),
        version: "3.11".to_string(),
        image: "python:3.11-slim".to_string(),
        interpreter: "python3".to_string(),
        memory_limit_mb: 256,
        cpu_limit: 0.5,
        pids_limit: 64,
    }
}
