// Language configuration management for Proctor Worker
use anyhow::{bail, Context, Result};
use proctor_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read languages.json")?;

        Self::from_json(&content).context("Failed to parse languages.json")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let language: Language = lang.name.parse().context("Invalid entry in languages.json")?;
            if lang.execution.command.trim().is_empty() {
                bail!("Language '{}' has an empty execution command", lang.name);
            }
            configs.insert(language, lang);
        }

        Ok(Self { configs })
    }

    /// Load `<dir>/languages.json`, or fall back to the built-in Python config
    pub fn load_or_builtin(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("languages.json");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn builtin() -> Self {
        let python = LanguageConfig {
            name: "python".to_string(),
            version: "3".to_string(),
            execution: LanguageExecution {
                command: "python3".to_string(),
                args: vec!["-I".to_string(), "-B".to_string()],
                file_extension: "py".to_string(),
            },
            memory_limit_mb: 256,
            enabled: true,
        };

        let mut configs = HashMap::new();
        configs.insert(Language::Python, python);
        Self { configs }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// Enabled languages, sorted by name
    pub fn enabled_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self
            .configs
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(language, _)| *language)
            .collect();
        languages.sort_by_key(|l| l.to_string());
        languages
    }
}
