use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    /// Skip the "continue to next chapter?" confirmation.
    #[serde(default)]
    pub unattended: bool,

    /// Upper bound on node executions in a single traversal.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    pub llm: LlmConfig,

    #[serde(default)]
    pub story: Option<StoryConcepts>,
}

/// Concepts for a fresh run. Missing ones are asked for interactively.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoryConcepts {
    pub world: Option<String>,
    pub character: Option<String>,
    pub premise: Option<String>,
}

fn default_output() -> String {
    "novel_output".to_string()
}
fn default_max_steps() -> usize {
    200
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(CONFIG_FILE, content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config_applies_defaults() {
        let yaml = r#"
llm:
  provider: ollama
  ollama:
    base_url: http://localhost:11434
    model: llama3
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.output_folder, "novel_output");
        assert_eq!(config.max_steps, 200);
        assert!(!config.unattended);
        assert!(config.story.is_none());
        assert_eq!(config.llm.retry_count, 1);
        assert_eq!(config.llm.timeout_seconds, 120);
    }

    #[test]
    fn test_parse_story_concepts() {
        let yaml = r#"
output_folder: out
unattended: true
llm:
  provider: gemini
  gemini:
    api_key: key
    model: gemini-2.5-flash
story:
  world: A drowned city
  premise: Find the lost archive
"#;
        let config = Config::parse(yaml).unwrap();
        let story = config.story.unwrap();
        assert_eq!(story.world.as_deref(), Some("A drowned city"));
        assert!(story.character.is_none());
        assert!(config.unattended);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
