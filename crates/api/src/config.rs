use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use extract::PipelineConfig;

pub const CONFIG_ENV: &str = "QC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub ollama: OllamaConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub output: OutputConfig,
    pub neo4j: Option<Neo4jConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            json_logs: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/runs"),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .context(format!("Failed to read config file {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .context(format!("Failed to parse config file {:?}", path))?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// `--config <path>` wins over `QC_CONFIG`; defaults when neither is set.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match cli_path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::DiscoveryMode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "pipeline": {{"max_concurrent_documents": 2, "discovery_mode": "mixed"}},
                "neo4j": {{"uri": "bolt://db:7687", "user": "neo4j", "password": "secret"}}
            }}"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.pipeline.max_concurrent_documents, 2);
        assert_eq!(config.pipeline.discovery_mode, DiscoveryMode::Mixed);
        assert_eq!(config.pipeline.connection_window_size, 10);
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert!(config.cache.enabled);
        assert_eq!(config.neo4j.unwrap().uri, "bolt://db:7687");
    }

    #[test]
    fn test_invalid_pipeline_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"pipeline": {{"connection_window_size": 0}}}}"#).unwrap();
        assert!(AppConfig::from_file(file.path()).is_err());
    }
}
