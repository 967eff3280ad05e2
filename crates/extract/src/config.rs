use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Build every schema from scratch
    #[default]
    Open,
    /// Keep supplied schemas verbatim and discover additional items
    Mixed,
    /// Use supplied schemas as-is, no discovery call
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            temperature: 0.2,
        }
    }
}

impl ModelSettings {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}

/// Model/temperature per oracle-calling stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseSettings {
    pub code_discovery: ModelSettings,
    pub speaker_discovery: ModelSettings,
    pub entity_discovery: ModelSettings,
    pub quote_extraction: ModelSettings,
    pub connection_detection: ModelSettings,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            // Discovery benefits from a little variety, application should be stable
            code_discovery: ModelSettings::with_temperature(0.4),
            speaker_discovery: ModelSettings::with_temperature(0.3),
            entity_discovery: ModelSettings::with_temperature(0.3),
            quote_extraction: ModelSettings::with_temperature(0.1),
            connection_detection: ModelSettings::with_temperature(0.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub over_connecting_rate: f64,
    pub under_connecting_rate: f64,
    /// Under-connecting is only meaningful with enough quotes
    pub min_quotes_for_under_connecting: usize,
    pub min_distinct_confidences: usize,
    pub min_connections_for_calibration: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            over_connecting_rate: 0.80,
            under_connecting_rate: 0.20,
            min_quotes_for_under_connecting: 10,
            min_distinct_confidences: 3,
            min_connections_for_calibration: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_documents: usize,
    pub code_hierarchy_depth: usize,
    pub connection_window_size: usize,
    pub discovery_mode: DiscoveryMode,
    pub document_timeout_secs: u64,
    /// Connections below this confidence are not recorded
    pub min_connection_confidence: f64,
    /// When set, drop the weakest connections until the connection rate is at or
    /// below `max_connection_rate`
    pub enforce_connection_ceiling: bool,
    pub max_connection_rate: f64,
    /// Warn when the concatenated corpus is larger than this
    pub max_corpus_tokens: usize,
    pub phases: PhaseSettings,
    pub retry: RetryConfig,
    pub quality: QualityThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_documents: 5,
            code_hierarchy_depth: 3,
            connection_window_size: 10,
            discovery_mode: DiscoveryMode::Open,
            document_timeout_secs: 1800,
            min_connection_confidence: 0.5,
            enforce_connection_ceiling: false,
            max_connection_rate: 0.70,
            max_corpus_tokens: 120_000,
            phases: PhaseSettings::default(),
            retry: RetryConfig::default(),
            quality: QualityThresholds::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrent_documents == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_concurrent_documents must be at least 1".to_string(),
            ));
        }
        if self.code_hierarchy_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "code_hierarchy_depth must be at least 1".to_string(),
            ));
        }
        if self.connection_window_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "connection_window_size must be at least 1".to_string(),
            ));
        }
        if self.document_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "document_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_connection_confidence)
            || !(0.0..=1.0).contains(&self.max_connection_rate)
        {
            return Err(PipelineError::InvalidConfig(
                "confidence and rate thresholds must be within 0..=1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_documents, 5);
        assert_eq!(config.discovery_mode, DiscoveryMode::Open);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"connection_window_size": 7, "discovery_mode": "mixed",
                "phases": {"quote_extraction": {"model": "qwen2.5"}}}"#,
        )
        .unwrap();

        assert_eq!(config.connection_window_size, 7);
        assert_eq!(config.discovery_mode, DiscoveryMode::Mixed);
        assert_eq!(config.phases.quote_extraction.model, "qwen2.5");
        assert_eq!(config.phases.quote_extraction.temperature, 0.2);
        assert_eq!(config.max_concurrent_documents, 5);
    }

    #[test]
    fn test_rejects_zero_window() {
        let config = PipelineConfig {
            connection_window_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }
}
