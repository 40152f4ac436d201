//! Configuration types for the SOAP engine.

use crate::error::ConfigurationError;
use crate::serializer::SerializeMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration for the SOAP engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Handler phases, in execution order
    pub phases: Vec<PhaseConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            phases: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigurationError::Load(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    /// Total number of configured handlers across all phases.
    pub fn handler_count(&self) -> usize {
        self.phases.iter().map(|p| p.handlers.len()).sum()
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Maximum message size to accept (bytes)
    pub max_message_size: usize,

    /// Reject documents carrying a DOCTYPE declaration
    pub reject_doctype: bool,

    /// Drop whitespace-only text between elements
    pub trim_whitespace: bool,

    /// SOAP version used for faults when the request version is unknown
    pub default_soap_version: SoapVersion,

    /// How the outgoing envelope is written
    pub serialize_mode: SerializeMode,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1_048_576, // 1MB
            reject_doctype: true,
            trim_whitespace: false,
            default_soap_version: SoapVersion::Soap11,
            serialize_mode: SerializeMode::Cached,
        }
    }
}

/// A named, ordered group of handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Phase name
    pub name: String,

    /// Handlers in declaration order
    pub handlers: Vec<HandlerConfig>,
}

/// Configuration of a single handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Handler instance name
    pub name: String,

    /// Registered handler kind (e.g. "log", "operation")
    pub kind: String,

    /// Named parameters, resolved once at init
    pub parameters: BTreeMap<String, ParameterValue>,
}

/// A handler parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Flag(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl ParameterValue {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Flag(_) => "flag",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
            Self::List(_) => "list",
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    /// Version label as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soap11 => "1.1",
            Self::Soap12 => "1.2",
        }
    }

    /// Parse a configuration label.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "1.1" => Some(Self::Soap11),
            "1.2" => Some(Self::Soap12),
            _ => None,
        }
    }

    /// Content type used when transmitting envelopes of this version.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml; charset=utf-8",
            Self::Soap12 => "application/soap+xml; charset=utf-8",
        }
    }
}

/// Operation control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Only allow listed operations
    #[default]
    Allowlist,
    /// Block listed operations
    Denylist,
}

impl OperationMode {
    /// Parse a configuration label.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "allowlist" => Some(Self::Allowlist),
            "denylist" => Some(Self::Denylist),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.settings.reject_doctype);
        assert!(!config.settings.trim_whitespace);
        assert_eq!(config.settings.serialize_mode, SerializeMode::Cached);
        assert!(config.phases.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = EngineConfig::default();
        config.phases.push(PhaseConfig {
            name: "dispatch".to_string(),
            handlers: vec![HandlerConfig {
                name: "route".to_string(),
                kind: "operation".to_string(),
                parameters: BTreeMap::from([(
                    "actions".to_string(),
                    ParameterValue::List(vec!["Get*".to_string()]),
                )]),
            }],
        });
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.handler_count(), 1);
        assert_eq!(
            parsed.phases[0].handlers[0].parameters.get("actions"),
            Some(&ParameterValue::List(vec!["Get*".to_string()]))
        );
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
version: "1"
settings:
  max_message_size: 2097152
  trim_whitespace: true
  default_soap_version: "1.2"
  serialize_mode: stream
phases:
  - name: transport
    handlers:
      - name: audit
        kind: log
        parameters:
          level: debug
  - name: dispatch
    handlers:
      - name: envelope
        kind: envelope
        parameters:
          require_header: true
          allowed_versions: ["1.1"]
      - name: limits
        kind: body-limits
        parameters:
          max_depth: 15
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.settings.max_message_size, 2_097_152);
        assert!(config.settings.trim_whitespace);
        assert_eq!(config.settings.default_soap_version, SoapVersion::Soap12);
        assert_eq!(config.settings.serialize_mode, SerializeMode::StreamThrough);
        assert_eq!(config.phases.len(), 2);
        assert_eq!(config.handler_count(), 3);

        let envelope = &config.phases[1].handlers[0];
        assert_eq!(
            envelope.parameters.get("require_header"),
            Some(&ParameterValue::Flag(true))
        );
        let limits = &config.phases[1].handlers[1];
        assert_eq!(limits.parameters.get("max_depth"), Some(&ParameterValue::Integer(15)));
    }

    #[test]
    fn test_invalid_yaml_is_load_error() {
        let err = EngineConfig::from_yaml_str("phases: [").unwrap_err();
        assert!(matches!(err, ConfigurationError::Load(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "settings:\n  reject_doctype: false\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert!(!config.settings.reject_doctype);

        let missing = EngineConfig::load(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigurationError::Load(_))));
    }

    #[test]
    fn test_version_and_mode_labels() {
        assert_eq!(SoapVersion::parse("1.2"), Some(SoapVersion::Soap12));
        assert_eq!(SoapVersion::parse("2.0"), None);
        assert_eq!(OperationMode::parse("DenyList"), Some(OperationMode::Denylist));
        assert_eq!(OperationMode::parse("other"), None);
    }
}
