//! The handler capability set.
//!
//! A [`Handler`] is one named, configurable processing unit of a
//! [`HandlerChain`](crate::engine::HandlerChain). Handlers are shared between
//! messages processed in parallel, so `invoke` and `on_fault` take `&self`;
//! anything a handler needs to undo later is recorded in the message context.

use crate::config::{HandlerConfig, ParameterValue};
use crate::context::MessageContext;
use crate::error::{ConfigurationError, HandlerFault};
use std::collections::BTreeMap;

/// A single processing unit in a handler chain.
pub trait Handler: Send + Sync {
    /// Resolve configuration. Called once before the handler joins a chain.
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError>;

    /// Process a message.
    ///
    /// Partial changes made before returning a fault must either be undone
    /// here or be undoable by [`on_fault`](Handler::on_fault).
    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault>;

    /// Undo the effects of `invoke` while the chain rolls back.
    fn on_fault(&self, _ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        Ok(())
    }

    /// Release resources when the chain is torn down.
    fn cleanup(&mut self) -> Result<(), HandlerFault> {
        Ok(())
    }

    /// The description passed to `init`.
    fn description(&self) -> &HandlerDescription;

    fn name(&self) -> &str {
        &self.description().name
    }

    fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.description().parameters.get(name)
    }
}

/// Static description of a configured handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerDescription {
    /// Instance name, unique within a chain
    pub name: String,
    /// Registered kind
    pub kind: String,
    /// Phase the handler runs in
    pub phase: String,
    /// Named parameters; unknown names are ignored
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl HandlerDescription {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Description of a handler declared in a configured phase.
    pub fn from_config(config: &HandlerConfig, phase: &str) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind.clone(),
            phase: phase.to_string(),
            parameters: config.parameters.clone(),
        }
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Text parameter, if present.
    pub fn text(&self, name: &str) -> Result<Option<&str>, ConfigurationError> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(ParameterValue::Text(value)) => Ok(Some(value)),
            Some(other) => Err(self.invalid(name, "text", other)),
        }
    }

    /// Text parameter that must be present and non-empty.
    pub fn required_text(&self, name: &str) -> Result<&str, ConfigurationError> {
        match self.text(name)? {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigurationError::MissingParameter {
                handler: self.name.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Flag parameter; `"true"`/`"false"` text is accepted too.
    pub fn flag(&self, name: &str) -> Result<Option<bool>, ConfigurationError> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(ParameterValue::Flag(value)) => Ok(Some(*value)),
            Some(ParameterValue::Text(value)) => match value.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(self.invalid_reason(name, format!("expected true or false, got '{}'", value))),
            },
            Some(other) => Err(self.invalid(name, "flag", other)),
        }
    }

    /// Integer parameter; numeric text is accepted too.
    pub fn integer(&self, name: &str) -> Result<Option<i64>, ConfigurationError> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(ParameterValue::Integer(value)) => Ok(Some(*value)),
            Some(ParameterValue::Text(value)) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid_reason(name, format!("expected an integer, got '{}'", value))),
            Some(other) => Err(self.invalid(name, "integer", other)),
        }
    }

    /// Non-negative integer parameter.
    pub fn count(&self, name: &str) -> Result<Option<usize>, ConfigurationError> {
        match self.integer(name)? {
            None => Ok(None),
            Some(value) => usize::try_from(value)
                .map(Some)
                .map_err(|_| self.invalid_reason(name, format!("must not be negative, got {}", value))),
        }
    }

    /// List parameter; comma-separated text is split into items.
    pub fn list(&self, name: &str) -> Result<Option<Vec<String>>, ConfigurationError> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(ParameterValue::List(items)) => Ok(Some(items.clone())),
            Some(ParameterValue::Text(value)) => Ok(Some(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            Some(other) => Err(self.invalid(name, "list", other)),
        }
    }

    fn invalid(&self, name: &str, expected: &str, got: &ParameterValue) -> ConfigurationError {
        self.invalid_reason(name, format!("expected {}, got {}", expected, got.type_name()))
    }

    pub(crate) fn invalid_reason(&self, name: &str, reason: String) -> ConfigurationError {
        ConfigurationError::InvalidParameter {
            handler: self.name.clone(),
            name: name.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> HandlerDescription {
        HandlerDescription::new("route", "operation")
            .with_parameter("actions", vec!["Get*".to_string(), "List*".to_string()])
            .with_parameter("csv", "a, b,,c")
            .with_parameter("strict", true)
            .with_parameter("limit", 10_i64)
            .with_parameter("limit_text", "25")
    }

    #[test]
    fn test_typed_accessors() {
        let desc = description();
        assert_eq!(desc.list("actions").unwrap().unwrap().len(), 2);
        assert_eq!(
            desc.list("csv").unwrap().unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(desc.flag("strict").unwrap(), Some(true));
        assert_eq!(desc.integer("limit").unwrap(), Some(10));
        assert_eq!(desc.integer("limit_text").unwrap(), Some(25));
        assert_eq!(desc.count("limit").unwrap(), Some(10));
        assert_eq!(desc.text("missing").unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_is_invalid_parameter() {
        let desc = description();
        let err = desc.flag("limit").unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidParameter { ref handler, ref name, .. }
                if handler == "route" && name == "limit"
        ));
        assert!(desc.integer("csv").is_err());
    }

    #[test]
    fn test_required_text_missing() {
        let desc = HandlerDescription::new("hdr", "add-header").with_parameter("namespace", "  ");
        assert!(matches!(
            desc.required_text("namespace"),
            Err(ConfigurationError::MissingParameter { .. })
        ));
        assert!(matches!(
            desc.required_text("local_name"),
            Err(ConfigurationError::MissingParameter { .. })
        ));
    }

    #[test]
    fn test_negative_count_rejected() {
        let desc = HandlerDescription::new("limits", "body-limits").with_parameter("max_depth", -1_i64);
        assert!(desc.count("max_depth").is_err());
    }
}
