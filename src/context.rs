//! Per-message state passed through a handler chain.

use crate::document::Document;
use crate::error::HandlerFault;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Where a message is in its trip through a handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainState {
    /// Not started
    #[default]
    Pending,
    /// Handler `i` is being invoked
    Running(usize),
    /// Every handler succeeded
    Completed,
    /// Handler `i` faulted; rollback has not finished
    Faulted(usize),
    /// Every handler up to the faulting one was given a chance to undo
    RolledBack,
}

impl ChainState {
    /// True for `Completed` and `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

/// A message in flight: the envelope tree plus transport and session properties.
#[derive(Debug)]
pub struct MessageContext {
    message_id: Option<String>,
    created_at: DateTime<Utc>,
    envelope: Document,
    properties: HashMap<String, Value>,
    soap_action: Option<String>,
    fault: Option<HandlerFault>,
    pub(crate) chain_state: ChainState,
}

impl MessageContext {
    pub fn new(envelope: Document) -> Self {
        Self {
            message_id: None,
            created_at: Utc::now(),
            envelope,
            properties: HashMap::new(),
            soap_action: None,
            fault: None,
            chain_state: ChainState::Pending,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_soap_action(mut self, action: impl Into<String>) -> Self {
        self.soap_action = Some(action.into());
        self
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn soap_action(&self) -> Option<&str> {
        self.soap_action.as_deref()
    }

    pub fn envelope(&self) -> &Document {
        &self.envelope
    }

    pub fn envelope_mut(&mut self) -> &mut Document {
        &mut self.envelope
    }

    /// Give up the envelope, e.g. to serialize it after the chain ran.
    pub fn into_envelope(self) -> Document {
        self.envelope
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Property as a string, if it is one.
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    /// Set a property, returning the previous value.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(name.into(), value.into())
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn fault(&self) -> Option<&HandlerFault> {
        self.fault.as_ref()
    }

    pub fn set_fault(&mut self, fault: HandlerFault) {
        self.fault = Some(fault);
    }

    pub fn chain_state(&self) -> ChainState {
        self.chain_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_context_is_pending() {
        let ctx = MessageContext::new(Document::new()).with_message_id("m-1");
        assert_eq!(ctx.chain_state(), ChainState::Pending);
        assert_eq!(ctx.message_id(), Some("m-1"));
        assert!(ctx.fault().is_none());
    }

    #[test]
    fn test_properties() {
        let mut ctx = MessageContext::new(Document::new());
        assert_eq!(ctx.set_property("soap.operation", "GetUser"), None);
        assert_eq!(ctx.property_str("soap.operation"), Some("GetUser"));
        ctx.set_property("quota.used", json!(3));
        assert_eq!(ctx.property("quota.used"), Some(&json!(3)));
        assert_eq!(ctx.property_str("quota.used"), None);
        assert_eq!(ctx.remove_property("soap.operation"), Some(json!("GetUser")));
        assert_eq!(ctx.properties().len(), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ChainState::Completed.is_terminal());
        assert!(ChainState::RolledBack.is_terminal());
        assert!(!ChainState::Faulted(1).is_terminal());
        assert!(!ChainState::Running(0).is_terminal());
        assert!(!ChainState::Pending.is_terminal());
    }
}
