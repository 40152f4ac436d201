//! Error types for the SOAP engine.

use crate::config::SoapVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by the object model: token source, builder, tree and serializer.
#[derive(Error, Debug)]
pub enum OmError {
    #[error("Malformed XML input: {0}")]
    MalformedInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Incomplete document: {0}")]
    IncompleteDocument(String),

    #[error("Stream already consumed: {0}")]
    AlreadyConsumed(String),

    #[error("Unsupported node: {0}")]
    UnsupportedNode(String),
}

/// Handler configuration errors, raised while a chain is assembled.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Handler '{handler}' requires parameter '{name}'")]
    MissingParameter { handler: String, name: String },

    #[error("Handler '{handler}' has invalid parameter '{name}': {reason}")]
    InvalidParameter {
        handler: String,
        name: String,
        reason: String,
    },

    #[error("Handler '{handler}' has unknown kind '{kind}'")]
    UnknownHandlerKind { handler: String, kind: String },

    #[error("Invalid handler name '{handler}' in phase '{phase}': {reason}")]
    InvalidHandlerName {
        handler: String,
        phase: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// SOAP fault codes a handler can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// The envelope namespace is not one the node accepts
    VersionMismatch,
    /// A mandatory header block was not understood
    MustUnderstand,
    /// The message itself is at fault (SOAP 1.1 `Client`)
    Sender,
    /// Processing failed for reasons unrelated to the message (SOAP 1.1 `Server`)
    Receiver,
}

impl FaultCode {
    /// Get the string code for this fault.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::MustUnderstand => "MUST_UNDERSTAND",
            Self::Sender => "SENDER",
            Self::Receiver => "RECEIVER",
        }
    }

    /// Local name of the fault code value for the given SOAP version.
    pub fn local_name(&self, version: SoapVersion) -> &'static str {
        match (self, version) {
            (Self::VersionMismatch, _) => "VersionMismatch",
            (Self::MustUnderstand, _) => "MustUnderstand",
            (Self::Sender, SoapVersion::Soap11) => "Client",
            (Self::Sender, SoapVersion::Soap12) => "Sender",
            (Self::Receiver, SoapVersion::Soap11) => "Server",
            (Self::Receiver, SoapVersion::Soap12) => "Receiver",
        }
    }
}

/// A domain-level processing failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{}] {reason}", .code.as_str())]
pub struct HandlerFault {
    /// Fault code
    pub code: FaultCode,
    /// Human-readable reason
    pub reason: String,
    /// Additional detail (if available)
    pub detail: Option<String>,
}

impl HandlerFault {
    /// Create a new fault.
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Create a fault with detail.
    pub fn with_detail(code: FaultCode, reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: Some(detail.into()),
        }
    }

    /// Shorthand for a `Sender` fault.
    pub fn sender(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Sender, reason)
    }

    /// Shorthand for a `Receiver` fault.
    pub fn receiver(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Receiver, reason)
    }
}

impl From<OmError> for HandlerFault {
    fn from(err: OmError) -> Self {
        let code = match err {
            OmError::MalformedInput(_) | OmError::IncompleteDocument(_) => FaultCode::Sender,
            _ => FaultCode::Receiver,
        };
        Self::new(code, err.to_string())
    }
}

/// A fault raised by a handler's `on_fault` while a chain was rolling back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryFault {
    /// Handler whose rollback failed
    pub handler: String,
    /// What it reported
    pub fault: HandlerFault,
}

impl fmt::Display for SecondaryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handler, self.fault)
    }
}

/// The fault a handler chain surfaces to its caller after rollback.
///
/// `fault` is always the original fault of the handler at `index`; anything
/// raised while undoing is kept apart in `secondary`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Handler '{handler}' faulted: {fault}")]
pub struct ChainFault {
    /// Name of the faulting handler
    pub handler: String,
    /// Position of the faulting handler in the chain
    pub index: usize,
    /// The original fault
    pub fault: HandlerFault,
    /// Rollback failures, in the order they happened
    pub secondary: Vec<SecondaryFault>,
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Om(#[from] OmError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Chain(#[from] ChainFault),
}
