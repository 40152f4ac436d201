//! SOAP/XML engine for Zentinel
//!
//! Two cooperating parts:
//!
//! - A lazily built XML object model. A [`Document`] pulls events from a
//!   [`TokenSource`] only as far as navigation requires, and a [`Serializer`]
//!   writes nodes either from the built tree or by streaming the unread
//!   remainder straight from the source.
//! - A handler chain engine. A [`HandlerChain`] runs a [`MessageContext`]
//!   through phases of [`Handler`]s; when one faults, the handlers that ran
//!   are rolled back in reverse order.
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_engine::{Document, EngineConfig, HandlerChain, HandlerRegistry, MessageContext};
//!
//! let config = EngineConfig::load("engine.yaml")?;
//! let chain = HandlerChain::from_config(&config, &HandlerRegistry::with_builtins())?;
//!
//! let mut ctx = MessageContext::new(Document::parse_str(xml));
//! chain.invoke(&mut ctx)?;
//! let root = ctx.envelope().root();
//! let out = ctx.envelope_mut().to_xml_string(root)?;
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod document;
pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod node;
pub mod serializer;
pub mod soap;
pub mod token;

pub use builder::Step;
pub use config::{EngineConfig, SoapVersion};
pub use context::{ChainState, MessageContext};
pub use dispatch::{Dispatcher, DispatchError, Response};
pub use document::Document;
pub use engine::HandlerChain;
pub use error::{ChainFault, ConfigurationError, EngineError, FaultCode, HandlerFault, OmError};
pub use handler::{Handler, HandlerDescription};
pub use handlers::HandlerRegistry;
pub use node::{BuildState, NodeId, NodeKind, QName};
pub use serializer::{SerializeMode, SerializeOptions, Serializer};
pub use token::{QuickXmlSource, SourceOptions, TokenSource, XmlEvent};
