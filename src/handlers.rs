//! Built-in handlers and the registry that creates handlers by kind.

use crate::config::{OperationMode, SoapVersion};
use crate::context::MessageContext;
use crate::document::Document;
use crate::error::{ConfigurationError, FaultCode, HandlerFault, OmError};
use crate::handler::{Handler, HandlerDescription};
use crate::node::{NodeId, NodeKind, QName};
use crate::soap::{self, action_operation, parse_soap_action};
use glob::Pattern;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Property holding the SOAP version label of the message.
pub const VERSION_PROPERTY: &str = "soap.version";
/// Property holding the operation name of the message.
pub const OPERATION_PROPERTY: &str = "soap.operation";

/// Creates an uninitialized handler.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Table of handler kinds.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", || Box::new(LogHandler::default()));
        registry.register("envelope", || Box::new(EnvelopeHandler::default()));
        registry.register("must-understand", || Box::new(MustUnderstandHandler::default()));
        registry.register("operation", || Box::new(OperationHandler::default()));
        registry.register("add-header", || Box::new(AddHeaderHandler::default()));
        registry.register("body-limits", || Box::new(BodyLimitsHandler::default()));
        registry
    }

    /// Register (or replace) a kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Create a handler of the described kind and initialize it.
    pub fn create(&self, description: HandlerDescription) -> Result<Box<dyn Handler>, ConfigurationError> {
        let factory = self
            .factories
            .get(&description.kind)
            .ok_or_else(|| ConfigurationError::UnknownHandlerKind {
                handler: description.name.clone(),
                kind: description.kind.clone(),
            })?;
        let mut handler = factory();
        handler.init(description)?;
        debug!(handler = %handler.name(), kind = %handler.description().kind, "Handler initialized");
        Ok(handler)
    }
}

// ============================================================================
// log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LogLevel {
    Debug,
    #[default]
    Info,
}

/// Logs each message passing through, and each rollback.
#[derive(Default)]
pub struct LogHandler {
    description: HandlerDescription,
    level: LogLevel,
}

impl Handler for LogHandler {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        self.level = match description.text("level")?.map(str::to_ascii_lowercase).as_deref() {
            None | Some("info") => LogLevel::Info,
            Some("debug") => LogLevel::Debug,
            Some(other) => {
                return Err(description.invalid_reason("level", format!("unknown level '{}'", other)));
            }
        };
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let message_id = ctx.message_id().unwrap_or("-");
        let soap_action = ctx.soap_action().unwrap_or("-");
        match self.level {
            LogLevel::Debug => debug!(
                handler = %self.name(),
                message_id = %message_id,
                soap_action = %soap_action,
                received_at = %ctx.created_at(),
                "Message received"
            ),
            LogLevel::Info => info!(
                handler = %self.name(),
                message_id = %message_id,
                soap_action = %soap_action,
                received_at = %ctx.created_at(),
                "Message received"
            ),
        }
        Ok(())
    }

    fn on_fault(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        info!(
            handler = %self.name(),
            message_id = %ctx.message_id().unwrap_or("-"),
            fault = ?ctx.fault().map(|f| f.reason.as_str()),
            "Message rolled back"
        );
        Ok(())
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

// ============================================================================
// envelope
// ============================================================================

/// Checks that the message is a SOAP envelope of an allowed version.
pub struct EnvelopeHandler {
    description: HandlerDescription,
    allowed_versions: Vec<SoapVersion>,
    require_header: bool,
}

impl Default for EnvelopeHandler {
    fn default() -> Self {
        Self {
            description: HandlerDescription::default(),
            allowed_versions: vec![SoapVersion::Soap11, SoapVersion::Soap12],
            require_header: false,
        }
    }
}

impl Handler for EnvelopeHandler {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        if let Some(labels) = description.list("allowed_versions")? {
            self.allowed_versions = labels
                .iter()
                .map(|label| {
                    SoapVersion::parse(label).ok_or_else(|| {
                        description
                            .invalid_reason("allowed_versions", format!("unknown SOAP version '{}'", label))
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        self.require_header = description.flag("require_header")?.unwrap_or(false);
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let doc = ctx.envelope_mut();
        let root = doc
            .document_element()?
            .ok_or_else(|| HandlerFault::sender("Message has no document element"))?;
        let name = doc
            .element_name(root)
            .cloned()
            .ok_or_else(|| HandlerFault::sender("Message has no document element"))?;

        if name.local_name != "Envelope" {
            return Err(HandlerFault::sender(format!(
                "Document element <{}> is not a SOAP Envelope",
                name
            )));
        }
        let version = SoapVersion::from_namespace(&name.namespace_uri).ok_or_else(|| {
            HandlerFault::new(
                FaultCode::VersionMismatch,
                format!("Unrecognized envelope namespace '{}'", name.namespace_uri),
            )
        })?;
        if !self.allowed_versions.contains(&version) {
            return Err(HandlerFault::new(
                FaultCode::VersionMismatch,
                format!("SOAP version {} is not allowed", version.as_str()),
            ));
        }
        if self.require_header && soap::header(doc)?.is_none() {
            return Err(HandlerFault::sender("SOAP Header is required but not present"));
        }
        if soap::body(doc)?.is_none() {
            return Err(HandlerFault::sender("SOAP Body is missing"));
        }

        ctx.set_property(VERSION_PROPERTY, version.as_str());
        Ok(())
    }

    fn on_fault(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        ctx.remove_property(VERSION_PROPERTY);
        Ok(())
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

// ============================================================================
// must-understand
// ============================================================================

/// Faults on mandatory header blocks outside the understood namespaces.
#[derive(Default)]
pub struct MustUnderstandHandler {
    description: HandlerDescription,
    understood: Vec<String>,
}

impl Handler for MustUnderstandHandler {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        self.understood = description.list("understood")?.unwrap_or_default();
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let blocks = soap::header_blocks(ctx.envelope_mut())?;
        let not_understood = blocks
            .iter()
            .filter(|b| b.must_understand)
            .find(|b| !self.understood.contains(&b.name.namespace_uri));
        if let Some(block) = not_understood {
            return Err(HandlerFault::with_detail(
                FaultCode::MustUnderstand,
                format!("Header block <{}> was not understood", block.name),
                block.name.namespace_uri.clone(),
            ));
        }
        Ok(())
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

// ============================================================================
// operation
// ============================================================================

/// Operation allowlist/denylist over the body operation and SOAPAction.
#[derive(Default)]
pub struct OperationHandler {
    description: HandlerDescription,
    patterns: Vec<Pattern>,
    mode: OperationMode,
    require_soap_action: bool,
    validate_action_match: bool,
}

impl Handler for OperationHandler {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        let actions = description
            .list("actions")?
            .ok_or_else(|| ConfigurationError::MissingParameter {
                handler: description.name.clone(),
                name: "actions".to_string(),
            })?;
        self.patterns = actions
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    description.invalid_reason("actions", format!("invalid pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<_, _>>()?;
        if let Some(label) = description.text("mode")? {
            self.mode = OperationMode::parse(label)
                .ok_or_else(|| description.invalid_reason("mode", format!("unknown mode '{}'", label)))?;
        }
        self.require_soap_action = description.flag("require_soap_action")?.unwrap_or(false);
        self.validate_action_match = description.flag("validate_action_match")?.unwrap_or(false);
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let soap_action = ctx.soap_action().map(parse_soap_action).filter(|a| !a.is_empty());
        if self.require_soap_action && soap_action.is_none() {
            return Err(HandlerFault::sender("SOAPAction header is required but not present"));
        }

        let body_operation = soap::body_operation(ctx.envelope_mut())?.map(|q| q.local_name);
        let operation = body_operation
            .clone()
            .or_else(|| soap_action.as_deref().map(|a| action_operation(a).to_string()))
            .unwrap_or_default();
        if operation.is_empty() {
            return Ok(());
        }

        let matches_pattern = self.patterns.iter().any(|p| p.matches(&operation));
        let allowed = match self.mode {
            // No patterns = allow all
            OperationMode::Allowlist => self.patterns.is_empty() || matches_pattern,
            OperationMode::Denylist => !matches_pattern,
        };
        if !allowed {
            return Err(HandlerFault::sender(format!("Operation '{}' is not allowed", operation)));
        }

        if self.validate_action_match {
            if let (Some(action), Some(body_op)) = (soap_action.as_deref(), body_operation.as_deref()) {
                if action_operation(action) != body_op {
                    warn!(
                        soap_action = action,
                        body_operation = body_op,
                        "SOAPAction mismatch with body operation"
                    );
                    return Err(HandlerFault::sender(format!(
                        "SOAPAction '{}' does not match body operation '{}'",
                        action, body_op
                    )));
                }
            }
        }

        ctx.set_property(OPERATION_PROPERTY, operation);
        Ok(())
    }

    fn on_fault(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        ctx.remove_property(OPERATION_PROPERTY);
        Ok(())
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

// ============================================================================
// add-header
// ============================================================================

/// Appends a header block, creating the `Header` element when absent.
#[derive(Default)]
pub struct AddHeaderHandler {
    description: HandlerDescription,
    block: Option<QName>,
    value: Option<String>,
}

impl AddHeaderHandler {
    fn undo_key(&self) -> String {
        format!("add-header.{}.inserted", self.name())
    }

    fn insert(&self, doc: &mut Document, block_name: QName) -> Result<NodeId, HandlerFault> {
        let (env, version) = soap::envelope(doc)?.ok_or_else(|| {
            HandlerFault::sender("Cannot add a header block outside a SOAP envelope")
        })?;

        let (header, created) = match soap::header(doc)? {
            Some(header) => (header, false),
            None => {
                let prefix = doc.element_name(env).and_then(|n| n.prefix.clone());
                let header = doc.create_element(QName {
                    namespace_uri: version.namespace().to_string(),
                    local_name: "Header".to_string(),
                    prefix,
                })?;
                match doc.first_child_element(env)? {
                    Some(first) => doc.insert_before(first, header)?,
                    None => doc.append_child(env, header)?,
                }
                (header, true)
            }
        };

        let block = match &self.value {
            Some(value) => doc.create_text_element(block_name, value)?,
            None => doc.create_element(block_name)?,
        };
        if let Err(e) = doc.append_child(header, block) {
            if created {
                doc.detach(header)?;
            }
            return Err(e.into());
        }
        Ok(if created { header } else { block })
    }
}

impl Handler for AddHeaderHandler {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        let namespace = description.required_text("namespace")?;
        let local_name = description.required_text("local_name")?;
        self.block = Some(match description.text("prefix")? {
            Some(prefix) => QName::prefixed(namespace, local_name, prefix),
            None => QName::new(namespace, local_name),
        });
        self.value = description.text("value")?.map(str::to_string);
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let block_name = self
            .block
            .clone()
            .ok_or_else(|| HandlerFault::receiver(format!("Handler '{}' was not initialized", self.name())))?;
        let inserted = self.insert(ctx.envelope_mut(), block_name)?;
        debug!(handler = %self.name(), node = %inserted, "Header block added");
        ctx.set_property(self.undo_key(), inserted.index());
        Ok(())
    }

    fn on_fault(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let Some(recorded) = ctx.remove_property(&self.undo_key()) else {
            return Ok(());
        };
        let doc = ctx.envelope_mut();
        let inserted = recorded
            .as_u64()
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| doc.node_id(index))
            .ok_or_else(|| HandlerFault::receiver("Recorded header block no longer exists"))?;
        doc.detach(inserted)?;
        debug!(handler = %self.name(), node = %inserted, "Header block removed");
        Ok(())
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

// ============================================================================
// body-limits
// ============================================================================

/// Structure of a SOAP body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyAnalysis {
    /// Deepest element nesting; direct children of the body are at depth 1
    pub max_depth: usize,
    pub element_count: usize,
    /// Longest single text node, in bytes
    pub max_text_length: usize,
    pub has_cdata: bool,
    pub has_comments: bool,
    /// The walk stopped early at an element nested past the depth limit
    pub truncated: bool,
}

impl BodyAnalysis {
    /// Walk the subtree under `body`, pulling it from the stream as the walk goes.
    ///
    /// With a `depth_limit`, the walk stops at the first element nested deeper
    /// than the limit; nothing after that element is read.
    pub fn scan(doc: &mut Document, body: NodeId, depth_limit: Option<usize>) -> Result<Self, OmError> {
        let mut analysis = Self::default();
        // Elements entered on the way down to the current node
        let mut path: Vec<NodeId> = Vec::new();
        let mut next = doc.first_child(body)?;
        loop {
            let Some(id) = next else {
                match path.pop() {
                    Some(parent) => {
                        next = doc.next_sibling(parent)?;
                        continue;
                    }
                    None => return Ok(analysis),
                }
            };
            match doc.kind(id) {
                NodeKind::Element { .. } => {
                    let depth = path.len() + 1;
                    analysis.element_count += 1;
                    analysis.max_depth = analysis.max_depth.max(depth);
                    if depth_limit.is_some_and(|limit| depth > limit) {
                        analysis.truncated = true;
                        return Ok(analysis);
                    }
                    path.push(id);
                    next = doc.first_child(id)?;
                    continue;
                }
                NodeKind::Text(text) => analysis.max_text_length = analysis.max_text_length.max(text.len()),
                NodeKind::CData(text) => {
                    analysis.has_cdata = true;
                    analysis.max_text_length = analysis.max_text_length.max(text.len());
                }
                NodeKind::Comment(_) => analysis.has_comments = true,
                _ => {}
            }
            next = doc.next_sibling(id)?;
        }
    }
}

/// Limits on the size and shape of the body.
///
/// The body is read lazily; a body nested past `max_depth` is rejected as
/// soon as the walk reaches the offending element.
pub struct BodyLimitsHandler {
    description: HandlerDescription,
    max_depth: usize,
    max_elements: usize,
    max_text_length: usize,
    block_cdata: bool,
    block_comments: bool,
}

impl Default for BodyLimitsHandler {
    fn default() -> Self {
        Self {
            description: HandlerDescription::default(),
            max_depth: 20,
            max_elements: 1000,
            max_text_length: 65536, // 64KB
            block_cdata: false,
            block_comments: false,
        }
    }
}

impl Handler for BodyLimitsHandler {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        if let Some(value) = description.count("max_depth")? {
            self.max_depth = value;
        }
        if let Some(value) = description.count("max_elements")? {
            self.max_elements = value;
        }
        if let Some(value) = description.count("max_text_length")? {
            self.max_text_length = value;
        }
        self.block_cdata = description.flag("block_cdata")?.unwrap_or(false);
        self.block_comments = description.flag("block_comments")?.unwrap_or(false);
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        let doc = ctx.envelope_mut();
        let Some(body) = soap::body(doc)? else {
            return Ok(());
        };
        let analysis = BodyAnalysis::scan(doc, body, Some(self.max_depth))?;

        let mut violations = Vec::new();
        if analysis.max_depth > self.max_depth {
            violations.push(format!(
                "SOAP Body nesting depth {} exceeds maximum {}",
                analysis.max_depth, self.max_depth
            ));
        }
        if analysis.element_count > self.max_elements {
            violations.push(format!(
                "SOAP Body contains {} elements, maximum is {}",
                analysis.element_count, self.max_elements
            ));
        }
        if analysis.max_text_length > self.max_text_length {
            violations.push(format!(
                "Text content length {} exceeds maximum {}",
                analysis.max_text_length, self.max_text_length
            ));
        }
        if self.block_cdata && analysis.has_cdata {
            violations.push("CDATA sections are not allowed in the SOAP Body".to_string());
        }
        if self.block_comments && analysis.has_comments {
            violations.push("Comments are not allowed in the SOAP Body".to_string());
        }

        if violations.is_empty() {
            return Ok(());
        }
        Err(HandlerFault::sender(violations.join("; ")))
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BuildState;

    const SOAP_11_REQUEST: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <t:Trace xmlns:t="urn:trace">on</t:Trace>
  </soap:Header>
  <soap:Body>
    <m:GetUser xmlns:m="http://example.org/users">
      <m:UserId>123</m:UserId>
    </m:GetUser>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_NO_HEADER: &str = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><m:DeleteUser xmlns:m="urn:users"/></soap:Body></soap:Envelope>"#;

    fn handler(kind: &str, description: HandlerDescription) -> Box<dyn Handler> {
        HandlerRegistry::with_builtins()
            .create(HandlerDescription { kind: kind.to_string(), ..description })
            .unwrap()
    }

    fn context(xml: &str) -> MessageContext {
        MessageContext::new(Document::parse_str(xml))
    }

    #[test]
    fn test_registry_kinds_and_unknown_kind() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(
            registry.kinds(),
            vec!["add-header", "body-limits", "envelope", "log", "must-understand", "operation"]
        );
        let err = registry
            .create(HandlerDescription::new("x", "nope"))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::UnknownHandlerKind { .. }));
    }

    #[test]
    fn test_log_rejects_unknown_level() {
        let err = HandlerRegistry::with_builtins()
            .create(HandlerDescription::new("audit", "log").with_parameter("level", "loud"))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::InvalidParameter { .. }));
    }

    #[test]
    fn test_envelope_records_version() {
        let h = handler("envelope", HandlerDescription::new("env", ""));
        let mut ctx = context(SOAP_11_REQUEST);
        h.invoke(&mut ctx).unwrap();
        assert_eq!(ctx.property_str(VERSION_PROPERTY), Some("1.1"));

        h.on_fault(&mut ctx).unwrap();
        assert_eq!(ctx.property(VERSION_PROPERTY), None);
    }

    #[test]
    fn test_envelope_version_not_allowed() {
        let h = handler(
            "envelope",
            HandlerDescription::new("env", "").with_parameter("allowed_versions", vec!["1.1".to_string()]),
        );
        let mut ctx = context(SOAP_12_NO_HEADER);
        let fault = h.invoke(&mut ctx).unwrap_err();
        assert_eq!(fault.code, FaultCode::VersionMismatch);
    }

    #[test]
    fn test_envelope_requires_header() {
        let h = handler(
            "envelope",
            HandlerDescription::new("env", "").with_parameter("require_header", true),
        );
        let fault = h.invoke(&mut context(SOAP_12_NO_HEADER)).unwrap_err();
        assert_eq!(fault.code, FaultCode::Sender);
        assert!(fault.reason.contains("Header"));
        h.invoke(&mut context(SOAP_11_REQUEST)).unwrap();
    }

    #[test]
    fn test_envelope_rejects_non_soap() {
        let h = handler("envelope", HandlerDescription::new("env", ""));
        let fault = h.invoke(&mut context("<order/>")).unwrap_err();
        assert_eq!(fault.code, FaultCode::Sender);

        let fault = h
            .invoke(&mut context(r#"<e:Envelope xmlns:e="urn:other"/>"#))
            .unwrap_err();
        assert_eq!(fault.code, FaultCode::VersionMismatch);
    }

    #[test]
    fn test_must_understand() {
        let xml = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Header><s:Security xmlns:s="urn:sec" soap:mustUnderstand="true"/></soap:Header><soap:Body/></soap:Envelope>"#;
        let h = handler("must-understand", HandlerDescription::new("mu", ""));
        let fault = h.invoke(&mut context(xml)).unwrap_err();
        assert_eq!(fault.code, FaultCode::MustUnderstand);
        assert_eq!(fault.detail.as_deref(), Some("urn:sec"));

        let h = handler(
            "must-understand",
            HandlerDescription::new("mu", "").with_parameter("understood", "urn:sec"),
        );
        h.invoke(&mut context(xml)).unwrap();
    }

    #[test]
    fn test_operation_requires_actions() {
        let err = HandlerRegistry::with_builtins()
            .create(HandlerDescription::new("route", "operation"))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::MissingParameter { .. }));
    }

    #[test]
    fn test_operation_allowlist() {
        let h = handler(
            "operation",
            HandlerDescription::new("route", "").with_parameter("actions", vec!["Get*".to_string()]),
        );
        let mut ctx = context(SOAP_11_REQUEST);
        h.invoke(&mut ctx).unwrap();
        assert_eq!(ctx.property_str(OPERATION_PROPERTY), Some("GetUser"));

        let fault = h.invoke(&mut context(SOAP_12_NO_HEADER)).unwrap_err();
        assert!(fault.reason.contains("DeleteUser"));
    }

    #[test]
    fn test_operation_denylist() {
        let h = handler(
            "operation",
            HandlerDescription::new("route", "")
                .with_parameter("actions", vec!["Delete*".to_string()])
                .with_parameter("mode", "denylist"),
        );
        assert!(h.invoke(&mut context(SOAP_12_NO_HEADER)).is_err());
        h.invoke(&mut context(SOAP_11_REQUEST)).unwrap();
    }

    #[test]
    fn test_operation_empty_allowlist_allows_all() {
        let h = handler(
            "operation",
            HandlerDescription::new("route", "").with_parameter("actions", Vec::<String>::new()),
        );
        h.invoke(&mut context(SOAP_12_NO_HEADER)).unwrap();
    }

    #[test]
    fn test_operation_reads_only_operation_start() {
        let h = handler(
            "operation",
            HandlerDescription::new("route", "").with_parameter("actions", vec!["*".to_string()]),
        );
        let mut ctx = context(SOAP_11_REQUEST);
        h.invoke(&mut ctx).unwrap();
        let doc = ctx.envelope_mut();
        let body = soap::body(doc).unwrap().unwrap();
        let op = doc.first_child_element(body).unwrap().unwrap();
        assert_eq!(doc.build_state(op), BuildState::Unbuilt);
    }

    #[test]
    fn test_soap_action_match() {
        let h = handler(
            "operation",
            HandlerDescription::new("route", "")
                .with_parameter("actions", vec!["*".to_string()])
                .with_parameter("validate_action_match", true),
        );
        let mut ok = context(SOAP_11_REQUEST).with_soap_action("\"http://example.org/users#GetUser\"");
        h.invoke(&mut ok).unwrap();

        let mut mismatch = context(SOAP_11_REQUEST).with_soap_action("\"http://example.org/users/DeleteUser\"");
        let fault = h.invoke(&mut mismatch).unwrap_err();
        assert!(fault.reason.contains("does not match"));
    }

    #[test]
    fn test_require_soap_action() {
        let h = handler(
            "operation",
            HandlerDescription::new("route", "")
                .with_parameter("actions", vec!["*".to_string()])
                .with_parameter("require_soap_action", true),
        );
        let fault = h.invoke(&mut context(SOAP_11_REQUEST)).unwrap_err();
        assert!(fault.reason.contains("SOAPAction"));
    }

    #[test]
    fn test_add_header_creates_header_and_undoes() {
        let h = handler(
            "add-header",
            HandlerDescription::new("stamp", "")
                .with_parameter("namespace", "urn:stamp")
                .with_parameter("local_name", "Stamp")
                .with_parameter("prefix", "st")
                .with_parameter("value", "42"),
        );
        let mut ctx = context(SOAP_12_NO_HEADER);
        h.invoke(&mut ctx).unwrap();

        let doc = ctx.envelope_mut();
        let blocks = soap::header_blocks(doc).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, QName::prefixed("urn:stamp", "Stamp", "st"));
        let root = doc.root();
        assert_eq!(
            doc.to_xml_string(root).unwrap(),
            concat!(
                r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">"#,
                r#"<soap:Header><st:Stamp xmlns:st="urn:stamp">42</st:Stamp></soap:Header>"#,
                r#"<soap:Body><m:DeleteUser xmlns:m="urn:users"/></soap:Body></soap:Envelope>"#
            )
        );

        h.on_fault(&mut ctx).unwrap();
        assert!(soap::header(ctx.envelope_mut()).unwrap().is_none());
        // nothing left to undo
        h.on_fault(&mut ctx).unwrap();
    }

    #[test]
    fn test_add_header_appends_to_existing_header() {
        let h = handler(
            "add-header",
            HandlerDescription::new("stamp", "")
                .with_parameter("namespace", "urn:stamp")
                .with_parameter("local_name", "Stamp"),
        );
        let mut ctx = context(SOAP_11_REQUEST);
        h.invoke(&mut ctx).unwrap();
        assert_eq!(soap::header_blocks(ctx.envelope_mut()).unwrap().len(), 2);

        h.on_fault(&mut ctx).unwrap();
        let blocks = soap::header_blocks(ctx.envelope_mut()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name.local_name, "Trace");
    }

    #[test]
    fn test_body_limits() {
        let h = handler(
            "body-limits",
            HandlerDescription::new("limits", "")
                .with_parameter("max_depth", 1_i64)
                .with_parameter("max_elements", 5_i64),
        );
        let fault = h.invoke(&mut context(SOAP_11_REQUEST)).unwrap_err();
        assert!(fault.reason.contains("nesting depth 2 exceeds maximum 1"));
        assert!(!fault.reason.contains("elements"));

        h.invoke(&mut context(SOAP_12_NO_HEADER)).unwrap();
    }

    #[test]
    fn test_body_analysis() {
        let mut doc = Document::parse_str(
            "<b><x>hello<y><!--c--><![CDATA[raw data]]></y></x><z/></b>",
        );
        let body = doc.document_element().unwrap().unwrap();
        let analysis = BodyAnalysis::scan(&mut doc, body, None).unwrap();
        assert_eq!(
            analysis,
            BodyAnalysis {
                max_depth: 2,
                element_count: 3,
                max_text_length: 8,
                has_cdata: true,
                has_comments: true,
                truncated: false,
            }
        );
        assert!(doc.is_complete(body));
    }

    #[test]
    fn test_body_limits_stops_at_depth_limit() {
        let levels = 100_000;
        let xml = format!(
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>{}{}</soap:Body></soap:Envelope>"#,
            "<a>".repeat(levels),
            "</a>".repeat(levels)
        );
        let h = handler("body-limits", HandlerDescription::new("limits", ""));
        let mut ctx = context(&xml);

        let fault = h.invoke(&mut ctx).unwrap_err();
        assert_eq!(fault.code, FaultCode::Sender);
        assert!(fault.reason.contains("nesting depth 21 exceeds maximum 20"));
        assert!(ctx.envelope_mut().events_consumed() < 30);
    }

    #[test]
    fn test_body_analysis_of_deep_body() {
        let levels = 100_000;
        let xml = format!("<b>{}x{}</b>", "<a>".repeat(levels), "</a>".repeat(levels));
        let mut doc = Document::parse_str(&xml);
        let body = doc.document_element().unwrap().unwrap();
        let analysis = BodyAnalysis::scan(&mut doc, body, None).unwrap();
        assert_eq!(analysis.max_depth, levels);
        assert_eq!(analysis.element_count, levels);
        assert!(!analysis.truncated);
        assert!(doc.is_complete(body));
    }

    #[test]
    fn test_body_limits_blocks_comments() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><!--x--><a/></soap:Body></soap:Envelope>"#;
        let h = handler(
            "body-limits",
            HandlerDescription::new("limits", "").with_parameter("block_comments", true),
        );
        assert!(h.invoke(&mut context(xml)).is_err());
    }
}
