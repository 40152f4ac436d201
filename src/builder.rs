//! Incremental builder.
//!
//! The builder owns the token source of a parsed [`Document`] and applies one
//! structural event per [`Document::next`] call: a start tag opens a new
//! element under the innermost open node, character data and other leaves are
//! appended to it, and an end tag closes it. The stack of open nodes is the
//! builder's cursor into the document; every node not yet complete is either
//! on that stack or permanently torn (consumed by a stream-through
//! serialization, or left behind by [`Document::discard`]).

use crate::document::Document;
use crate::error::OmError;
use crate::node::{Attribute, BuildState, NamespaceDecl, NodeId, NodeKind, QName, XMLNS_NS, XML_NS};
use crate::token::{TokenSource, XmlEvent};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// Outcome of a single builder step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A new element was opened.
    Started(NodeId),
    /// A leaf (text, CDATA, comment, PI) was appended.
    Appended(NodeId),
    /// An element was closed.
    Closed(NodeId),
    /// Whitespace outside the document element was skipped.
    Skipped,
    /// The token source is exhausted.
    EndOfStream,
}

impl Step {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// An element (or the document node) whose end has not been read yet.
#[derive(Debug, Clone)]
pub(crate) struct OpenNode {
    pub(crate) id: NodeId,
    /// Qualified name exactly as it appeared in the start tag
    pub(crate) raw_name: String,
    /// Length of the binding stack before this node's declarations
    bindings_mark: usize,
}

/// Cursor state of a lazily built document.
pub(crate) struct Builder {
    /// Only ever reached through `get_mut`, so it is never locked; it makes
    /// the document `Sync` for read-only traversal from other threads.
    source: Mutex<Box<dyn TokenSource>>,
    pub(crate) open: Vec<OpenNode>,
    /// Namespace declarations of every open element, outermost first
    bindings: Vec<NamespaceDecl>,
    exhausted: bool,
    seen_document_element: bool,
    failure: Option<String>,
}

impl Builder {
    pub(crate) fn new(source: Box<dyn TokenSource>) -> Self {
        Self {
            source: Mutex::new(source),
            open: vec![OpenNode {
                id: NodeId::DOCUMENT,
                raw_name: String::new(),
                bindings_mark: 0,
            }],
            bindings: Vec::new(),
            exhausted: false,
            seen_document_element: false,
            failure: None,
        }
    }

    pub(crate) fn top(&self) -> Option<&OpenNode> {
        self.open.last()
    }

    /// Close the innermost open node, dropping its declarations from scope.
    fn pop_open(&mut self) -> Option<OpenNode> {
        let open = self.open.pop()?;
        self.bindings.truncate(open.bindings_mark);
        Some(open)
    }

    /// Resolve a prefix against `own` declarations, then those of the open elements.
    ///
    /// Only declarations are searched, so the cost does not grow with nesting depth.
    fn lookup<'a>(&'a self, own: &'a [NamespaceDecl], prefix: Option<&str>) -> Option<&'a str> {
        match prefix {
            Some("xml") => return Some(XML_NS),
            Some("xmlns") => return Some(XMLNS_NS),
            _ => {}
        }
        own.iter()
            .chain(self.bindings.iter().rev())
            .find(|d| d.prefix.as_deref() == prefix)
            .map(|d| d.uri.as_str())
    }

    fn resolve(
        &self,
        own: &[NamespaceDecl],
        prefix: Option<&str>,
        use_default: bool,
        raw_name: &str,
    ) -> Result<String, OmError> {
        match prefix {
            Some(p) => self
                .lookup(own, Some(p))
                .filter(|uri| !uri.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    OmError::MalformedInput(format!("unbound namespace prefix '{}' in '{}'", p, raw_name))
                }),
            None if use_default => Ok(self.lookup(own, None).unwrap_or_default().to_string()),
            None => Ok(String::new()),
        }
    }
}

impl Document {
    /// Pull exactly one event from the token source and apply it to the tree.
    ///
    /// Returns [`Step::EndOfStream`] once the source is exhausted, and for
    /// programmatically built documents. After [`discard`](Self::discard)
    /// every call fails with `IncompleteDocument`.
    pub fn next(&mut self) -> Result<Step, OmError> {
        let Some(event) = self.pull_raw()? else {
            return Ok(Step::EndOfStream);
        };
        let result = self.apply(event);
        if let Err(ref e) = result {
            if let Some(builder) = self.builder.as_mut() {
                builder.failure = Some(e.to_string());
            }
        }
        result
    }

    /// Drive [`next`](Self::next) until `target` is complete.
    pub fn build_next(&mut self, target: NodeId) -> Result<(), OmError> {
        loop {
            let node = self.node(target);
            if node.is_complete() {
                return Ok(());
            }
            if node.consumed || node.closed {
                return Err(self.consumed_error(target));
            }
            if self.next()?.is_end_of_stream() && !self.node(target).closed {
                return Err(OmError::IncompleteDocument(format!(
                    "stream ended before {} was complete",
                    self.describe(target)
                )));
            }
        }
    }

    /// Build the whole document.
    pub fn build_all(&mut self) -> Result<(), OmError> {
        self.build_next(self.root())
    }

    /// Release the token source. Nodes that are not complete stay that way.
    pub fn discard(&mut self) {
        if let Some(builder) = self.builder.take() {
            debug!(
                open_elements = builder.open.len().saturating_sub(1),
                events_consumed = self.events_consumed,
                "discarding incremental builder"
            );
            self.discarded = true;
        }
    }

    /// Number of events pulled from the token source so far.
    pub fn events_consumed(&self) -> u64 {
        self.events_consumed
    }

    /// True once the token source has reported its end (or was never attached).
    pub fn is_exhausted(&self) -> bool {
        match &self.builder {
            Some(builder) => builder.exhausted,
            None => !self.discarded,
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Pull one raw event, counting it. `Ok(None)` at end of stream.
    pub(crate) fn pull_raw(&mut self) -> Result<Option<XmlEvent>, OmError> {
        let discarded = self.discarded;
        let Some(builder) = self.builder.as_mut() else {
            if discarded {
                return Err(OmError::IncompleteDocument(
                    "the builder was discarded before the document was complete".to_string(),
                ));
            }
            return Ok(None);
        };
        if let Some(ref failure) = builder.failure {
            return Err(OmError::MalformedInput(format!(
                "builder stopped after an earlier error: {}",
                failure
            )));
        }
        if builder.exhausted {
            return Ok(None);
        }
        let source = builder.source.get_mut().unwrap_or_else(PoisonError::into_inner);
        let event = match source.next_event() {
            Ok(event) => event,
            Err(e) => {
                builder.failure = Some(e.to_string());
                return Err(e);
            }
        };
        match event {
            Some(event) => {
                self.events_consumed += 1;
                trace!(event = ?event, consumed = self.events_consumed, "builder pulled event");
                Ok(Some(event))
            }
            None => {
                builder.exhausted = true;
                self.finish_document();
                Ok(None)
            }
        }
    }

    /// Raw name of `id` if it is the innermost node the builder has open.
    pub(crate) fn open_raw_name(&self, id: NodeId) -> Option<String> {
        self.builder
            .as_ref()
            .and_then(Builder::top)
            .filter(|open| open.id == id)
            .map(|open| open.raw_name.clone())
    }

    /// Pop `id` off the open stack without building the rest of it.
    ///
    /// Its remainder was written elsewhere, so the node is closed and
    /// consumed but keeps whatever build state it had reached.
    pub(crate) fn unwind_consumed(&mut self, id: NodeId) {
        if let Some(builder) = self.builder.as_mut() {
            if builder.top().is_some_and(|open| open.id == id) {
                builder.pop_open();
            }
        }
        let node = self.node_mut(id);
        node.closed = true;
        node.consumed = true;
    }

    /// Stop the builder for good; every later pull reports `reason`.
    pub(crate) fn halt_builder(&mut self, reason: &OmError) {
        if let Some(builder) = self.builder.as_mut() {
            builder.failure.get_or_insert_with(|| reason.to_string());
        }
    }

    /// Called once when the source runs dry.
    fn finish_document(&mut self) {
        let Some(builder) = self.builder.as_ref() else {
            return;
        };
        let legitimate = builder.open.len() == 1 && builder.seen_document_element;
        if !legitimate {
            debug!(
                open_elements = builder.open.len().saturating_sub(1),
                "token source ended inside the document"
            );
            return;
        }
        let root = self.root();
        if let Some(builder) = self.builder.as_mut() {
            builder.open.clear();
            builder.bindings.clear();
        }
        self.close_node(root);
    }

    fn apply(&mut self, event: XmlEvent) -> Result<Step, OmError> {
        let parent = self
            .builder
            .as_ref()
            .and_then(Builder::top)
            .map(|open| open.id)
            .ok_or_else(|| {
                OmError::MalformedInput("content after the end of the document".to_string())
            })?;
        let at_document_level = parent == self.root();

        match event {
            XmlEvent::StartElement { name, attributes } => {
                self.start_element(parent, at_document_level, name, attributes)
            }
            XmlEvent::EndElement { name } => self.end_element(name),
            XmlEvent::Text(text) => {
                if at_document_level {
                    if text.trim().is_empty() {
                        return Ok(Step::Skipped);
                    }
                    return Err(OmError::MalformedInput(format!(
                        "text outside the document element: {:?}",
                        text
                    )));
                }
                self.append_leaf(parent, NodeKind::Text(text))
            }
            XmlEvent::CData(text) => {
                if at_document_level {
                    return Err(OmError::MalformedInput(
                        "CDATA section outside the document element".to_string(),
                    ));
                }
                self.append_leaf(parent, NodeKind::CData(text))
            }
            XmlEvent::Comment(text) => self.append_leaf(parent, NodeKind::Comment(text)),
            XmlEvent::ProcessingInstruction { target, data } => {
                self.append_leaf(parent, NodeKind::ProcessingInstruction { target, data })
            }
        }
    }

    fn append_leaf(&mut self, parent: NodeId, kind: NodeKind) -> Result<Step, OmError> {
        let id = self.alloc(kind, BuildState::Complete)?;
        self.link_append(parent, id);
        self.mark_progress(parent);
        Ok(Step::Appended(id))
    }

    fn start_element(
        &mut self,
        parent: NodeId,
        at_document_level: bool,
        raw_name: String,
        raw_attributes: Vec<(String, String)>,
    ) -> Result<Step, OmError> {
        if at_document_level {
            let builder = self.builder_mut()?;
            if builder.seen_document_element {
                return Err(OmError::MalformedInput(format!(
                    "second document element <{}>",
                    raw_name
                )));
            }
            builder.seen_document_element = true;
        }

        let (prefix, local) = split_qname(&raw_name)?;
        let mut namespaces: Vec<NamespaceDecl> = Vec::new();
        let mut pending_attributes = Vec::new();
        for (key, value) in raw_attributes {
            let declared = match key.as_str() {
                "xmlns" => Some(None),
                other => other.strip_prefix("xmlns:").map(Some),
            };
            match declared {
                Some(declared_prefix) => {
                    let decl = namespace_decl(declared_prefix, value)?;
                    if namespaces.iter().any(|d| d.prefix == decl.prefix) {
                        return Err(OmError::MalformedInput(format!(
                            "duplicate namespace declaration '{}' on <{}>",
                            key, raw_name
                        )));
                    }
                    namespaces.push(decl);
                }
                None => pending_attributes.push((key, value)),
            }
        }

        let builder = self.builder_mut()?;
        let element_uri = builder.resolve(&namespaces, prefix, true, &raw_name)?;
        let mut attributes: Vec<Attribute> = Vec::with_capacity(pending_attributes.len());
        for (key, value) in pending_attributes {
            let (attr_prefix, attr_local) = split_qname(&key)?;
            let uri = match attr_prefix {
                Some(_) => builder.resolve(&namespaces, attr_prefix, false, &key)?,
                None => String::new(),
            };
            if attributes.iter().any(|a| a.name.matches(&uri, attr_local)) {
                return Err(OmError::MalformedInput(format!(
                    "duplicate attribute '{}' on <{}>",
                    key, raw_name
                )));
            }
            attributes.push(Attribute {
                name: QName {
                    namespace_uri: uri,
                    local_name: attr_local.to_string(),
                    prefix: attr_prefix.map(str::to_string),
                },
                value,
            });
        }
        let bindings_mark = builder.bindings.len();
        builder.bindings.extend(namespaces.iter().cloned());

        let name = QName {
            namespace_uri: element_uri,
            local_name: local.to_string(),
            prefix: prefix.map(str::to_string),
        };
        let id = self.alloc(
            NodeKind::Element {
                name,
                attributes,
                namespaces,
            },
            BuildState::Unbuilt,
        )?;
        self.link_append(parent, id);
        self.mark_progress(parent);

        self.builder_mut()?.open.push(OpenNode {
            id,
            raw_name,
            bindings_mark,
        });
        trace!(node = %id, "builder opened element");
        Ok(Step::Started(id))
    }

    fn end_element(&mut self, raw_name: String) -> Result<Step, OmError> {
        let builder = self.builder_mut()?;
        if builder.open.len() <= 1 {
            return Err(OmError::MalformedInput(format!(
                "end tag </{}> without a matching start tag",
                raw_name
            )));
        }
        let expected = builder.open.last().map(|o| o.raw_name.as_str()).unwrap_or_default();
        if expected != raw_name {
            return Err(OmError::MalformedInput(format!(
                "end tag </{}> does not match start tag <{}>",
                raw_name, expected
            )));
        }
        let Some(open) = builder.pop_open() else {
            return Err(OmError::MalformedInput(format!(
                "end tag </{}> without a matching start tag",
                raw_name
            )));
        };
        self.close_node(open.id);
        trace!(node = %open.id, "builder closed element");
        Ok(Step::Closed(open.id))
    }

    /// Mark a node's end as read; it is complete unless a child was torn.
    pub(crate) fn close_node(&mut self, id: NodeId) {
        let all_children_complete = self
            .cached_children(id)
            .into_iter()
            .all(|child| self.is_complete(child));
        let node = self.node_mut(id);
        node.closed = true;
        if all_children_complete {
            node.build_state = BuildState::Complete;
        } else if node.build_state == BuildState::Unbuilt {
            node.build_state = BuildState::PartiallyBuilt;
        }
    }

    fn mark_progress(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        if node.build_state == BuildState::Unbuilt {
            node.build_state = BuildState::PartiallyBuilt;
        }
    }

    fn builder_mut(&mut self) -> Result<&mut Builder, OmError> {
        self.builder.as_mut().ok_or_else(|| {
            OmError::IncompleteDocument("the builder was discarded".to_string())
        })
    }
}

/// Split `prefix:local`; at most one colon, neither side empty.
pub(crate) fn split_qname(raw: &str) -> Result<(Option<&str>, &str), OmError> {
    let invalid = || OmError::MalformedInput(format!("invalid qualified name '{}'", raw));
    match raw.split_once(':') {
        None if !raw.is_empty() => Ok((None, raw)),
        None => Err(invalid()),
        Some((prefix, local)) => {
            if prefix.is_empty() || local.is_empty() || local.contains(':') {
                return Err(invalid());
            }
            Ok((Some(prefix), local))
        }
    }
}

fn namespace_decl(prefix: Option<&str>, uri: String) -> Result<NamespaceDecl, OmError> {
    match prefix {
        Some("xmlns") => Err(OmError::MalformedInput(
            "the 'xmlns' prefix cannot be declared".to_string(),
        )),
        Some("xml") if uri != XML_NS => Err(OmError::MalformedInput(
            "the 'xml' prefix cannot be rebound".to_string(),
        )),
        Some(p) if uri.is_empty() => Err(OmError::MalformedInput(format!(
            "prefix '{}' cannot be bound to an empty namespace",
            p
        ))),
        _ if uri == XMLNS_NS => Err(OmError::MalformedInput(
            "the xmlns namespace cannot be declared".to_string(),
        )),
        _ => Ok(NamespaceDecl {
            prefix: prefix.map(str::to_string),
            uri,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSource(VecDeque<XmlEvent>);

    impl TokenSource for ScriptedSource {
        fn next_event(&mut self) -> Result<Option<XmlEvent>, OmError> {
            Ok(self.0.pop_front())
        }
    }

    fn scripted(events: Vec<XmlEvent>) -> Document {
        Document::from_source(Box::new(ScriptedSource(events.into())))
    }

    #[test]
    fn test_next_applies_one_event_at_a_time() {
        let mut doc = scripted(vec![
            XmlEvent::start("r"),
            XmlEvent::text("hi"),
            XmlEvent::end("r"),
        ]);
        let Step::Started(r) = doc.next().unwrap() else {
            panic!("expected a start step");
        };
        assert_eq!(doc.build_state(doc.root()), BuildState::PartiallyBuilt);
        assert_eq!(doc.build_state(r), BuildState::Unbuilt);

        assert!(matches!(doc.next().unwrap(), Step::Appended(_)));
        assert_eq!(doc.build_state(r), BuildState::PartiallyBuilt);

        assert_eq!(doc.next().unwrap(), Step::Closed(r));
        assert_eq!(doc.build_state(r), BuildState::Complete);
        assert_eq!(doc.build_state(doc.root()), BuildState::PartiallyBuilt);

        assert_eq!(doc.next().unwrap(), Step::EndOfStream);
        assert_eq!(doc.build_state(doc.root()), BuildState::Complete);
        assert!(doc.is_exhausted());
        assert_eq!(doc.events_consumed(), 3);
    }

    #[test]
    fn test_end_tag_without_start_is_malformed() {
        let mut doc = scripted(vec![XmlEvent::end("r")]);
        assert!(matches!(doc.next(), Err(OmError::MalformedInput(_))));
        // the failure sticks
        assert!(matches!(doc.next(), Err(OmError::MalformedInput(_))));
    }

    #[test]
    fn test_mismatched_end_tag_is_malformed() {
        let mut doc = scripted(vec![XmlEvent::start("a"), XmlEvent::end("b")]);
        doc.next().unwrap();
        let err = doc.next().unwrap_err();
        assert!(matches!(err, OmError::MalformedInput(ref m) if m.contains("does not match")));
    }

    #[test]
    fn test_second_document_element_is_malformed() {
        let mut doc = scripted(vec![
            XmlEvent::start("a"),
            XmlEvent::end("a"),
            XmlEvent::start("b"),
        ]);
        assert!(matches!(doc.build_all(), Err(OmError::MalformedInput(_))));
    }

    #[test]
    fn test_unbound_prefix_is_malformed() {
        let mut doc = Document::parse_str("<p:r/>");
        let err = doc.build_all().unwrap_err();
        assert!(matches!(err, OmError::MalformedInput(ref m) if m.contains("unbound")));
    }

    #[test]
    fn test_text_outside_root_is_malformed_whitespace_skipped() {
        let mut doc = scripted(vec![XmlEvent::text("\n  "), XmlEvent::start("r")]);
        assert_eq!(doc.next().unwrap(), Step::Skipped);

        let mut doc = scripted(vec![XmlEvent::text("junk")]);
        assert!(matches!(doc.next(), Err(OmError::MalformedInput(_))));
    }

    #[test]
    fn test_build_next_stops_at_target() {
        let mut doc = scripted(vec![
            XmlEvent::start("r"),
            XmlEvent::start("a"),
            XmlEvent::text("1"),
            XmlEvent::end("a"),
            XmlEvent::start("b"),
            XmlEvent::end("b"),
            XmlEvent::end("r"),
        ]);
        let r = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(r).unwrap().unwrap();
        doc.build_next(a).unwrap();
        assert!(doc.is_complete(a));
        assert_eq!(doc.build_state(r), BuildState::PartiallyBuilt);
        assert_eq!(doc.events_consumed(), 4);
    }

    #[test]
    fn test_truncated_stream_is_incomplete() {
        let mut doc = scripted(vec![XmlEvent::start("r"), XmlEvent::start("a")]);
        let r = doc.document_element().unwrap().unwrap();
        assert!(matches!(doc.build_next(r), Err(OmError::IncompleteDocument(_))));
        assert!(matches!(doc.build_all(), Err(OmError::IncompleteDocument(_))));
    }

    #[test]
    fn test_empty_stream_is_incomplete_document() {
        let mut doc = scripted(vec![]);
        assert!(matches!(doc.build_all(), Err(OmError::IncompleteDocument(_))));
    }

    #[test]
    fn test_discard_leaves_torn_tree() {
        let mut doc = Document::parse_str("<r><a>1</a><b>2</b></r>");
        let r = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(r).unwrap().unwrap();
        doc.discard();

        assert!(doc.is_discarded());
        assert_eq!(doc.build_state(r), BuildState::PartiallyBuilt);
        assert_eq!(doc.build_state(a), BuildState::Unbuilt);
        assert!(matches!(doc.next(), Err(OmError::IncompleteDocument(_))));
        assert!(matches!(doc.build_next(a), Err(OmError::IncompleteDocument(_))));
        assert_eq!(doc.build_state(r), BuildState::PartiallyBuilt);
    }

    #[test]
    fn test_namespace_declaration_rules() {
        let mut doc = Document::parse_str(r#"<r xmlns:p=""/>"#);
        assert!(matches!(doc.build_all(), Err(OmError::MalformedInput(_))));

        let mut doc = Document::parse_str(r#"<r xmlns:p="urn:1" xmlns:p="urn:2"/>"#);
        assert!(doc.build_all().is_err());

        let mut doc = Document::parse_str(r#"<r xmlns="urn:d"><c xmlns=""/></r>"#);
        doc.build_all().unwrap();
        let r = doc.document_element().unwrap().unwrap();
        let c = doc.first_child_element(r).unwrap().unwrap();
        assert_eq!(doc.element_name(r).unwrap().namespace_uri, "urn:d");
        assert!(doc.element_name(c).unwrap().has_no_namespace());
    }

    #[test]
    fn test_unprefixed_attributes_have_no_namespace() {
        let mut doc = Document::parse_str(r#"<r xmlns="urn:d" xmlns:p="urn:p" id="1" p:flag="y"/>"#);
        let r = doc.document_element().unwrap().unwrap();
        assert_eq!(doc.attribute(r, "", "id"), Some("1"));
        assert_eq!(doc.attribute(r, "urn:p", "flag"), Some("y"));
        assert_eq!(doc.attributes(r).len(), 2);
    }

    #[test]
    fn test_split_qname() {
        assert_eq!(split_qname("a:b").unwrap(), (Some("a"), "b"));
        assert_eq!(split_qname("b").unwrap(), (None, "b"));
        assert!(split_qname(":b").is_err());
        assert!(split_qname("a:").is_err());
        assert!(split_qname("a:b:c").is_err());
    }
}
