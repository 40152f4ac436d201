//! XML serializer.
//!
//! Two strategies, chosen per call:
//!
//! - [`SerializeMode::Cached`] completes the node through the builder if
//!   needed, then walks the in-memory tree. Repeatable and byte-identical.
//! - [`SerializeMode::StreamThrough`] writes whatever is already in memory
//!   and copies the rest of the node straight from the token source without
//!   building it. The copied region is consumed: asking for it again, in
//!   either mode, fails with `AlreadyConsumed`.
//!
//! Output keeps every namespace URI bound to the same scope as in the tree.
//! Prefixes are kept where possible; missing declarations are added on the
//! element that needs them.

use crate::document::Document;
use crate::error::OmError;
use crate::node::{NamespaceDecl, NodeId, NodeKind, QName, XML_NS};
use crate::token::XmlEvent;
use quick_xml::escape::{escape, partial_escape};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::Write;
use tracing::debug;

const XML_DECLARATION: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Serialization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerializeMode {
    /// Walk the fully built tree
    #[default]
    #[serde(rename = "cached")]
    Cached,
    /// Copy the unbuilt remainder from the token source
    #[serde(rename = "stream")]
    StreamThrough,
}

impl SerializeMode {
    /// Parse a configuration label (`cached` or `stream`).
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "cached" => Some(Self::Cached),
            "stream" | "stream-through" => Some(Self::StreamThrough),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::StreamThrough => "stream",
        }
    }
}

/// Serializer options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializeOptions {
    /// Start the output with an XML declaration
    pub xml_declaration: bool,
}

/// Writes nodes of a [`Document`] as XML text.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    options: SerializeOptions,
}

impl Serializer {
    pub fn new(options: SerializeOptions) -> Self {
        Self { options }
    }

    /// Serialize `id` and its subtree to `sink`.
    ///
    /// A failed call may leave partial output in `sink`.
    pub fn serialize<W: Write>(
        &self,
        doc: &mut Document,
        id: NodeId,
        sink: &mut W,
        mode: SerializeMode,
    ) -> Result<(), OmError> {
        match mode {
            SerializeMode::Cached => doc.build_next(id)?,
            SerializeMode::StreamThrough => {
                let node = doc.node(id);
                if !node.is_complete() && (node.consumed || node.closed) {
                    return Err(doc.consumed_error(id));
                }
            }
        }

        let mut out = Emitter::new(sink);
        if self.options.xml_declaration {
            out.sink.write_all(XML_DECLARATION)?;
        }
        if doc.is_complete(id) {
            out.write_cached(doc, id, true)?;
        } else {
            let before = doc.events_consumed();
            out.write_streamed(doc, id, true)?;
            debug!(
                node = %id,
                events_copied = doc.events_consumed() - before,
                "stream-through serialization finished"
            );
        }
        out.sink.flush()?;
        Ok(())
    }
}

impl Document {
    /// Serialize a node with default options.
    pub fn serialize_to<W: Write>(
        &mut self,
        id: NodeId,
        sink: &mut W,
        mode: SerializeMode,
    ) -> Result<(), OmError> {
        Serializer::default().serialize(self, id, sink, mode)
    }

    /// Serialize a node in cached mode to a string.
    pub fn to_xml_string(&mut self, id: NodeId) -> Result<String, OmError> {
        let mut buf = Vec::new();
        self.serialize_to(id, &mut buf, SerializeMode::Cached)?;
        String::from_utf8(buf).map_err(|e| OmError::MalformedInput(e.to_string()))
    }
}

/// Pending step of an iterative tree walk.
enum Visit {
    Enter(NodeId, bool),
    Close(String),
}

/// Per-call output state: the sink plus the namespace bindings written so far.
struct Emitter<'w, W: Write> {
    sink: &'w mut W,
    bindings: Vec<NamespaceDecl>,
    frames: Vec<usize>,
    generated: usize,
}

impl<'w, W: Write> Emitter<'w, W> {
    fn new(sink: &'w mut W) -> Self {
        Self {
            sink,
            bindings: Vec::new(),
            frames: Vec::new(),
            generated: 0,
        }
    }

    /// Write a complete subtree; `top` marks the node the caller asked for.
    fn write_cached(&mut self, doc: &Document, id: NodeId, top: bool) -> Result<(), OmError> {
        let mut work = vec![Visit::Enter(id, top)];
        while let Some(visit) = work.pop() {
            let (id, top) = match visit {
                Visit::Enter(id, top) => (id, top),
                Visit::Close(qname) => {
                    self.close_element(&qname)?;
                    continue;
                }
            };
            match doc.kind(id) {
                NodeKind::Document => {
                    work.extend(doc.cached_children(id).into_iter().rev().map(|c| Visit::Enter(c, false)));
                }
                NodeKind::Element { .. } => {
                    let inherited = if top { inherited_bindings(doc, id) } else { Vec::new() };
                    let children = doc.cached_children(id);
                    let qname = self.open_element(doc, id, inherited, children.is_empty())?;
                    if !children.is_empty() {
                        work.push(Visit::Close(qname));
                        work.extend(children.into_iter().rev().map(|c| Visit::Enter(c, false)));
                    }
                }
                NodeKind::Text(text) => self.write_text(text)?,
                NodeKind::CData(text) => self.write_cdata(text)?,
                NodeKind::Comment(text) => self.write_comment(text)?,
                NodeKind::ProcessingInstruction { target, data } => {
                    self.write_pi(target, data.as_deref())?
                }
            }
        }
        Ok(())
    }

    /// Write a node the builder still has open.
    ///
    /// The open nodes form a single chain down from `id`: only the last
    /// child of an open node can still be open itself. The walk writes the
    /// cached part of each node on the way down, then copies the streamed
    /// remainder of each on the way back up, innermost first.
    fn write_streamed(&mut self, doc: &mut Document, id: NodeId, top: bool) -> Result<(), OmError> {
        let mut chain: Vec<(NodeId, Option<String>)> = Vec::new();
        let mut current = Some((id, top));
        while let Some((node_id, top)) = current.take() {
            let qname = match doc.kind(node_id) {
                NodeKind::Element { .. } => {
                    let inherited = if top { inherited_bindings(doc, node_id) } else { Vec::new() };
                    Some(self.open_element(doc, node_id, inherited, false)?)
                }
                _ => None,
            };
            for child in doc.cached_children(node_id) {
                let node = doc.node(child);
                if node.is_complete() {
                    self.write_cached(doc, child, false)?;
                } else if node.consumed || node.closed {
                    return Err(doc.consumed_error(child));
                } else {
                    current = Some((child, false));
                    break;
                }
            }
            chain.push((node_id, qname));
        }

        while let Some((node_id, qname)) = chain.pop() {
            if let Err(e) = self.copy_remainder(doc, node_id) {
                doc.halt_builder(&e);
                doc.unwind_consumed(node_id);
                return Err(e);
            }
            doc.unwind_consumed(node_id);
            if let Some(qname) = qname {
                self.close_element(&qname)?;
            }
        }
        Ok(())
    }

    /// Copy raw events up to the end of `id`, which must be the builder's innermost open node.
    fn copy_remainder(&mut self, doc: &mut Document, id: NodeId) -> Result<(), OmError> {
        let raw_name = doc.open_raw_name(id).ok_or_else(|| {
            OmError::IncompleteDocument(format!(
                "the builder can no longer supply the rest of {}",
                doc.describe(id)
            ))
        })?;
        let is_document = id == doc.root();
        let mut open: Vec<String> = Vec::new();

        loop {
            let Some(event) = doc.pull_raw()? else {
                if is_document && open.is_empty() {
                    return Ok(());
                }
                return Err(OmError::IncompleteDocument(format!(
                    "stream ended inside {}",
                    doc.describe(id)
                )));
            };
            match event {
                XmlEvent::StartElement { name, attributes } => {
                    write!(self.sink, "<{}", name)?;
                    for (key, value) in &attributes {
                        write!(self.sink, " {}=\"{}\"", key, escape_attribute(value))?;
                    }
                    self.sink.write_all(b">")?;
                    open.push(name);
                }
                XmlEvent::EndElement { name } => match open.pop() {
                    Some(expected) if expected == name => write!(self.sink, "</{}>", name)?,
                    None if !is_document && name == raw_name => return Ok(()),
                    expected => {
                        return Err(OmError::MalformedInput(format!(
                            "end tag </{}> does not match <{}>",
                            name,
                            expected.as_deref().unwrap_or(&raw_name)
                        )));
                    }
                },
                XmlEvent::Text(text) => self.write_text(&text)?,
                XmlEvent::CData(text) => self.write_cdata(&text)?,
                XmlEvent::Comment(text) => self.write_comment(&text)?,
                XmlEvent::ProcessingInstruction { target, data } => {
                    self.write_pi(&target, data.as_deref())?
                }
            }
        }
    }

    /// Write a start tag and return the qualified name used, for the end tag.
    fn open_element(
        &mut self,
        doc: &Document,
        id: NodeId,
        inherited: Vec<NamespaceDecl>,
        self_closing: bool,
    ) -> Result<String, OmError> {
        let NodeKind::Element {
            name,
            attributes,
            namespaces,
        } = doc.kind(id)
        else {
            return Err(OmError::UnsupportedNode(format!(
                "{} is not an element",
                doc.describe(id)
            )));
        };

        self.frames.push(self.bindings.len());
        let mut declared: Vec<NamespaceDecl> = Vec::new();
        for decl in namespaces.iter().chain(inherited.iter()) {
            if !declared.iter().any(|d| d.prefix == decl.prefix) {
                self.declare(&mut declared, decl.prefix.clone(), decl.uri.clone());
            }
        }

        let element_prefix = self.element_prefix(doc, id, name, &mut declared)?;
        let mut written_attributes = Vec::with_capacity(attributes.len());
        for attr in attributes {
            let prefix = self.attribute_prefix(&attr.name, &mut declared);
            written_attributes.push((qualify(prefix.as_deref(), &attr.name.local_name), &attr.value));
        }

        let qname = qualify(element_prefix.as_deref(), &name.local_name);
        write!(self.sink, "<{}", qname)?;
        for decl in &declared {
            match &decl.prefix {
                Some(prefix) => write!(self.sink, " xmlns:{}=\"{}\"", prefix, escape_attribute(&decl.uri))?,
                None => write!(self.sink, " xmlns=\"{}\"", escape_attribute(&decl.uri))?,
            }
        }
        for (key, value) in written_attributes {
            write!(self.sink, " {}=\"{}\"", key, escape_attribute(value))?;
        }
        if self_closing {
            self.sink.write_all(b"/>")?;
            self.pop_frame();
        } else {
            self.sink.write_all(b">")?;
        }
        Ok(qname)
    }

    fn close_element(&mut self, qname: &str) -> Result<(), OmError> {
        write!(self.sink, "</{}>", qname)?;
        self.pop_frame();
        Ok(())
    }

    fn pop_frame(&mut self) {
        if let Some(mark) = self.frames.pop() {
            self.bindings.truncate(mark);
        }
    }

    fn element_prefix(
        &mut self,
        doc: &Document,
        id: NodeId,
        name: &QName,
        declared: &mut Vec<NamespaceDecl>,
    ) -> Result<Option<String>, OmError> {
        let uri = name.namespace_uri.as_str();
        if uri.is_empty() {
            if self.bound(None).is_some_and(|u| !u.is_empty()) {
                if declared.iter().any(|d| d.prefix.is_none()) {
                    return Err(OmError::UnsupportedNode(format!(
                        "{} has no namespace but declares a default namespace",
                        doc.describe(id)
                    )));
                }
                self.declare(declared, None, String::new());
            }
            return Ok(None);
        }

        let preferred = name.prefix.as_deref().filter(|p| *p != "xmlns");
        if self.bound(preferred) == Some(uri) {
            return Ok(preferred.map(str::to_string));
        }
        if !declared.iter().any(|d| d.prefix.as_deref() == preferred) && preferred != Some("xml") {
            self.declare(declared, preferred.map(str::to_string), uri.to_string());
            return Ok(preferred.map(str::to_string));
        }
        if let Some(prefix) = self.prefix_for(uri) {
            return Ok(Some(prefix));
        }
        Ok(Some(self.generate_prefix(declared, uri)))
    }

    fn attribute_prefix(&mut self, name: &QName, declared: &mut Vec<NamespaceDecl>) -> Option<String> {
        let uri = name.namespace_uri.as_str();
        if uri.is_empty() {
            return None;
        }
        if uri == XML_NS {
            return Some("xml".to_string());
        }
        if let Some(prefix) = name.prefix.as_deref().filter(|p| *p != "xmlns" && *p != "xml") {
            if self.bound(Some(prefix)) == Some(uri) {
                return Some(prefix.to_string());
            }
            if !declared.iter().any(|d| d.prefix.as_deref() == Some(prefix)) {
                self.declare(declared, Some(prefix.to_string()), uri.to_string());
                return Some(prefix.to_string());
            }
        }
        if let Some(prefix) = self.prefix_for(uri) {
            return Some(prefix);
        }
        Some(self.generate_prefix(declared, uri))
    }

    fn generate_prefix(&mut self, declared: &mut Vec<NamespaceDecl>, uri: &str) -> String {
        loop {
            self.generated += 1;
            let candidate = format!("ns{}", self.generated);
            if self.bound(Some(candidate.as_str())).is_none() {
                self.declare(declared, Some(candidate.clone()), uri.to_string());
                return candidate;
            }
        }
    }

    fn declare(&mut self, declared: &mut Vec<NamespaceDecl>, prefix: Option<String>, uri: String) {
        let decl = NamespaceDecl { prefix, uri };
        self.bindings.push(decl.clone());
        declared.push(decl);
    }

    /// URI a prefix is bound to in the output written so far.
    fn bound(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NS);
        }
        self.bindings
            .iter()
            .rev()
            .find(|d| d.prefix.as_deref() == prefix)
            .map(|d| d.uri.as_str())
    }

    /// A non-default prefix currently bound to `uri`, if any.
    fn prefix_for(&self, uri: &str) -> Option<String> {
        self.bindings
            .iter()
            .rev()
            .filter_map(|d| d.prefix.as_deref())
            .find(|p| self.bound(Some(*p)) == Some(uri))
            .map(str::to_string)
    }

    fn write_text(&mut self, text: &str) -> Result<(), OmError> {
        self.sink.write_all(partial_escape(text).as_bytes())?;
        Ok(())
    }

    fn write_cdata(&mut self, text: &str) -> Result<(), OmError> {
        if text.contains("]]>") {
            return Err(OmError::UnsupportedNode(
                "CDATA section containing ']]>'".to_string(),
            ));
        }
        write!(self.sink, "<![CDATA[{}]]>", text)?;
        Ok(())
    }

    fn write_comment(&mut self, text: &str) -> Result<(), OmError> {
        if text.contains("--") || text.ends_with('-') {
            return Err(OmError::UnsupportedNode(format!(
                "comment cannot be written as XML: {:?}",
                text
            )));
        }
        write!(self.sink, "<!--{}-->", text)?;
        Ok(())
    }

    fn write_pi(&mut self, target: &str, data: Option<&str>) -> Result<(), OmError> {
        if target.is_empty() || target.eq_ignore_ascii_case("xml") {
            return Err(OmError::UnsupportedNode(format!(
                "invalid processing instruction target {:?}",
                target
            )));
        }
        match data {
            Some(data) if data.contains("?>") => Err(OmError::UnsupportedNode(
                "processing instruction data containing '?>'".to_string(),
            )),
            Some(data) => {
                write!(self.sink, "<?{} {}?>", target, data)?;
                Ok(())
            }
            None => {
                write!(self.sink, "<?{}?>", target)?;
                Ok(())
            }
        }
    }
}

/// Ancestor bindings a detached rendering of `id` needs to stay resolvable.
fn inherited_bindings(doc: &Document, id: NodeId) -> Vec<NamespaceDecl> {
    match doc.parent(id) {
        Some(parent) => doc
            .in_scope_namespaces(parent)
            .into_iter()
            .filter(|d| d.prefix.is_some() || !d.uri.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

/// Escape an attribute value. Tabs and line breaks become character
/// references; a parser would otherwise normalize them to spaces.
fn escape_attribute(value: &str) -> Cow<'_, str> {
    let escaped = escape(value);
    if !escaped.contains(&['\t', '\n', '\r'][..]) {
        return escaped;
    }
    let mut out = String::with_capacity(escaped.len() + 8);
    for c in escaped.chars() {
        match c {
            '\t' => out.push_str("&#9;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn qualify(prefix: Option<&str>, local_name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}:{}", prefix, local_name),
        None => local_name.to_string(),
    }
}
