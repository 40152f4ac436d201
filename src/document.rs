//! Arena-backed, lazily built XML document.
//!
//! All nodes live in a `Vec<NodeData>` owned by the [`Document`] and are
//! addressed by [`NodeId`]. A document parsed from a [`TokenSource`] starts out
//! almost empty; navigation methods that take `&mut self` pull just enough
//! events through the incremental builder (see [`crate::builder`]) to answer
//! the question asked, never more. The `cached_*` accessors only look at what
//! is already in memory.

use crate::builder::Builder;
use crate::error::OmError;
use crate::node::{
    Attribute, BuildState, NamespaceDecl, NodeData, NodeId, NodeKind, QName, XMLNS_NS, XML_NS,
};
use crate::token::{QuickXmlSource, SourceOptions, TokenSource};
use std::io::BufRead;

/// An XML document, possibly only partially built.
pub struct Document {
    /// Index 0 is an unused placeholder so ids can be `NonZeroU32`.
    nodes: Vec<NodeData>,
    root: NodeId,
    pub(crate) builder: Option<Builder>,
    pub(crate) discarded: bool,
    pub(crate) events_consumed: u64,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.node_count())
            .field("root_state", &self.build_state(self.root))
            .field("events_consumed", &self.events_consumed)
            .field("discarded", &self.discarded)
            .finish()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    fn with_root_state(state: BuildState) -> Self {
        let placeholder = NodeData::new(NodeKind::Document, BuildState::Complete);
        let mut root = NodeData::new(NodeKind::Document, state);
        root.closed = state == BuildState::Complete;
        Self {
            nodes: vec![placeholder, root],
            root: NodeId::DOCUMENT,
            builder: None,
            discarded: false,
            events_consumed: 0,
        }
    }

    /// An empty, programmatically built document.
    pub fn new() -> Self {
        Self::with_root_state(BuildState::Complete)
    }

    /// A document built lazily from a token source.
    pub fn from_source(source: Box<dyn TokenSource>) -> Self {
        let mut doc = Self::with_root_state(BuildState::Unbuilt);
        doc.builder = Some(Builder::new(source));
        doc
    }

    /// Lazily parse a string.
    pub fn parse_str(xml: &str) -> Self {
        Self::parse_bytes(xml.as_bytes().to_vec(), SourceOptions::default())
    }

    /// Lazily parse an owned byte buffer.
    pub fn parse_bytes(data: Vec<u8>, options: SourceOptions) -> Self {
        Self::from_source(Box::new(QuickXmlSource::from_bytes(data, options)))
    }

    /// Lazily parse from a reader; the reader is consumed as the tree is navigated.
    pub fn parse_reader<R: BufRead + Send + 'static>(input: R, options: SourceOptions) -> Self {
        Self::from_source(Box::new(QuickXmlSource::from_reader(input, options)))
    }

    // --- Arena access ---

    /// The synthetic document node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Node storage.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this document.
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    /// Id of the node at arena position `index`, if this document has one.
    pub fn node_id(&self, index: usize) -> Option<NodeId> {
        NodeId::from_index(index).filter(|id| id.index() < self.nodes.len())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.index()]
    }

    /// Number of nodes ever allocated (detached nodes included).
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    pub(crate) fn alloc(&mut self, kind: NodeKind, state: BuildState) -> Result<NodeId, OmError> {
        let id = NodeId::from_index(self.nodes.len())
            .ok_or_else(|| OmError::UnsupportedNode("document node capacity exceeded".to_string()))?;
        let mut data = NodeData::new(kind, state);
        data.closed = state == BuildState::Complete;
        self.nodes.push(data);
        Ok(id)
    }

    // --- Cached reads (never pull) ---

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn build_state(&self, id: NodeId) -> BuildState {
        self.node(id).build_state
    }

    pub fn is_complete(&self, id: NodeId) -> bool {
        self.node(id).is_complete()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn cached_first_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).first_child
    }

    pub fn cached_next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).next_sibling
    }

    pub fn cached_prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).prev_sibling
    }

    /// Children already in memory, in document order.
    pub fn cached_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children = Vec::new();
        let mut next = self.node(id).first_child;
        while let Some(child) = next {
            children.push(child);
            next = self.node(child).next_sibling;
        }
        children
    }

    /// The node itself followed by its ancestors up to the document node.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            doc: self,
            next: Some(id),
        }
    }

    /// True if `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    pub fn element_name(&self, id: NodeId) -> Option<&QName> {
        self.node(id).element_name()
    }

    pub fn attributes(&self, id: NodeId) -> &[Attribute] {
        match &self.node(id).kind {
            NodeKind::Element { attributes, .. } => attributes,
            _ => &[],
        }
    }

    /// Attribute value by namespace URI (empty for none) and local name.
    pub fn attribute(&self, id: NodeId, namespace_uri: &str, local_name: &str) -> Option<&str> {
        self.attributes(id)
            .iter()
            .find(|a| a.name.matches(namespace_uri, local_name))
            .map(|a| a.value.as_str())
    }

    /// Namespace declarations made on this element.
    pub fn namespace_declarations(&self, id: NodeId) -> &[NamespaceDecl] {
        match &self.node(id).kind {
            NodeKind::Element { namespaces, .. } => namespaces,
            _ => &[],
        }
    }

    /// Character content of a text, CDATA, comment or PI node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Text(t) | NodeKind::CData(t) | NodeKind::Comment(t) => Some(t),
            NodeKind::ProcessingInstruction { data, .. } => data.as_deref(),
            _ => None,
        }
    }

    // --- Namespace resolution ---

    /// Resolve a prefix (`None` for the default namespace) in the scope of `id`.
    ///
    /// Declarations are searched from `id` outwards; the nearest one wins.
    /// An empty result for the default namespace means "no namespace".
    pub fn lookup_namespace(&self, id: NodeId, prefix: Option<&str>) -> Option<&str> {
        match prefix {
            Some("xml") => return Some(XML_NS),
            Some("xmlns") => return Some(XMLNS_NS),
            _ => {}
        }
        for ancestor in self.ancestors(id) {
            if let Some(decl) = self
                .namespace_declarations(ancestor)
                .iter()
                .find(|d| d.prefix.as_deref() == prefix)
            {
                return Some(decl.uri.as_str());
            }
        }
        None
    }

    /// Every binding visible at `id`, outermost first, shadowed bindings removed.
    pub fn in_scope_namespaces(&self, id: NodeId) -> Vec<NamespaceDecl> {
        let mut seen: Vec<NamespaceDecl> = Vec::new();
        for ancestor in self.ancestors(id) {
            for decl in self.namespace_declarations(ancestor) {
                if !seen.iter().any(|s| s.prefix == decl.prefix) {
                    seen.push(decl.clone());
                }
            }
        }
        seen.reverse();
        seen
    }

    // --- Lazy navigation ---

    /// First child, pulling from the stream only until one exists.
    pub fn first_child(&mut self, id: NodeId) -> Result<Option<NodeId>, OmError> {
        loop {
            let node = self.node(id);
            if let Some(child) = node.first_child {
                return Ok(Some(child));
            }
            if node.consumed {
                return Err(self.consumed_error(id));
            }
            if node.closed || !node.kind.is_container() {
                return Ok(None);
            }
            self.pull_for(id)?;
        }
    }

    /// Next sibling, pulling from the stream only until it exists or the parent closes.
    pub fn next_sibling(&mut self, id: NodeId) -> Result<Option<NodeId>, OmError> {
        loop {
            if let Some(sibling) = self.node(id).next_sibling {
                return Ok(Some(sibling));
            }
            let Some(parent) = self.node(id).parent else {
                return Ok(None);
            };
            let parent_node = self.node(parent);
            if parent_node.consumed {
                return Err(self.consumed_error(parent));
            }
            if parent_node.closed {
                return Ok(None);
            }
            self.pull_for(parent)?;
        }
    }

    /// All children; completes the node first.
    pub fn children(&mut self, id: NodeId) -> Result<Vec<NodeId>, OmError> {
        self.build_next(id)?;
        Ok(self.cached_children(id))
    }

    /// First element child, skipping text, comments and PIs.
    pub fn first_child_element(&mut self, id: NodeId) -> Result<Option<NodeId>, OmError> {
        let mut next = self.first_child(id)?;
        while let Some(child) = next {
            if self.element_name(child).is_some() {
                return Ok(Some(child));
            }
            next = self.next_sibling(child)?;
        }
        Ok(None)
    }

    /// Next element sibling, skipping text, comments and PIs.
    pub fn next_sibling_element(&mut self, id: NodeId) -> Result<Option<NodeId>, OmError> {
        let mut next = self.next_sibling(id)?;
        while let Some(sibling) = next {
            if self.element_name(sibling).is_some() {
                return Ok(Some(sibling));
            }
            next = self.next_sibling(sibling)?;
        }
        Ok(None)
    }

    /// All element children; completes the node first.
    pub fn child_elements(&mut self, id: NodeId) -> Result<Vec<NodeId>, OmError> {
        Ok(self
            .children(id)?
            .into_iter()
            .filter(|c| self.element_name(*c).is_some())
            .collect())
    }

    /// The document element, reading no further than its start tag.
    pub fn document_element(&mut self) -> Result<Option<NodeId>, OmError> {
        self.first_child_element(self.root)
    }

    /// First element child with the given name, pulling only as far as needed.
    pub fn find_child(
        &mut self,
        id: NodeId,
        namespace_uri: &str,
        local_name: &str,
    ) -> Result<Option<NodeId>, OmError> {
        let mut next = self.first_child_element(id)?;
        while let Some(child) = next {
            if self
                .element_name(child)
                .is_some_and(|n| n.matches(namespace_uri, local_name))
            {
                return Ok(Some(child));
            }
            next = self.next_sibling_element(child)?;
        }
        Ok(None)
    }

    /// Concatenated text of all descendant text and CDATA nodes; completes the node.
    pub fn text_content(&mut self, id: NodeId) -> Result<String, OmError> {
        self.build_next(id)?;
        let mut out = String::new();
        self.collect_text(id, &mut out);
        Ok(out)
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            match &self.node(id).kind {
                NodeKind::Text(t) | NodeKind::CData(t) => out.push_str(t),
                NodeKind::Document | NodeKind::Element { .. } => {
                    pending.extend(self.cached_children(id).into_iter().rev());
                }
                _ => {}
            }
        }
    }

    /// Pull one event on behalf of `waiting_on`; fails if the stream ends first.
    fn pull_for(&mut self, waiting_on: NodeId) -> Result<(), OmError> {
        if self.node(waiting_on).consumed {
            return Err(self.consumed_error(waiting_on));
        }
        if self.next()?.is_end_of_stream() && !self.node(waiting_on).closed {
            return Err(OmError::IncompleteDocument(format!(
                "stream ended while {} was still open",
                self.describe(waiting_on)
            )));
        }
        Ok(())
    }

    pub(crate) fn consumed_error(&self, id: NodeId) -> OmError {
        OmError::AlreadyConsumed(format!(
            "the unbuilt part of {} was consumed by a stream-through serialization",
            self.describe(id)
        ))
    }

    /// Human-readable label for logs and errors.
    pub fn describe(&self, id: NodeId) -> String {
        match &self.node(id).kind {
            NodeKind::Element { name, .. } => format!("element <{}> {}", name, id),
            other => format!("{} node {}", other.type_name(), id),
        }
    }

    // --- Factory ---

    /// A detached, complete, childless element.
    pub fn create_element(&mut self, name: QName) -> Result<NodeId, OmError> {
        self.alloc(
            NodeKind::Element {
                name,
                attributes: Vec::new(),
                namespaces: Vec::new(),
            },
            BuildState::Complete,
        )
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> Result<NodeId, OmError> {
        self.alloc(NodeKind::Text(text.into()), BuildState::Complete)
    }

    pub fn create_cdata(&mut self, text: impl Into<String>) -> Result<NodeId, OmError> {
        self.alloc(NodeKind::CData(text.into()), BuildState::Complete)
    }

    pub fn create_comment(&mut self, text: impl Into<String>) -> Result<NodeId, OmError> {
        self.alloc(NodeKind::Comment(text.into()), BuildState::Complete)
    }

    pub fn create_processing_instruction(
        &mut self,
        target: impl Into<String>,
        data: Option<String>,
    ) -> Result<NodeId, OmError> {
        self.alloc(
            NodeKind::ProcessingInstruction {
                target: target.into(),
                data,
            },
            BuildState::Complete,
        )
    }

    /// Create an element with a single text child.
    pub fn create_text_element(&mut self, name: QName, text: &str) -> Result<NodeId, OmError> {
        let element = self.create_element(name)?;
        if !text.is_empty() {
            let text = self.create_text(text)?;
            self.link_append(element, text);
        }
        Ok(element)
    }

    /// Declare (or redeclare) a prefix on an element.
    pub fn declare_namespace(
        &mut self,
        id: NodeId,
        prefix: Option<&str>,
        uri: impl Into<String>,
    ) -> Result<(), OmError> {
        let describe = self.describe(id);
        let NodeKind::Element { namespaces, .. } = &mut self.node_mut(id).kind else {
            return Err(OmError::UnsupportedNode(format!(
                "cannot declare a namespace on {}",
                describe
            )));
        };
        let uri = uri.into();
        match namespaces.iter_mut().find(|d| d.prefix.as_deref() == prefix) {
            Some(decl) => decl.uri = uri,
            None => namespaces.push(NamespaceDecl {
                prefix: prefix.map(str::to_string),
                uri,
            }),
        }
        Ok(())
    }

    /// Set (or replace) an attribute on an element.
    pub fn set_attribute(
        &mut self,
        id: NodeId,
        name: QName,
        value: impl Into<String>,
    ) -> Result<(), OmError> {
        let describe = self.describe(id);
        let NodeKind::Element { attributes, .. } = &mut self.node_mut(id).kind else {
            return Err(OmError::UnsupportedNode(format!(
                "cannot set an attribute on {}",
                describe
            )));
        };
        let value = value.into();
        match attributes
            .iter_mut()
            .find(|a| a.name.matches(&name.namespace_uri, &name.local_name))
        {
            Some(attr) => attr.value = value,
            None => attributes.push(Attribute { name, value }),
        }
        Ok(())
    }

    /// Remove an attribute; returns its value if it was present.
    pub fn remove_attribute(
        &mut self,
        id: NodeId,
        namespace_uri: &str,
        local_name: &str,
    ) -> Option<String> {
        let NodeKind::Element { attributes, .. } = &mut self.node_mut(id).kind else {
            return None;
        };
        let index = attributes
            .iter()
            .position(|a| a.name.matches(namespace_uri, local_name))?;
        Some(attributes.remove(index).value)
    }

    // --- Mutation ---

    fn check_insertable(&self, parent: NodeId, child: NodeId) -> Result<(), OmError> {
        if !self.node(parent).kind.is_container() {
            return Err(OmError::UnsupportedNode(format!(
                "{} cannot have children",
                self.describe(parent)
            )));
        }
        if matches!(self.node(child).kind, NodeKind::Document) {
            return Err(OmError::UnsupportedNode(
                "a document node cannot be inserted into a tree".to_string(),
            ));
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(OmError::UnsupportedNode(format!(
                "inserting {} under {} would create a cycle",
                self.describe(child),
                self.describe(parent)
            )));
        }
        Ok(())
    }

    /// Append `child` as the last child of `parent`.
    ///
    /// Both subtrees are completed first so the new child lands after every
    /// child still waiting in the stream. A child that already has a parent is
    /// detached from it.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), OmError> {
        self.check_insertable(parent, child)?;
        self.build_next(parent)?;
        self.build_next(child)?;
        self.unlink(child);
        self.link_append(parent, child);
        Ok(())
    }

    /// Insert `new_child` immediately before `reference`.
    pub fn insert_before(&mut self, reference: NodeId, new_child: NodeId) -> Result<(), OmError> {
        if reference == new_child {
            return Err(OmError::UnsupportedNode(
                "a node cannot be inserted before itself".to_string(),
            ));
        }
        let parent = self.node(reference).parent.ok_or_else(|| {
            OmError::UnsupportedNode(format!("{} has no parent", self.describe(reference)))
        })?;
        self.check_insertable(parent, new_child)?;
        self.build_next(new_child)?;
        self.unlink(new_child);

        self.node_mut(new_child).parent = Some(parent);
        match self.node(reference).prev_sibling {
            Some(prev) => {
                self.node_mut(prev).next_sibling = Some(new_child);
                self.node_mut(new_child).prev_sibling = Some(prev);
            }
            None => self.node_mut(parent).first_child = Some(new_child),
        }
        self.node_mut(new_child).next_sibling = Some(reference);
        self.node_mut(reference).prev_sibling = Some(new_child);
        Ok(())
    }

    /// Detach a node (and its subtree) from its parent, completing it first.
    pub fn detach(&mut self, id: NodeId) -> Result<(), OmError> {
        if id == self.root {
            return Err(OmError::UnsupportedNode(
                "the document node cannot be detached".to_string(),
            ));
        }
        self.build_next(id)?;
        self.unlink(id);
        Ok(())
    }

    pub(crate) fn link_append(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(child).parent = Some(parent);
        match self.node(parent).last_child {
            Some(last) => {
                self.node_mut(last).next_sibling = Some(child);
                self.node_mut(child).prev_sibling = Some(last);
            }
            None => self.node_mut(parent).first_child = Some(child),
        }
        self.node_mut(parent).last_child = Some(child);
    }

    fn unlink(&mut self, id: NodeId) {
        let Some(parent) = self.node(id).parent else {
            return;
        };
        let prev = self.node(id).prev_sibling;
        let next = self.node(id).next_sibling;

        match prev {
            Some(p) => self.node_mut(p).next_sibling = next,
            None => self.node_mut(parent).first_child = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev_sibling = prev,
            None => self.node_mut(parent).last_child = prev,
        }

        let node = self.node_mut(id);
        node.parent = None;
        node.prev_sibling = None;
        node.next_sibling = None;
    }
}

/// Iterator over a node and its ancestors.
pub struct Ancestors<'a> {
    doc: &'a Document,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.doc.node(current).parent;
        Some(current)
    }
}
