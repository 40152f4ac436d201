//! Node type definitions for the object model.
//!
//! Nodes live in an arena owned by [`Document`](crate::document::Document)
//! and refer to each other through [`NodeId`]s. Parent and sibling links are
//! plain ids, so the tree never owns itself in a cycle.

use std::fmt;
use std::num::NonZeroU32;

/// Namespace bound to the `xml` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Namespace of `xmlns` declarations themselves.
pub const XMLNS_NS: &str = "http://www.w3.org/2000/xmlns/";

/// A typed index into the document's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NodeId(NonZeroU32);

impl NodeId {
    /// Id of the document node; the first slot after the placeholder.
    pub(crate) const DOCUMENT: NodeId = NodeId(NonZeroU32::MIN);

    pub(crate) fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().and_then(NonZeroU32::new).map(Self)
    }

    /// Position in the document's arena.
    pub fn index(self) -> usize {
        // u32 always fits in usize on supported targets
        self.0.get() as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How much of a node's subtree has been pulled from the token stream.
///
/// Ordered: a node's state only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuildState {
    Unbuilt,
    PartiallyBuilt,
    Complete,
}

/// A namespace-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    /// Namespace URI; empty when the name is in no namespace
    pub namespace_uri: String,
    pub local_name: String,
    pub prefix: Option<String>,
}

impl QName {
    /// A name in no namespace.
    pub fn local(local_name: impl Into<String>) -> Self {
        Self {
            namespace_uri: String::new(),
            local_name: local_name.into(),
            prefix: None,
        }
    }

    /// A namespaced name without a preferred prefix.
    pub fn new(namespace_uri: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace_uri: namespace_uri.into(),
            local_name: local_name.into(),
            prefix: None,
        }
    }

    /// A namespaced name with a preferred prefix.
    pub fn prefixed(
        namespace_uri: impl Into<String>,
        local_name: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            namespace_uri: namespace_uri.into(),
            local_name: local_name.into(),
            prefix: Some(prefix.into()),
        }
    }

    /// True when the name has the given namespace and local name.
    pub fn matches(&self, namespace_uri: &str, local_name: &str) -> bool {
        self.namespace_uri == namespace_uri && self.local_name == local_name
    }

    /// True when the name is in no namespace.
    pub fn has_no_namespace(&self) -> bool {
        self.namespace_uri.is_empty()
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local_name),
            None => f.write_str(&self.local_name),
        }
    }
}

/// An attribute on an element. `xmlns` declarations are never attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

/// A namespace declaration scoped to an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    /// `None` for the default namespace
    pub prefix: Option<String>,
    /// Empty string undeclares the default namespace
    pub uri: String,
}

/// The kind of a node and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The synthetic document node, one per `Document`.
    Document,

    Element {
        name: QName,
        attributes: Vec<Attribute>,
        namespaces: Vec<NamespaceDecl>,
    },

    Text(String),

    /// A CDATA section (content written without escaping).
    CData(String),

    Comment(String),

    ProcessingInstruction {
        target: String,
        data: Option<String>,
    },
}

impl NodeKind {
    /// Short name used in error messages and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Element { .. } => "element",
            Self::Text(_) => "text",
            Self::CData(_) => "cdata",
            Self::Comment(_) => "comment",
            Self::ProcessingInstruction { .. } => "processing-instruction",
        }
    }

    /// Only documents and elements can have children.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Document | Self::Element { .. })
    }
}

/// Storage for a single node in the arena.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub last_child: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub prev_sibling: Option<NodeId>,
    pub build_state: BuildState,
    /// Nothing more will arrive from the stream for this node: its end tag
    /// was read, or it was created programmatically.
    pub closed: bool,
    /// The unbuilt remainder of this node was handed to a stream-through
    /// serialization and can never be materialized.
    pub consumed: bool,
}

impl NodeData {
    pub(crate) fn new(kind: NodeKind, build_state: BuildState) -> Self {
        Self {
            kind,
            parent: None,
            first_child: None,
            last_child: None,
            next_sibling: None,
            prev_sibling: None,
            build_state,
            closed: false,
            consumed: false,
        }
    }

    /// True once the whole subtree is in memory.
    pub fn is_complete(&self) -> bool {
        self.build_state == BuildState::Complete
    }

    /// Element name, if this is an element.
    pub fn element_name(&self) -> Option<&QName> {
        match &self.kind {
            NodeKind::Element { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_state_ordering() {
        assert!(BuildState::Unbuilt < BuildState::PartiallyBuilt);
        assert!(BuildState::PartiallyBuilt < BuildState::Complete);
    }

    #[test]
    fn test_qname_display() {
        assert_eq!(QName::prefixed("urn:x", "root", "a").to_string(), "a:root");
        assert_eq!(QName::local("root").to_string(), "root");
    }

    #[test]
    fn test_qname_matches_ignores_prefix() {
        let name = QName::prefixed("urn:x", "root", "a");
        assert!(name.matches("urn:x", "root"));
        assert!(!name.matches("urn:y", "root"));
        assert!(QName::local("r").has_no_namespace());
    }

    #[test]
    fn test_node_id_rejects_zero() {
        assert!(NodeId::from_index(0).is_none());
        assert_eq!(NodeId::from_index(3).map(NodeId::index), Some(3));
    }
}
