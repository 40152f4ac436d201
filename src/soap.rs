//! SOAP envelope views over a lazily built [`Document`].
//!
//! Every lookup here pulls only as much of the message as it needs: finding
//! the operation reads up to the start tag of the first body element and
//! leaves the payload itself unbuilt.

use crate::config::SoapVersion;
use crate::document::Document;
use crate::error::{HandlerFault, OmError};
use crate::node::{NodeId, QName, XML_NS};

/// SOAP 1.1 envelope namespace.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 envelope namespace.
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// Namespace of the engine's own fault detail entries.
pub const FAULT_DETAIL_NS: &str = "urn:zentinel:soap:engine";

const ENVELOPE_PREFIX: &str = "soap";

impl SoapVersion {
    /// Envelope namespace of this version.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    /// Version whose envelope namespace is `uri`.
    pub fn from_namespace(uri: &str) -> Option<Self> {
        match uri {
            SOAP_11_NS => Some(Self::Soap11),
            SOAP_12_NS => Some(Self::Soap12),
            _ => None,
        }
    }
}

/// A child element of the SOAP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    pub node: NodeId,
    pub name: QName,
    /// `mustUnderstand` was `1` or `true`
    pub must_understand: bool,
}

/// The document element if it is a SOAP envelope, with its version.
///
/// Reads no further than the envelope's start tag.
pub fn envelope(doc: &mut Document) -> Result<Option<(NodeId, SoapVersion)>, OmError> {
    let Some(root) = doc.document_element()? else {
        return Ok(None);
    };
    let version = doc
        .element_name(root)
        .filter(|name| name.local_name == "Envelope")
        .and_then(|name| SoapVersion::from_namespace(&name.namespace_uri));
    Ok(version.map(|v| (root, v)))
}

/// SOAP version of the envelope, if the document is one.
pub fn envelope_version(doc: &mut Document) -> Result<Option<SoapVersion>, OmError> {
    Ok(envelope(doc)?.map(|(_, version)| version))
}

/// Version a fault reply to `doc` should use: the envelope's own, else `fallback`.
///
/// Looks only at the envelope's start tag, which is normally cached by the
/// time a fault is written, so a torn or malformed remainder does not matter.
pub fn reply_version(doc: &mut Document, fallback: SoapVersion) -> SoapVersion {
    envelope_version(doc).ok().flatten().unwrap_or(fallback)
}

/// The `Header` element; it can only be the envelope's first element child.
pub fn header(doc: &mut Document) -> Result<Option<NodeId>, OmError> {
    let Some((env, version)) = envelope(doc)? else {
        return Ok(None);
    };
    let first = doc.first_child_element(env)?;
    Ok(first.filter(|id| {
        doc.element_name(*id)
            .is_some_and(|n| n.matches(version.namespace(), "Header"))
    }))
}

/// The `Body` element.
pub fn body(doc: &mut Document) -> Result<Option<NodeId>, OmError> {
    let Some((env, version)) = envelope(doc)? else {
        return Ok(None);
    };
    doc.find_child(env, version.namespace(), "Body")
}

/// Every header block, in document order. Completes the header.
pub fn header_blocks(doc: &mut Document) -> Result<Vec<HeaderBlock>, OmError> {
    let Some((_, version)) = envelope(doc)? else {
        return Ok(Vec::new());
    };
    let Some(header) = header(doc)? else {
        return Ok(Vec::new());
    };
    let blocks = doc
        .child_elements(header)?
        .into_iter()
        .filter_map(|node| {
            let name = doc.element_name(node)?.clone();
            let must_understand = doc
                .attribute(node, version.namespace(), "mustUnderstand")
                .is_some_and(|v| matches!(v.trim(), "1" | "true"));
            Some(HeaderBlock {
                node,
                name,
                must_understand,
            })
        })
        .collect();
    Ok(blocks)
}

/// Name of the first element in the body.
pub fn body_operation(doc: &mut Document) -> Result<Option<QName>, OmError> {
    let Some(body) = body(doc)? else {
        return Ok(None);
    };
    let first = doc.first_child_element(body)?;
    Ok(first.and_then(|id| doc.element_name(id).cloned()))
}

/// Extract SOAPAction from HTTP header value (removes quotes).
pub fn parse_soap_action(header_value: &str) -> String {
    header_value.trim().trim_matches('"').to_string()
}

/// Operation name carried by a SOAPAction URI (`urn:svc/GetUser`, `urn:svc#GetUser`).
pub fn action_operation(action: &str) -> &str {
    let action = action.rsplit('/').next().unwrap_or(action);
    action.rsplit('#').next().unwrap_or(action)
}

/// Build a SOAP fault envelope for `fault`.
pub fn fault_envelope(version: SoapVersion, fault: &HandlerFault) -> Result<Document, OmError> {
    let ns = version.namespace();
    let mut doc = Document::new();

    let envelope = doc.create_element(QName::prefixed(ns, "Envelope", ENVELOPE_PREFIX))?;
    doc.declare_namespace(envelope, Some(ENVELOPE_PREFIX), ns)?;
    let body = doc.create_element(QName::prefixed(ns, "Body", ENVELOPE_PREFIX))?;
    let fault_el = doc.create_element(QName::prefixed(ns, "Fault", ENVELOPE_PREFIX))?;
    let root = doc.root();
    doc.append_child(root, envelope)?;
    doc.append_child(envelope, body)?;
    doc.append_child(body, fault_el)?;

    let code_value = format!("{}:{}", ENVELOPE_PREFIX, fault.code.local_name(version));
    let detail_name = match version {
        SoapVersion::Soap11 => {
            let code = doc.create_text_element(QName::local("faultcode"), &code_value)?;
            let reason = doc.create_text_element(QName::local("faultstring"), &fault.to_string())?;
            doc.append_child(fault_el, code)?;
            doc.append_child(fault_el, reason)?;
            QName::local("detail")
        }
        SoapVersion::Soap12 => {
            let code = doc.create_element(QName::prefixed(ns, "Code", ENVELOPE_PREFIX))?;
            let value =
                doc.create_text_element(QName::prefixed(ns, "Value", ENVELOPE_PREFIX), &code_value)?;
            doc.append_child(code, value)?;
            doc.append_child(fault_el, code)?;

            let reason = doc.create_element(QName::prefixed(ns, "Reason", ENVELOPE_PREFIX))?;
            let text =
                doc.create_text_element(QName::prefixed(ns, "Text", ENVELOPE_PREFIX), &fault.to_string())?;
            doc.set_attribute(text, QName::prefixed(XML_NS, "lang", "xml"), "en")?;
            doc.append_child(reason, text)?;
            doc.append_child(fault_el, reason)?;
            QName::prefixed(ns, "Detail", ENVELOPE_PREFIX)
        }
    };

    if let Some(detail_text) = &fault.detail {
        let detail = doc.create_element(detail_name)?;
        let entry = doc.create_text_element(
            QName::prefixed(FAULT_DETAIL_NS, "fault", "zentinel"),
            detail_text,
        )?;
        doc.declare_namespace(entry, Some("zentinel"), FAULT_DETAIL_NS)?;
        doc.set_attribute(entry, QName::local("code"), fault.code.as_str())?;
        doc.append_child(detail, entry)?;
        doc.append_child(fault_el, detail)?;
    }
    Ok(doc)
}
