//! XML token sources.
//!
//! A [`TokenSource`] is a pull-style reader producing one structural event at
//! a time. The incremental builder and the stream-through serializer consume
//! it; nothing else in the crate touches raw XML input.
//!
//! [`QuickXmlSource`] adapts quick-xml, which does not expand external
//! entities. DOCTYPE declarations are rejected by default since SOAP messages
//! may not carry one.

use crate::error::OmError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::VecDeque;
use std::io::{BufRead, Cursor};
use tracing::trace;

/// A single structural event.
///
/// Names are raw qualified names as written in the input (`soap:Body`);
/// namespace declarations arrive as ordinary `xmlns`/`xmlns:*` attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    StartElement {
        name: String,
        attributes: Vec<(String, String)>,
    },
    EndElement {
        name: String,
    },
    /// Character data, already unescaped
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        data: Option<String>,
    },
}

impl XmlEvent {
    /// Convenience constructor for a start tag without attributes.
    pub fn start(name: impl Into<String>) -> Self {
        Self::StartElement {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    /// Convenience constructor for an end tag.
    pub fn end(name: impl Into<String>) -> Self {
        Self::EndElement { name: name.into() }
    }

    /// Convenience constructor for a text event.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }
}

/// Pull-style producer of structural events.
pub trait TokenSource: Send {
    /// Pull the next event; `Ok(None)` once the input is exhausted.
    fn next_event(&mut self) -> Result<Option<XmlEvent>, OmError>;
}

impl<T: TokenSource + ?Sized> TokenSource for Box<T> {
    fn next_event(&mut self) -> Result<Option<XmlEvent>, OmError> {
        (**self).next_event()
    }
}

/// Options for [`QuickXmlSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    /// Fail on `<!DOCTYPE ...>`
    pub reject_doctype: bool,
    /// Drop whitespace around text and whitespace-only text
    pub trim_text: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            reject_doctype: true,
            trim_text: false,
        }
    }
}

/// Token source over a quick-xml reader.
pub struct QuickXmlSource<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    pending: VecDeque<XmlEvent>,
    options: SourceOptions,
    finished: bool,
}

impl QuickXmlSource<Cursor<Vec<u8>>> {
    /// Create a source over an owned byte buffer.
    pub fn from_bytes(data: impl Into<Vec<u8>>, options: SourceOptions) -> Self {
        Self::from_reader(Cursor::new(data.into()), options)
    }
}

impl<R: BufRead> QuickXmlSource<R> {
    /// Create a source over any buffered reader.
    pub fn from_reader(input: R, options: SourceOptions) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(options.trim_text);
        Self {
            reader,
            buf: Vec::new(),
            pending: VecDeque::new(),
            options,
            finished: false,
        }
    }

    fn read_next(&mut self) -> Result<Option<XmlEvent>, OmError> {
        loop {
            self.buf.clear();
            let position = self.reader.buffer_position();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(quick_xml::Error::Io(e)) => {
                    return Err(OmError::Io(std::io::Error::new(e.kind(), e.to_string())));
                }
                Err(e) => {
                    return Err(OmError::MalformedInput(format!(
                        "XML parse error at byte {}: {}",
                        position, e
                    )));
                }
            };

            let produced = match event {
                Event::Start(ref e) => start_event(e)?,
                Event::Empty(ref e) => {
                    let start = start_event(e)?;
                    if let XmlEvent::StartElement { ref name, .. } = start {
                        self.pending.push_back(XmlEvent::end(name.clone()));
                    }
                    start
                }
                Event::End(ref e) => XmlEvent::EndElement {
                    name: utf8(e.name().as_ref())?,
                },
                Event::Text(ref e) => {
                    let text = e
                        .unescape()
                        .map_err(|e| OmError::MalformedInput(format!("Invalid text content: {}", e)))?;
                    if text.is_empty() {
                        continue;
                    }
                    XmlEvent::Text(text.into_owned())
                }
                Event::CData(e) => XmlEvent::CData(utf8(&e.into_inner())?),
                Event::Comment(ref e) => XmlEvent::Comment(utf8(e)?),
                Event::PI(ref e) => {
                    let content = utf8(e)?;
                    let (target, data) = match content.split_once(|c: char| c.is_ascii_whitespace()) {
                        Some((target, data)) => {
                            let data = data.trim_start();
                            (target.to_string(), (!data.is_empty()).then(|| data.to_string()))
                        }
                        None => (content, None),
                    };
                    XmlEvent::ProcessingInstruction { target, data }
                }
                Event::DocType(_) => {
                    if self.options.reject_doctype {
                        return Err(OmError::MalformedInput(
                            "DOCTYPE declarations are not allowed".to_string(),
                        ));
                    }
                    continue;
                }
                Event::Decl(_) => continue,
                Event::Eof => return Ok(None),
            };
            return Ok(Some(produced));
        }
    }
}

impl<R: BufRead + Send> TokenSource for QuickXmlSource<R> {
    fn next_event(&mut self) -> Result<Option<XmlEvent>, OmError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if self.finished {
            return Ok(None);
        }
        let event = self.read_next()?;
        if event.is_none() {
            self.finished = true;
        }
        trace!(event = ?event, "token source event");
        Ok(event)
    }
}

fn start_event(e: &BytesStart<'_>) -> Result<XmlEvent, OmError> {
    let name = utf8(e.name().as_ref())?;
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| OmError::MalformedInput(format!("Invalid attribute: {}", e)))?;
        let key = utf8(attr.key.as_ref())?;
        let value = attr
            .unescape_value()
            .map_err(|e| OmError::MalformedInput(format!("Invalid attribute value: {}", e)))?;
        attributes.push((key, value.into_owned()));
    }
    Ok(XmlEvent::StartElement { name, attributes })
}

fn utf8(bytes: &[u8]) -> Result<String, OmError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| OmError::MalformedInput(format!("Invalid UTF-8: {}", e)))
}
