//! XML documents as received off the wire.
//!
//! A document keeps the exact bytes it arrived as (forwarding and content
//! hashing use those, never a re-serialisation) together with the few root
//! attributes the protocol engine dispatches on. The tree itself is rebuilt
//! on demand with [`XmlDocument::with_tree`].

use std::fmt;

use bytes::Bytes;
use roxmltree::{Document, ParsingOptions};

use crate::types::{EventRole, ParseError};

fn parsing_options() -> ParsingOptions {
    // No DTDs means no entity expansion.
    ParsingOptions {
        allow_dtd: false,
        ..ParsingOptions::default()
    }
}

/// Raw bytes plus the root-level facts extracted from them.
#[derive(Clone)]
pub struct XmlDocument {
    raw: Bytes,
    root_name: String,
    root_namespace: Option<String>,
    role: Option<String>,
    ivorn: Option<String>,
}

impl XmlDocument {
    /// Parse `raw` as a UTF-8 XML document.
    pub fn parse(raw: Bytes) -> Result<Self, ParseError> {
        let (root_name, root_namespace, role, ivorn) = {
            let text = std::str::from_utf8(&raw)
                .map_err(|e| ParseError(format!("payload is not UTF-8: {e}")))?;
            let doc = Document::parse_with_options(text, parsing_options())
                .map_err(|e| ParseError(e.to_string()))?;
            let root = doc.root_element();
            (
                root.tag_name().name().to_string(),
                root.tag_name().namespace().map(str::to_string),
                root.attribute("role").map(str::to_string),
                root.attribute("ivorn").map(str::to_string),
            )
        };
        Ok(Self {
            raw,
            root_name,
            root_namespace,
            role,
            ivorn,
        })
    }

    pub fn raw_bytes(&self) -> &Bytes {
        &self.raw
    }

    /// Local name of the root element.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn root_namespace(&self) -> Option<&str> {
        self.root_namespace.as_deref()
    }

    /// The root `role` attribute, if any.
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// The root `ivorn` attribute, if any.
    pub fn ivorn(&self) -> Option<&str> {
        self.ivorn.as_deref()
    }

    /// Run `f` against the parsed tree.
    pub fn with_tree<T>(&self, f: impl FnOnce(&Document<'_>) -> T) -> T {
        // Validated as UTF-8 XML in `parse`, and the bytes are immutable.
        let text = std::str::from_utf8(&self.raw).unwrap_or_default();
        match Document::parse_with_options(text, parsing_options()) {
            Ok(doc) => f(&doc),
            Err(_) => {
                let empty = Document::parse("<empty/>").expect("literal document parses");
                f(&empty)
            }
        }
    }
}

impl fmt::Debug for XmlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmlDocument")
            .field("root", &self.root_name)
            .field("role", &self.role)
            .field("ivorn", &self.ivorn)
            .field("len", &self.raw.len())
            .finish()
    }
}

/// A VOEvent: a document whose role is one of the four event roles and which
/// names itself with an `ivorn`.
#[derive(Debug, Clone)]
pub struct Event {
    doc: XmlDocument,
    role: EventRole,
}

impl Event {
    /// Parse raw bytes straight into an event.
    pub fn parse(raw: Bytes) -> Result<Self, ParseError> {
        let doc = XmlDocument::parse(raw)?;
        Event::from_document(doc).map_err(|doc| {
            ParseError(format!(
                "not a VOEvent (role={:?}, ivorn={:?})",
                doc.role(),
                doc.ivorn()
            ))
        })
    }

    /// Promote a document to an event, handing it back if it is not one.
    pub fn from_document(doc: XmlDocument) -> Result<Self, XmlDocument> {
        let role = match doc.role().and_then(EventRole::parse) {
            Some(role) => role,
            None => return Err(doc),
        };
        if doc.ivorn().is_none() {
            return Err(doc);
        }
        Ok(Self { doc, role })
    }

    pub fn ivorn(&self) -> &str {
        self.doc.ivorn().unwrap_or_default()
    }

    pub fn role(&self) -> EventRole {
        self.role
    }

    pub fn raw_bytes(&self) -> &Bytes {
        self.doc.raw_bytes()
    }

    pub fn document(&self) -> &XmlDocument {
        &self.doc
    }
}
