//! VOEvent Transport Protocol messages.
//!
//! Transport messages share one shape: a `Transport` root carrying a `role`
//! attribute and the children `Origin`, `Response`, `TimeStamp`, `Meta`, in
//! exactly that order. Schema validation downstream, and some peers, read
//! these positionally, so the builder never reorders them.
//!
//! | Message               | role           | Origin        | Response  | Meta              |
//! |-----------------------|----------------|---------------|-----------|-------------------|
//! | iamalive              | `iamalive`     | local         |           |                   |
//! | iamalive response     | `iamalive`     | remote        | local     |                   |
//! | ack                   | `ack`          | event ivorn   | local     |                   |
//! | nak                   | `nak`          | event ivorn   | local     | `Result`          |
//! | authenticate          | `authenticate` | local         |           |                   |
//! | authenticate response | `authenticate` | remote        | local     | `Param` per filter|

use std::fmt;

use bytes::Bytes;
use chrono::Utc;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Writer;

use crate::document::{Event, XmlDocument};
use crate::types::{ParseError, VtpError, TRANSPORT_NS, XSI_NS};

const TRANSPORT_SCHEMA_LOCATION: &str = "http://telescope-networks.org/schema/Transport/v1.1 \
     http://www.telescope-networks.org/schema/Transport-v1.1.xsd";

/// Wire role of a transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    IAmAlive,
    Ack,
    Nak,
    Authenticate,
}

impl TransportRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "iamalive" => Some(TransportRole::IAmAlive),
            "ack" => Some(TransportRole::Ack),
            "nak" => Some(TransportRole::Nak),
            "authenticate" => Some(TransportRole::Authenticate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportRole::IAmAlive => "iamalive",
            TransportRole::Ack => "ack",
            TransportRole::Nak => "nak",
            TransportRole::Authenticate => "authenticate",
        }
    }
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VTP control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub role: TransportRole,
    pub origin: String,
    pub response: Option<String>,
    pub timestamp: String,
    /// Explanation attached to a nak.
    pub result: Option<String>,
    /// XPath filters carried by an authenticate response.
    pub filters: Vec<String>,
}

fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl TransportMessage {
    fn new(role: TransportRole, origin: &str) -> Self {
        Self {
            role,
            origin: origin.to_string(),
            response: None,
            timestamp: utc_timestamp(),
            result: None,
            filters: Vec::new(),
        }
    }

    fn replying(role: TransportRole, local_ivo: &str, remote_ivo: &str) -> Self {
        let mut msg = Self::new(role, remote_ivo);
        if !local_ivo.is_empty() {
            msg.response = Some(local_ivo.to_string());
        }
        msg
    }

    pub fn iamalive(local_ivo: &str) -> Self {
        Self::new(TransportRole::IAmAlive, local_ivo)
    }

    pub fn iamalive_response(local_ivo: &str, remote_ivo: &str) -> Self {
        Self::replying(TransportRole::IAmAlive, local_ivo, remote_ivo)
    }

    pub fn ack(local_ivo: &str, event_ivorn: &str) -> Self {
        Self::replying(TransportRole::Ack, local_ivo, event_ivorn)
    }

    pub fn nak(local_ivo: &str, event_ivorn: &str, result: Option<&str>) -> Self {
        let mut msg = Self::replying(TransportRole::Nak, local_ivo, event_ivorn);
        msg.result = result.filter(|r| !r.is_empty()).map(str::to_string);
        msg
    }

    pub fn authenticate(local_ivo: &str) -> Self {
        Self::new(TransportRole::Authenticate, local_ivo)
    }

    pub fn authenticate_response(local_ivo: &str, remote_ivo: &str, filters: &[String]) -> Self {
        let mut msg = Self::replying(TransportRole::Authenticate, local_ivo, remote_ivo);
        msg.filters = filters.to_vec();
        msg
    }

    /// Serialise to the bytes sent on the wire.
    pub fn to_bytes(&self) -> Result<Bytes, VtpError> {
        fn xml_err(e: impl fmt::Display) -> VtpError {
            VtpError::Protocol(format!("cannot serialise transport message: {e}"))
        }

        let mut writer = Writer::new(Vec::with_capacity(512));
        writer
            .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let mut root = BytesStart::new("trn:Transport");
        root.push_attribute(("xmlns:trn", TRANSPORT_NS));
        root.push_attribute(("xmlns:xsi", XSI_NS));
        root.push_attribute(("xsi:schemaLocation", TRANSPORT_SCHEMA_LOCATION));
        root.push_attribute(("version", "1.0"));
        root.push_attribute(("role", self.role.as_str()));
        writer.write_event(XmlEvent::Start(root)).map_err(xml_err)?;

        writer
            .create_element("Origin")
            .write_text_content(BytesText::new(&self.origin))
            .map_err(xml_err)?;
        if let Some(response) = &self.response {
            writer
                .create_element("Response")
                .write_text_content(BytesText::new(response))
                .map_err(xml_err)?;
        }
        writer
            .create_element("TimeStamp")
            .write_text_content(BytesText::new(&self.timestamp))
            .map_err(xml_err)?;

        if self.result.is_some() || !self.filters.is_empty() {
            writer
                .write_event(XmlEvent::Start(BytesStart::new("Meta")))
                .map_err(xml_err)?;
            if let Some(result) = &self.result {
                writer
                    .create_element("Result")
                    .write_text_content(BytesText::new(result))
                    .map_err(xml_err)?;
            }
            for filter in &self.filters {
                writer
                    .create_element("Param")
                    .with_attribute(("name", "xpath-filter"))
                    .with_attribute(("value", filter.as_str()))
                    .write_empty()
                    .map_err(xml_err)?;
            }
            writer
                .write_event(XmlEvent::End(BytesEnd::new("Meta")))
                .map_err(xml_err)?;
        }

        writer
            .write_event(XmlEvent::End(BytesEnd::new("trn:Transport")))
            .map_err(xml_err)?;
        Ok(Bytes::from(writer.into_inner()))
    }

    /// Interpret a parsed document as a transport message.
    ///
    /// Returns `None` if the root role is not a transport role. Filters are
    /// read from both the current `Param name="xpath-filter"` form and the
    /// legacy `filter type="xpath"` form.
    pub fn from_document(doc: &XmlDocument) -> Option<Self> {
        let role = doc.role().and_then(TransportRole::parse)?;
        Some(doc.with_tree(|tree| {
            let root = tree.root_element();
            let child_text = |name: &str| {
                root.children()
                    .find(|n| n.is_element() && n.tag_name().name() == name)
                    .and_then(|n| n.text())
                    .map(|t| t.trim().to_string())
            };

            let mut result = None;
            let mut filters = Vec::new();
            if let Some(meta) = root
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "Meta")
            {
                for node in meta.children().filter(|n| n.is_element()) {
                    match node.tag_name().name() {
                        "Result" => result = node.text().map(|t| t.trim().to_string()),
                        "Param" if node.attribute("name") == Some("xpath-filter") => {
                            if let Some(value) = node.attribute("value") {
                                filters.push(value.to_string());
                            }
                        }
                        "filter" if node.attribute("type") == Some("xpath") => {
                            if let Some(text) = node.text() {
                                filters.push(text.trim().to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }

            TransportMessage {
                role,
                origin: child_text("Origin").unwrap_or_default(),
                response: child_text("Response"),
                timestamp: child_text("TimeStamp").unwrap_or_default(),
                result,
                filters,
            }
        }))
    }
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone)]
pub enum Inbound {
    Event(Event),
    Transport(TransportMessage),
    /// Well-formed XML with a role nobody here understands.
    Incomprehensible(Option<String>),
}

/// Parse and classify an inbound payload by its root `role`.
pub fn classify(raw: Bytes) -> Result<Inbound, ParseError> {
    let doc = XmlDocument::parse(raw)?;
    if let Some(msg) = TransportMessage::from_document(&doc) {
        return Ok(Inbound::Transport(msg));
    }
    match Event::from_document(doc) {
        Ok(event) => Ok(Inbound::Event(event)),
        Err(doc) => Ok(Inbound::Incomprehensible(doc.role().map(str::to_string))),
    }
}
