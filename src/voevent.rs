//! Construction of the broker's own VOEvents.

use bytes::Bytes;
use chrono::Utc;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Writer;

use crate::document::Event;
use crate::types::{VtpError, VOEVENT_NS, XSI_NS};

const VOEVENT_SCHEMA_LOCATION: &str =
    "http://www.ivoa.net/xml/VOEvent/v2.0 http://www.ivoa.net/xml/VOEvent/VOEvent-v2.0.xsd";

/// Build a `test`-role event announcing that the broker at `local_ivo` is up.
///
/// The local ID embeds the current time (to the second) so that successive
/// test events are distinct in the event store.
pub fn broker_test_event(local_ivo: &str) -> Result<Event, VtpError> {
    fn xml_err(e: impl std::fmt::Display) -> VtpError {
        VtpError::Protocol(format!("cannot serialise test event: {e}"))
    }

    let now = Utc::now();
    let ivorn = format!("{local_ivo}#TestEvent-{}", now.format("%Y-%m-%dT%H:%M:%S"));

    let mut writer = Writer::new(Vec::with_capacity(1024));
    writer
        .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut root = BytesStart::new("voe:VOEvent");
    root.push_attribute(("xmlns:voe", VOEVENT_NS));
    root.push_attribute(("xmlns:xsi", XSI_NS));
    root.push_attribute(("xsi:schemaLocation", VOEVENT_SCHEMA_LOCATION));
    root.push_attribute(("ivorn", ivorn.as_str()));
    root.push_attribute(("role", "test"));
    root.push_attribute(("version", "2.0"));
    writer.write_event(XmlEvent::Start(root)).map_err(xml_err)?;

    writer
        .write_event(XmlEvent::Start(BytesStart::new("Who")))
        .map_err(xml_err)?;
    writer
        .create_element("AuthorIVORN")
        .write_text_content(BytesText::new(local_ivo))
        .map_err(xml_err)?;
    writer
        .create_element("Date")
        .write_text_content(BytesText::new(
            &now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        ))
        .map_err(xml_err)?;
    writer
        .write_event(XmlEvent::End(BytesEnd::new("Who")))
        .map_err(xml_err)?;

    writer
        .write_event(XmlEvent::Start(BytesStart::new("What")))
        .map_err(xml_err)?;
    writer
        .create_element("Description")
        .write_text_content(BytesText::new(concat!(
            "Broker test event generated by vtp-broker ",
            env!("CARGO_PKG_VERSION"),
            "."
        )))
        .map_err(xml_err)?;
    writer
        .write_event(XmlEvent::End(BytesEnd::new("What")))
        .map_err(xml_err)?;

    writer
        .write_event(XmlEvent::End(BytesEnd::new("voe:VOEvent")))
        .map_err(xml_err)?;

    Event::parse(Bytes::from(writer.into_inner())).map_err(VtpError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivoid::parse_ivoid;
    use crate::types::EventRole;

    #[test]
    fn test_event_is_a_test_role_voevent() {
        let event = broker_test_event("ivo://comet.broker/test").unwrap();
        assert_eq!(event.role(), EventRole::Test);
        assert!(event.ivorn().starts_with("ivo://comet.broker/test#TestEvent-"));
        assert_eq!(event.document().root_name(), "VOEvent");
        assert_eq!(event.document().root_namespace(), Some(VOEVENT_NS));
    }

    #[test]
    fn test_event_ivorn_has_local_id() {
        let event = broker_test_event("ivo://comet.broker/test").unwrap();
        let ivoid = parse_ivoid(event.ivorn()).unwrap();
        assert!(ivoid.local_id.starts_with("TestEvent-"));
    }
}
