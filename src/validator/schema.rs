use std::sync::Arc;

use async_trait::async_trait;

use crate::document::{Event, XmlDocument};
use crate::pipeline::{Validator, WorkerPool};
use crate::types::{EventRole, ValidationError, VOEVENT_NS};

/// Checks a document against a schema. Called on the worker pool.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, doc: &XmlDocument) -> Result<(), String>;
}

/// Structural check of VOEvent 2.0 documents.
///
/// Covers the root element, its attributes and the order of its children.
/// Element content below the top level is not inspected.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoEventStructure;

/// Top-level children in schema order, and whether each may repeat.
const TOP_LEVEL: [(&str, bool); 8] = [
    ("Who", false),
    ("What", false),
    ("WhereWhen", false),
    ("How", false),
    ("Why", false),
    ("Citations", false),
    ("Description", true),
    ("Reference", true),
];

impl SchemaValidator for VoEventStructure {
    fn validate(&self, doc: &XmlDocument) -> Result<(), String> {
        if doc.root_name() != "VOEvent" {
            return Err(format!("root element is {}, expected VOEvent", doc.root_name()));
        }
        if doc.root_namespace() != Some(VOEVENT_NS) {
            return Err(format!(
                "VOEvent is in namespace {:?}, expected {VOEVENT_NS}",
                doc.root_namespace()
            ));
        }
        match doc.role() {
            Some(role) if EventRole::parse(role).is_some() => {}
            other => return Err(format!("invalid role {other:?}")),
        }
        if doc.ivorn().map_or(true, str::is_empty) {
            return Err("missing ivorn".into());
        }

        doc.with_tree(|tree| {
            let root = tree.root_element();
            if root.attribute("version") != Some("2.0") {
                return Err(format!(
                    "version is {:?}, expected \"2.0\"",
                    root.attribute("version")
                ));
            }

            let mut last: Option<usize> = None;
            for child in root.children().filter(|n| n.is_element()) {
                if child.tag_name().namespace().is_some() {
                    return Err(format!(
                        "{} must not be namespace-qualified",
                        child.tag_name().name()
                    ));
                }
                let name = child.tag_name().name();
                let idx = TOP_LEVEL
                    .iter()
                    .position(|(n, _)| *n == name)
                    .ok_or_else(|| format!("unexpected element {name}"))?;
                let repeats = TOP_LEVEL[idx].1;
                if let Some(prev) = last {
                    if idx < prev || (idx == prev && !repeats) {
                        return Err(format!("element {name} is out of order or repeated"));
                    }
                }
                last = Some(idx);
            }
            Ok(())
        })
    }
}

/// Rejects events which fail a [`SchemaValidator`].
#[derive(Clone)]
pub struct CheckSchema {
    schema: Arc<dyn SchemaValidator>,
    pool: WorkerPool,
}

impl CheckSchema {
    pub fn new(schema: Arc<dyn SchemaValidator>, pool: WorkerPool) -> Self {
        Self { schema, pool }
    }

    /// Validate against the built-in VOEvent 2.0 structure check.
    pub fn voevent(pool: WorkerPool) -> Self {
        Self::new(Arc::new(VoEventStructure), pool)
    }
}

#[async_trait]
impl Validator for CheckSchema {
    fn name(&self) -> &str {
        "check-schema"
    }

    async fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        let schema = Arc::clone(&self.schema);
        let doc = event.document().clone();
        self.pool
            .run(move || schema.validate(&doc))
            .await
            .map_err(|e| ValidationError::new(e.to_string()))?
            .map_err(|reason| ValidationError::new(format!("Schema validation failed: {reason}")))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::document::test_support::*;

    fn structure(xml: &str) -> Result<(), String> {
        let doc = XmlDocument::parse(Bytes::from(xml.to_string())).unwrap();
        VoEventStructure.validate(&doc)
    }

    fn wrap(body: &str) -> String {
        format!(
            "<voe:VOEvent xmlns:voe=\"{VOEVENT_NS}\" version=\"2.0\" role=\"test\" \
             ivorn=\"{DUMMY_EVENT_IVOID}\">{body}</voe:VOEvent>"
        )
    }

    #[test]
    fn dummy_event_is_valid() {
        let doc = XmlDocument::parse(dummy_voevent()).unwrap();
        assert_eq!(VoEventStructure.validate(&doc), Ok(()));
    }

    #[test]
    fn repeatable_elements() {
        assert!(structure(&wrap("<Who/><Description/><Description/><Reference/>")).is_ok());
        assert!(structure(&wrap("<Who/><Who/>")).is_err());
    }

    #[test]
    fn order_matters() {
        assert!(structure(&wrap("<What/><Who/>")).is_err());
        assert!(structure(&wrap("<Unknown/>")).is_err());
    }

    #[test]
    fn root_checks() {
        assert!(structure("<VOEvent role=\"test\" ivorn=\"ivo://a.b/c#d\" version=\"2.0\"/>").is_err());
        let wrong_version = wrap("").replace("version=\"2.0\"", "version=\"1.1\"");
        assert!(structure(&wrong_version).is_err());
        let wrong_role = wrap("").replace("role=\"test\"", "role=\"iamalive\"");
        assert!(structure(&wrong_role).is_err());
    }

    #[tokio::test]
    async fn validator_reports_reason() {
        let check = CheckSchema::voevent(WorkerPool::new(1));
        assert!(check.validate(&dummy_event()).await.is_ok());

        let bad = Event::parse(Bytes::from(wrap("<What/><Who/>"))).unwrap();
        let err = check.validate(&bad).await.unwrap_err();
        assert!(err.0.starts_with("Schema validation failed"));
    }
}
