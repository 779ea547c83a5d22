use async_trait::async_trait;

use crate::document::Event;
use crate::ivoid::parse_ivoid;
use crate::pipeline::Validator;
use crate::types::ValidationError;

/// Requires a well-formed IVOA identifier with a per-event local ID.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckIvoid;

#[async_trait]
impl Validator for CheckIvoid {
    fn name(&self) -> &str {
        "check-ivoid"
    }

    async fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        let ivoid = parse_ivoid(event.ivorn())
            .ok_or_else(|| ValidationError::new(format!("Invalid IVOID: {}", event.ivorn())))?;
        if ivoid.local_id.is_empty() {
            return Err(ValidationError::new("No per-event local ID"));
        }
        Ok(())
    }
}
