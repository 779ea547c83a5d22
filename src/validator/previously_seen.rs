use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::document::Event;
use crate::event_db::EventDb;
use crate::pipeline::{Validator, WorkerPool};
use crate::types::ValidationError;

/// Rejects events already recorded in the event store; records new ones.
#[derive(Clone)]
pub struct CheckPreviouslySeen {
    db: Arc<EventDb>,
    pool: WorkerPool,
}

impl CheckPreviouslySeen {
    pub fn new(db: Arc<EventDb>, pool: WorkerPool) -> Self {
        Self { db, pool }
    }
}

#[async_trait]
impl Validator for CheckPreviouslySeen {
    fn name(&self) -> &str {
        "check-previously-seen"
    }

    async fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        let db = Arc::clone(&self.db);
        let owned = event.clone();
        let seen = self
            .pool
            .run(move || db.check(&owned))
            .await
            .map_err(|e| ValidationError::new(e.to_string()))?;

        match seen {
            Ok(true) => {
                debug!(ivorn = event.ivorn(), "event not previously seen");
                Ok(())
            }
            Ok(false) => {
                debug!(ivorn = event.ivorn(), "event has been previously seen");
                Err(ValidationError::new("Previously seen by this broker"))
            }
            Err(err) => {
                warn!(ivorn = event.ivorn(), error = %err, "event store lookup failed");
                Err(err.into())
            }
        }
    }
}
