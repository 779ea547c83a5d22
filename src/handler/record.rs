use std::sync::Arc;

use async_trait::async_trait;

use crate::document::Event;
use crate::event_db::EventDb;
use crate::pipeline::{Handler, WorkerPool};
use crate::types::HandlerError;

/// Marks events as seen, so a later copy from another route is dropped.
#[derive(Clone)]
pub struct EventRecorder {
    db: Arc<EventDb>,
    pool: WorkerPool,
}

impl EventRecorder {
    pub fn new(db: Arc<EventDb>, pool: WorkerPool) -> Self {
        Self { db, pool }
    }
}

#[async_trait]
impl Handler for EventRecorder {
    fn name(&self) -> &str {
        "event-recorder"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let db = Arc::clone(&self.db);
        let owned = event.clone();
        self.pool
            .run(move || db.record(&owned))
            .await
            .map_err(|e| HandlerError::Other(e.to_string()))?
            .map_err(|e| HandlerError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_support::dummy_event;

    #[tokio::test]
    async fn recorded_events_are_seen() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(EventDb::new(dir.path()).unwrap());
        let recorder = EventRecorder::new(Arc::clone(&db), WorkerPool::new(1));
        let event = dummy_event();

        recorder.handle(&event).await.unwrap();
        recorder.handle(&event).await.unwrap();
        assert!(!db.check(&event).unwrap());
    }
}
