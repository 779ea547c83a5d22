use async_trait::async_trait;
use tracing::debug;

use crate::document::Event;
use crate::pipeline::Handler;
use crate::tcp::broadcaster::BroadcastHub;
use crate::types::HandlerError;

/// Forwards events to every subscriber of a broadcaster.
#[derive(Clone)]
pub struct EventRelay {
    hub: BroadcastHub,
}

impl EventRelay {
    pub fn new(hub: BroadcastHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Handler for EventRelay {
    fn name(&self) -> &str {
        "event-relay"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let queued = self.hub.send_event(event);
        debug!(ivorn = event.ivorn(), queued, "relayed event");
        Ok(())
    }
}
