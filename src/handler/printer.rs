use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::document::Event;
use crate::pipeline::Handler;
use crate::types::HandlerError;

/// Prints each event to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventPrinter;

#[async_trait]
impl Handler for EventPrinter {
    fn name(&self) -> &str {
        "print-event"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let mut out = tokio::io::stdout();
        out.write_all(event.raw_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}
