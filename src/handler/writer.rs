use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::document::Event;
use crate::pipeline::Handler;
use crate::types::HandlerError;

/// Saves each event to a file named after its ivorn.
#[derive(Debug, Clone)]
pub struct EventWriter {
    directory: PathBuf,
}

impl EventWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name for `ivorn`: its alphanumeric characters only.
    pub fn file_name(ivorn: &str) -> String {
        ivorn.chars().filter(|c| c.is_alphanumeric()).collect()
    }
}

#[async_trait]
impl Handler for EventWriter {
    fn name(&self) -> &str {
        "save-event"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(Self::file_name(event.ivorn()));
        debug!(path = %path.display(), "writing event");
        tokio::fs::write(&path, event.raw_bytes()).await?;
        Ok(())
    }
}
