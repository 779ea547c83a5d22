use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::document::Event;
use crate::pipeline::Handler;
use crate::types::HandlerError;

/// Runs an external command with the event on its standard input.
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    command: String,
    args: Vec<String>,
}

impl SpawnCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Handler for SpawnCommand {
    fn name(&self) -> &str {
        "spawn-command"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        info!(command = %self.command, "running external command");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(command = %self.command, error = %e, "cannot start external command");
                HandlerError::Io(e)
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The command may exit without reading; that is its business.
            if let Err(e) = stdin.write_all(event.raw_bytes()).await {
                debug!(command = %self.command, error = %e, "stdin closed early");
            }
        }

        let output = child.wait_with_output().await?;
        for stream in [&output.stdout, &output.stderr] {
            if !stream.is_empty() {
                debug!(command = %self.command, "external process said: {}", String::from_utf8_lossy(stream));
            }
        }

        if output.status.success() {
            Ok(())
        } else {
            let err = HandlerError::CommandFailed {
                command: self.command.clone(),
                code: output.status.code(),
            };
            warn!("{err}");
            Err(err)
        }
    }
}
