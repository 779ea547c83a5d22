use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vtp_broker::config::{BroadcasterSection, CommandConfig, ReceiverSection};
use vtp_broker::{Broker, BrokerConfig, Whitelist};

/// VOEvent Transport Protocol broker
#[derive(Parser, Debug)]
#[command(name = "comet-broker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IVOA identifier for this broker
    #[arg(long)]
    local_ivo: Option<String>,

    /// Directory for the event store
    #[arg(long)]
    eventdb: Option<PathBuf>,

    /// Listen for TCP connections from authors
    #[arg(short, long)]
    receive: bool,

    /// Address for receiving events
    #[arg(long, default_value = "0.0.0.0:8098")]
    receive_listen: String,

    /// Network allowed to submit events (repeatable)
    #[arg(long = "whitelist")]
    whitelist: Vec<String>,

    /// Re-broadcast events to TCP subscribers
    #[arg(short, long)]
    broadcast: bool,

    /// Address for broadcasting events
    #[arg(long, default_value = "0.0.0.0:8099")]
    broadcast_listen: String,

    /// Upstream broker to subscribe to, as host:port (repeatable)
    #[arg(long = "remote")]
    remotes: Vec<String>,

    /// XPath filter applied to upstream events (repeatable)
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Print accepted events to standard output
    #[arg(long)]
    print_events: bool,

    /// Save accepted events to this directory
    #[arg(long)]
    save_events: Option<PathBuf>,

    /// Spawn this command for each accepted event (repeatable)
    #[arg(long = "cmd")]
    commands: Vec<String>,

    /// Increase verbosity
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn into_config(self) -> Result<BrokerConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::load(path)?,
            None => BrokerConfig::default(),
        };
        if let Some(ivo) = self.local_ivo {
            config.local_ivo = ivo;
        }
        if let Some(path) = self.eventdb {
            config.event_db.path = path;
        }
        if self.receive {
            let section = config.receiver.get_or_insert_with(ReceiverSection::default);
            section.listen = self.receive_listen;
            if !self.whitelist.is_empty() {
                section.whitelist = Whitelist::parse(&self.whitelist)?;
            }
        }
        if self.broadcast {
            let section = config.broadcaster.get_or_insert_with(BroadcasterSection::default);
            section.listen = self.broadcast_listen;
        }
        config.remotes.extend(self.remotes);
        config.filters.extend(self.filters);
        config.handlers.print_events |= self.print_events;
        if self.save_events.is_some() {
            config.handlers.save_events = self.save_events;
        }
        for command in self.commands {
            let mut words = command.split_whitespace().map(str::to_string);
            if let Some(program) = words.next() {
                config.handlers.commands.push(CommandConfig {
                    command: program,
                    args: words.collect(),
                });
            }
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config()?;
    let broker = Broker::from_config(config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; shutting down"),
            Err(e) => error!(error = %e, "cannot listen for interrupt"),
        }
        signal.cancel();
    });

    broker.run(shutdown).await?;
    Ok(())
}
