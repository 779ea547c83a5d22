use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vtp_broker::{archive, Event, Sender};

/// Submit VOEvents to a broker
#[derive(Parser, Debug)]
#[command(name = "comet-sendvo")]
#[command(version, about, long_about = None)]
struct Args {
    /// Receiving broker, as host:port
    #[arg(long, default_value = "localhost:8098")]
    host: String,

    /// Event files; `-` or nothing reads one event from standard input.
    /// Several files are sent together as a tar archive.
    files: Vec<PathBuf>,

    /// Give up waiting for the broker's replies after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Increase verbosity
    #[arg(short, long)]
    verbose: bool,
}

async fn read_input(path: &Path) -> Result<Bytes, Box<dyn Error>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    } else {
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }
}

async fn submit(args: Args) -> Result<bool, Box<dyn Error>> {
    let files = if args.files.is_empty() {
        vec![PathBuf::from("-")]
    } else {
        args.files
    };
    let mut payloads = Vec::with_capacity(files.len());
    for path in &files {
        payloads.push(read_input(path).await?);
    }

    let sender = Sender::new(args.timeout.map(Duration::from_secs));
    let stream = TcpStream::connect(&args.host).await?;
    info!(host = %args.host, "connected");

    let report = if let [payload] = payloads.as_slice() {
        let event = Event::parse(payload.clone())?;
        sender.send_event(stream, &event).await?
    } else {
        sender.send_archive(stream, archive::pack(&payloads)?).await?
    };
    info!(
        acked = report.acked,
        naked = report.naked,
        expected = report.expected,
        "submission finished"
    );
    Ok(report.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match submit(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "submission failed");
            ExitCode::FAILURE
        }
    }
}
