//! slicedrop CLI: upload files in resumable chunks.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use slicedrop_client::{FileSource, Recovery, SessionConfig, SessionEvent, UploadSession, WsClient};
use slicedrop_protocol::constants::{
    DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_CHUNK_COUNT, MessageType,
};
use slicedrop_protocol::messages::{ProbeRequest, ProbeResponse};
use slicedrop_transfer::naming::extension_from_name;

#[derive(Parser)]
#[command(name = "slicedrop", version, about = "Resumable chunked uploads")]
struct Cli {
    /// Upload server URL
    #[arg(long, default_value = "ws://127.0.0.1:9060", global = true)]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file, resuming any chunks already staged
    Upload {
        /// Path to the file to upload
        file: PathBuf,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Show what the server already holds for a file
    Probe {
        /// Path to the file to check
        file: PathBuf,
    },
}

#[derive(Args)]
struct Tuning {
    /// Chunks uploaded in parallel
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Retries per chunk for transient failures
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt
    #[arg(long, default_value_t = 250)]
    retry_delay_ms: u64,

    /// Preferred chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK_BYTES)]
    max_chunk_bytes: u64,

    /// Upper bound on the number of chunks
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK_COUNT)]
    max_chunks: u32,

    /// Skip per-chunk SHA-256 checksums
    #[arg(long)]
    no_checksums: bool,
}

impl Tuning {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_chunk_bytes: self.max_chunk_bytes,
            max_chunk_count: self.max_chunks,
            concurrency: self.concurrency.max(1),
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            checksums: !self.no_checksums,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = tokio::runtime::Runtime::new()
        .context("starting runtime")
        .and_then(|rt| rt.block_on(run(cli)));

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = WsClient::connect(&cli.server)
        .await
        .with_context(|| format!("connecting to {}", cli.server))?;
    let client = Arc::new(client);

    let result = match cli.command {
        Command::Upload { file, tuning } => upload(client.clone(), file, &tuning).await,
        Command::Probe { file } => probe(&client, file).await,
    };

    client.close().await;
    result
}

async fn upload(client: Arc<WsClient>, file: PathBuf, tuning: &Tuning) -> anyhow::Result<()> {
    let source =
        FileSource::open(&file).with_context(|| format!("opening {}", file.display()))?;

    let mut session = UploadSession::new(client, Arc::new(source), tuning.session_config());
    let events = session.take_events();
    let cancel = session.cancel_token();

    let printer = events.map(|mut rx| {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        })
    });

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, stopping after in-flight chunks");
            cancel.cancel();
        }
    });

    let result = session.run().await;
    interrupt.abort();
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match result {
        Ok(outcome) => {
            let location = outcome.artifact_location.as_deref().unwrap_or("(unknown)");
            if outcome.instant {
                println!("already uploaded: {location}");
            } else {
                println!(
                    "uploaded {} chunk(s), resumed {}: {location}",
                    outcome.uploaded_chunks, outcome.resumed_chunks
                );
            }
            println!("fingerprint: {}", outcome.fingerprint);
            Ok(())
        }
        Err(e) => {
            let hint = match e.recovery() {
                Recovery::Resume => "run the same upload again to resume",
                Recovery::RetryMerge => "all chunks are staged; run the upload again to retry the merge",
                Recovery::Restart => "fix the input and start over",
            };
            Err(anyhow::Error::new(e).context(hint.to_string()))
        }
    }
}

async fn probe(client: &WsClient, file: PathBuf) -> anyhow::Result<()> {
    let path = file.clone();
    let fingerprint = tokio::task::spawn_blocking(move || slicedrop_transfer::fingerprint_file(&path))
        .await
        .context("hash task panicked")?
        .with_context(|| format!("hashing {}", file.display()))?;
    let size = std::fs::metadata(&file)?.len();
    let extension = file
        .file_name()
        .map(|n| extension_from_name(&n.to_string_lossy()));

    let req = ProbeRequest {
        fingerprint: fingerprint.to_string(),
        extension,
        size: Some(size),
        total_chunks: None,
    };
    let reply = client
        .request(MessageType::ProbeChunks, Some(&req))
        .await
        .context("probe failed")?;
    let resp: ProbeResponse = reply
        .parse_payload()?
        .context("empty probe reply")?;

    println!("fingerprint: {fingerprint}");
    println!("status: {:?}", resp.result.code);
    if let Some(location) = &resp.result.artifact_location {
        println!("artifact: {location}");
    }
    if !resp.present.is_empty() {
        println!("staged chunks: {:?}", resp.present);
    }
    if let Some(layout) = resp.layout {
        println!("layout: {} chunk(s) of {} bytes", layout.total_chunks, layout.chunk_size);
    }
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::PhaseChanged(phase) => tracing::debug!(%phase, "phase"),
        SessionEvent::Planned {
            total_chunks,
            chunk_size,
            file_size,
            ..
        } => println!("{file_size} bytes in {total_chunks} chunk(s) of up to {chunk_size} bytes"),
        SessionEvent::ChunkSkipped { index } => tracing::debug!(index, "already staged"),
        SessionEvent::ChunkAcknowledged {
            acknowledged, total, ..
        } => eprint!("\r{acknowledged}/{total} chunks"),
        SessionEvent::ChunkRetry {
            index,
            attempt,
            reason,
        } => eprintln!("\nchunk {index} retry {attempt}: {reason}"),
        SessionEvent::Done(_) => eprintln!(),
        SessionEvent::Failed { phase, message, .. } => eprintln!("\n{phase} failed: {message}"),
    }
}
