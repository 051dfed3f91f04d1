mod demo;
mod events;
mod output;

use std::path::PathBuf;

use arc_protocol::SigningKeypair;
use clap::{Parser, Subcommand};
use events::{emit, EventKeygen};

#[derive(Parser)]
#[command(name = "arc-sim", about = "Scenario driver for the ARC-AI transport prototype")]
struct Cli {
    /// Also append JSONL events to a timestamped file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run authority + edge hubs in-process over a simulated lossy link.
    Demo {
        /// Per-chunk loss probability in percent. Restored to 0 before retransmits.
        #[arg(long, default_value = "30")]
        loss: f64,
        /// One-way latency per chunk in ms.
        #[arg(long, default_value = "250")]
        latency_ms: u64,
        /// Link bandwidth in bytes per second.
        #[arg(long, default_value = "32000")]
        bandwidth: u64,
        /// Maximum chunk size in bytes.
        #[arg(long, default_value = "800")]
        max_chunk_size: usize,
        /// Number of edge hubs.
        #[arg(long, default_value = "2")]
        edges: usize,
        /// Number of queries, spread round-robin across edges.
        #[arg(long, default_value = "6")]
        queries: u32,
        /// Maximum retransmit rounds after the link is restored.
        #[arg(long, default_value = "6")]
        retransmit_rounds: u32,
        /// Simulator RNG seed.
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Generate an Ed25519 keypair for MAIN_HUB_SIGNING_KEY_B64 / MAIN_HUB_VERIFY_KEY_B64.
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    eprintln!("arc-sim v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Demo {
            loss,
            latency_ms,
            bandwidth,
            max_chunk_size,
            edges,
            queries,
            retransmit_rounds,
            seed,
        } => {
            if let Some(dir) = &cli.output_dir {
                let path = output::resolve_jsonl_path(dir, "demo", seed)?;
                output::init_jsonl_writer(&path)?;
                eprintln!("JSONL: {}", path.display());
            }
            eprintln!("Demo: {edges} edge hub(s), loss {loss}%, latency {latency_ms} ms, chunk {max_chunk_size} B");
            eprintln!();

            let opts = demo::DemoOptions {
                loss_pct: loss,
                latency_ms,
                bandwidth_bytes_per_sec: bandwidth,
                max_chunk_size_bytes: max_chunk_size,
                edges,
                queries,
                retransmit_rounds,
                seed,
            };
            let summary = demo::run(&opts).await?;
            emit(&summary);

            eprintln!();
            eprintln!(
                "Queries: {} ({} authoritative, {} cached, {} fallback)",
                summary.queries, summary.authoritative, summary.cached, summary.fallback
            );
            eprintln!(
                "Messages: {} sent, {} queued, {} chunk(s) still pending",
                summary.messages_sent, summary.messages_queued, summary.still_pending
            );
        }
        Command::Keygen => {
            let keys = SigningKeypair::generate();
            emit(&EventKeygen {
                event: "keygen",
                signing_key_b64: keys.signing_key_base64(),
                verify_key_b64: keys.verify_key_base64(),
            });
        }
    }

    Ok(())
}
