//! Tally Node - runs a local devnet and drives the protocol library across it.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tally_node::observability::{init_logging, LogFormat};
use tally_node::{Devnet, Node, NodeConfig};
use tally_protocols::NotarisationResponse;
use tally_types::{SecureHash, StateRef, TimeWindow, Timestamp, TransactionId, WireTransaction};

/// Tally Node - flow engine and notary devnet
#[derive(Parser, Debug)]
#[command(name = "tally-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file applied to every node (session, storage, logging).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,

    /// Legal names of the devnet parties. Repeat for each party.
    #[arg(long, default_values_t = [
        "O=Bank A,L=London,C=GB".to_string(),
        "O=Bank B,L=New York,C=US".to_string(),
    ])]
    parties: Vec<String>,

    /// Legal name of the notary node.
    #[arg(long, default_value = "O=Notary Service,L=Zurich,C=CH")]
    notary: String,

    /// Print Prometheus metrics for every node when done.
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let base = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    let level = args.log_level.clone().unwrap_or_else(|| base.log_level.clone());
    let format = if args.json_logs { LogFormat::Json } else { base.log_format };
    init_logging(&level, format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tally devnet");

    anyhow::ensure!(args.parties.len() >= 2, "the devnet needs at least two parties");
    let configs = args
        .parties
        .iter()
        .chain(std::iter::once(&args.notary))
        .map(|name| NodeConfig {
            legal_name: name.clone(),
            private_key: None,
            notary: *name == args.notary,
            data_dir: base.data_dir.join(sanitize(name)),
            ..base.clone()
        })
        .collect();
    let devnet = Devnet::from_configs(configs).context("assembling devnet")?;

    let alice = &devnet.nodes()[0];
    let bob = &devnet.nodes()[1];
    let notary = devnet.notary().context("devnet has no notary")?;

    run_demo(alice, bob, notary).await?;

    if args.metrics {
        for node in devnet.nodes() {
            println!("# node {}\n{}", node.name(), node.encode_metrics()?);
        }
    }

    devnet.shutdown();
    tracing::info!("Devnet stopped");
    Ok(())
}

async fn run_demo(alice: &Node, bob: &Node, notary: &Node) -> anyhow::Result<()> {
    let identities = alice
        .swap_identities(bob.name().clone())
        .await
        .context("swapping identities")?;
    for (party, anonymous) in &identities {
        tracing::info!(party = %party, key = %anonymous.owning_key.short_id(), "Confidential identity");
    }

    let contract = bob.import_attachment(b"contract code v1".to_vec())?;
    let fetched = alice
        .fetch_attachments(vec![contract], bob.name().clone())
        .await
        .context("fetching attachment")?;
    tracing::info!(
        downloaded = fetched.downloaded.len(),
        from_disk = fetched.from_disk.len(),
        "Attachment resolved"
    );

    let issuance = TransactionId::new(SecureHash::compute(b"issuance"));
    let now = Timestamp::now();
    let spend = |tag: &str| WireTransaction {
        inputs: vec![StateRef::new(issuance, 0)],
        outputs: vec![tag.as_bytes().to_vec()],
        attachments: vec![contract],
        notary: notary.name().clone(),
        time_window: Some(TimeWindow::with_tolerance(now, Duration::from_secs(30))),
    };

    report("first spend", alice.notarise(spend("pay bob")).await?);
    report("double spend", bob.notarise(spend("pay bob again")).await?);
    Ok(())
}

fn report(label: &str, response: NotarisationResponse) {
    match response {
        NotarisationResponse::Signed(signature) => {
            tracing::info!(label, by = %signature.by.short_id(), "Notarised")
        }
        NotarisationResponse::Error(error) => {
            tracing::warn!(label, error = %error, "Notarisation refused")
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
