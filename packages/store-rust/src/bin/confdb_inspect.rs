//! Opens a controller configuration database and prints
//! every network with its summary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use confdb_store::telemetry::{init_tracing, LogFormat};
use confdb_store::{controller_config, open_store};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(
    name = "confdb-inspect",
    about = "Dump the networks held in a controller configuration database",
    version
)]
struct Cli {
    /// Database path: a directory, or `postgres:<conninfo>`.
    path: String,

    /// Controller node id (ten hex digits).
    #[arg(long, env = "CONFDB_CONTROLLER_ID", default_value = "0000000000")]
    controller_id: String,

    /// Service `local.conf`; a ledger mirror is added when it configures one.
    #[arg(long)]
    local_conf: Option<PathBuf>,

    /// Also list each network's members.
    #[arg(long)]
    members: bool,

    /// Seconds to wait for the initial load.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,

    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_format = match cli.format {
        OutputFormat::Text => LogFormat::Text,
        OutputFormat::Json => LogFormat::Json,
    };
    init_tracing(&cli.log_level, log_format);

    let local_conf: Option<Value> = match &cli.local_conf {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Some(serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?)
        }
        None => None,
    };

    let config = controller_config(&cli.path, &cli.controller_id, local_conf.as_ref())?;
    let store = open_store(config).await?;

    let ready = tokio::time::timeout(Duration::from_secs(cli.wait_secs), store.wait_for_ready())
        .await
        .unwrap_or(false);
    if !ready {
        store.shutdown().await;
        anyhow::bail!("store did not become ready within {}s", cli.wait_secs);
    }

    let networks = store.networks();
    match cli.format {
        OutputFormat::Json => {
            let mut out = Vec::with_capacity(networks.len());
            for id in networks {
                let Some(network) = store.network(id) else { continue };
                let mut entry = json!({
                    "network": network,
                    "summary": store.summary(id),
                });
                if cli.members {
                    entry["members"] = serde_json::to_value(store.members(id))?;
                }
                out.push(entry);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("{} network(s)", networks.len());
            for id in networks {
                let Some(network) = store.network(id) else { continue };
                let summary = store.summary(id).unwrap_or_default();
                println!(
                    "{id}  rev {}  {:?}  members {}/{} authorized  bridges {}  ips {}",
                    network.revision,
                    network.name,
                    summary.authorized_member_count,
                    summary.total_member_count,
                    summary.active_bridges.len(),
                    summary.allocated_ips.len(),
                );
                if cli.members {
                    for member in store.members(id) {
                        println!(
                            "  {}  rev {}  authorized={}",
                            member.id, member.revision, member.authorized
                        );
                    }
                }
            }
        }
    }

    store.shutdown().await;
    Ok(())
}
