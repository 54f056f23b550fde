use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use parcel_notify::model::LogStatus;
use parcel_notify::orchestrator::{PrepareRequest, QueueRequest, RecipientParams};
use parcel_notify::{app, config, db};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run notification batch passes from the command line"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Batch identifier; queue and prepare generate one when omitted
    #[arg(long)]
    batch: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record pending entries from a JSON request file
    Queue {
        #[arg(long)]
        request: PathBuf,
        /// Add every customer in the directory as a recipient
        #[arg(long)]
        all_customers: bool,
    },
    /// Render pending entries (and the request's recipients, if given)
    Prepare {
        #[arg(long)]
        request: Option<PathBuf>,
        #[arg(long)]
        all_customers: bool,
    },
    /// Send every prepared entry
    Execute,
    /// Resend every failed entry
    Retry,
    /// Delete the entries with the given status
    Clear {
        #[arg(long)]
        status: String,
    },
    /// Print per-status counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = app::open_database(&cfg).await?;
    let orchestrator = app::build_orchestrator(&cfg, &pool).await?;

    let generated = matches!(args.command, Command::Queue { .. } | Command::Prepare { .. });
    let batch = match (args.batch, generated) {
        (Some(batch), _) => batch,
        (None, true) => {
            let batch = format!("batch-{}", uuid::Uuid::new_v4());
            info!(%batch, "generated batch id");
            batch
        }
        (None, false) => return Err(anyhow!("--batch is required for this command")),
    };

    let output = match args.command {
        Command::Queue {
            request,
            all_customers,
        } => {
            let mut request: QueueRequest = read_json(&request).await?;
            if all_customers {
                add_all_customers(&pool, &mut request.recipients).await?;
            }
            serde_json::to_value(orchestrator.queue(&batch, &request).await?)?
        }
        Command::Prepare {
            request,
            all_customers,
        } => {
            let mut request: PrepareRequest = match request {
                Some(path) => read_json(&path).await?,
                None => PrepareRequest::default(),
            };
            if all_customers {
                if request.message.is_none() {
                    warn!("--all-customers ignored: the request has no message");
                } else {
                    add_all_customers(&pool, &mut request.recipients).await?;
                }
            }
            serde_json::to_value(orchestrator.prepare(&batch, &request).await?)?
        }
        Command::Execute => serde_json::to_value(orchestrator.execute(&batch).await?)?,
        Command::Retry => serde_json::to_value(orchestrator.retry(&batch).await?)?,
        Command::Clear { status } => {
            let status = LogStatus::parse_status(status.trim())
                .ok_or_else(|| anyhow!("unknown status: {status}"))?;
            serde_json::json!({ "removed": orchestrator.clear(&batch, status).await? })
        }
        Command::Status => serde_json::to_value(orchestrator.counts(&batch).await?)?,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "batch": batch, "result": output }))?
    );
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid request in {}", path.display()))
}

async fn add_all_customers(pool: &db::Pool, recipients: &mut Vec<RecipientParams>) -> Result<()> {
    for id in db::list_customer_ids(pool).await? {
        if !recipients.iter().any(|r| r.recipient_id == id) {
            recipients.push(RecipientParams::new(id));
        }
    }
    Ok(())
}
