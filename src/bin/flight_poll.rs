use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;

use parcel_notify::{app, config, flight};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run one flight-status sweep and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only update flight rows; leave landing notifications for later
    #[arg(long)]
    no_notify: bool,
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
    let client = app::build_flight_client(&cfg, &pool).await?;
    let orchestrator = if args.no_notify {
        None
    } else {
        Some(app::build_orchestrator(&cfg, &pool).await?)
    };

    let summary = flight::run_poll(
        &pool,
        &client,
        &cfg.flights,
        Utc::now().date_naive(),
        orchestrator.as_ref(),
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
