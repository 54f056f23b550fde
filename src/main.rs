use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use parcel_notify::{app, config, flight, handlers};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = Arc::new(config::load(Some(&args.config))?);

    let pool = app::open_database(&cfg).await?;
    let orchestrator = Arc::new(app::build_orchestrator(&cfg, &pool).await?);
    let flights = Arc::new(app::build_flight_client(&cfg, &pool).await?);

    // Background flight sweeps (single task).
    if cfg.app.flight_poll_interval_secs > 0 {
        let worker_pool = pool.clone();
        let worker_flights = flights.clone();
        let worker_orchestrator = orchestrator.clone();
        let settings = cfg.flights.clone();
        let interval = Duration::from_secs(cfg.app.flight_poll_interval_secs);
        tokio::spawn(async move {
            loop {
                let today = Utc::now().date_naive();
                if let Err(err) = flight::run_poll(
                    &worker_pool,
                    worker_flights.as_ref(),
                    &settings,
                    today,
                    Some(worker_orchestrator.as_ref()),
                )
                .await
                {
                    error!(?err, "flight poll failed");
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    let state = handlers::AppState {
        pool,
        orchestrator,
        flights,
        config: cfg.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.app.listen_addr).await?;
    info!(addr = %cfg.app.listen_addr, "listening");
    axum::serve(listener, handlers::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
