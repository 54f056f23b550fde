//! Wiring shared by the binaries: database, credentials and clients.
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::db::{self, Pool, SqliteStore};
use crate::flight::HttpFlightClient;
use crate::orchestrator::Orchestrator;
use crate::phone::PhoneNormalizer;
use crate::secrets;
use crate::template::TemplateBuilder;
use crate::whatsapp::WhatsAppClient;

/// Open the database (honouring `DATABASE_URL`) and apply migrations.
pub async fn open_database(cfg: &Config) -> Result<Pool> {
    cfg.ensure_dirs()?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn build_orchestrator(cfg: &Config, pool: &Pool) -> Result<Orchestrator> {
    let store = SqliteStore::new(pool.clone());
    let credentials =
        secrets::resolve_whatsapp_credentials(&store, &cfg.whatsapp, |k| std::env::var(k).ok())
            .await?;
    let client = WhatsAppClient::new(&cfg.whatsapp.api_base, &cfg.whatsapp.api_version, credentials)
        .context("failed to build WhatsApp client")?;
    info!(?client, "messaging client ready");
    Ok(Orchestrator::new(
        Arc::new(store),
        Arc::new(client),
        PhoneNormalizer::from_config(&cfg.phone),
        TemplateBuilder::new(cfg.whatsapp.language.clone()),
        Some(cfg.whatsapp.fallback_template.clone()),
    ))
}

pub async fn build_flight_client(cfg: &Config, pool: &Pool) -> Result<HttpFlightClient> {
    let store = SqliteStore::new(pool.clone());
    let api_key =
        secrets::resolve_flight_api_key(&store, &cfg.flights, |k| std::env::var(k).ok()).await;
    HttpFlightClient::new(&cfg.flights.endpoint, &api_key)
}
