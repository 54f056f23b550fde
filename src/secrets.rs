//! Provider credential lookup: secret store first, then the environment,
//! then the config file.
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

use crate::config::{self, ConfigError};

pub const WHATSAPP_TOKEN: &str = "WHATSAPP_TOKEN";
pub const WHATSAPP_PHONE_NUMBER_ID: &str = "WHATSAPP_PHONE_NUMBER_ID";
pub const FLIGHT_API_KEY: &str = "FLIGHT_API_KEY";

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct WhatsAppCredentials {
    pub token: String,
    pub phone_number_id: String,
}

impl fmt::Debug for WhatsAppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppCredentials")
            .field("token", &"[REDACTED]")
            .field("phone_number_id", &self.phone_number_id)
            .finish()
    }
}

/// Resolve WhatsApp credentials. `env` is injected so callers and tests
/// control the environment lookup (`|k| std::env::var(k).ok()` in binaries).
pub async fn resolve_whatsapp_credentials<F>(
    store: &dyn SecretStore,
    cfg: &config::WhatsApp,
    env: F,
) -> Result<WhatsAppCredentials, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let token = lookup(store, &env, WHATSAPP_TOKEN, cfg.token.as_deref())
        .await
        .ok_or(ConfigError::MissingCredential(WHATSAPP_TOKEN))?;
    let phone_number_id = lookup(
        store,
        &env,
        WHATSAPP_PHONE_NUMBER_ID,
        cfg.phone_number_id.as_deref(),
    )
    .await
    .ok_or(ConfigError::MissingCredential(WHATSAPP_PHONE_NUMBER_ID))?;
    Ok(WhatsAppCredentials {
        token,
        phone_number_id,
    })
}

/// Flight API key, same lookup order. May be empty when the API is unused.
pub async fn resolve_flight_api_key<F>(store: &dyn SecretStore, cfg: &config::Flights, env: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(store, &env, FLIGHT_API_KEY, Some(cfg.api_key.as_str()))
        .await
        .unwrap_or_default()
}

async fn lookup<F>(
    store: &dyn SecretStore,
    env: &F,
    name: &str,
    from_config: Option<&str>,
) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    match store.get_secret(name).await {
        Ok(Some(v)) if !v.trim().is_empty() => {
            debug!(name, "credential from secret store");
            return Some(v.trim().to_string());
        }
        Ok(_) => {}
        Err(err) => debug!(?err, name, "secret store lookup failed; trying environment"),
    }
    if let Some(v) = env(name).filter(|v| !v.trim().is_empty()) {
        debug!(name, "credential from environment");
        return Some(v.trim().to_string());
    }
    from_config
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
