use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlightQuery {
    pub flight_number: String,
    pub trip_date: NaiveDate,
    pub priority: u8,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlightStatus {
    #[serde(default)]
    pub has_landed: bool,
    #[serde(default)]
    pub actual_departure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_arrival: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Error)]
pub enum FlightError {
    #[error("flight API transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("flight API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("flight API response could not be parsed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait FlightStatusService: Send + Sync {
    async fn check(&self, query: &FlightQuery) -> Result<FlightStatus, FlightError>;
}

#[derive(Clone)]
pub struct HttpFlightClient {
    http: Client,
    endpoint: Url,
    api_key: String,
}

impl fmt::Debug for HttpFlightClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFlightClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpFlightClient {
    pub fn new(endpoint: &str, api_key: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid flight API endpoint")?;
        let http = Client::builder()
            .user_agent("parcel-notify/0.1")
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl FlightStatusService for HttpFlightClient {
    async fn check(&self, query: &FlightQuery) -> Result<FlightStatus, FlightError> {
        debug!(flight = %query.flight_number, date = %query.trip_date, priority = query.priority, "checking flight");
        let res = self
            .http
            .post(self.endpoint.clone())
            .header("x-api-key", &self.api_key)
            .json(query)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(FlightError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| FlightError::Decode(e.to_string()))
    }
}
