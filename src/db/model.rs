//! Database view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::FlightRecord;

/// Result of writing a prepared entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Upserted(i64),
    /// The (batch, recipient) pair already reached `sent`; left untouched.
    SkippedSent,
}

/// Flight row plus the number of packages riding on it.
#[derive(Debug, Clone)]
pub struct FlightForPoll {
    pub flight: FlightRecord,
    pub package_count: i64,
}

/// Customer with the tracking numbers of their packages on one flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightRecipient {
    pub customer_id: i64,
    pub tracking_numbers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedemptionRow {
    pub id: i64,
    pub customer_id: i64,
    pub points: i64,
    #[serde(skip)]
    pub code: String,
    pub attempts: i64,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
