//! Database module: view models, SQL repositories and the store adapters.
//!
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//! - `store`: `SqliteStore`, the trait implementations the orchestrator and
//!   the secret lookup consume.
//!
//! External modules import from `parcel_notify::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;
pub mod store;

pub use repo::*;

pub use model::{FlightForPoll, FlightRecipient, RedemptionRow, UpsertOutcome};
pub use store::{NotificationStore, SqliteStore, StatusUpdate};
