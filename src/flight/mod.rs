//! Flight-status sweep: rank flights by how many packages ride on them, ask
//! the flight API about the most important ones, persist what changed and
//! prepare landing notifications.
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info, instrument, warn};

use crate::config;
use crate::db::{self, FlightForPoll};
use crate::model::{FlightRecord, ParamBag};
use crate::orchestrator::{MessageSpec, Orchestrator, PrepareRequest, RecipientParams};
use crate::template::TemplateKind;

pub mod client;

pub use client::{FlightError, FlightQuery, FlightStatus, FlightStatusService, HttpFlightClient};

pub const ARRIVED: &str = "arrived";

/// Fields to persist on a flight row; `None` leaves the column as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlightUpdate {
    pub has_landed: Option<bool>,
    pub status: Option<String>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub actual_arrival: Option<DateTime<Utc>>,
}

impl FlightUpdate {
    pub fn is_empty(&self) -> bool {
        self.has_landed.is_none()
            && self.status.is_none()
            && self.actual_departure.is_none()
            && self.actual_arrival.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PollSummary {
    pub queries_today: i64,
    pub checked: u32,
    pub updated: u32,
    pub api_errors: u32,
    pub fallback_applied: u32,
    pub notified: u32,
}

/// Package count clamped to 1..=10.
pub fn priority(package_count: i64) -> u8 {
    package_count.clamp(1, 10) as u8
}

/// Highest priority first; ties go to the earlier scheduled arrival, with
/// unknown arrivals last.
pub fn rank(flights: Vec<FlightForPoll>) -> Vec<(FlightForPoll, u8)> {
    let mut ranked: Vec<_> = flights
        .into_iter()
        .map(|f| {
            let p = priority(f.package_count);
            (f, p)
        })
        .collect();
    ranked.sort_by(|(a, pa), (b, pb)| {
        pb.cmp(pa).then_with(|| {
            match (a.flight.scheduled_arrival, b.flight.scheduled_arrival) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.flight.id.cmp(&b.flight.id),
            }
        })
    });
    ranked
}

/// Changes between the stored row and what the API reported. Landing is
/// only ever set, never cleared.
pub fn diff(current: &FlightRecord, fetched: &FlightStatus) -> FlightUpdate {
    FlightUpdate {
        has_landed: (fetched.has_landed && !current.has_landed).then_some(true),
        status: fetched
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != current.status)
            .map(str::to_string),
        actual_departure: fetched
            .actual_departure
            .filter(|d| current.actual_departure != Some(*d)),
        actual_arrival: fetched
            .actual_arrival
            .filter(|d| current.actual_arrival != Some(*d)),
    }
}

/// When the API cannot answer: a flight whose arrival date (or trip date,
/// if no arrival is scheduled) is already in the past is taken as arrived.
pub fn fallback_update(flight: &FlightRecord, today: NaiveDate) -> Option<FlightUpdate> {
    if flight.has_landed {
        return None;
    }
    let reference = flight
        .scheduled_arrival
        .map(|d| d.date_naive())
        .unwrap_or(flight.trip_date);
    (reference < today).then(|| FlightUpdate {
        has_landed: Some(true),
        status: Some(ARRIVED.to_string()),
        ..Default::default()
    })
}

/// One sweep. `notifier` prepares the landing batches; without it landed
/// flights stay unnotified for a later sweep.
#[instrument(skip_all, fields(today = %today))]
pub async fn run_poll(
    pool: &SqlitePool,
    service: &dyn FlightStatusService,
    settings: &config::Flights,
    today: NaiveDate,
    notifier: Option<&Orchestrator>,
) -> Result<PollSummary> {
    let mut summary = PollSummary {
        queries_today: db::flight_queries_on(pool, today).await?,
        ..Default::default()
    };
    if summary.queries_today >= i64::from(settings.daily_query_budget) {
        warn!(
            queries = summary.queries_today,
            budget = settings.daily_query_budget,
            "daily flight query budget already reached"
        );
    } else {
        info!(
            queries = summary.queries_today,
            budget = settings.daily_query_budget,
            "flight query usage"
        );
    }

    let candidates = db::flights_needing_attention(pool)
        .await
        .context("failed to load flights")?;
    let in_air: Vec<_> = candidates
        .into_iter()
        .filter(|f| !f.flight.has_landed)
        .collect();

    for (item, priority) in rank(in_air).into_iter().take(settings.max_checks_per_run) {
        let flight = &item.flight;
        let query = FlightQuery {
            flight_number: flight.flight_number.clone(),
            trip_date: flight.trip_date,
            priority,
        };
        match service.check(&query).await {
            Ok(status) => {
                summary.checked += 1;
                if let Err(err) = db::record_flight_query(pool, today).await {
                    error!(?err, "failed to record flight query");
                }
                let update = diff(flight, &status);
                let res = if update.is_empty() {
                    db::touch_flight_checked(pool, flight.id, Utc::now()).await
                } else {
                    summary.updated += 1;
                    info!(id = flight.id, flight = %flight.flight_number, ?update, "flight changed");
                    db::apply_flight_update(pool, flight.id, &update, Utc::now()).await
                };
                if let Err(err) = res {
                    error!(?err, id = flight.id, "failed to store flight update");
                }
            }
            Err(err) => {
                summary.api_errors += 1;
                warn!(%err, id = flight.id, flight = %flight.flight_number, "flight API check failed");
                if let Some(update) = fallback_update(flight, today) {
                    summary.fallback_applied += 1;
                    info!(id = flight.id, "arrival date passed; marking flight arrived");
                    if let Err(err) =
                        db::apply_flight_update(pool, flight.id, &update, Utc::now()).await
                    {
                        error!(?err, id = flight.id, "failed to store fallback update");
                    }
                }
            }
        }
    }

    if let Some(orchestrator) = notifier {
        let landed: Vec<_> = db::flights_needing_attention(pool)
            .await?
            .into_iter()
            .filter(|f| f.flight.has_landed && !f.flight.notification_sent)
            .collect();
        for item in landed {
            match notify_landing(pool, orchestrator, &item.flight).await {
                Ok(()) => summary.notified += 1,
                Err(err) => error!(?err, id = item.flight.id, "landing notification failed"),
            }
        }
    }

    info!(
        checked = summary.checked,
        updated = summary.updated,
        api_errors = summary.api_errors,
        fallback_applied = summary.fallback_applied,
        notified = summary.notified,
        "flight poll finished"
    );
    Ok(summary)
}

pub fn landing_batch_id(flight_id: i64) -> String {
    format!("flight-{flight_id}")
}

/// Prepare `llegada_paquetes` for every customer with packages on the flight
/// and mark the flight notified. Sending stays a separate execute step. If
/// any row could not be stored the flight stays unnotified and the next
/// sweep prepares the batch again.
async fn notify_landing(
    pool: &SqlitePool,
    orchestrator: &Orchestrator,
    flight: &FlightRecord,
) -> Result<()> {
    let recipients = db::flight_recipients(pool, flight.id).await?;
    let arrival = flight
        .actual_arrival
        .or(flight.scheduled_arrival)
        .map(|d| d.date_naive())
        .unwrap_or(flight.trip_date);

    let request = PrepareRequest {
        message: Some(MessageSpec::Template {
            template: TemplateKind::LlegadaPaquetes,
            params: ParamBag::from([(
                "fecha_llegada".to_string(),
                arrival.format("%Y-%m-%d").to_string(),
            )]),
        }),
        recipients: recipients
            .into_iter()
            .map(|r| RecipientParams {
                recipient_id: r.customer_id,
                params: ParamBag::from([("guias".to_string(), r.tracking_numbers.join(", "))]),
            })
            .collect(),
    };
    let batch = landing_batch_id(flight.id);
    let prepared = orchestrator.prepare(&batch, &request).await?;
    info!(
        id = flight.id,
        batch = %batch,
        prepared = prepared.prepared,
        rejected = prepared.rejected.len(),
        "landing notifications prepared"
    );
    if prepared.storage_errors > 0 {
        return Err(anyhow!(
            "{} landing notifications for flight {} could not be stored",
            prepared.storage_errors,
            flight.id
        ));
    }
    db::mark_flight_notified(pool, flight.id).await
}
