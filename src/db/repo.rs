use super::model::{FlightForPoll, FlightRecipient, RedemptionRow, UpsertOutcome};
use crate::flight::FlightUpdate;
use crate::model::{
    BatchCounts, FlightRecord, LogStatus, MessageKind, NewLogEntry, NotificationLogEntry, ParamBag,
    Recipient,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// Statements here are always drained with `fetch_all`, even when one row is
// expected. A SQLite statement left mid-result keeps its implicit
// transaction open on the pooled connection, so an INSERT ... RETURNING
// would stay invisible to the other connections.

fn returned_id(ids: Vec<i64>, table: &str) -> Result<i64> {
    ids.into_iter()
        .next()
        .ok_or_else(|| anyhow!("insert into {} returned no id", table))
}

// ---------------------------------------------------------------------------
// customers

#[instrument(skip_all)]
pub async fn insert_customer(
    pool: &Pool,
    name: &str,
    phone: Option<&str>,
    whatsapp_number: Option<&str>,
    address: Option<&str>,
) -> Result<i64> {
    let ids = sqlx::query_scalar(
        "INSERT INTO customers (name, phone, whatsapp_number, address) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(phone)
    .bind(whatsapp_number)
    .bind(address)
    .fetch_all(pool)
    .await?;
    returned_id(ids, "customers")
}

#[instrument(skip_all)]
pub async fn update_customer_contact(
    pool: &Pool,
    id: i64,
    phone: Option<&str>,
    whatsapp_number: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE customers SET phone = ?, whatsapp_number = ? WHERE id = ?")
        .bind(phone)
        .bind(whatsapp_number)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_customer(pool: &Pool, id: i64) -> Result<Option<Recipient>> {
    let rows = sqlx::query(
        "SELECT id, name, phone, whatsapp_number, address FROM customers WHERE id = ?",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    Ok(rows.first().map(|row| Recipient {
        id: row.get("id"),
        name: row.get("name"),
        phone: row.get("phone"),
        whatsapp_number: row.get("whatsapp_number"),
        address: row.get("address"),
    }))
}

pub async fn list_customer_ids(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar("SELECT id FROM customers ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// notification log

fn map_log_entry(row: &SqliteRow) -> Result<NotificationLogEntry> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = LogStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("log entry {} has unknown status {}", id, status_str))?;
    let kind_str: String = row.get("message_kind");
    let message_kind = MessageKind::parse_kind(&kind_str)
        .ok_or_else(|| anyhow!("log entry {} has unknown kind {}", id, kind_str))?;
    let params_json: String = row.get("template_params");
    let template_params: ParamBag = serde_json::from_str(&params_json)
        .with_context(|| format!("log entry {} has malformed template_params", id))?;

    Ok(NotificationLogEntry {
        id,
        batch_id: row.get("batch_id"),
        recipient_id: row.get("recipient_id"),
        recipient_name: row.get("recipient_name"),
        recipient_phone: row.get("recipient_phone"),
        message_kind,
        message_body: row.get("message_body"),
        template_name: row.get("template_name"),
        template_language: row.get("template_language"),
        template_params,
        status,
        error_message: row.get("error_message"),
        provider_message_id: row.get("provider_message_id"),
        sent_at: row.get("sent_at"),
        created_at: row.get("created_at"),
    })
}

/// Insert a pending entry unless the (batch, recipient) pair already exists.
/// Returns the new id, or None when a row was already there.
#[instrument(skip_all)]
pub async fn insert_pending_entry(pool: &Pool, entry: &NewLogEntry) -> Result<Option<i64>> {
    let params = serde_json::to_string(&entry.template_params)?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO notification_log (batch_id, recipient_id, recipient_name, recipient_phone, message_kind, message_body, template_name, template_language, template_params, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?) \
         ON CONFLICT (batch_id, recipient_id) DO NOTHING \
         RETURNING id",
    )
    .bind(&entry.batch_id)
    .bind(entry.recipient_id)
    .bind(&entry.recipient_name)
    .bind(&entry.recipient_phone)
    .bind(entry.message_kind.as_str())
    .bind(&entry.message_body)
    .bind(&entry.template_name)
    .bind(&entry.template_language)
    .bind(params)
    .bind(Utc::now())
    .fetch_all(pool)
    .await?
    .into_iter()
    .next();
    Ok(id)
}

/// Upsert on (batch_id, recipient_id). A row that already reached `sent` is
/// never overwritten, so preparing twice neither duplicates nor resends.
#[instrument(skip_all)]
pub async fn upsert_log_entry(pool: &Pool, entry: &NewLogEntry) -> Result<UpsertOutcome> {
    let params = serde_json::to_string(&entry.template_params)?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO notification_log (batch_id, recipient_id, recipient_name, recipient_phone, message_kind, message_body, template_name, template_language, template_params, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (batch_id, recipient_id) DO UPDATE SET \
            recipient_name = excluded.recipient_name, \
            recipient_phone = excluded.recipient_phone, \
            message_kind = excluded.message_kind, \
            message_body = excluded.message_body, \
            template_name = excluded.template_name, \
            template_language = excluded.template_language, \
            template_params = excluded.template_params, \
            status = excluded.status, \
            error_message = NULL, \
            provider_message_id = NULL, \
            sent_at = NULL \
         WHERE notification_log.status <> 'sent' \
         RETURNING id",
    )
    .bind(&entry.batch_id)
    .bind(entry.recipient_id)
    .bind(&entry.recipient_name)
    .bind(&entry.recipient_phone)
    .bind(entry.message_kind.as_str())
    .bind(&entry.message_body)
    .bind(&entry.template_name)
    .bind(&entry.template_language)
    .bind(params)
    .bind(entry.status.as_str())
    .bind(Utc::now())
    .fetch_all(pool)
    .await?
    .into_iter()
    .next();
    Ok(match id {
        Some(id) => UpsertOutcome::Upserted(id),
        None => UpsertOutcome::SkippedSent,
    })
}

#[instrument(skip_all)]
pub async fn get_log_entry(pool: &Pool, id: i64) -> Result<Option<NotificationLogEntry>> {
    let rows = sqlx::query("SELECT * FROM notification_log WHERE id = ?")
        .bind(id)
        .fetch_all(pool)
        .await?;
    rows.first().map(map_log_entry).transpose()
}

#[instrument(skip_all)]
pub async fn list_log_entries(
    pool: &Pool,
    batch_id: &str,
    status: Option<LogStatus>,
) -> Result<Vec<NotificationLogEntry>> {
    let rows = match status {
        Some(status) => {
            sqlx::query("SELECT * FROM notification_log WHERE batch_id = ? AND status = ? ORDER BY id")
                .bind(batch_id)
                .bind(status.as_str())
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM notification_log WHERE batch_id = ? ORDER BY id")
                .bind(batch_id)
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter().map(map_log_entry).collect()
}

#[instrument(skip_all)]
pub async fn mark_entry_sent(
    pool: &Pool,
    id: i64,
    provider_message_id: &str,
    sent_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE notification_log SET status = 'sent', provider_message_id = ?, sent_at = ?, error_message = NULL WHERE id = ?",
    )
    .bind(provider_message_id)
    .bind(sent_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark entry sent")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_entry_failed(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE notification_log SET status = 'failed', error_message = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark entry failed")?;
    Ok(())
}

/// failed → prepared: clears the previous error and, when given, stores the
/// freshly resolved phone.
#[instrument(skip_all)]
pub async fn reset_entry_for_retry(pool: &Pool, id: i64, phone: Option<&str>) -> Result<()> {
    sqlx::query(
        "UPDATE notification_log SET status = 'prepared', error_message = NULL, recipient_phone = COALESCE(?, recipient_phone) WHERE id = ? AND status = 'failed'",
    )
    .bind(phone)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to reset entry for retry")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_log_entries(pool: &Pool, batch_id: &str, status: LogStatus) -> Result<u64> {
    let res = sqlx::query("DELETE FROM notification_log WHERE batch_id = ? AND status = ?")
        .bind(batch_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn batch_counts(pool: &Pool, batch_id: &str) -> Result<BatchCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM notification_log WHERE batch_id = ? GROUP BY status",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    let mut counts = BatchCounts::default();
    for (status, n) in rows {
        match LogStatus::parse_status(&status) {
            Some(LogStatus::Pending) => counts.pending = n,
            Some(LogStatus::Prepared) => counts.prepared = n,
            Some(LogStatus::Sent) => counts.sent = n,
            Some(LogStatus::Failed) => counts.failed = n,
            None => return Err(anyhow!("unknown status {} in batch {}", status, batch_id)),
        }
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// secrets

pub async fn get_secret(pool: &Pool, name: &str) -> Result<Option<String>> {
    let values: Vec<String> = sqlx::query_scalar("SELECT value FROM app_secrets WHERE name = ?")
        .bind(name)
        .fetch_all(pool)
        .await?;
    Ok(values.into_iter().next())
}

pub async fn put_secret(pool: &Pool, name: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO app_secrets (name, value) VALUES (?, ?) ON CONFLICT (name) DO UPDATE SET value = excluded.value",
    )
    .bind(name)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// flights and packages

fn map_flight(row: &SqliteRow) -> FlightRecord {
    FlightRecord {
        id: row.get("id"),
        flight_number: row.get("flight_number"),
        trip_date: row.get("trip_date"),
        scheduled_departure: row.get("scheduled_departure"),
        scheduled_arrival: row.get("scheduled_arrival"),
        actual_departure: row.get("actual_departure"),
        actual_arrival: row.get("actual_arrival"),
        status: row.get("status"),
        has_landed: row.get("has_landed"),
        notification_sent: row.get("notification_sent"),
    }
}

#[instrument(skip_all)]
pub async fn insert_flight(
    pool: &Pool,
    flight_number: &str,
    trip_date: NaiveDate,
    scheduled_departure: Option<DateTime<Utc>>,
    scheduled_arrival: Option<DateTime<Utc>>,
) -> Result<i64> {
    let ids = sqlx::query_scalar(
        "INSERT INTO flights (flight_number, trip_date, scheduled_departure, scheduled_arrival) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(flight_number)
    .bind(trip_date)
    .bind(scheduled_departure)
    .bind(scheduled_arrival)
    .fetch_all(pool)
    .await?;
    returned_id(ids, "flights")
}

#[instrument(skip_all)]
pub async fn get_flight(pool: &Pool, id: i64) -> Result<Option<FlightRecord>> {
    let rows = sqlx::query("SELECT * FROM flights WHERE id = ?")
        .bind(id)
        .fetch_all(pool)
        .await?;
    Ok(rows.first().map(map_flight))
}

/// Flights still in flight, plus landed ones whose notification is pending.
#[instrument(skip_all)]
pub async fn flights_needing_attention(pool: &Pool) -> Result<Vec<FlightForPoll>> {
    let rows = sqlx::query(
        "SELECT f.*, (SELECT COUNT(*) FROM packages p WHERE p.flight_id = f.id) AS package_count \
         FROM flights f \
         WHERE f.has_landed = 0 OR (f.has_landed = 1 AND f.notification_sent = 0) \
         ORDER BY f.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| FlightForPoll {
            flight: map_flight(row),
            package_count: row.get("package_count"),
        })
        .collect())
}

/// Persist only the fields present in `update`. `has_landed` never goes back
/// to false.
#[instrument(skip_all)]
pub async fn apply_flight_update(
    pool: &Pool,
    id: i64,
    update: &FlightUpdate,
    checked_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE flights SET \
            has_landed = MAX(has_landed, COALESCE(?, 0)), \
            status = COALESCE(?, status), \
            actual_departure = COALESCE(?, actual_departure), \
            actual_arrival = COALESCE(?, actual_arrival), \
            last_checked_at = ? \
         WHERE id = ?",
    )
    .bind(update.has_landed)
    .bind(update.status.as_deref())
    .bind(update.actual_departure)
    .bind(update.actual_arrival)
    .bind(checked_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update flight")?;
    Ok(())
}

pub async fn touch_flight_checked(pool: &Pool, id: i64, checked_at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE flights SET last_checked_at = ? WHERE id = ?")
        .bind(checked_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_flight_notified(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE flights SET notification_sent = 1 WHERE id = ? AND has_landed = 1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark flight notified")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_package(
    pool: &Pool,
    tracking_number: &str,
    customer_id: i64,
    flight_id: Option<i64>,
) -> Result<i64> {
    let ids = sqlx::query_scalar(
        "INSERT INTO packages (tracking_number, customer_id, flight_id) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(tracking_number)
    .bind(customer_id)
    .bind(flight_id)
    .fetch_all(pool)
    .await?;
    returned_id(ids, "packages")
}

/// Customers owning packages on a flight, with their tracking numbers.
#[instrument(skip_all)]
pub async fn flight_recipients(pool: &Pool, flight_id: i64) -> Result<Vec<FlightRecipient>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT customer_id, tracking_number FROM packages WHERE flight_id = ? ORDER BY customer_id, tracking_number",
    )
    .bind(flight_id)
    .fetch_all(pool)
    .await?;
    let mut grouped: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for (customer_id, tracking) in rows {
        grouped.entry(customer_id).or_default().push(tracking);
    }
    Ok(grouped
        .into_iter()
        .map(|(customer_id, tracking_numbers)| FlightRecipient {
            customer_id,
            tracking_numbers,
        })
        .collect())
}

pub async fn flight_queries_on(pool: &Pool, day: NaiveDate) -> Result<i64> {
    let n: Vec<i64> = sqlx::query_scalar("SELECT queries FROM flight_api_usage WHERE day = ?")
        .bind(day)
        .fetch_all(pool)
        .await?;
    Ok(n.into_iter().next().unwrap_or(0))
}

pub async fn record_flight_query(pool: &Pool, day: NaiveDate) -> Result<()> {
    sqlx::query(
        "INSERT INTO flight_api_usage (day, queries) VALUES (?, 1) ON CONFLICT (day) DO UPDATE SET queries = queries + 1",
    )
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// loyalty

#[instrument(skip_all)]
pub async fn insert_loyalty_transaction(
    pool: &Pool,
    customer_id: i64,
    kind: &str,
    points: i64,
    reference: Option<&str>,
) -> Result<i64> {
    let ids = sqlx::query_scalar(
        "INSERT INTO loyalty_transactions (customer_id, kind, points, reference, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(customer_id)
    .bind(kind)
    .bind(points)
    .bind(reference)
    .bind(Utc::now())
    .fetch_all(pool)
    .await?;
    returned_id(ids, "loyalty_transactions")
}

pub async fn loyalty_balance(pool: &Pool, customer_id: i64) -> Result<i64> {
    let balance: Vec<i64> = sqlx::query_scalar(
        "SELECT COALESCE(SUM(points), 0) FROM loyalty_transactions WHERE customer_id = ?",
    )
    .bind(customer_id)
    .fetch_all(pool)
    .await?;
    Ok(balance.into_iter().next().unwrap_or(0))
}

#[instrument(skip_all)]
pub async fn insert_redemption(
    pool: &Pool,
    customer_id: i64,
    points: i64,
    code: &str,
    expires_at: DateTime<Utc>,
) -> Result<i64> {
    let ids = sqlx::query_scalar(
        "INSERT INTO loyalty_redemptions (customer_id, points, code, expires_at, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(customer_id)
    .bind(points)
    .bind(code)
    .bind(expires_at)
    .bind(Utc::now())
    .fetch_all(pool)
    .await?;
    returned_id(ids, "loyalty_redemptions")
}

pub async fn get_redemption(pool: &Pool, id: i64) -> Result<Option<RedemptionRow>> {
    let rows = sqlx::query("SELECT * FROM loyalty_redemptions WHERE id = ?")
        .bind(id)
        .fetch_all(pool)
        .await?;
    Ok(rows.first().map(|row| RedemptionRow {
        id: row.get("id"),
        customer_id: row.get("customer_id"),
        points: row.get("points"),
        code: row.get("code"),
        attempts: row.get("attempts"),
        status: row.get("status"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }))
}

/// Count one verification attempt against a pending redemption, in a single
/// statement. Returns the new count, or None once the cap is reached or the
/// redemption is no longer pending.
#[instrument(skip_all)]
pub async fn claim_redemption_attempt(
    pool: &Pool,
    id: i64,
    max_attempts: i64,
) -> Result<Option<i64>> {
    let attempts: Vec<i64> = sqlx::query_scalar(
        "UPDATE loyalty_redemptions SET attempts = attempts + 1 \
         WHERE id = ? AND status = 'pending' AND attempts < ? \
         RETURNING attempts",
    )
    .bind(id)
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;
    Ok(attempts.into_iter().next())
}

pub async fn set_redemption_status(pool: &Pool, id: i64, status: &str) -> Result<()> {
    sqlx::query("UPDATE loyalty_redemptions SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Debit the points and mark the redemption verified in one transaction.
/// Returns false when the balance no longer covers the points.
#[instrument(skip_all)]
pub async fn complete_redemption(pool: &Pool, redemption: &RedemptionRow) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let balance: Vec<i64> = sqlx::query_scalar(
        "SELECT COALESCE(SUM(points), 0) FROM loyalty_transactions WHERE customer_id = ?",
    )
    .bind(redemption.customer_id)
    .fetch_all(&mut *tx)
    .await?;
    if balance.into_iter().next().unwrap_or(0) < redemption.points {
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO loyalty_transactions (customer_id, kind, points, reference, created_at) VALUES (?, 'redemption', ?, ?, ?)",
    )
    .bind(redemption.customer_id)
    .bind(-redemption.points)
    .bind(format!("redemption-{}", redemption.id))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    let res = sqlx::query(
        "UPDATE loyalty_redemptions SET status = 'verified' WHERE id = ? AND status = 'pending'",
    )
    .bind(redemption.id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        return Err(anyhow!("redemption {} is no longer pending", redemption.id));
    }
    tx.commit().await?;
    Ok(true)
}
