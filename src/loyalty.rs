//! Loyalty points: accrual from purchase amounts, redemption requests with a
//! 4-digit code, and code verification.
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config;
use crate::db::{self, RedemptionRow};

pub const KIND_ACCRUAL: &str = "accrual";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_EXPIRED: &str = "expired";

#[derive(Debug, Error)]
pub enum LoyaltyError {
    #[error("customer {0} not found")]
    CustomerNotFound(i64),
    #[error("redemption {0} not found")]
    RedemptionNotFound(i64),
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("at least {min} points are required to redeem, got {requested}")]
    BelowMinimum { min: i64, requested: i64 },
    #[error("insufficient balance: {balance} points available, {requested} requested")]
    InsufficientBalance { balance: i64, requested: i64 },
    #[error("redemption is {0}")]
    NotPending(String),
    #[error("redemption code expired")]
    Expired,
    #[error("too many failed attempts")]
    TooManyAttempts,
    #[error("code does not match ({remaining} attempts left)")]
    CodeMismatch { remaining: i64 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Accrual {
    pub transaction_id: i64,
    pub points: i64,
    pub balance: i64,
}

/// A freshly created redemption. The code is only handed to the channel
/// that delivers it to the customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionRequest {
    pub redemption_id: i64,
    pub points: i64,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Verified {
    pub redemption_id: i64,
    pub points: i64,
    pub value: i64,
    pub balance: i64,
}

/// Whole points earned for a purchase amount, rounded down.
pub fn points_for_amount(amount: i64, currency_per_point: i64) -> i64 {
    if amount <= 0 || currency_per_point <= 0 {
        return 0;
    }
    amount / currency_per_point
}

pub fn redemption_value(points: i64, point_value: i64) -> i64 {
    points.saturating_mul(point_value)
}

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{:04}", rng.gen_range(0..10_000))
}

pub async fn balance(pool: &SqlitePool, customer_id: i64) -> Result<i64, LoyaltyError> {
    ensure_customer(pool, customer_id).await?;
    Ok(db::loyalty_balance(pool, customer_id).await?)
}

#[instrument(skip_all, fields(customer_id = customer_id))]
pub async fn accrue(
    pool: &SqlitePool,
    settings: &config::Loyalty,
    customer_id: i64,
    amount: i64,
    reference: Option<&str>,
) -> Result<Accrual, LoyaltyError> {
    if amount <= 0 {
        return Err(LoyaltyError::InvalidAmount);
    }
    ensure_customer(pool, customer_id).await?;
    let points = points_for_amount(amount, settings.currency_per_point);
    let transaction_id =
        db::insert_loyalty_transaction(pool, customer_id, KIND_ACCRUAL, points, reference).await?;
    let balance = db::loyalty_balance(pool, customer_id).await?;
    info!(points, balance, "points accrued");
    Ok(Accrual {
        transaction_id,
        points,
        balance,
    })
}

#[instrument(skip_all, fields(customer_id = customer_id))]
pub async fn request_redemption(
    pool: &SqlitePool,
    settings: &config::Loyalty,
    customer_id: i64,
    points: i64,
    now: DateTime<Utc>,
) -> Result<RedemptionRequest, LoyaltyError> {
    ensure_customer(pool, customer_id).await?;
    if points < settings.min_redeem_points {
        return Err(LoyaltyError::BelowMinimum {
            min: settings.min_redeem_points,
            requested: points,
        });
    }
    let balance = db::loyalty_balance(pool, customer_id).await?;
    if points > balance {
        return Err(LoyaltyError::InsufficientBalance {
            balance,
            requested: points,
        });
    }
    let code = generate_code(&mut rand::thread_rng());
    let expires_at = Duration::try_minutes(settings.code_ttl_minutes)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| anyhow!("code ttl of {} minutes is out of range", settings.code_ttl_minutes))?;
    let redemption_id = db::insert_redemption(pool, customer_id, points, &code, expires_at).await?;
    info!(redemption_id, points, "redemption requested");
    Ok(RedemptionRequest {
        redemption_id,
        points,
        code,
        expires_at,
    })
}

/// Check a code against a pending redemption and, on a match, debit the
/// points.
#[instrument(skip_all, fields(redemption_id = redemption_id))]
pub async fn verify_redemption(
    pool: &SqlitePool,
    settings: &config::Loyalty,
    redemption_id: i64,
    code: &str,
    now: DateTime<Utc>,
) -> Result<Verified, LoyaltyError> {
    let redemption = db::get_redemption(pool, redemption_id)
        .await?
        .ok_or(LoyaltyError::RedemptionNotFound(redemption_id))?;
    if redemption.status != STATUS_PENDING {
        return Err(LoyaltyError::NotPending(redemption.status));
    }
    if now >= redemption.expires_at {
        db::set_redemption_status(pool, redemption_id, STATUS_EXPIRED).await?;
        return Err(LoyaltyError::Expired);
    }
    // The attempt is counted before the code is compared, so concurrent
    // guesses never get past the cap.
    let Some(attempts) =
        db::claim_redemption_attempt(pool, redemption_id, settings.max_code_attempts).await?
    else {
        return Err(match db::get_redemption(pool, redemption_id).await? {
            Some(current) if current.status != STATUS_PENDING => {
                LoyaltyError::NotPending(current.status)
            }
            _ => LoyaltyError::TooManyAttempts,
        });
    };
    if !code_matches(&redemption, code) {
        warn!(attempts, "redemption code mismatch");
        return Err(LoyaltyError::CodeMismatch {
            remaining: (settings.max_code_attempts - attempts).max(0),
        });
    }
    if !db::complete_redemption(pool, &redemption).await? {
        let balance = db::loyalty_balance(pool, redemption.customer_id).await?;
        return Err(LoyaltyError::InsufficientBalance {
            balance,
            requested: redemption.points,
        });
    }
    let balance = db::loyalty_balance(pool, redemption.customer_id).await?;
    info!(points = redemption.points, balance, "redemption verified");
    Ok(Verified {
        redemption_id,
        points: redemption.points,
        value: redemption_value(redemption.points, settings.point_value),
        balance,
    })
}

fn code_matches(redemption: &RedemptionRow, code: &str) -> bool {
    redemption.code == code.trim()
}

async fn ensure_customer(pool: &SqlitePool, customer_id: i64) -> Result<(), LoyaltyError> {
    match db::get_customer(pool, customer_id).await? {
        Some(_) => Ok(()),
        None => Err(LoyaltyError::CustomerNotFound(customer_id)),
    }
}
