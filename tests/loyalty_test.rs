use chrono::{Duration, Utc};
use parcel_notify::config;
use parcel_notify::db;
use parcel_notify::loyalty::{self, LoyaltyError};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn settings() -> config::Loyalty {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.loyalty
}

#[tokio::test]
async fn accrual_rounds_down_and_builds_balance() {
    let pool = setup_pool().await;
    let s = settings();
    let c = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None)
        .await
        .unwrap();

    let first = loyalty::accrue(&pool, &s, c, 125_999, Some("factura-1")).await.unwrap();
    assert_eq!(first.points, 125);
    assert_eq!(first.balance, 125);
    let second = loyalty::accrue(&pool, &s, c, 10_000, None).await.unwrap();
    assert_eq!(second.balance, 135);
    assert_eq!(loyalty::balance(&pool, c).await.unwrap(), 135);

    assert!(matches!(
        loyalty::accrue(&pool, &s, c, 0, None).await,
        Err(LoyaltyError::InvalidAmount)
    ));
    assert!(matches!(
        loyalty::accrue(&pool, &s, 404, 5_000, None).await,
        Err(LoyaltyError::CustomerNotFound(404))
    ));
}

#[tokio::test]
async fn redemption_request_checks_minimum_and_balance() {
    let pool = setup_pool().await;
    let s = settings();
    let c = db::insert_customer(&pool, "Ana", None, None, None).await.unwrap();
    loyalty::accrue(&pool, &s, c, 150_000, None).await.unwrap();

    assert!(matches!(
        loyalty::request_redemption(&pool, &s, c, 50, Utc::now()).await,
        Err(LoyaltyError::BelowMinimum { min: 100, requested: 50 })
    ));
    assert!(matches!(
        loyalty::request_redemption(&pool, &s, c, 200, Utc::now()).await,
        Err(LoyaltyError::InsufficientBalance { balance: 150, requested: 200 })
    ));

    let now = Utc::now();
    let req = loyalty::request_redemption(&pool, &s, c, 120, now).await.unwrap();
    assert_eq!(req.code.len(), 4);
    assert_eq!(req.expires_at, now + Duration::minutes(10));
    // Nothing is debited until the code is verified.
    assert_eq!(loyalty::balance(&pool, c).await.unwrap(), 150);
}

#[tokio::test]
async fn verification_debits_points_once() {
    let pool = setup_pool().await;
    let s = settings();
    let c = db::insert_customer(&pool, "Ana", None, None, None).await.unwrap();
    loyalty::accrue(&pool, &s, c, 150_000, None).await.unwrap();
    let now = Utc::now();
    let req = loyalty::request_redemption(&pool, &s, c, 120, now).await.unwrap();

    let wrong = if req.code == "0000" { "1111" } else { "0000" };
    assert!(matches!(
        loyalty::verify_redemption(&pool, &s, req.redemption_id, wrong, now).await,
        Err(LoyaltyError::CodeMismatch { remaining: 2 })
    ));

    let verified = loyalty::verify_redemption(&pool, &s, req.redemption_id, &req.code, now)
        .await
        .unwrap();
    assert_eq!(verified.points, 120);
    assert_eq!(verified.value, 1_200);
    assert_eq!(verified.balance, 30);

    assert!(matches!(
        loyalty::verify_redemption(&pool, &s, req.redemption_id, &req.code, now).await,
        Err(LoyaltyError::NotPending(status)) if status == "verified"
    ));
    assert_eq!(loyalty::balance(&pool, c).await.unwrap(), 30);
}

#[tokio::test]
async fn attempts_are_capped_and_codes_expire() {
    let pool = setup_pool().await;
    let s = settings();
    let c = db::insert_customer(&pool, "Ana", None, None, None).await.unwrap();
    loyalty::accrue(&pool, &s, c, 500_000, None).await.unwrap();
    let now = Utc::now();

    let req = loyalty::request_redemption(&pool, &s, c, 100, now).await.unwrap();
    let wrong = if req.code == "0000" { "1111" } else { "0000" };
    for _ in 0..s.max_code_attempts {
        let _ = loyalty::verify_redemption(&pool, &s, req.redemption_id, wrong, now).await;
    }
    assert!(matches!(
        loyalty::verify_redemption(&pool, &s, req.redemption_id, &req.code, now).await,
        Err(LoyaltyError::TooManyAttempts)
    ));

    let req = loyalty::request_redemption(&pool, &s, c, 100, now).await.unwrap();
    let later = now + Duration::minutes(11);
    assert!(matches!(
        loyalty::verify_redemption(&pool, &s, req.redemption_id, &req.code, later).await,
        Err(LoyaltyError::Expired)
    ));
    let row = db::get_redemption(&pool, req.redemption_id).await.unwrap().unwrap();
    assert_eq!(row.status, "expired");
    assert_eq!(loyalty::balance(&pool, c).await.unwrap(), 500);
}

#[tokio::test]
async fn verification_fails_when_balance_was_spent_elsewhere() {
    let pool = setup_pool().await;
    let s = settings();
    let c = db::insert_customer(&pool, "Ana", None, None, None).await.unwrap();
    loyalty::accrue(&pool, &s, c, 150_000, None).await.unwrap();
    let now = Utc::now();
    let first = loyalty::request_redemption(&pool, &s, c, 100, now).await.unwrap();
    let second = loyalty::request_redemption(&pool, &s, c, 100, now).await.unwrap();

    loyalty::verify_redemption(&pool, &s, first.redemption_id, &first.code, now)
        .await
        .unwrap();
    assert!(matches!(
        loyalty::verify_redemption(&pool, &s, second.redemption_id, &second.code, now).await,
        Err(LoyaltyError::InsufficientBalance { balance: 50, requested: 100 })
    ));
    let row = db::get_redemption(&pool, second.redemption_id).await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
}

#[tokio::test]
async fn out_of_range_code_ttl_is_an_error() {
    let pool = setup_pool().await;
    let mut s = settings();
    let c = db::insert_customer(&pool, "Ana", None, None, None).await.unwrap();
    loyalty::accrue(&pool, &s, c, 150_000, None).await.unwrap();

    s.code_ttl_minutes = i64::MAX;
    assert!(matches!(
        loyalty::request_redemption(&pool, &s, c, 100, Utc::now()).await,
        Err(LoyaltyError::Store(_))
    ));
    let mut cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.loyalty = s;
    assert!(config::validate(&cfg).is_err());
}
