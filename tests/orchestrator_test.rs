use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parcel_notify::db::{self, SqliteStore};
use parcel_notify::model::{LogStatus, ParamBag};
use parcel_notify::orchestrator::{
    BatchTally, MessageSpec, Orchestrator, PrepareRequest, QueueRequest, RecipientParams,
};
use parcel_notify::phone::PhoneNormalizer;
use parcel_notify::template::{TemplateBuilder, TemplateKind};
use parcel_notify::whatsapp::{MessageBody, MessagingService, OutgoingMessage, SendError, SendReceipt};
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Scripted responses per destination number; unscripted sends succeed.
#[derive(Clone, Default)]
struct RecordingMessenger {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<SendReceipt, SendError>>>>>,
    calls: Arc<Mutex<Vec<OutgoingMessage>>>,
}

impl RecordingMessenger {
    async fn script(&self, to: &str, responses: Vec<Result<SendReceipt, SendError>>) {
        self.responses
            .lock()
            .await
            .insert(to.to_string(), VecDeque::from(responses));
    }

    async fn calls(&self) -> Vec<OutgoingMessage> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MessagingService for RecordingMessenger {
    async fn send(&self, message: &OutgoingMessage) -> Result<SendReceipt, SendError> {
        let mut calls = self.calls.lock().await;
        calls.push(message.clone());
        let n = calls.len();
        drop(calls);
        let mut responses = self.responses.lock().await;
        responses
            .get_mut(message.to.as_international())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(SendReceipt {
                    message_id: format!("wamid.{n}"),
                })
            })
    }
}

fn provider_error(code: i64, message: &str) -> SendError {
    SendError::Provider {
        code: Some(code),
        message: message.into(),
        kind: Some("OAuthException".into()),
    }
}

fn orchestrator(pool: &sqlx::SqlitePool, messenger: &RecordingMessenger) -> Orchestrator {
    Orchestrator::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(messenger.clone()),
        PhoneNormalizer::new("57", vec!["1".into(), "57".into()]),
        TemplateBuilder::new("es"),
        Some("notificacion_general".into()),
    )
}

fn trip_request(recipients: &[i64]) -> PrepareRequest {
    PrepareRequest {
        message: Some(MessageSpec::Template {
            template: TemplateKind::ProximosViajes,
            params: ParamBag::from([
                ("fecha_salida".to_string(), "2025-09-03".to_string()),
                ("fecha_regreso".to_string(), "2025-09-05".to_string()),
                ("fecha_limite".to_string(), "2025-09-02".to_string()),
            ]),
        }),
        recipients: recipients.iter().copied().map(RecipientParams::new).collect(),
    }
}

#[tokio::test]
async fn trip_template_renders_spanish_dates_and_normalized_phone() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let juan = db::insert_customer(&pool, "Juan Pérez", Some("3001234567"), None, None)
        .await
        .unwrap();

    let summary = orch.prepare("viaje-sep", &trip_request(&[juan])).await.unwrap();
    assert_eq!(summary.prepared, 1);
    assert!(summary.rejected.is_empty());

    let entries = orch.entries("viaje-sep", Some(LogStatus::Prepared)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].recipient_phone, "+573001234567");
    assert_eq!(entries[0].template_name.as_deref(), Some("proximos_viajes"));
    assert!(entries[0].message_body.contains("miércoles 3 de septiembre"));
    assert!(messenger.calls().await.is_empty(), "prepare must not send");

    let tally = orch.execute("viaje-sep").await.unwrap();
    assert_eq!(tally, BatchTally { executed: 1, failed: 0 });

    let calls = messenger.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].to.as_international(), "+573001234567");
    let MessageBody::Template(payload) = &calls[0].body else {
        panic!("expected template body");
    };
    assert_eq!(
        payload.body_parameters,
        vec![
            "Juan Pérez",
            "miércoles 3 de septiembre",
            "viernes 5 de septiembre",
            "martes 2 de septiembre",
        ]
    );

    let sent = orch.entries("viaje-sep", Some(LogStatus::Sent)).await.unwrap();
    assert_eq!(sent[0].provider_message_id.as_deref(), Some("wamid.1"));
    assert!(sent[0].sent_at.is_some());
}

#[tokio::test]
async fn preparing_twice_never_duplicates_or_resends() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let a = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None).await.unwrap();
    let b = db::insert_customer(&pool, "Beto", Some("3004445566"), None, None).await.unwrap();

    orch.prepare("b1", &trip_request(&[a, b])).await.unwrap();
    orch.prepare("b1", &trip_request(&[a, b])).await.unwrap();
    let counts = orch.counts("b1").await.unwrap();
    assert_eq!(counts.prepared, 2);
    assert_eq!(counts.total(), 2);

    orch.execute("b1").await.unwrap();
    let again = orch.prepare("b1", &trip_request(&[a, b])).await.unwrap();
    assert_eq!(again.prepared, 0);
    assert_eq!(again.skipped_sent, 2);
    assert_eq!(orch.execute("b1").await.unwrap(), BatchTally::default());
    assert_eq!(messenger.calls().await.len(), 2);
}

#[tokio::test]
async fn execute_continues_past_failures_and_retry_touches_only_failed() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let a = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None).await.unwrap();
    let b = db::insert_customer(&pool, "Beto", Some("3004445566"), None, None).await.unwrap();
    messenger
        .script(
            "+573001112233",
            vec![
                Err(provider_error(131026, "Message undeliverable")),
                Err(provider_error(131026, "Message undeliverable")),
            ],
        )
        .await;

    let tally = orch.execute("empty").await.unwrap();
    assert_eq!(tally, BatchTally::default());

    orch.prepare("b2", &trip_request(&[a, b])).await.unwrap();
    let tally = orch.execute("b2").await.unwrap();
    assert_eq!(tally, BatchTally { executed: 1, failed: 1 });

    let failed = orch.entries("b2", Some(LogStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].recipient_id, a);
    assert_eq!(
        failed[0].error_message.as_deref(),
        Some("provider error 131026: Message undeliverable")
    );

    let before = messenger.calls().await.len();
    let retry = orch.retry("b2").await.unwrap();
    assert_eq!(retry, BatchTally { executed: 0, failed: 1 });
    let calls = messenger.calls().await;
    assert_eq!(calls.len(), before + 1);
    assert_eq!(calls.last().unwrap().to.as_international(), "+573001112233");

    let failed = orch.entries("b2", Some(LogStatus::Failed)).await.unwrap();
    assert_eq!(
        failed[0].error_message.as_deref(),
        Some("[reintento] provider error 131026: Message undeliverable")
    );

    // Script exhausted: the next retry succeeds.
    let retry = orch.retry("b2").await.unwrap();
    assert_eq!(retry, BatchTally { executed: 1, failed: 0 });
    assert_eq!(orch.counts("b2").await.unwrap().sent, 2);
}

#[tokio::test]
async fn retry_uses_the_current_phone() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let a = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None).await.unwrap();
    messenger
        .script("+573001112233", vec![Err(provider_error(131026, "undeliverable"))])
        .await;

    orch.prepare("b3", &trip_request(&[a])).await.unwrap();
    orch.execute("b3").await.unwrap();
    db::update_customer_contact(&pool, a, Some("3001112233"), Some("3209998877"))
        .await
        .unwrap();

    let retry = orch.retry("b3").await.unwrap();
    assert_eq!(retry.executed, 1);
    let calls = messenger.calls().await;
    assert_eq!(calls.last().unwrap().to.as_international(), "+573209998877");
    let sent = orch.entries("b3", Some(LogStatus::Sent)).await.unwrap();
    assert_eq!(sent[0].recipient_phone, "+573209998877");
}

#[tokio::test]
async fn placeholder_address_rejects_recipient_without_sending() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let good = db::insert_customer(&pool, "Ana", Some("3001112233"), None, Some("Calle 10 # 43-12"))
        .await
        .unwrap();
    let bad = db::insert_customer(&pool, "Beto", Some("3004445566"), None, Some("Por confirmar"))
        .await
        .unwrap();
    let request = PrepareRequest {
        message: Some(MessageSpec::Template {
            template: TemplateKind::EntregaDomicilio,
            params: ParamBag::from([
                ("guia".to_string(), "MX-1".to_string()),
                ("fecha_entrega".to_string(), "2025-09-04".to_string()),
            ]),
        }),
        recipients: vec![RecipientParams::new(good), RecipientParams::new(bad)],
    };

    let summary = orch.prepare("entregas", &request).await.unwrap();
    assert_eq!(summary.prepared, 1);
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].recipient_id, bad);
    assert!(summary.rejected[0].reason.contains("placeholder"));

    orch.execute("entregas").await.unwrap();
    let calls = messenger.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].to.as_international(), "+573001112233");
    assert_eq!(orch.counts("entregas").await.unwrap().total(), 1);
}

#[tokio::test]
async fn closed_session_window_falls_back_to_template() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let a = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None).await.unwrap();
    messenger
        .script(
            "+573001112233",
            vec![Err(provider_error(131047, "Re-engagement message"))],
        )
        .await;

    let request = PrepareRequest {
        message: Some(MessageSpec::Text {
            body: "Hola {nombre}, tu pedido está listo".into(),
        }),
        recipients: vec![RecipientParams::new(a)],
    };
    orch.prepare("aviso", &request).await.unwrap();
    let tally = orch.execute("aviso").await.unwrap();
    assert_eq!(tally, BatchTally { executed: 1, failed: 0 });

    let calls = messenger.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].body,
        MessageBody::Text("Hola Ana, tu pedido está listo".into())
    );
    let MessageBody::Template(payload) = &calls[1].body else {
        panic!("expected fallback template");
    };
    assert_eq!(payload.name, "notificacion_general");
    assert_eq!(
        payload.body_parameters,
        vec!["Ana", "Hola Ana, tu pedido está listo"]
    );
}

#[tokio::test]
async fn session_window_on_template_is_not_retried() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let a = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None).await.unwrap();
    messenger
        .script(
            "+573001112233",
            vec![Err(provider_error(131047, "Re-engagement message"))],
        )
        .await;

    orch.prepare("b4", &trip_request(&[a])).await.unwrap();
    let tally = orch.execute("b4").await.unwrap();
    assert_eq!(tally, BatchTally { executed: 0, failed: 1 });
    assert_eq!(messenger.calls().await.len(), 1);
}

#[tokio::test]
async fn queued_entries_are_rendered_by_prepare_and_cleared_by_status() {
    let pool = setup_pool().await;
    let messenger = RecordingMessenger::default();
    let orch = orchestrator(&pool, &messenger);
    let a = db::insert_customer(&pool, "Ana", Some("3001112233"), None, None).await.unwrap();
    let nophone = db::insert_customer(&pool, "Sin Número", None, None, None).await.unwrap();

    let queue = QueueRequest {
        message: MessageSpec::Template {
            template: TemplateKind::LlegadaPaquetes,
            params: ParamBag::from([("fecha_llegada".to_string(), "2025-09-03".to_string())]),
        },
        recipients: vec![
            RecipientParams {
                recipient_id: a,
                params: ParamBag::from([("guias".to_string(), "MX-1, MX-2".to_string())]),
            },
            RecipientParams {
                recipient_id: nophone,
                params: ParamBag::from([("guias".to_string(), "MX-3".to_string())]),
            },
            RecipientParams::new(9999),
        ],
    };
    let summary = orch.queue("llegadas", &queue).await.unwrap();
    assert_eq!(summary.queued, 2);
    assert_eq!(summary.rejected.len(), 1);
    let summary = orch.queue("llegadas", &queue).await.unwrap();
    assert_eq!(summary.already_present, 2);
    assert_eq!(orch.counts("llegadas").await.unwrap().pending, 2);

    let prepared = orch.prepare("llegadas", &PrepareRequest::default()).await.unwrap();
    assert_eq!(prepared.prepared, 1);
    assert_eq!(prepared.rejected.len(), 1);
    assert_eq!(prepared.rejected[0].recipient_id, nophone);

    let entries = orch.entries("llegadas", Some(LogStatus::Prepared)).await.unwrap();
    assert!(entries[0].message_body.contains("MX-1, MX-2"));
    assert!(entries[0].message_body.contains("miércoles 3 de septiembre"));

    assert_eq!(orch.clear("llegadas", LogStatus::Pending).await.unwrap(), 1);
    let counts = orch.counts("llegadas").await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.prepared, 1);
}
