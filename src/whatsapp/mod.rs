use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::phone::PhoneNumber;
use crate::secrets::WhatsAppCredentials;
use crate::template::TemplatePayload;
use crate::whatsapp::model::{ErrorEnvelope, SendMessageResp};

pub mod model;

/// Provider code for "more than 24 hours since the customer last replied".
pub const SESSION_WINDOW_ERROR_CODE: i64 = 131047;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("provider error {}: {message}", code_label(.code))]
    Provider {
        code: Option<i64>,
        message: String,
        kind: Option<String>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

fn code_label(code: &Option<i64>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
}

impl SendError {
    pub fn is_session_window(&self) -> bool {
        matches!(
            self,
            SendError::Provider {
                code: Some(SESSION_WINDOW_ERROR_CODE),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Template(TemplatePayload),
    Text(String),
    Image { link: String, caption: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: PhoneNumber,
    pub body: MessageBody,
}

impl OutgoingMessage {
    pub fn is_template(&self) -> bool {
        matches!(self.body, MessageBody::Template(_))
    }
}

#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<SendReceipt, SendError>;
}

#[derive(Clone)]
pub struct WhatsAppClient {
    http: Client,
    base_url: Url,
    api_version: String,
    credentials: WhatsAppCredentials,
}

impl fmt::Debug for WhatsAppClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppClient")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("phone_number_id", &self.credentials.phone_number_id)
            .finish_non_exhaustive()
    }
}

impl WhatsAppClient {
    pub fn new(base_url: &str, api_version: &str, credentials: WhatsAppCredentials) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("invalid WhatsApp API base URL")?;
        let http = Client::builder()
            .user_agent("parcel-notify/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_version: api_version.trim_matches('/').to_string(),
            credentials,
        })
    }

    pub fn build_request(&self, body: &Value) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!(
                "{}/{}/messages",
                self.api_version, self.credentials.phone_number_id
            ))
            .context("invalid WhatsApp endpoint")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.credentials.token))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build WhatsApp request")
    }
}

#[async_trait]
impl MessagingService for WhatsAppClient {
    async fn send(&self, message: &OutgoingMessage) -> Result<SendReceipt, SendError> {
        let body = build_message_request(message);
        let request = self
            .build_request(&body)
            .map_err(|e| SendError::Transport(format!("{e:#}")))?;
        debug!(url = %request.url(), to = %message.to, "sending WhatsApp message");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        if !status.is_success() {
            let err = match serde_json::from_str::<ErrorEnvelope>(&text) {
                Ok(envelope) => {
                    debug!(
                        subcode = ?envelope.error.error_subcode,
                        fbtrace_id = ?envelope.error.fbtrace_id,
                        "WhatsApp error details"
                    );
                    SendError::Provider {
                        code: envelope.error.code,
                        message: envelope.error.message,
                        kind: envelope.error.kind,
                    }
                }
                Err(_) => SendError::Provider {
                    code: None,
                    message: format!("HTTP {status}: {text}"),
                    kind: None,
                },
            };
            warn!(%status, to = %message.to, error = %err, "WhatsApp send failed");
            return Err(err);
        }

        parse_send_response(&text)
    }
}

/// Success requires a non-empty `messages` array; an `error` object in a 2xx
/// body still counts as a provider failure.
pub fn parse_send_response(text: &str) -> Result<SendReceipt, SendError> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(text) {
        return Err(SendError::Provider {
            code: envelope.error.code,
            message: envelope.error.message,
            kind: envelope.error.kind,
        });
    }
    let payload: SendMessageResp =
        serde_json::from_str(text).map_err(|e| SendError::InvalidResponse(e.to_string()))?;
    payload
        .messages
        .into_iter()
        .next()
        .map(|m| SendReceipt { message_id: m.id })
        .ok_or_else(|| SendError::InvalidResponse("response has no messages".into()))
}

pub fn build_message_request(message: &OutgoingMessage) -> Value {
    let to = message.to.for_api();
    match &message.body {
        MessageBody::Template(payload) => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": build_template_object(payload),
        }),
        MessageBody::Text(body) => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body },
        }),
        MessageBody::Image { link, caption } => {
            let mut image = json!({ "link": link });
            if let Some(caption) = caption.as_deref().filter(|c| !c.is_empty()) {
                image["caption"] = json!(caption);
            }
            json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "image",
                "image": image,
            })
        }
    }
}

fn build_template_object(payload: &TemplatePayload) -> Value {
    let mut components = Vec::new();
    if let Some(link) = payload.header_image.as_deref() {
        components.push(json!({
            "type": "header",
            "parameters": [ { "type": "image", "image": { "link": link } } ]
        }));
    }
    if !payload.body_parameters.is_empty() {
        let parameters: Vec<Value> = payload
            .body_parameters
            .iter()
            .map(|text| json!({ "type": "text", "text": text }))
            .collect();
        components.push(json!({ "type": "body", "parameters": parameters }));
    }
    json!({
        "name": payload.name,
        "language": { "code": payload.language },
        "components": components,
    })
}
