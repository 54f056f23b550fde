//! Batch passes over the notification log: queue, prepare, execute, retry
//! and clear.
//!
//! Each pass walks the entries of one batch sequentially. A failure on one
//! entry is recorded on that entry (or logged, for storage errors) and the
//! pass moves on; nothing here fails fast except loading the batch itself.
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::db::{NotificationStore, StatusUpdate, UpsertOutcome};
use crate::model::{
    BatchCounts, LogEvent, LogStatus, MessageKind, NewLogEntry, NotificationLogEntry, ParamBag,
    Recipient,
};
use crate::phone::PhoneNormalizer;
use crate::template::{
    self, TemplateBuilder, TemplateError, TemplateKind, PARAM_HEADER_IMAGE, PARAM_NAME,
};
use crate::whatsapp::{MessageBody, MessagingService, OutgoingMessage};

pub mod policy;

pub use policy::{next_step, BatchTally, NextStep};

/// Prefix stored on entries that failed again during a retry pass.
pub const RETRY_ERROR_PREFIX: &str = "[reintento] ";

/// What to send: a registered template or free-form copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSpec {
    Template {
        template: TemplateKind,
        #[serde(default)]
        params: ParamBag,
    },
    /// `{nombre}` in the body is replaced with the recipient name.
    Text { body: String },
    Image {
        link: String,
        #[serde(default)]
        caption: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientParams {
    pub recipient_id: i64,
    #[serde(default)]
    pub params: ParamBag,
}

impl RecipientParams {
    pub fn new(recipient_id: i64) -> Self {
        Self {
            recipient_id,
            params: ParamBag::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueRequest {
    pub message: MessageSpec,
    pub recipients: Vec<RecipientParams>,
}

/// Explicit recipients need `message`; pending entries carry their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareRequest {
    #[serde(default)]
    pub message: Option<MessageSpec>,
    #[serde(default)]
    pub recipients: Vec<RecipientParams>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Rejected {
    pub recipient_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueSummary {
    pub queued: u32,
    pub already_present: u32,
    pub rejected: Vec<Rejected>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PrepareSummary {
    pub prepared: u32,
    pub skipped_sent: u32,
    /// Recipients whose row could not be written. They are also listed in
    /// `rejected`.
    pub storage_errors: u32,
    pub rejected: Vec<Rejected>,
}

pub struct Orchestrator {
    store: Arc<dyn NotificationStore>,
    messenger: Arc<dyn MessagingService>,
    normalizer: PhoneNormalizer,
    builder: TemplateBuilder,
    fallback_template: Option<String>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        messenger: Arc<dyn MessagingService>,
        normalizer: PhoneNormalizer,
        builder: TemplateBuilder,
        fallback_template: Option<String>,
    ) -> Self {
        Self {
            store,
            messenger,
            normalizer,
            builder,
            fallback_template: fallback_template.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Record `pending` entries without rendering anything. Existing entries
    /// for the same recipient are left alone.
    #[instrument(skip_all, fields(batch = batch_id))]
    pub async fn queue(&self, batch_id: &str, request: &QueueRequest) -> Result<QueueSummary> {
        let mut summary = QueueSummary::default();
        for target in &request.recipients {
            let recipient = match self.store.find_recipient(target.recipient_id).await? {
                Some(r) => r,
                None => {
                    summary.rejected.push(Rejected {
                        recipient_id: target.recipient_id,
                        reason: "recipient not found".into(),
                    });
                    continue;
                }
            };
            let entry = pending_entry(batch_id, &recipient, &request.message, &target.params);
            match self.store.insert_pending(&entry).await? {
                Some(_) => summary.queued += 1,
                None => summary.already_present += 1,
            }
        }
        info!(
            queued = summary.queued,
            already_present = summary.already_present,
            rejected = summary.rejected.len(),
            "queue pass finished"
        );
        Ok(summary)
    }

    /// Render explicit recipients and the batch's pending entries into
    /// `prepared` rows. Nothing is sent. Rows that already reached `sent` are
    /// counted as skipped and left untouched.
    #[instrument(skip_all, fields(batch = batch_id))]
    pub async fn prepare(&self, batch_id: &str, request: &PrepareRequest) -> Result<PrepareSummary> {
        let mut summary = PrepareSummary::default();
        let mut seen = HashSet::new();

        for target in &request.recipients {
            seen.insert(target.recipient_id);
            let outcome = match &request.message {
                Some(spec) => self.prepare_one(batch_id, target.recipient_id, spec, &target.params).await,
                None => Err(PrepareFailure::Rejected("no message given".into())),
            };
            tally_prepare(&mut summary, target.recipient_id, outcome);
        }

        let pending = self
            .store
            .list_entries(batch_id, Some(LogStatus::Pending))
            .await
            .context("failed to load pending entries")?;
        for entry in pending {
            if !seen.insert(entry.recipient_id) {
                continue;
            }
            let outcome = match spec_from_entry(&entry) {
                Ok(spec) => {
                    self.prepare_one(batch_id, entry.recipient_id, &spec, &ParamBag::new())
                        .await
                }
                Err(err) => Err(PrepareFailure::Rejected(err.to_string())),
            };
            tally_prepare(&mut summary, entry.recipient_id, outcome);
        }

        info!(
            prepared = summary.prepared,
            skipped_sent = summary.skipped_sent,
            storage_errors = summary.storage_errors,
            rejected = summary.rejected.len(),
            "prepare pass finished"
        );
        Ok(summary)
    }

    async fn prepare_one(
        &self,
        batch_id: &str,
        recipient_id: i64,
        spec: &MessageSpec,
        extra: &ParamBag,
    ) -> Result<UpsertOutcome, PrepareFailure> {
        let recipient = self
            .store
            .find_recipient(recipient_id)
            .await
            .map_err(PrepareFailure::Store)?
            .ok_or_else(|| PrepareFailure::Rejected("recipient not found".into()))?;
        let entry = self
            .render(batch_id, &recipient, spec, extra)
            .map_err(PrepareFailure::Rejected)?;
        self.store
            .upsert_entry(&entry)
            .await
            .map_err(PrepareFailure::Store)
    }

    fn render(
        &self,
        batch_id: &str,
        recipient: &Recipient,
        spec: &MessageSpec,
        extra: &ParamBag,
    ) -> Result<NewLogEntry, String> {
        let raw_phone = recipient
            .current_phone()
            .ok_or_else(|| "recipient has no phone number".to_string())?;
        let phone = self.normalizer.normalize(raw_phone);
        let params = merged_params(recipient, spec, extra);

        let (message_kind, message_body, template_name) = match spec {
            MessageSpec::Template { template, .. } => {
                let payload = self
                    .builder
                    .build(*template, &params)
                    .map_err(|e| e.to_string())?;
                (
                    MessageKind::Template,
                    template::preview(*template, &payload),
                    Some(template.name().to_string()),
                )
            }
            MessageSpec::Text { body } => (
                MessageKind::Text,
                template::personalize(body, &recipient.name),
                None,
            ),
            MessageSpec::Image { caption, .. } => (
                MessageKind::Image,
                caption
                    .as_deref()
                    .map(|c| template::personalize(c, &recipient.name))
                    .unwrap_or_default(),
                None,
            ),
        };

        Ok(NewLogEntry {
            batch_id: batch_id.to_string(),
            recipient_id: recipient.id,
            recipient_name: recipient.name.clone(),
            recipient_phone: phone.as_international().to_string(),
            message_kind,
            message_body,
            template_name,
            template_language: self.builder.language().to_string(),
            template_params: params,
            status: LogStatus::Prepared,
        })
    }

    /// Send every `prepared` entry and record the outcome on it.
    #[instrument(skip_all, fields(batch = batch_id))]
    pub async fn execute(&self, batch_id: &str) -> Result<BatchTally> {
        let entries = self
            .store
            .list_entries(batch_id, Some(LogStatus::Prepared))
            .await
            .context("failed to load prepared entries")?;
        let mut tally = BatchTally::default();
        for entry in entries {
            if let Err(err) = entry.status.transition(LogEvent::SendSucceeded) {
                warn!(id = entry.id, %err, "entry is not ready to send; skipping");
                continue;
            }
            let outcome = self.deliver(&entry).await;
            if let Some(status) = self.record_outcome(&entry, outcome, "").await {
                tally = tally.record(status);
            }
        }
        info!(executed = tally.executed, failed = tally.failed, "execute pass finished");
        Ok(tally)
    }

    /// Reset every `failed` entry to `prepared` with a refreshed phone and
    /// send it again.
    #[instrument(skip_all, fields(batch = batch_id))]
    pub async fn retry(&self, batch_id: &str) -> Result<BatchTally> {
        let entries = self
            .store
            .list_entries(batch_id, Some(LogStatus::Failed))
            .await
            .context("failed to load failed entries")?;
        let mut tally = BatchTally::default();
        for mut entry in entries {
            let reset = match entry.status.transition(LogEvent::ResetForRetry) {
                Ok(status) => status,
                Err(err) => {
                    warn!(id = entry.id, %err, "skipping entry");
                    continue;
                }
            };
            let phone = self.refreshed_phone(&entry).await;
            if let Err(err) = self
                .store
                .update_status(entry.id, StatusUpdate::Prepared { phone: phone.clone() })
                .await
            {
                error!(?err, id = entry.id, "failed to reset entry for retry");
                continue;
            }
            entry.status = reset;
            if let Some(phone) = phone {
                entry.recipient_phone = phone;
            }
            let outcome = self.deliver(&entry).await;
            if let Some(status) = self.record_outcome(&entry, outcome, RETRY_ERROR_PREFIX).await {
                tally = tally.record(status);
            }
        }
        info!(executed = tally.executed, failed = tally.failed, "retry pass finished");
        Ok(tally)
    }

    #[instrument(skip_all, fields(batch = batch_id, status = %status))]
    pub async fn clear(&self, batch_id: &str, status: LogStatus) -> Result<u64> {
        let removed = self.store.delete_entries(batch_id, status).await?;
        info!(removed, "cleared entries");
        Ok(removed)
    }

    pub async fn counts(&self, batch_id: &str) -> Result<BatchCounts> {
        self.store.batch_counts(batch_id).await
    }

    pub async fn entries(
        &self,
        batch_id: &str,
        status: Option<LogStatus>,
    ) -> Result<Vec<NotificationLogEntry>> {
        self.store.list_entries(batch_id, status).await
    }

    async fn refreshed_phone(&self, entry: &NotificationLogEntry) -> Option<String> {
        match self.store.find_recipient(entry.recipient_id).await {
            Ok(Some(recipient)) => recipient
                .current_phone()
                .map(|raw| self.normalizer.normalize(raw).as_international().to_string()),
            Ok(None) => None,
            Err(err) => {
                warn!(?err, id = entry.id, "could not refresh phone; keeping stored number");
                None
            }
        }
    }

    /// Send one entry, falling back to the session-window template at most
    /// once. Returns the provider message id or the error to store.
    async fn deliver(&self, entry: &NotificationLogEntry) -> Result<String, String> {
        let mut message = self.outgoing(entry).map_err(|e| e.to_string())?;
        let mut fallback_available = !message.is_template() && self.fallback_template.is_some();
        loop {
            let result = self.messenger.send(&message).await;
            match next_step(&result, fallback_available) {
                NextStep::MarkSent { provider_message_id } => return Ok(provider_message_id),
                NextStep::MarkFailed { error } => return Err(error),
                NextStep::SendFallback => {
                    let Some(name) = self.fallback_template.as_deref() else {
                        return Err("fallback template not configured".into());
                    };
                    info!(id = entry.id, template = name, "session window closed; sending fallback template");
                    let body = fallback_body(entry);
                    message.body = MessageBody::Template(self.builder.fallback(
                        name,
                        &entry.recipient_name,
                        &body,
                    ));
                    fallback_available = false;
                }
            }
        }
    }

    fn outgoing(&self, entry: &NotificationLogEntry) -> Result<OutgoingMessage, TemplateError> {
        let to = self.normalizer.normalize(&entry.recipient_phone);
        let body = match entry.message_kind {
            MessageKind::Template => {
                let name = entry.template_name.as_deref().unwrap_or_default();
                let kind = TemplateKind::from_name(name)?;
                MessageBody::Template(self.builder.build(kind, &entry.template_params)?)
            }
            MessageKind::Text => MessageBody::Text(entry.message_body.clone()),
            MessageKind::Image => MessageBody::Image {
                link: entry
                    .template_params
                    .get(PARAM_HEADER_IMAGE)
                    .cloned()
                    .unwrap_or_default(),
                caption: Some(entry.message_body.clone()).filter(|c| !c.is_empty()),
            },
        };
        Ok(OutgoingMessage { to, body })
    }

    /// Store the result of a send. The new status comes from the entry
    /// lifecycle; an entry that cannot take the transition is left as it is
    /// and `None` is returned.
    async fn record_outcome(
        &self,
        entry: &NotificationLogEntry,
        outcome: Result<String, String>,
        error_prefix: &str,
    ) -> Option<LogStatus> {
        let event = if outcome.is_ok() {
            LogEvent::SendSucceeded
        } else {
            LogEvent::SendFailed
        };
        let status = match entry.status.transition(event) {
            Ok(status) => status,
            Err(err) => {
                error!(id = entry.id, %err, "refusing to record send outcome");
                return None;
            }
        };
        let update = match outcome {
            Ok(provider_message_id) => {
                info!(id = entry.id, recipient = entry.recipient_id, "sent");
                StatusUpdate::Sent {
                    provider_message_id,
                    sent_at: Utc::now(),
                }
            }
            Err(error) => {
                warn!(id = entry.id, recipient = entry.recipient_id, %error, "send failed");
                StatusUpdate::Failed {
                    error: format!("{error_prefix}{error}"),
                }
            }
        };
        if let Err(err) = self.store.update_status(entry.id, update).await {
            error!(?err, id = entry.id, %status, "failed to record send outcome");
        }
        Some(status)
    }
}

enum PrepareFailure {
    Rejected(String),
    Store(anyhow::Error),
}

fn tally_prepare(
    summary: &mut PrepareSummary,
    recipient_id: i64,
    outcome: Result<UpsertOutcome, PrepareFailure>,
) {
    match outcome {
        Ok(UpsertOutcome::Upserted(_)) => summary.prepared += 1,
        Ok(UpsertOutcome::SkippedSent) => summary.skipped_sent += 1,
        Err(PrepareFailure::Rejected(reason)) => {
            warn!(recipient_id, %reason, "recipient rejected");
            summary.rejected.push(Rejected {
                recipient_id,
                reason,
            });
        }
        Err(PrepareFailure::Store(err)) => {
            error!(?err, recipient_id, "failed to store prepared entry");
            summary.storage_errors += 1;
            summary.rejected.push(Rejected {
                recipient_id,
                reason: format!("storage error: {err:#}"),
            });
        }
    }
}

/// Message params, then per-recipient params, then defaults taken from the
/// recipient record for anything still missing.
fn merged_params(recipient: &Recipient, spec: &MessageSpec, extra: &ParamBag) -> ParamBag {
    let mut params = match spec {
        MessageSpec::Template { params, .. } => params.clone(),
        MessageSpec::Image { link, .. } => {
            ParamBag::from([(PARAM_HEADER_IMAGE.to_string(), link.clone())])
        }
        MessageSpec::Text { .. } => ParamBag::new(),
    };
    params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    params
        .entry(PARAM_NAME.to_string())
        .or_insert_with(|| recipient.name.clone());
    if let (MessageSpec::Template { template: TemplateKind::EntregaDomicilio, .. }, Some(address)) =
        (spec, recipient.address.as_ref())
    {
        params
            .entry("direccion".to_string())
            .or_insert_with(|| address.clone());
    }
    params
}

fn pending_entry(
    batch_id: &str,
    recipient: &Recipient,
    spec: &MessageSpec,
    extra: &ParamBag,
) -> NewLogEntry {
    let (message_kind, message_body, template_name) = match spec {
        MessageSpec::Template { template, .. } => {
            (MessageKind::Template, String::new(), Some(template.name().to_string()))
        }
        MessageSpec::Text { body } => (MessageKind::Text, body.clone(), None),
        MessageSpec::Image { caption, .. } => {
            (MessageKind::Image, caption.clone().unwrap_or_default(), None)
        }
    };
    let mut template_params = match spec {
        MessageSpec::Template { params, .. } => params.clone(),
        MessageSpec::Image { link, .. } => {
            ParamBag::from([(PARAM_HEADER_IMAGE.to_string(), link.clone())])
        }
        MessageSpec::Text { .. } => ParamBag::new(),
    };
    template_params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    NewLogEntry {
        batch_id: batch_id.to_string(),
        recipient_id: recipient.id,
        recipient_name: recipient.name.clone(),
        recipient_phone: recipient.current_phone().unwrap_or_default().to_string(),
        message_kind,
        message_body,
        template_name,
        template_language: String::new(),
        template_params,
        status: LogStatus::Pending,
    }
}

/// Rebuild what a pending entry asked for.
fn spec_from_entry(entry: &NotificationLogEntry) -> Result<MessageSpec, TemplateError> {
    Ok(match entry.message_kind {
        MessageKind::Template => MessageSpec::Template {
            template: TemplateKind::from_name(entry.template_name.as_deref().unwrap_or_default())?,
            params: entry.template_params.clone(),
        },
        MessageKind::Text => MessageSpec::Text {
            body: entry.message_body.clone(),
        },
        MessageKind::Image => MessageSpec::Image {
            link: entry
                .template_params
                .get(PARAM_HEADER_IMAGE)
                .cloned()
                .unwrap_or_default(),
            caption: Some(entry.message_body.clone()).filter(|c| !c.is_empty()),
        },
    })
}

fn fallback_body(entry: &NotificationLogEntry) -> String {
    match entry.message_kind {
        MessageKind::Image if entry.message_body.is_empty() => entry
            .template_params
            .get(PARAM_HEADER_IMAGE)
            .cloned()
            .unwrap_or_default(),
        _ => entry.message_body.clone(),
    }
}
