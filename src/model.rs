use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Parameter bag attached to a log entry; keys are template parameter names.
pub type ParamBag = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Prepared,
    Sent,
    Failed,
}

/// Events that move a log entry through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Render,
    SendSucceeded,
    SendFailed,
    ResetForRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: LogStatus,
    pub event: LogEvent,
}

impl LogStatus {
    pub const ALL: [LogStatus; 4] = [
        LogStatus::Pending,
        LogStatus::Prepared,
        LogStatus::Sent,
        LogStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Prepared => "prepared",
            LogStatus::Sent => "sent",
            LogStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LogStatus::Pending),
            "prepared" => Some(LogStatus::Prepared),
            "sent" => Some(LogStatus::Sent),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }

    /// pending → prepared → {sent | failed}; failed → prepared on retry.
    /// Rendering a prepared or failed entry again is allowed (re-prepare).
    pub fn transition(self, event: LogEvent) -> Result<LogStatus, InvalidTransition> {
        use LogEvent::*;
        use LogStatus::*;
        match (self, event) {
            (Pending | Prepared | Failed, Render) => Ok(Prepared),
            (Prepared, SendSucceeded) => Ok(Sent),
            (Prepared, SendFailed) => Ok(Failed),
            (Failed, ResetForRetry) => Ok(Prepared),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Template,
    Text,
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Template => "template",
            MessageKind::Text => "text",
            MessageKind::Image => "image",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "template" => Some(MessageKind::Template),
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            _ => None,
        }
    }
}

/// A customer as read from the directory at prepare time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub whatsapp_number: Option<String>,
    pub address: Option<String>,
}

impl Recipient {
    /// The number to message: the WhatsApp number when set, else the phone.
    pub fn current_phone(&self) -> Option<&str> {
        self.whatsapp_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.phone.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationLogEntry {
    pub id: i64,
    pub batch_id: String,
    pub recipient_id: i64,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub message_kind: MessageKind,
    pub message_body: String,
    pub template_name: Option<String>,
    pub template_language: String,
    pub template_params: ParamBag,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Row written by the queue and prepare passes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub batch_id: String,
    pub recipient_id: i64,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub message_kind: MessageKind,
    pub message_body: String,
    pub template_name: Option<String>,
    pub template_language: String,
    pub template_params: ParamBag,
    pub status: LogStatus,
}

/// Per-status counts for one batch, derived from the log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchCounts {
    pub pending: i64,
    pub prepared: i64,
    pub sent: i64,
    pub failed: i64,
}

impl BatchCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.prepared + self.sent + self.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlightRecord {
    pub id: i64,
    pub flight_number: String,
    pub trip_date: NaiveDate,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub status: String,
    pub has_landed: bool,
    pub notification_sent: bool,
}

impl FlightRecord {
    pub fn is_terminal(&self) -> bool {
        self.has_landed && self.notification_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let s = LogStatus::Pending.transition(LogEvent::Render).unwrap();
        assert_eq!(s, LogStatus::Prepared);
        assert_eq!(s.transition(LogEvent::SendSucceeded).unwrap(), LogStatus::Sent);
        assert_eq!(s.transition(LogEvent::SendFailed).unwrap(), LogStatus::Failed);
        assert_eq!(
            LogStatus::Failed.transition(LogEvent::ResetForRetry).unwrap(),
            LogStatus::Prepared
        );
    }

    #[test]
    fn sent_is_terminal() {
        for event in [
            LogEvent::Render,
            LogEvent::SendSucceeded,
            LogEvent::SendFailed,
            LogEvent::ResetForRetry,
        ] {
            assert!(LogStatus::Sent.transition(event).is_err());
        }
        assert!(LogStatus::Pending.transition(LogEvent::SendSucceeded).is_err());
        assert!(LogStatus::Prepared.transition(LogEvent::ResetForRetry).is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in LogStatus::ALL {
            assert_eq!(LogStatus::parse_status(s.as_str()), Some(s));
        }
        assert_eq!(LogStatus::parse_status("queued"), None);
    }

    #[test]
    fn current_phone_prefers_whatsapp_number() {
        let mut r = Recipient {
            id: 1,
            name: "Ana".into(),
            phone: Some("3001112233".into()),
            whatsapp_number: Some("  ".into()),
            address: None,
        };
        assert_eq!(r.current_phone(), Some("3001112233"));
        r.whatsapp_number = Some("3109998877".into());
        assert_eq!(r.current_phone(), Some("3109998877"));
        r.phone = None;
        r.whatsapp_number = None;
        assert_eq!(r.current_phone(), None);
    }
}
