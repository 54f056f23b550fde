//! Pure decision pieces of the send loop: what to do after one send attempt,
//! and how outcomes fold into a batch summary.
use serde::Serialize;

use crate::model::LogStatus;
use crate::whatsapp::{SendError, SendReceipt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    MarkSent { provider_message_id: String },
    /// Free-form message hit the closed session window; resend as template.
    SendFallback,
    MarkFailed { error: String },
}

/// `fallback_available` is true only for a free-form message that has not
/// been retried with the fallback template yet.
pub fn next_step(result: &Result<SendReceipt, SendError>, fallback_available: bool) -> NextStep {
    match result {
        Ok(receipt) => NextStep::MarkSent {
            provider_message_id: receipt.message_id.clone(),
        },
        Err(err) if fallback_available && err.is_session_window() => NextStep::SendFallback,
        Err(err) => NextStep::MarkFailed {
            error: err.to_string(),
        },
    }
}

/// Running totals of an execute or retry pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BatchTally {
    pub executed: u32,
    pub failed: u32,
}

impl BatchTally {
    pub fn record(mut self, outcome: LogStatus) -> Self {
        match outcome {
            LogStatus::Sent => self.executed += 1,
            LogStatus::Failed => self.failed += 1,
            LogStatus::Pending | LogStatus::Prepared => {}
        }
        self
    }

    pub fn attempted(&self) -> u32 {
        self.executed + self.failed
    }
}
