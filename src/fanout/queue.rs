use crate::envelope::Envelope;
use crate::types::DeviceId;
use crate::Error;
use std::collections::HashSet;
use std::fmt;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of an outbound message.
///
/// ```text
/// pending -> sending -> sent
///    |          |
///    |          v
///    |       failed -> sending (automatic retry)
///    |          |  \-> pending (re-trigger)
///    v          v
/// cancelled <---/
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// A message already `sending` cannot be cancelled.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (*self, next),
            (Pending, Sending)
                | (Pending, Cancelled)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Sending)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the recipients of a sent message have confirmed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Not sent yet, or sent and still waiting for acknowledgements.
    Pending,
    /// Every known recipient device acknowledged.
    Complete,
    /// The delivery timeout elapsed before all acknowledgements arrived.
    BestEffort,
}

#[derive(Clone, Debug)]
pub(crate) struct Outbound {
    pub(crate) envelope: Envelope,
    pub(crate) sent: bool,
}

/// One outbound message and its per-device envelopes.
///
/// Envelopes are already encrypted and committed; sending again after a
/// failure only resends the envelopes not yet accepted by the transport.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    id: String,
    status: QueueStatus,
    retry_count: u32,
    recipients: Vec<DeviceId>,
    pub(crate) outbound: Vec<Outbound>,
    acknowledged: HashSet<DeviceId>,
    pub(crate) next_attempt_at: Option<Instant>,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) last_error: Option<Error>,
}

impl QueueEntry {
    pub(crate) fn new(id: String, recipients: Vec<DeviceId>, envelopes: Vec<Envelope>) -> Self {
        Self {
            id,
            status: QueueStatus::Pending,
            retry_count: 0,
            recipients,
            outbound: envelopes
                .into_iter()
                .map(|envelope| Outbound {
                    envelope,
                    sent: false,
                })
                .collect(),
            acknowledged: HashSet::new(),
            next_attempt_at: None,
            sent_at: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> QueueStatus {
        self.status
    }

    /// Failed attempts since enqueue or the last re-trigger.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Devices whose acknowledgement completes delivery.
    pub fn recipients(&self) -> &[DeviceId] {
        &self.recipients
    }

    pub fn envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.outbound.iter().map(|outbound| &outbound.envelope)
    }

    pub fn unsent(&self) -> usize {
        self.outbound.iter().filter(|outbound| !outbound.sent).count()
    }

    pub fn is_acknowledged_by(&self, device: &str) -> bool {
        self.acknowledged.contains(device)
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Automatic retry is scheduled.
    pub fn retry_scheduled(&self) -> bool {
        self.status == QueueStatus::Failed && self.next_attempt_at.is_some()
    }

    pub(crate) fn transition(&mut self, next: QueueStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        debug!(message_id = %self.id, from = %self.status, to = %next, "queue transition");
        self.status = next;
        Ok(())
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Failed => self.next_attempt_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    pub(crate) fn record_failure(&mut self, error: Error) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error);
    }

    /// Back to a fresh retry budget.
    pub(crate) fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.last_error = None;
    }

    /// Returns false for devices that are not recipients.
    pub(crate) fn acknowledge(&mut self, device: &str) -> bool {
        if !self.recipients.iter().any(|recipient| recipient == device) {
            return false;
        }
        self.acknowledged.insert(device.to_string());
        true
    }

    pub(crate) fn all_acknowledged(&self) -> bool {
        self.recipients
            .iter()
            .all(|recipient| self.acknowledged.contains(recipient))
    }
}
