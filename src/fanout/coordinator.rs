use crate::envelope::Envelope;
use crate::fanout::{Backoff, DeliveryStatus, QueueEntry, QueueStatus, Transport};
use crate::types::DeviceId;
use crate::{Config, Error};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one [`FanoutCoordinator::process_queue`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct QueueReport {
    /// Entries whose envelopes were all accepted by the transport.
    pub sent: Vec<String>,
    /// Entries that failed and have a retry scheduled.
    pub retrying: Vec<String>,
    /// [`Error::QueueExhaustedRetries`] for every entry that gave up.
    pub exhausted: Vec<Error>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, QueueEntry>,
    /// Enqueue order.
    order: Vec<String>,
}

/// Offline queue of already-encrypted outbound messages.
///
/// The lock over the queue is never held while the transport is sending.
/// Entries being sent are in `sending` state, which neither `cancel` nor
/// `retrigger` accept, so the queue can be used concurrently.
pub struct FanoutCoordinator<T> {
    transport: Arc<T>,
    backoff: Backoff,
    max_retries: u32,
    delivery_timeout: Duration,
    state: Mutex<QueueState>,
}

impl<T: Transport> FanoutCoordinator<T> {
    pub fn new(transport: Arc<T>, config: &Config) -> Self {
        Self {
            transport,
            backoff: Backoff::from_config(config),
            max_retries: config.max_retries,
            delivery_timeout: config.delivery_timeout,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queues one envelope per recipient device under `message_id`.
    pub async fn enqueue(
        &self,
        message_id: String,
        recipients: Vec<DeviceId>,
        envelopes: Vec<Envelope>,
    ) -> Result<QueueEntry, Error> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&message_id) {
            return Err(Error::Protocol(format!("message {message_id} already queued")));
        }

        let entry = QueueEntry::new(message_id.clone(), recipients, envelopes);
        debug!(
            message_id = %message_id,
            envelopes = entry.unsent(),
            "message queued"
        );
        state.order.push(message_id.clone());
        state.entries.insert(message_id, entry.clone());
        Ok(entry)
    }

    /// Sends every due entry: pending ones and failed ones whose backoff elapsed.
    pub async fn process_queue(&self) -> Result<QueueReport, Error> {
        let claimed = self.claim_due().await;
        let mut report = QueueReport::default();
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut outcomes = Vec::with_capacity(claimed.len());
        for (message_id, envelopes) in claimed {
            let mut delivered = Vec::new();
            let mut failure = None;
            for (position, envelope) in envelopes {
                match self.transport.send(&envelope).await {
                    Ok(()) => delivered.push(position),
                    Err(error) => {
                        warn!(message_id = %message_id, envelope_id = %envelope.id, %error, "send failed");
                        failure = Some(error);
                        break;
                    }
                }
            }
            outcomes.push((message_id, delivered, failure));
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;
        for (message_id, delivered, failure) in outcomes {
            let Some(entry) = state.entries.get_mut(&message_id) else {
                continue;
            };
            for position in delivered {
                if let Some(outbound) = entry.outbound.get_mut(position) {
                    outbound.sent = true;
                }
            }

            match failure {
                None => {
                    entry.transition(QueueStatus::Sent)?;
                    entry.sent_at = Some(now);
                    entry.next_attempt_at = None;
                    info!(message_id = %message_id, "message sent");
                    report.sent.push(message_id);
                }
                Some(error) => {
                    entry.transition(QueueStatus::Failed)?;
                    let retryable = error.is_retryable();
                    entry.record_failure(error);

                    if retryable && entry.retry_count() <= self.max_retries {
                        let delay = self.backoff.delay(entry.retry_count());
                        entry.next_attempt_at = Some(now + delay);
                        debug!(
                            message_id = %message_id,
                            retry_count = entry.retry_count(),
                            delay_ms = delay.as_millis() as u64,
                            "retry scheduled"
                        );
                        report.retrying.push(message_id);
                    } else {
                        entry.next_attempt_at = None;
                        warn!(
                            message_id = %message_id,
                            retry_count = entry.retry_count(),
                            "message exhausted its retries"
                        );
                        report.exhausted.push(Error::QueueExhaustedRetries(message_id));
                    }
                }
            }
        }
        Ok(report)
    }

    async fn claim_due(&self) -> Vec<(String, Vec<(usize, Envelope)>)> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let QueueState { entries, order } = &mut *state;

        let mut claimed = Vec::new();
        for message_id in order.iter() {
            let Some(entry) = entries.get_mut(message_id) else {
                continue;
            };
            if !entry.is_due(now) || entry.transition(QueueStatus::Sending).is_err() {
                continue;
            }
            let unsent = entry
                .outbound
                .iter()
                .enumerate()
                .filter(|(_, outbound)| !outbound.sent)
                .map(|(position, outbound)| (position, outbound.envelope.clone()))
                .collect();
            claimed.push((message_id.clone(), unsent));
        }
        claimed
    }

    /// Records that `device` received the message.
    pub async fn acknowledge(&self, message_id: &str, device: &str) -> Result<DeliveryStatus, Error> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(message_id)
            .ok_or_else(|| Error::QueueEntryNotFound(message_id.to_string()))?;

        if !entry.acknowledge(device) {
            debug!(message_id, device, "acknowledgement from unknown recipient ignored");
        }
        Ok(self.status_of(entry, Instant::now()))
    }

    pub async fn delivery_status(&self, message_id: &str) -> Result<DeliveryStatus, Error> {
        let state = self.state.lock().await;
        let entry = state
            .entries
            .get(message_id)
            .ok_or_else(|| Error::QueueEntryNotFound(message_id.to_string()))?;
        Ok(self.status_of(entry, Instant::now()))
    }

    fn status_of(&self, entry: &QueueEntry, now: Instant) -> DeliveryStatus {
        let Some(sent_at) = entry.sent_at else {
            return DeliveryStatus::Pending;
        };
        if entry.all_acknowledged() {
            DeliveryStatus::Complete
        } else if now.duration_since(sent_at) >= self.delivery_timeout {
            DeliveryStatus::BestEffort
        } else {
            DeliveryStatus::Pending
        }
    }

    /// Moves a failed entry back to `pending` with a fresh retry budget.
    pub async fn retrigger(&self, message_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(message_id)
            .ok_or_else(|| Error::QueueEntryNotFound(message_id.to_string()))?;

        entry.transition(QueueStatus::Pending)?;
        entry.reset_retries();
        info!(message_id, "message re-triggered");
        Ok(())
    }

    /// Suppresses delivery of a message that is not being sent right now.
    ///
    /// Envelopes already accepted by the transport are not recalled.
    pub async fn cancel(&self, message_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(message_id)
            .ok_or_else(|| Error::QueueEntryNotFound(message_id.to_string()))?;

        entry.transition(QueueStatus::Cancelled)?;
        entry.next_attempt_at = None;
        info!(message_id, "message cancelled");
        Ok(())
    }

    pub async fn entry(&self, message_id: &str) -> Option<QueueEntry> {
        self.state.lock().await.entries.get(message_id).cloned()
    }

    /// Entries in enqueue order.
    pub async fn entries(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|message_id| state.entries.get(message_id).cloned())
            .collect()
    }

    /// Drops cancelled entries and sent entries whose delivery is settled.
    pub async fn purge_finished(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let finished: Vec<String> = state
            .entries
            .values()
            .filter(|entry| match entry.status() {
                QueueStatus::Cancelled => true,
                QueueStatus::Sent => self.status_of(entry, now) != DeliveryStatus::Pending,
                _ => false,
            })
            .map(|entry| entry.id().to_string())
            .collect();

        for message_id in &finished {
            state.entries.remove(message_id);
        }
        state.order.retain(|message_id| !finished.contains(message_id));
        finished.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Destination, Payload};
    use crate::fanout::MemoryTransport;
    use crate::group::GroupMessage;

    fn envelope(recipient: &str) -> Envelope {
        Envelope::new(
            "alice",
            Destination::Device(recipient.to_string()),
            Payload::Group(GroupMessage {
                group_id: "g".to_string(),
                channel_id: "c".to_string(),
                epoch_version: 1,
                sender_id: "alice".to_string(),
                index: 0,
                ciphertext: vec![0; 16],
            }),
            0,
        )
        .unwrap()
    }

    fn coordinator(transport: &Arc<MemoryTransport>) -> FanoutCoordinator<MemoryTransport> {
        let config = Config {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        FanoutCoordinator::new(transport.clone(), &config)
    }

    async fn enqueue(queue: &FanoutCoordinator<MemoryTransport>, id: &str) {
        queue
            .enqueue(
                id.to_string(),
                vec!["b1".to_string(), "b2".to_string()],
                vec![envelope("b1"), envelope("b2")],
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_acknowledge() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = coordinator(&transport);
        enqueue(&queue, "m1").await;

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.sent, vec!["m1"]);
        assert_eq!(transport.take_sent().unwrap().len(), 2);
        assert_eq!(queue.delivery_status("m1").await.unwrap(), DeliveryStatus::Pending);

        assert_eq!(queue.acknowledge("m1", "b1").await.unwrap(), DeliveryStatus::Pending);
        assert_eq!(queue.acknowledge("m1", "b2").await.unwrap(), DeliveryStatus::Complete);

        // Nothing due any more.
        assert_eq!(queue.process_queue().await.unwrap(), QueueReport::default());
        assert_eq!(queue.purge_finished().await, 1);
        assert!(queue.entry("m1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_delivery_becomes_best_effort() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = coordinator(&transport);
        enqueue(&queue, "m1").await;
        queue.process_queue().await.unwrap();
        queue.acknowledge("m1", "b1").await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(queue.delivery_status("m1").await.unwrap(), DeliveryStatus::Pending);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.delivery_status("m1").await.unwrap(), DeliveryStatus::BestEffort);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_exhaustion() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_online(false);
        let queue = coordinator(&transport);
        enqueue(&queue, "m1").await;

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.retrying, vec!["m1"]);
        let entry = queue.entry("m1").await.unwrap();
        assert_eq!(entry.status(), QueueStatus::Failed);
        assert_eq!(entry.retry_count(), 1);

        // Not due before the 1 s backoff elapsed.
        assert_eq!(queue.process_queue().await.unwrap(), QueueReport::default());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.process_queue().await.unwrap().retrying, vec!["m1"]);

        // Second failure doubles the delay.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.process_queue().await.unwrap(), QueueReport::default());
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = queue.process_queue().await.unwrap();
        assert_eq!(
            report.exhausted,
            vec![Error::QueueExhaustedRetries("m1".to_string())]
        );

        let entry = queue.entry("m1").await.unwrap();
        assert_eq!(entry.status(), QueueStatus::Failed);
        assert!(!entry.retry_scheduled());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(queue.process_queue().await.unwrap(), QueueReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_after_exhaustion() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_online(false);
        let queue = FanoutCoordinator::new(
            transport.clone(),
            &Config {
                max_retries: 0,
                ..Config::default()
            },
        );
        enqueue(&queue, "m1").await;
        assert_eq!(queue.process_queue().await.unwrap().exhausted.len(), 1);

        transport.set_online(true);
        queue.retrigger("m1").await.unwrap();
        let entry = queue.entry("m1").await.unwrap();
        assert_eq!((entry.status(), entry.retry_count()), (QueueStatus::Pending, 0));

        assert_eq!(queue.process_queue().await.unwrap().sent, vec!["m1"]);
        assert_eq!(
            queue.retrigger("m1").await,
            Err(Error::InvalidTransition {
                from: "sent",
                to: "pending"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rules() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = coordinator(&transport);
        enqueue(&queue, "pending").await;
        enqueue(&queue, "sent").await;

        queue.cancel("pending").await.unwrap();
        queue.process_queue().await.unwrap();
        assert_eq!(transport.take_sent().unwrap().len(), 2);
        assert_eq!(
            queue.entry("pending").await.unwrap().status(),
            QueueStatus::Cancelled
        );

        assert!(matches!(
            queue.cancel("sent").await,
            Err(Error::InvalidTransition { from: "sent", .. })
        ));
        assert_eq!(
            queue.cancel("missing").await,
            Err(Error::QueueEntryNotFound("missing".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_send_resends_only_the_rest() {
        struct FlakyTransport {
            inner: MemoryTransport,
            fail_for: std::sync::Mutex<Option<String>>,
        }

        #[async_trait::async_trait]
        impl Transport for FlakyTransport {
            async fn send(&self, envelope: &Envelope) -> Result<(), Error> {
                let fail_for = self.fail_for.lock().unwrap().clone();
                if fail_for.as_deref() == Some(envelope.id.as_str()) {
                    return Err(Error::Transport("flaky".to_string()));
                }
                self.inner.send(envelope).await
            }
        }

        let first = envelope("b1");
        let second = envelope("b2");
        let transport = Arc::new(FlakyTransport {
            inner: MemoryTransport::new(),
            fail_for: std::sync::Mutex::new(Some(second.id.clone())),
        });
        let queue = FanoutCoordinator::new(transport.clone(), &Config::default());
        queue
            .enqueue(
                "m1".to_string(),
                vec!["b1".to_string(), "b2".to_string()],
                vec![first.clone(), second.clone()],
            )
            .await
            .unwrap();

        queue.process_queue().await.unwrap();
        assert_eq!(queue.entry("m1").await.unwrap().unsent(), 1);

        *transport.fail_for.lock().unwrap() = None;
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(queue.process_queue().await.unwrap().sent, vec!["m1"]);

        let ids: Vec<String> = transport
            .inner
            .take_sent()
            .unwrap()
            .into_iter()
            .map(|envelope| envelope.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_failure_is_not_retried() {
        struct RejectingTransport;

        #[async_trait::async_trait]
        impl Transport for RejectingTransport {
            async fn send(&self, _envelope: &Envelope) -> Result<(), Error> {
                Err(Error::Protocol("rejected by relay".to_string()))
            }
        }

        let queue = FanoutCoordinator::new(Arc::new(RejectingTransport), &Config::default());
        queue
            .enqueue("m1".to_string(), vec!["b".to_string()], vec![envelope("b")])
            .await
            .unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.exhausted.len(), 1);
        assert_eq!(
            queue.entry("m1").await.unwrap().last_error(),
            Some(&Error::Protocol("rejected by relay".to_string()))
        );
    }
}
