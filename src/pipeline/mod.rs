//! Per-delivery retry and fault routing.
//!
//! A `RetryPipeline` sits between the broker and one idempotent consumer. For
//! every delivery it runs the consumer, retries failures according to their
//! `ErrorKind`, and when the budget is spent publishes a `FaultRecord` on the
//! consumer group's fault topic before acknowledging the original message.
//!
//! Error kinds:
//! - `Validation`, `Transient`: retried `retry_limit` times at a fixed
//!   interval, then faulted.
//! - `Unavailable`: the target store is down. Retried at its own interval with
//!   no budget until it recovers or shutdown is signalled; never faulted.
//! - `Contract`: the message can never be processed (malformed body, schema
//!   mismatch). Faulted after one attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{Broker, Delivery, Envelope, MessageHandler, Topology};
use crate::config::RetryConfig;
use crate::event::{now, Event, EventId};
use crate::inbox::{ConsumeOutcome, IdempotentConsumer};
use crate::remediation::FaultRecord;
use crate::shutdown::ShutdownSignal;
use crate::storage::StorageError;
use crate::utils::retry;

/// Namespace for fault message ids.
const FAULT_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_9a4d_4f0b_8e71_2d5c_0a93_f416);

/// How a handler failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The content was rejected by a business rule.
    Validation,
    /// A temporary failure unrelated to the content.
    Transient,
    /// The target store could not be reached.
    Unavailable,
    /// The message can never be processed as sent.
    Contract,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Contract => "contract",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contract, message)
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        if e.is_unavailable() {
            Self::unavailable(e.to_string())
        } else {
            Self::transient(e.to_string())
        }
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::from(e).into()
    }
}

/// Retry budget and spacing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt for `Validation` and `Transient` errors.
    pub retry_limit: u32,
    pub interval: Duration,
    pub unavailable_interval: Duration,
}

impl RetryPolicy {
    /// Delays before each bounded retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        retry::delays(retry::fixed_backoff(self.interval, self.retry_limit))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            interval: Duration::from_millis(config.interval_ms),
            unavailable_interval: Duration::from_millis(config.unavailable_interval_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Where one delivery is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Received,
    Processing,
    RetryScheduled,
    Applied,
    Faulted,
    Interrupted,
}

/// One failed attempt. Lives only for the duration of the delivery.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub event_id: EventId,
    pub attempt_number: u32,
    pub last_error: HandlerError,
}

/// Final result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The consumer applied the event.
    Applied,
    /// The event had already been processed by this group.
    Duplicate,
    /// Retries were exhausted (or skipped) and a fault record was published.
    Faulted { fault_id: EventId, attempts: u32 },
    /// Shutdown interrupted the retry loop.
    Interrupted,
    /// A fault record was due but could not be published.
    FaultUndelivered,
}

impl Outcome {
    /// Whether the broker message can be acknowledged.
    pub fn should_ack(&self) -> bool {
        matches!(
            self,
            Outcome::Applied | Outcome::Duplicate | Outcome::Faulted { .. }
        )
    }

    pub fn delivery(&self) -> Delivery {
        if self.should_ack() {
            Delivery::Ack
        } else {
            Delivery::Nack
        }
    }
}

/// What the pipeline is delivering.
enum Subject<'a> {
    Event(&'a Event),
    /// A body that did not decode.
    Unparsed { message_id: EventId, body: &'a [u8] },
}

impl Subject<'_> {
    fn event_id(&self) -> EventId {
        match self {
            Subject::Event(event) => event.event_id,
            Subject::Unparsed { message_id, .. } => *message_id,
        }
    }
}

/// Retry and fault routing around one consumer group.
pub struct RetryPipeline {
    consumer: Arc<IdempotentConsumer>,
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl RetryPipeline {
    pub fn new(
        consumer: Arc<IdempotentConsumer>,
        broker: Arc<dyn Broker>,
        policy: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            consumer,
            broker,
            policy,
            shutdown,
        }
    }

    pub fn group(&self) -> &str {
        self.consumer.group()
    }

    pub fn fault_topic(&self) -> String {
        Topology::fault_topic(self.group())
    }

    /// Deliver a broker message. Bodies that do not decode are contract faults.
    pub async fn deliver_envelope(&self, envelope: &Envelope) -> Outcome {
        match envelope.decode_event() {
            Ok(event) => self.deliver(&event).await,
            Err(e) => {
                warn!(
                    group = %self.group(),
                    message_id = %envelope.message_id,
                    error = %e,
                    "Malformed message body"
                );
                let subject = Subject::Unparsed {
                    message_id: envelope.message_id,
                    body: &envelope.body,
                };
                self.fault(&subject, HandlerError::contract(e.to_string()), 1)
                    .await
            }
        }
    }

    /// Deliver one event through the retry loop.
    #[tracing::instrument(name = "pipeline.deliver", skip_all, fields(group = %self.group(), event_id = %event.event_id))]
    pub async fn deliver(&self, event: &Event) -> Outcome {
        let mut delays = self.policy.delays();
        let mut shutdown = self.shutdown.clone();
        let mut state = ProcessingState::Received;
        let mut attempt_number = 0u32;

        loop {
            attempt_number += 1;
            transition(&mut state, ProcessingState::Processing);

            let error = match self.consumer.process(event).await {
                Ok(ConsumeOutcome::Applied) => {
                    transition(&mut state, ProcessingState::Applied);
                    return Outcome::Applied;
                }
                Ok(ConsumeOutcome::Duplicate) => {
                    transition(&mut state, ProcessingState::Applied);
                    return Outcome::Duplicate;
                }
                Err(error) => error,
            };

            let attempt = RetryAttempt {
                event_id: event.event_id,
                attempt_number,
                last_error: error,
            };

            let delay = match attempt.last_error.kind {
                ErrorKind::Contract => None,
                ErrorKind::Unavailable => Some(self.policy.unavailable_interval),
                ErrorKind::Validation | ErrorKind::Transient => delays.next(),
            };

            let Some(delay) = delay else {
                transition(&mut state, ProcessingState::Faulted);
                return self
                    .fault(&Subject::Event(event), attempt.last_error, attempt.attempt_number)
                    .await;
            };

            warn!(
                attempt = attempt.attempt_number,
                kind = %attempt.last_error.kind,
                error = %attempt.last_error.message,
                retry_in_ms = delay.as_millis() as u64,
                "Delivery failed, retrying"
            );
            transition(&mut state, ProcessingState::RetryScheduled);

            if !shutdown.sleep(delay).await {
                transition(&mut state, ProcessingState::Interrupted);
                info!(
                    attempt = attempt.attempt_number,
                    "Shutdown during retry, returning message to broker"
                );
                return Outcome::Interrupted;
            }
        }
    }

    /// Publish a fault record for `subject` on the group's fault topic.
    async fn fault(&self, subject: &Subject<'_>, error: HandlerError, attempts: u32) -> Outcome {
        let event_id = subject.event_id();
        let fault_id = self.fault_id(event_id);

        let (event_type, payload) = match subject {
            Subject::Event(event) => {
                let payload = serde_json::to_value(event).unwrap_or_else(|e| {
                    error!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to encode faulted event, fault carries no payload"
                    );
                    serde_json::Value::Null
                });
                (Some(event.event_type()), payload)
            }
            Subject::Unparsed { body, .. } => (
                None,
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
            ),
        };

        let record = FaultRecord {
            fault_id,
            event_id,
            event_type,
            payload,
            exception_kind: error.kind,
            exception_message: error.message,
            consumer_group: self.group().to_string(),
            attempts,
            faulted_at: now(),
        };

        let topic = self.fault_topic();
        let envelope = match Envelope::for_message(&topic, fault_id, &record) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Failed to encode fault record");
                return Outcome::FaultUndelivered;
            }
        };

        match self.broker.publish(envelope).await {
            Ok(()) => {
                warn!(
                    event_id = %event_id,
                    fault_id = %fault_id,
                    fault_topic = %topic,
                    kind = %record.exception_kind,
                    attempts,
                    "Delivery faulted"
                );
                Outcome::Faulted { fault_id, attempts }
            }
            Err(e) => {
                error!(
                    event_id = %event_id,
                    fault_topic = %topic,
                    error = %e,
                    "Failed to publish fault record, returning message to broker"
                );
                Outcome::FaultUndelivered
            }
        }
    }

    /// Fault ids are stable per (group, event) so a re-faulted redelivery
    /// carries the same id as the first fault.
    fn fault_id(&self, event_id: EventId) -> EventId {
        let name = format!("{}/{}", self.group(), event_id);
        EventId::derived(&FAULT_NAMESPACE, name.as_bytes())
    }
}

#[async_trait]
impl MessageHandler for RetryPipeline {
    async fn handle(&self, envelope: Arc<Envelope>) -> Delivery {
        self.deliver_envelope(&envelope).await.delivery()
    }
}

fn transition(state: &mut ProcessingState, next: ProcessingState) {
    debug!(from = ?*state, to = ?next, "Delivery state");
    *state = next;
}
