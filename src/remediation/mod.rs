//! Repair and republish of faulted events.
//!
//! The remediator consumes fault topics. A fault that a `RepairRule`
//! recognises is corrected and published again on its original event topic
//! under a new event id; anything else is dropped into the `fault_log` table
//! for an operator. The remediator never publishes to a fault topic, so a
//! repaired event that fails again cannot loop back through here on its own.
//!
//! Repaired ids are derived from the fault id. A redelivered fault therefore
//! republishes under the same id and downstream inboxes drop the copy.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{Broker, BusError, Delivery, Envelope, MessageHandler, Topology};
use crate::config::RemediationConfig;
use crate::event::{Event, EventBody, EventId, EventType};
use crate::inbox::SqliteInbox;
use crate::pipeline::ErrorKind;
use crate::storage::StorageError;

mod fault_log;

pub use fault_log::{FaultLogEntry, SqliteFaultLog};

/// Namespace for repaired event ids.
const REPAIR_NAMESPACE: Uuid = Uuid::from_u128(0x0d2a_77c4_51e8_4b93_a6f0_c3e1_84b2_59d7);

/// A delivery that exhausted its retries, as published on a fault topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    /// Message id of the fault itself.
    pub fault_id: EventId,
    /// Id of the event (or raw message) that faulted.
    pub event_id: EventId,
    /// `None` when the original body could not be decoded.
    pub event_type: Option<EventType>,
    /// The original event as JSON, or the raw body as a string.
    pub payload: serde_json::Value,
    pub exception_kind: ErrorKind,
    pub exception_message: String,
    pub consumer_group: String,
    pub attempts: u32,
    pub faulted_at: DateTime<Utc>,
}

impl FaultRecord {
    /// The original event, when the payload holds one.
    pub fn event(&self) -> Option<Event> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// A known fault and its correction.
pub trait RepairRule: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, fault: &FaultRecord) -> bool;

    /// The corrected body, or `None` if this event cannot be repaired.
    fn repair(&self, event: &Event) -> Option<EventBody>;
}

/// Replaces a model value that downstream validation rejects.
#[derive(Debug, Clone)]
pub struct ModelPlaceholderRule {
    rejected: String,
    replacement: String,
}

impl ModelPlaceholderRule {
    pub fn new(rejected: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            rejected: rejected.into(),
            replacement: replacement.into(),
        }
    }
}

impl From<&RemediationConfig> for ModelPlaceholderRule {
    fn from(config: &RemediationConfig) -> Self {
        Self::new(&config.rejected_model, &config.replacement_model)
    }
}

impl RepairRule for ModelPlaceholderRule {
    fn name(&self) -> &str {
        "model-placeholder"
    }

    fn matches(&self, fault: &FaultRecord) -> bool {
        fault.exception_kind == ErrorKind::Validation
            && fault.event_type == Some(EventType::Created)
    }

    fn repair(&self, event: &Event) -> Option<EventBody> {
        match &event.body {
            EventBody::Created(item) if item.model == self.rejected => {
                let mut item = item.clone();
                item.model = self.replacement.clone();
                Some(EventBody::Created(item))
            }
            _ => None,
        }
    }
}

/// What the remediator did with a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationDecision {
    Republished { new_event_id: EventId, rule: String },
    Dropped { reason: String },
}

impl RemediationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationDecision::Republished { .. } => "republished",
            RemediationDecision::Dropped { .. } => "dropped",
        }
    }
}

/// Errors that leave a fault unhandled (the message is redelivered).
#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("Republish failed: {0}")]
    Publish(#[from] BusError),

    #[error("Fault log write failed: {0}")]
    Storage(#[from] StorageError),
}

/// Applies repair rules to fault records.
pub struct FaultRemediator {
    rules: Vec<Box<dyn RepairRule>>,
    broker: Arc<dyn Broker>,
    topology: Topology,
    fault_log: SqliteFaultLog,
}

impl FaultRemediator {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, fault_log: SqliteFaultLog) -> Self {
        Self {
            rules: Vec::new(),
            broker,
            topology,
            fault_log,
        }
    }

    pub fn with_rule(mut self, rule: impl RepairRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Repair and republish `fault`, or log it as dropped.
    #[tracing::instrument(name = "remediation.handle", skip_all, fields(fault_id = %fault.fault_id, event_id = %fault.event_id))]
    pub async fn handle(&self, fault: &FaultRecord) -> Result<RemediationDecision, RemediationError> {
        let decision = match self.repair(fault) {
            Some((rule, repaired)) => {
                let topic = self.topology.topic(repaired.event_type());
                debug_assert!(!Topology::is_fault_topic(&topic));

                let envelope = Envelope::for_event(&topic, &repaired)?;
                self.broker.publish(envelope).await?;

                info!(
                    new_event_id = %repaired.event_id,
                    rule = %rule,
                    topic = %topic,
                    "Faulted event repaired and republished"
                );
                RemediationDecision::Republished {
                    new_event_id: repaired.event_id,
                    rule,
                }
            }
            None => {
                let reason = match fault.event() {
                    Some(_) => "no repair rule matches".to_string(),
                    None => "payload is not an event".to_string(),
                };
                warn!(
                    group = %fault.consumer_group,
                    kind = %fault.exception_kind,
                    error = %fault.exception_message,
                    reason = %reason,
                    "Fault dropped for operator review"
                );
                RemediationDecision::Dropped { reason }
            }
        };

        if let RemediationDecision::Dropped { reason } = &decision {
            self.fault_log.record(fault, reason).await?;
        }
        Ok(decision)
    }

    fn repair(&self, fault: &FaultRecord) -> Option<(String, Event)> {
        let original = fault.event()?;
        self.rules
            .iter()
            .filter(|rule| rule.matches(fault))
            .find_map(|rule| {
                rule.repair(&original).map(|body| {
                    let new_id = EventId::derived(&REPAIR_NAMESPACE, fault.fault_id.as_uuid().as_bytes());
                    (rule.name().to_string(), original.redelivered_with(new_id, body))
                })
            })
    }
}

/// Broker handler for fault topics.
///
/// Faults are de-duplicated by fault id under the remediator's own consumer
/// group before the remediator sees them.
pub struct RemediationHandler {
    remediator: Arc<FaultRemediator>,
    inbox: SqliteInbox,
    group: String,
}

impl RemediationHandler {
    pub fn new(remediator: Arc<FaultRemediator>, inbox: SqliteInbox, group: impl Into<String>) -> Self {
        Self {
            remediator,
            inbox,
            group: group.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

#[async_trait]
impl MessageHandler for RemediationHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Delivery {
        let fault: FaultRecord = match serde_json::from_slice(&envelope.body) {
            Ok(fault) => fault,
            Err(e) => {
                error!(
                    message_id = %envelope.message_id,
                    topic = %envelope.topic,
                    error = %e,
                    "Undecodable fault record discarded"
                );
                return Delivery::Ack;
            }
        };

        match self.inbox.has_processed(&self.group, envelope.message_id).await {
            Ok(true) => return Delivery::Ack,
            Ok(false) => {}
            Err(e) => {
                warn!(fault_id = %fault.fault_id, error = %e, "Inbox check failed");
                return Delivery::Nack;
            }
        }

        match self.remediator.handle(&fault).await {
            Ok(_) => match self.inbox.mark_processed(&self.group, envelope.message_id).await {
                Ok(_) => Delivery::Ack,
                Err(e) => {
                    // Redelivery republishes under the same derived id.
                    warn!(fault_id = %fault.fault_id, error = %e, "Inbox write failed");
                    Delivery::Nack
                }
            },
            Err(e) => {
                warn!(fault_id = %fault.fault_id, error = %e, "Remediation failed");
                Delivery::Nack
            }
        }
    }
}
