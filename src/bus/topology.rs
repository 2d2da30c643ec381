//! Deterministic naming of topics and consumer groups.

use crate::config::Config;
use crate::event::EventType;

/// Suffix appended to a consumer group to name its fault topic.
const FAULT_SUFFIX: &str = "fault";

/// Topic and consumer-group naming for one service.
///
/// - event topics: `<prefix>.<event type>` (`items.created`)
/// - consumer groups: `<service>-<consumer>` in kebab case (`search-item-created`)
/// - fault topics: `<group>.fault` (`search-item-created.fault`)
#[derive(Debug, Clone)]
pub struct Topology {
    service: String,
    topic_prefix: String,
}

impl Topology {
    pub fn new(service: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.service.name, &config.messaging.topic_prefix)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Topic carrying events of one type.
    pub fn topic(&self, event_type: EventType) -> String {
        format!("{}.{}", self.topic_prefix, event_type.as_str())
    }

    /// Consumer group name for a consumer of this service.
    pub fn group(&self, consumer: &str) -> String {
        kebab_case(&format!("{}-{}", self.service, consumer))
    }

    /// Consumer group of this service dedicated to one event type.
    pub fn event_group(&self, event_type: EventType) -> String {
        self.group(&format!("item-{}", event_type.as_str()))
    }

    /// Fault topic for a consumer group.
    pub fn fault_topic(group: &str) -> String {
        format!("{}.{}", group, FAULT_SUFFIX)
    }

    pub fn is_fault_topic(topic: &str) -> bool {
        topic
            .rsplit_once('.')
            .map(|(_, suffix)| suffix == FAULT_SUFFIX)
            .unwrap_or(false)
    }
}

/// `SearchItem_Created` -> `search-item-created`.
fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c == '_' || c == ' ' || c == '-' {
            if !out.ends_with('-') && !out.is_empty() {
                out.push('-');
            }
            prev_lower = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower && !out.ends_with('-') {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out.trim_end_matches('-').to_string()
}
