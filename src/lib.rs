//! Relaybox - reliable item event distribution.
//!
//! Moves item state changes from the owning service to downstream services
//! over an at-least-once broker:
//!
//! - `outbox`: transactional staging of outgoing events and the relay that drains it
//! - `bus`: broker abstraction, topology naming and the in-process channel broker
//! - `inbox`: consumer-side duplicate suppression
//! - `pipeline`: bounded retries and fault routing per delivery
//! - `remediation`: repair-and-republish of faulted events
//! - `reconcile`: catch-up resynchronisation at service start
//! - `source`, `consumers`: the owning service's item table and the downstream consumers
//! - `runtime`: wiring of both sides onto one broker

pub mod bus;
pub mod config;
pub mod consumers;
pub mod event;
pub mod inbox;
pub mod outbox;
pub mod pipeline;
pub mod reconcile;
pub mod remediation;
pub mod runtime;
pub mod shutdown;
pub mod source;
pub mod storage;
pub mod utils;
