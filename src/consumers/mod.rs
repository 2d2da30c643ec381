//! Downstream consumers of item events.
//!
//! - `search`: transactional projection into the search index
//! - `notification`: best-effort forwarding to a notification hub

pub mod notification;
pub mod search;

pub use notification::{ChannelHub, NotificationHub, NotificationRelay, Notice};
pub use search::{SearchIndex, SearchProjector, SearchRow};
