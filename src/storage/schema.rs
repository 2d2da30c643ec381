//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! The tables themselves are created by the migrations in `migrations/sqlite`.

use sea_query::Iden;

/// Owning-service items table.
#[derive(Iden)]
pub enum Items {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "document"]
    Document,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    Table,
    #[iden = "seq"]
    Seq,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "entity_id"]
    EntityId,
    #[iden = "event_data"]
    EventData,
    #[iden = "state"]
    State,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "delivered_at"]
    DeliveredAt,
    #[iden = "attempts"]
    Attempts,
    #[iden = "last_error"]
    LastError,
}

/// Inbox (processed message ledger) schema.
#[derive(Iden)]
pub enum Inbox {
    Table,
    #[iden = "consumer_group"]
    ConsumerGroup,
    #[iden = "event_id"]
    EventId,
    #[iden = "processed_at"]
    ProcessedAt,
}

/// Search index schema.
#[derive(Iden)]
pub enum SearchItems {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "document"]
    Document,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "partial"]
    Partial,
    #[iden = "removed"]
    Removed,
}

/// Reconciliation watermarks schema.
#[derive(Iden)]
pub enum Watermarks {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "observed_at"]
    ObservedAt,
}

/// Dropped-fault log schema.
#[derive(Iden)]
pub enum FaultLog {
    Table,
    #[iden = "fault_id"]
    FaultId,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "consumer_group"]
    ConsumerGroup,
    #[iden = "exception_kind"]
    ExceptionKind,
    #[iden = "exception_message"]
    ExceptionMessage,
    #[iden = "payload"]
    Payload,
    #[iden = "decision"]
    Decision,
    #[iden = "recorded_at"]
    RecordedAt,
}
