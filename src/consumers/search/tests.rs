use super::*;
use crate::event::now;
use crate::pipeline::ErrorKind;
use crate::storage::connect_in_memory;
use chrono::Duration;

fn item(model: &str, updated_at: DateTime<Utc>) -> ItemPayload {
    ItemPayload {
        schema_version: ITEM_SCHEMA_VERSION,
        id: Uuid::new_v4(),
        seller: "alice".to_string(),
        make: "Ford".to_string(),
        model: model.to_string(),
        year: 2020,
        color: "Red".to_string(),
        mileage: 1000,
        updated_at,
        ..Default::default()
    }
}

fn patch(item: &ItemPayload, color: &str, updated_at: DateTime<Utc>) -> ItemPatch {
    let mut patch = ItemPatch::from_payload(item);
    patch.color = color.to_string();
    patch.updated_at = updated_at;
    patch
}

async fn project(pool: &SqlitePool, projector: &SearchProjector, event: &Event) -> std::result::Result<(), HandlerError> {
    let mut tx = pool.begin().await.unwrap();
    let result = projector.project(&mut *tx, event).await;
    if result.is_ok() {
        tx.commit().await.unwrap();
    }
    result
}

#[tokio::test]
async fn test_created_then_updated() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let projector = SearchProjector::new(index.clone());
    let t0 = now();
    let created = item("GT", t0);

    project(&pool, &projector, &Event::created(created.clone())).await.unwrap();
    project(&pool, &projector, &Event::updated(patch(&created, "Blue", t0 + Duration::seconds(1))))
        .await
        .unwrap();

    let stored = index.get(created.id).await.unwrap().unwrap();
    assert_eq!(stored.color, "Blue");
    assert_eq!(stored.seller, "alice");
    assert_eq!(index.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_updated_before_created_matches_in_order_result() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let projector = SearchProjector::new(index.clone());
    let t0 = now();
    let created = item("GT", t0);
    let update = patch(&created, "Blue", t0 + Duration::seconds(1));

    project(&pool, &projector, &Event::updated(update.clone())).await.unwrap();
    let placeholder = index.row(created.id).await.unwrap().unwrap();
    assert!(placeholder.partial);
    assert!(index.get(created.id).await.unwrap().is_none());

    project(&pool, &projector, &Event::created(created.clone())).await.unwrap();

    let mut expected = created.clone();
    expected.apply_patch(&update);
    assert_eq!(index.get(created.id).await.unwrap(), Some(expected));
    assert!(!index.row(created.id).await.unwrap().unwrap().partial);
}

#[tokio::test]
async fn test_stale_update_is_ignored() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let projector = SearchProjector::new(index.clone());
    let t0 = now();
    let created = item("GT", t0);

    project(&pool, &projector, &Event::created(created.clone())).await.unwrap();
    project(&pool, &projector, &Event::updated(patch(&created, "Green", t0 - Duration::seconds(5))))
        .await
        .unwrap();

    assert_eq!(index.get(created.id).await.unwrap().unwrap().color, "Red");
}

#[tokio::test]
async fn test_removed_tombstones_and_blocks_late_created() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let projector = SearchProjector::new(index.clone());
    let created = item("GT", now());

    project(&pool, &projector, &Event::removed(created.id)).await.unwrap();
    project(&pool, &projector, &Event::created(created.clone())).await.unwrap();

    assert!(index.get(created.id).await.unwrap().is_none());
    assert!(index.row(created.id).await.unwrap().unwrap().removed);
    assert_eq!(index.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_model_is_validation_error() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let projector = SearchProjector::new(index.clone()).rejecting_model("Foo");

    let err = project(&pool, &projector, &Event::created(item("Foo", now())))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(index.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_future_schema_is_contract_error() {
    let pool = connect_in_memory().await.unwrap();
    let projector = SearchProjector::new(SearchIndex::new(pool.clone()));
    let mut future = item("GT", now());
    future.schema_version = ITEM_SCHEMA_VERSION + 1;

    let err = project(&pool, &projector, &Event::created(future)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Contract);
}

#[tokio::test]
async fn test_upsert_many_is_idempotent() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let t0 = now();
    let items = vec![item("GT", t0), item("Mustang", t0 + Duration::seconds(1))];

    assert_eq!(index.upsert_many(&items).await.unwrap(), 2);
    assert_eq!(index.upsert_many(&items).await.unwrap(), 0);
    assert_eq!(index.count().await.unwrap(), 2);
    assert_eq!(index.latest_update().await.unwrap(), Some(t0 + Duration::seconds(1)));
}

#[tokio::test]
async fn test_newer_document_replaces_older() {
    let pool = connect_in_memory().await.unwrap();
    let index = SearchIndex::new(pool.clone());
    let t0 = now();
    let old = item("GT", t0);
    let mut new = old.clone();
    new.model = "GT500".to_string();
    new.updated_at = t0 + Duration::seconds(1);

    index.upsert_many(&[new.clone()]).await.unwrap();
    assert_eq!(index.upsert_many(&[old]).await.unwrap(), 0);
    assert_eq!(index.get(new.id).await.unwrap().unwrap().model, "GT500");
}

#[tokio::test]
async fn test_empty_index_has_no_latest_update() {
    let pool = connect_in_memory().await.unwrap();
    assert_eq!(SearchIndex::new(pool).latest_update().await.unwrap(), None);
}
