use super::*;
use crate::event::now;
use crate::shutdown::Shutdown;
use crate::storage::connect_in_memory;
use chrono::Duration as ChronoDuration;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

const NAME: &str = "search-reconciler";

/// Replays scripted responses; retryable failures once the script runs out.
struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<ItemPayload>, FetchError>>>,
    requests: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<Vec<ItemPayload>, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<Option<DateTime<Utc>>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemSource for ScriptedSource {
    async fn items_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemPayload>, FetchError> {
        self.requests.lock().unwrap().push(since);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Retryable("connection refused".into())))
    }
}

fn item(updated_at: DateTime<Utc>) -> ItemPayload {
    ItemPayload {
        id: Uuid::new_v4(),
        model: "GT".to_string(),
        updated_at,
        ..Default::default()
    }
}

fn reconciler(pool: &sqlx::SqlitePool, source: Arc<ScriptedSource>) -> Reconciler {
    Reconciler::new(
        NAME,
        source,
        SearchIndex::new(pool.clone()),
        WatermarkStore::new(pool.clone()),
        Duration::from_millis(5),
    )
}

#[tokio::test]
async fn test_applies_items_and_advances_to_newest() {
    let pool = connect_in_memory().await.unwrap();
    let t1 = now();
    let t2 = t1 + ChronoDuration::seconds(1);
    let t3 = t1 + ChronoDuration::seconds(2);
    let source = ScriptedSource::new(vec![Ok(vec![item(t2), item(t3), item(t1)])]);

    let outcome = reconciler(&pool, source.clone())
        .run(ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            count: 3,
            watermark: Some(t3)
        }
    );
    assert_eq!(source.requests(), vec![None]);
    assert_eq!(SearchIndex::new(pool.clone()).count().await.unwrap(), 3);
    assert_eq!(WatermarkStore::new(pool).get(NAME).await.unwrap(), Some(t3));
}

#[tokio::test]
async fn test_empty_response_keeps_watermark() {
    let pool = connect_in_memory().await.unwrap();
    let t = now();
    WatermarkStore::new(pool.clone()).advance(NAME, t).await.unwrap();
    let source = ScriptedSource::new(vec![Ok(vec![])]);

    let outcome = reconciler(&pool, source.clone())
        .run(ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            count: 0,
            watermark: Some(t)
        }
    );
    assert_eq!(source.requests(), vec![Some(t)]);
}

#[tokio::test]
async fn test_retryable_failures_are_retried() {
    let pool = connect_in_memory().await.unwrap();
    let source = ScriptedSource::new(vec![
        Err(FetchError::Retryable("404".into())),
        Err(FetchError::Retryable("connection refused".into())),
        Ok(vec![item(now())]),
    ]);

    let outcome = reconciler(&pool, source.clone())
        .run(ShutdownSignal::never())
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Applied { count: 1, .. }));
    assert_eq!(source.requests().len(), 3);
}

#[tokio::test]
async fn test_fatal_failure_ends_run() {
    let pool = connect_in_memory().await.unwrap();
    let source = ScriptedSource::new(vec![Err(FetchError::Fatal("upstream returned 400".into()))]);

    let result = reconciler(&pool, source.clone()).run(ShutdownSignal::never()).await;

    assert!(matches!(result, Err(ReconcileError::Fatal(_))));
    assert_eq!(source.requests().len(), 1);
    assert_eq!(WatermarkStore::new(pool).get(NAME).await.unwrap(), None);
}

#[tokio::test]
async fn test_shutdown_cancels_retry_loop() {
    let pool = connect_in_memory().await.unwrap();
    let source = ScriptedSource::new(vec![]);
    let shutdown = Shutdown::new();
    let reconciler = Arc::new(reconciler(&pool, source.clone()));

    let task = {
        let reconciler = reconciler.clone();
        let signal = shutdown.signal();
        tokio::spawn(async move { reconciler.run(signal).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.trigger();

    let outcome = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Cancelled);
    assert!(source.requests().len() > 1);
}

#[tokio::test]
async fn test_replayed_items_change_nothing() {
    let pool = connect_in_memory().await.unwrap();
    let items = vec![item(now())];
    let source = ScriptedSource::new(vec![Ok(items.clone()), Ok(items)]);
    let reconciler = reconciler(&pool, source);

    let first = reconciler.run(ShutdownSignal::never()).await.unwrap();
    let second = reconciler.run(ShutdownSignal::never()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(SearchIndex::new(pool).count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_locked_store_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = crate::config::StorageConfig {
        path: dir.path().join("search.db").to_string_lossy().to_string(),
        busy_timeout_ms: 50,
        ..Default::default()
    };
    let pool = crate::storage::connect(&config).await.unwrap();
    let other = crate::storage::connect(&config).await.unwrap();
    let t1 = now();
    let items = vec![item(t1), item(t1 + ChronoDuration::seconds(1))];
    let source = ScriptedSource::new((0..200).map(|_| Ok(items.clone())).collect());

    // Another connection holds the write lock across the first attempts.
    let mut holder = other.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        sqlx::query("COMMIT").execute(&mut *holder).await.unwrap();
    });

    let outcome = reconciler(&pool, source.clone())
        .run(ShutdownSignal::never())
        .await
        .unwrap();

    release.await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            count: 2,
            watermark: Some(t1 + ChronoDuration::seconds(1))
        }
    );
    assert!(source.requests().len() > 1);
    assert_eq!(SearchIndex::new(pool).count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_sub_microsecond_watermark_is_not_refetched() {
    let pool = connect_in_memory().await.unwrap();
    let t0 = now();
    let t3 = t0 + ChronoDuration::nanoseconds(3_000_667);
    let source = ScriptedSource::new(vec![
        Ok(vec![
            item(t0 + ChronoDuration::nanoseconds(1_000_667)),
            item(t3),
        ]),
        Ok(Vec::new()),
    ]);
    let reconciler = reconciler(&pool, source.clone());

    let first = reconciler.run(ShutdownSignal::never()).await.unwrap();
    let second = reconciler.run(ShutdownSignal::never()).await.unwrap();

    assert_eq!(
        first,
        ReconcileOutcome::Applied {
            count: 2,
            watermark: Some(t3)
        }
    );
    assert!(matches!(second, ReconcileOutcome::Applied { count: 0, .. }));
    assert_eq!(source.requests(), vec![None, Some(t3)]);
}
