/// Concurrent access tests
///
/// Many tasks sharing one accessor: pool bounds, lazy collection creation,
/// batched deferred writes and scans over partially corrupted collections
/// Run with: cargo test --test concurrent_access_tests
use docbridge::{
    ConnectionConfig, DocumentAccessor, Entity, ID_FIELD, MemoryConnectionManager, MemoryStore,
    WriteOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: i64,
}

fn reading(value: i64) -> Reading {
    Reading {
        sensor: format!("sensor_{}", value),
        value,
    }
}

async fn open(
    store: &Arc<MemoryStore>,
    max_connections: usize,
) -> DocumentAccessor<MemoryConnectionManager> {
    let config = ConnectionConfig::new("app", "secret")
        .database("concurrent")
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10));
    let manager = MemoryConnectionManager::new(Arc::clone(store), config.clone());
    DocumentAccessor::open(manager, config).await.unwrap()
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_creates_collection_once() {
    let store = MemoryStore::new();
    store.set_latency(Some(Duration::from_millis(10)));
    let accessor = open(&store, 8).await;
    let calls_before = store.create_collection_calls();

    let num_tasks = 12;
    let barrier = Arc::new(Barrier::new(num_tasks));
    let mut handles = vec![];

    for _ in 0..num_tasks {
        let accessor = accessor.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            accessor.resource_for("hot_collection").await
        }));
    }

    for handle in handles {
        let collection = handle.await.unwrap().unwrap();
        assert_eq!(collection.name(), "hot_collection");
    }

    assert_eq!(store.create_collection_calls() - calls_before, 1);
    assert_eq!(accessor.pool_status().checked_out, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_collections_create_in_parallel() {
    let store = MemoryStore::new();
    store.set_latency(Some(Duration::from_millis(100)));
    let accessor = open(&store, 8).await;

    let started = std::time::Instant::now();
    let mut handles = vec![];
    for i in 0..6 {
        let accessor = accessor.clone();
        handles.push(tokio::spawn(async move {
            accessor.resource_for(&format!("parallel_{}", i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Serialized creation would take at least 600ms.
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(accessor.known_collections().len(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_writes_respect_pool_bounds() {
    let store = MemoryStore::new();
    store.set_latency(Some(Duration::from_millis(5)));
    let accessor = open(&store, 3).await;

    let entities: Vec<_> = (0..40).map(|i| Entity::new(reading(i))).collect();
    let actions: Vec<_> = entities
        .iter()
        .map(|entity| accessor.prepare_insert("readings", entity).unwrap())
        .collect();

    let results = accessor.execute_all(&actions).await;
    assert_eq!(results.len(), 40);
    for result in &results {
        let WriteOutcome { affected, .. } = result.as_ref().unwrap();
        assert_eq!(*affected, 1);
    }

    assert!(store.connections_opened() <= 3);
    assert_eq!(accessor.pool_status().checked_out, 0);

    let mut scanned: Vec<Entity<Reading>> = accessor.scan_all("readings").await.unwrap();
    scanned.sort_by_key(|entity| entity.item.value);
    assert_eq!(scanned.len(), 40);
    assert_eq!(scanned[39].item, reading(39));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mixed_operations_release_connections() {
    let store = MemoryStore::new();
    let accessor = open(&store, 4).await;

    let mut handles = vec![];
    for task_id in 0..8i64 {
        let accessor = accessor.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let entity = Entity::new(reading(task_id * 100 + i));
                accessor
                    .prepare_insert("mixed", &entity)
                    .unwrap()
                    .execute()
                    .await
                    .unwrap();

                let mut updated = entity.clone();
                updated.item.value += 1;
                accessor
                    .prepare_replace("mixed", &updated)
                    .unwrap()
                    .execute()
                    .await
                    .unwrap();

                let fetched: Entity<Reading> =
                    accessor.fetch_by_id("mixed", entity.id).await.unwrap().unwrap();
                assert_eq!(fetched.item.value, updated.item.value);

                if i % 2 == 0 {
                    accessor
                        .prepare_delete("mixed", &entity)
                        .unwrap()
                        .execute()
                        .await
                        .unwrap();
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let remaining: Vec<Entity<Reading>> = accessor.scan_all("mixed").await.unwrap();
    assert_eq!(remaining.len(), 40);
    assert_eq!(accessor.pool_status().checked_out, 0);
}

#[tokio::test]
async fn test_scan_skips_corrupted_record_and_logs_it() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = MemoryStore::new();
    let accessor = open(&store, 2).await;

    let valid: Vec<_> = (0..5).map(|i| Entity::new(reading(i))).collect();
    for entity in &valid {
        accessor
            .prepare_insert("sensors", entity)
            .unwrap()
            .execute()
            .await
            .unwrap();
    }

    let corrupted_id = Uuid::new_v4();
    let mut corrupted = docbridge::Document::new();
    corrupted.insert(ID_FIELD.into(), json!(corrupted_id.to_string()));
    corrupted.insert("id".into(), json!(corrupted_id));
    corrupted.insert("item".into(), json!({"sensor": "broken", "value": "not a number"}));
    store.raw_insert("concurrent", "sensors", corrupted).unwrap();

    let mut scanned: Vec<Entity<Reading>> = accessor.scan_all("sensors").await.unwrap();
    scanned.sort_by_key(|entity| entity.item.value);

    assert_eq!(scanned.len(), 5);
    let scanned_ids: Vec<_> = scanned.iter().map(|entity| entity.id).collect();
    let valid_ids: Vec<_> = valid.iter().map(|entity| entity.id).collect();
    assert_eq!(scanned_ids, valid_ids);

    let output = logs.contents();
    assert!(output.contains("skipping undecodable record"));
    assert!(output.contains(&corrupted_id.to_string()));
    assert!(output.contains("sensors"));

    // Fetching the corrupted record directly reports the decode failure.
    let err = accessor
        .fetch_by_id::<Entity<Reading>>("sensors", corrupted_id)
        .await
        .unwrap_err();
    assert!(matches!(err, docbridge::AccessorError::Decode { .. }));
    assert_eq!(accessor.pool_status().checked_out, 0);
}

#[tokio::test]
async fn test_status_reporter_logs_until_pool_dropped() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = MemoryStore::new();
    let config = ConnectionConfig::new("app", "secret")
        .database("reported")
        .status_interval(Duration::from_millis(20));
    let manager = MemoryConnectionManager::new(Arc::clone(&store), config.clone());
    let accessor = DocumentAccessor::open(manager, config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(70)).await;
    let reports = logs.contents().matches("connection pool status").count();
    assert!(reports >= 1);

    drop(accessor);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(logs.contents().matches("connection pool status").count(), reports);
}
