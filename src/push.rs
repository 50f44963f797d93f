//! Upward replication of local writes and periodic refresh of cached queries.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    access::DataAccess,
    cache::{CacheError, ParentLink, QueryCache},
    config::LoopOptions,
    daemon::spawn_periodic,
    metrics::ROWS_PUSHED,
    schema::{DIRTY, VERSION},
    store::{Clause, Row, Value, cell},
};

/// Replicated tables of `keyspace`, or `tables` when it is not empty.
fn push_targets(access: &DataAccess, keyspace: &str, tables: &[String]) -> Vec<String> {
    if !tables.is_empty() {
        return tables.to_vec();
    }
    access
        .schemas()
        .keyspace(keyspace)
        .map(|ks| {
            ks.tables
                .iter()
                .filter(|t| t.is_replicated())
                .map(|t| t.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Push every dirty version of the given tables to the parent and clear the
/// flag once the parent has stored them. An empty `tables` means every
/// replicated table of the keyspace. Returns the number of rows pushed.
pub async fn push_dirty(
    access: &DataAccess,
    parent: &dyn ParentLink,
    keyspace: &str,
    tables: &[String],
) -> Result<usize, CacheError> {
    let store = access.store();
    let mut pushed = 0;
    for table in push_targets(access, keyspace, tables) {
        let Some(schema) = access.schemas().table(keyspace, &table) else {
            continue;
        };
        let rows = store
            .select(keyspace, &table, &[Clause::new(DIRTY, true)], None)
            .await?;
        if rows.is_empty() {
            continue;
        }
        let count = rows.len();
        parent.push_rows(keyspace, &table, rows.clone()).await?;

        let mut key_columns = schema.row_key();
        key_columns.push(VERSION.to_string());
        for row in rows {
            let mut clean: Row = key_columns
                .iter()
                .map(|c| (c.clone(), cell(&row, c).clone()))
                .collect();
            clean.insert(DIRTY.into(), Value::Bool(false));
            store.insert(keyspace, &table, clean).await?;
        }
        tracing::debug!(keyspace, table = %table, rows = count, "pushed dirty rows");
        ROWS_PUSHED.inc_by(count as u64);
        pushed += count;
    }
    Ok(pushed)
}

/// Push the dirty rows of every keyspace loaded on this node.
pub async fn push_all(access: &DataAccess, parent: &dyn ParentLink) -> Result<usize, CacheError> {
    let mut pushed = 0;
    for keyspace in access.schemas().keyspaces() {
        pushed += push_dirty(access, parent, &keyspace, &[]).await?;
    }
    Ok(pushed)
}

pub fn spawn_push_daemon(
    access: Arc<DataAccess>,
    parent: Arc<dyn ParentLink>,
    loops: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("push", loops.sync_interval, loops.jitter, shutdown, move || {
        let access = access.clone();
        let parent = parent.clone();
        async move {
            if let Err(err) = push_all(&access, parent.as_ref()).await {
                tracing::warn!(%err, "push to parent failed");
            }
        }
    })
}

/// Re-fetch every live, uncovered entry of the cache.
pub fn spawn_pull_daemon(
    cache: Arc<QueryCache>,
    loops: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("pull", loops.sync_interval, loops.jitter, shutdown, move || {
        let cache = cache.clone();
        async move {
            if let Err(err) = cache.refresh(&cache.live_entries()).await {
                tracing::warn!(%err, "pull from parent failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryKey;
    use crate::schema::{CqlType, KeyspaceSchema, SchemaInfo, TableSchema, augment_keyspace};
    use crate::store::{Store, memory::MemoryStore};
    use async_trait::async_trait;
    use std::{sync::Mutex, time::Duration};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingParent {
        pushed: Mutex<Vec<(String, String, Row)>>,
        fail: bool,
    }

    #[async_trait]
    impl ParentLink for RecordingParent {
        async fn add_query_entry(&self, _key: &QueryKey) -> Result<(), CacheError> {
            Ok(())
        }

        async fn create_query_delta(
            &self,
            _key: &QueryKey,
            _parent_timestamp: Option<Uuid>,
            _caller: i32,
        ) -> Result<Option<Uuid>, CacheError> {
            Ok(None)
        }

        async fn get_delta(&self, delta_id: Uuid) -> Result<Vec<Row>, CacheError> {
            Err(CacheError::DeltaMissing(delta_id))
        }

        async fn push_rows(
            &self,
            keyspace: &str,
            table: &str,
            rows: Vec<Row>,
        ) -> Result<usize, CacheError> {
            if self.fail {
                return Err(CacheError::ParentUnavailable("down".into()));
            }
            let count = rows.len();
            let mut pushed = self.pushed.lock().unwrap();
            pushed.extend(rows.into_iter().map(|r| (keyspace.into(), table.into(), r)));
            Ok(count)
        }
    }

    async fn child_access() -> (DataAccess, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ks = augment_keyspace(&KeyspaceSchema::new(
            "app",
            vec![
                TableSchema::new("notes")
                    .partition("id", CqlType::Int)
                    .regular("body", CqlType::Text),
            ],
        ));
        store.create_keyspace(&ks).await.unwrap();
        let schemas = Arc::new(SchemaInfo::new());
        schemas.register(ks);
        let cache = Arc::new(QueryCache::new(store.clone(), None, 2, Duration::from_secs(30)));
        (DataAccess::new(store.clone(), schemas, cache, 2, false), store)
    }

    fn note(id: i64, body: &str) -> Row {
        Row::from([
            ("id".to_string(), Value::Int(id)),
            ("body".to_string(), Value::from(body)),
        ])
    }

    #[tokio::test]
    async fn pushed_rows_are_cleared_and_not_pushed_twice() {
        let (access, store) = child_access().await;
        access.insert("app", "notes", note(1, "a")).await.unwrap();
        access.insert("app", "notes", note(2, "b")).await.unwrap();
        let parent = RecordingParent::default();

        assert_eq!(push_all(&access, &parent).await.unwrap(), 2);
        let dirty = store
            .select("app", "notes", &[Clause::new(DIRTY, true)], None)
            .await
            .unwrap();
        assert!(dirty.is_empty());
        assert_eq!(store.row_count("app", "notes").await, 2);

        assert_eq!(push_all(&access, &parent).await.unwrap(), 0);
        let pushed = parent.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 2);
        assert!(pushed.iter().all(|(ks, t, _)| ks == "app" && t == "notes"));
    }

    #[tokio::test]
    async fn failed_push_keeps_rows_dirty() {
        let (access, store) = child_access().await;
        access.insert("app", "notes", note(1, "a")).await.unwrap();
        let parent = RecordingParent {
            fail: true,
            ..Default::default()
        };
        assert!(push_all(&access, &parent).await.is_err());
        let dirty = store
            .select("app", "notes", &[Clause::new(DIRTY, true)], None)
            .await
            .unwrap();
        assert_eq!(dirty.len(), 1);
    }
}
