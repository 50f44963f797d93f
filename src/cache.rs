//! Query cache of a child node.
//!
//! Every distinct `(keyspace, table, clauses, limit)` read at this node gets a
//! [`QueryCacheEntry`]. Before the read is served locally the entry is made
//! ready by pulling a delta from the parent. Concurrent readers of the same
//! query share one entry and wait on its state lock, so at most one fetch per
//! entry is in flight.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future::try_join_all;
use uuid::Uuid;

use crate::{
    delta::{apply_rows, high_water_mark},
    metrics::{CACHE_ENTRIES, DELTA_FETCHES, DELTA_ROWS_APPLIED},
    store::{Clause, Row, Store, StoreError},
};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("parent node unavailable: {0}")]
    ParentUnavailable(String),
    #[error("parent rejected request: {0}")]
    Rejected(String),
    #[error("delta {0} is no longer available")]
    DeltaMissing(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Identity of a cached query. Clauses are kept sorted so that the same
/// predicate written in a different order maps to the same entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub keyspace: String,
    pub table: String,
    pub clauses: Vec<Clause>,
    pub limit: Option<usize>,
}

impl QueryKey {
    pub fn new(keyspace: &str, table: &str, clauses: &[Clause], limit: Option<usize>) -> Self {
        let mut clauses = clauses.to_vec();
        clauses.sort();
        clauses.dedup();
        Self {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            clauses,
            limit,
        }
    }

    /// Canonical text form of the clause set.
    pub fn serialized_clauses(&self) -> String {
        serde_json::to_string(&self.clauses).unwrap_or_default()
    }

    /// True when every row this query can return is also returned by
    /// `other`.
    fn is_covered_by(&self, other: &QueryKey) -> bool {
        other.keyspace == self.keyspace
            && other.table == self.table
            && other.limit.is_none()
            && other.clauses.iter().all(|c| self.clauses.contains(c))
    }
}

/// Replication state of an entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryState {
    /// `None` until the entry's first fetch decided it.
    pub is_covered: Option<bool>,
    /// Highest parent arrival stamp received for this query.
    pub parent_timestamp: Option<Uuid>,
    pub ready: bool,
}

pub struct QueryCacheEntry {
    key: QueryKey,
    state: tokio::sync::Mutex<EntryState>,
    ready: AtomicBool,
    last_access: Mutex<Instant>,
}

impl QueryCacheEntry {
    fn new(key: QueryKey) -> Self {
        Self {
            key,
            state: tokio::sync::Mutex::new(EntryState::default()),
            ready: AtomicBool::new(false),
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub async fn state(&self) -> EntryState {
        self.state.lock().await.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_access.lock() {
            *at = Instant::now();
        }
    }

    fn idle(&self) -> Duration {
        self.last_access
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn mark_ready(&self, state: &mut EntryState) {
        state.ready = true;
        self.ready.store(true, Ordering::Release);
    }
}

/// Calls a child makes on its parent to replicate a query.
#[async_trait]
pub trait ParentLink: Send + Sync {
    /// Make the parent register (and itself replicate) the query.
    async fn add_query_entry(&self, key: &QueryKey) -> Result<(), CacheError>;

    /// Ask for the rows of `key` that arrived after `parent_timestamp`.
    async fn create_query_delta(
        &self,
        key: &QueryKey,
        parent_timestamp: Option<Uuid>,
        caller: i32,
    ) -> Result<Option<Uuid>, CacheError>;

    async fn get_delta(&self, delta_id: Uuid) -> Result<Vec<Row>, CacheError>;

    /// Hand dirty row versions to the parent. Returns how many it stored.
    async fn push_rows(
        &self,
        keyspace: &str,
        table: &str,
        rows: Vec<Row>,
    ) -> Result<usize, CacheError>;
}

/// Query cache of one node. The root has no parent link; its entries are
/// complete the moment they are created.
pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, Arc<QueryCacheEntry>>>,
    store: Arc<dyn Store>,
    parent: Option<Arc<dyn ParentLink>>,
    node_id: i32,
    leases: RwLock<HashMap<String, Duration>>,
    default_lease: Duration,
}

impl QueryCache {
    pub fn new(
        store: Arc<dyn Store>,
        parent: Option<Arc<dyn ParentLink>>,
        node_id: i32,
        default_lease: Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
            parent,
            node_id,
            leases: RwLock::new(HashMap::new()),
            default_lease,
        }
    }

    /// Set the idle time after which an entry of `keyspace` is refreshed
    /// before it is used again.
    pub fn set_lease(&self, keyspace: &str, lease: Duration) {
        if let Ok(mut leases) = self.leases.write() {
            leases.insert(keyspace.to_string(), lease);
        }
    }

    fn lease(&self, keyspace: &str) -> Duration {
        self.leases
            .read()
            .ok()
            .and_then(|l| l.get(keyspace).copied())
            .unwrap_or(self.default_lease)
    }

    /// Look up or create the entry for a query and make sure it is ready.
    pub async fn update_cache(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Arc<QueryCacheEntry>, CacheError> {
        let key = QueryKey::new(keyspace, table, clauses, limit);
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| CacheError::Rejected("query cache poisoned".into()))?;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(QueryCacheEntry::new(key.clone())))
                .clone();
            CACHE_ENTRIES.set(entries.len() as i64);
            entry
        };

        self.make_ready(&entry).await?;
        // the lease runs from the end of the read
        entry.touch();
        Ok(entry)
    }

    async fn make_ready(&self, entry: &QueryCacheEntry) -> Result<(), CacheError> {
        let key = &entry.key;
        let mut state = entry.state.lock().await;
        // expiry is decided and reset under the state lock: callers queued
        // behind a refetch find the entry fresh
        let expired = state.ready && entry.idle() > self.lease(&key.keyspace);
        entry.touch();
        if state.ready && !expired {
            return Ok(());
        }

        let Some(parent) = &self.parent else {
            state.is_covered = Some(true);
            entry.mark_ready(&mut state);
            return Ok(());
        };

        if state.is_covered.is_none() && self.find_cover(key).is_some() {
            tracing::debug!(keyspace = %key.keyspace, table = %key.table, "query covered by an existing entry");
            state.is_covered = Some(true);
            entry.mark_ready(&mut state);
            return Ok(());
        }
        if state.is_covered == Some(true) {
            // the covering entry does the fetching
            if let Some(cover) = self.find_cover(key) {
                let mut cover_state = cover.state.lock().await;
                self.fetch_locked(parent.as_ref(), &cover, &mut cover_state)
                    .await?;
            }
            entry.mark_ready(&mut state);
            return Ok(());
        }

        self.fetch_locked(parent.as_ref(), entry, &mut state).await?;
        Ok(())
    }

    fn find_cover(&self, key: &QueryKey) -> Option<Arc<QueryCacheEntry>> {
        let entries = self.entries.lock().ok()?;
        entries
            .values()
            .find(|e| e.key != *key && e.is_ready() && key.is_covered_by(&e.key))
            .cloned()
    }

    /// Pull the parent's delta for `entry`, waiting for any fetch already in
    /// progress on it.
    pub async fn fetch_delta(&self, entry: &QueryCacheEntry) -> Result<usize, CacheError> {
        let Some(parent) = &self.parent else {
            return Ok(0);
        };
        let mut state = entry.state.lock().await;
        self.fetch_locked(parent.as_ref(), entry, &mut state).await
    }

    async fn fetch_locked(
        &self,
        parent: &dyn ParentLink,
        entry: &QueryCacheEntry,
        state: &mut EntryState,
    ) -> Result<usize, CacheError> {
        let key = &entry.key;
        parent.add_query_entry(key).await?;
        DELTA_FETCHES.inc();
        let delta = parent
            .create_query_delta(key, state.parent_timestamp, self.node_id)
            .await?;
        let mut applied = 0;
        if let Some(delta_id) = delta {
            let rows = parent.get_delta(delta_id).await?;
            let high_water = high_water_mark(&rows);
            applied = apply_rows(self.store.as_ref(), &key.keyspace, &key.table, rows, false)
                .await?;
            DELTA_ROWS_APPLIED.inc_by(applied as u64);
            if high_water > state.parent_timestamp {
                state.parent_timestamp = high_water;
            }
            tracing::debug!(
                keyspace = %key.keyspace,
                table = %key.table,
                clauses = %key.serialized_clauses(),
                applied,
                "applied delta from parent"
            );
        }
        if state.is_covered.is_none() {
            state.is_covered = Some(false);
        }
        entry.mark_ready(state);
        Ok(applied)
    }

    /// Every entry currently cached.
    pub fn entries(&self) -> Vec<Arc<QueryCacheEntry>> {
        self.entries
            .lock()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries used within their keyspace's lease.
    pub fn live_entries(&self) -> Vec<Arc<QueryCacheEntry>> {
        self.entries()
            .into_iter()
            .filter(|e| e.idle() <= self.lease(&e.key.keyspace))
            .collect()
    }

    /// Entries of a keyspace, optionally restricted to a set of tables.
    pub fn entries_for(&self, keyspace: &str, tables: &[String]) -> Vec<Arc<QueryCacheEntry>> {
        self.entries()
            .into_iter()
            .filter(|e| {
                e.key.keyspace == keyspace && (tables.is_empty() || tables.contains(&e.key.table))
            })
            .collect()
    }

    /// Re-fetch every ready entry that is not covered by another.
    /// Returns the number of rows applied.
    pub async fn refresh(&self, entries: &[Arc<QueryCacheEntry>]) -> Result<usize, CacheError> {
        let mut fetches = Vec::new();
        for entry in entries {
            if !entry.is_ready() {
                continue;
            }
            if entry.state.lock().await.is_covered == Some(true) {
                continue;
            }
            fetches.push(self.fetch_delta(entry));
        }
        Ok(try_join_all(fetches).await?.into_iter().sum())
    }

    /// Forget every entry of a keyspace.
    pub fn remove_keyspace(&self, keyspace: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|k, _| k.keyspace != keyspace);
            CACHE_ENTRIES.set(entries.len() as i64);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        CqlType, DELETED, DIRTY, KeyspaceSchema, NODE, PARENT_TIMESTAMP, TableSchema, VERSION,
        augment_table,
    };
    use crate::store::{Value, cell, memory::MemoryStore};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingParent {
        adds: AtomicUsize,
        deltas: AtomicUsize,
        rows: Mutex<Vec<Row>>,
        seen_timestamps: Mutex<Vec<Option<Uuid>>>,
    }

    #[async_trait]
    impl ParentLink for CountingParent {
        async fn add_query_entry(&self, _key: &QueryKey) -> Result<(), CacheError> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }

        async fn create_query_delta(
            &self,
            _key: &QueryKey,
            parent_timestamp: Option<Uuid>,
            _caller: i32,
        ) -> Result<Option<Uuid>, CacheError> {
            self.deltas.fetch_add(1, Ordering::SeqCst);
            self.seen_timestamps.lock().unwrap().push(parent_timestamp);
            if self.rows.lock().unwrap().is_empty() {
                Ok(None)
            } else {
                Ok(Some(Uuid::new_v4()))
            }
        }

        async fn get_delta(&self, _delta_id: Uuid) -> Result<Vec<Row>, CacheError> {
            Ok(std::mem::take(&mut *self.rows.lock().unwrap()))
        }

        async fn push_rows(
            &self,
            _keyspace: &str,
            _table: &str,
            rows: Vec<Row>,
        ) -> Result<usize, CacheError> {
            Ok(rows.len())
        }
    }

    fn schema() -> TableSchema {
        augment_table(
            &TableSchema::new("t")
                .partition("id", CqlType::Text)
                .regular("v", CqlType::Int),
        )
    }

    fn parent_row(id: &str) -> Row {
        Row::from([
            ("id".to_string(), Value::from(id)),
            ("v".to_string(), Value::Int(1)),
            (VERSION.to_string(), Value::Uuid(Uuid::now_v7())),
            (PARENT_TIMESTAMP.to_string(), Value::Uuid(Uuid::now_v7())),
            (DIRTY.to_string(), Value::Bool(false)),
            (DELETED.to_string(), Value::Bool(false)),
            (NODE.to_string(), Value::Int(1)),
        ])
    }

    async fn cache_with(parent: Option<Arc<CountingParent>>) -> (Arc<QueryCache>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_keyspace(&KeyspaceSchema::new("ks", vec![schema()]))
            .await
            .unwrap();
        let parent = parent.map(|p| p as Arc<dyn ParentLink>);
        let cache = QueryCache::new(store.clone(), parent, 2, Duration::from_secs(60));
        (Arc::new(cache), store)
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_fetch() {
        let parent = Arc::new(CountingParent::default());
        let (cache, _) = cache_with(Some(parent.clone())).await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .update_cache("ks", "t", &[Clause::new("id", "a")], None)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ready());
        }
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fetch_applies_rows_and_advances_high_water_mark() {
        let parent = Arc::new(CountingParent::default());
        let row = parent_row("a");
        let sent_ts = cell(&row, PARENT_TIMESTAMP).as_uuid();
        parent.rows.lock().unwrap().push(row);
        let (cache, store) = cache_with(Some(parent.clone())).await;

        let entry = cache.update_cache("ks", "t", &[], None).await.unwrap();
        assert_eq!(store.row_count("ks", "t").await, 1);
        let state = entry.state().await;
        assert_eq!(state.parent_timestamp, sent_ts);
        assert_eq!(state.is_covered, Some(false));

        cache.fetch_delta(&entry).await.unwrap();
        let seen = parent.seen_timestamps.lock().unwrap().clone();
        assert_eq!(seen, vec![None, sent_ts]);
    }

    #[tokio::test]
    async fn narrower_query_is_covered_by_ready_unlimited_entry() {
        let parent = Arc::new(CountingParent::default());
        let (cache, _) = cache_with(Some(parent.clone())).await;
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        let narrow = cache
            .update_cache("ks", "t", &[Clause::new("id", "a")], Some(5))
            .await
            .unwrap();
        assert_eq!(narrow.state().await.is_covered, Some(true));
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 1);

        // covered entries are skipped by a refresh
        cache.refresh(&cache.entries()).await.unwrap();
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn limited_entry_does_not_cover() {
        let parent = Arc::new(CountingParent::default());
        let (cache, _) = cache_with(Some(parent.clone())).await;
        cache.update_cache("ks", "t", &[], Some(3)).await.unwrap();
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn root_entries_are_ready_without_fetching() {
        let (cache, _) = cache_with(None).await;
        let entry = cache.update_cache("ks", "t", &[], None).await.unwrap();
        let state = entry.state().await;
        assert!(state.ready);
        assert_eq!(state.is_covered, Some(true));
    }

    #[tokio::test]
    async fn expired_entry_is_refetched_on_next_use() {
        let parent = Arc::new(CountingParent::default());
        let (cache, _) = cache_with(Some(parent.clone())).await;
        cache.set_lease("ks", Duration::from_millis(100));
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn expired_entry_is_refetched_once_by_parallel_readers() {
        let parent = Arc::new(CountingParent::default());
        let (cache, _) = cache_with(Some(parent.clone())).await;
        cache.set_lease("ks", Duration::from_millis(100));
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.update_cache("ks", "t", &[], None).await.unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ready());
        }
        assert_eq!(parent.deltas.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_entries_drop_out_of_live_set() {
        let (cache, _) = cache_with(Some(Arc::new(CountingParent::default()))).await;
        cache.set_lease("ks", Duration::from_millis(100));
        cache.update_cache("ks", "t", &[], None).await.unwrap();
        assert_eq!(cache.live_entries().len(), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.live_entries().is_empty());
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn clause_order_does_not_change_identity() {
        let a = QueryKey::new("ks", "t", &[Clause::new("x", 1i64), Clause::new("y", 2i64)], None);
        let b = QueryKey::new("ks", "t", &[Clause::new("y", 2i64), Clause::new("x", 1i64)], None);
        assert_eq!(a, b);
        assert_eq!(a.serialized_clauses(), b.serialized_clauses());
    }
}
