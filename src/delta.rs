//! Parent side of the delta protocol and application of remote rows.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::{
    schema::{DIRTY, NODE, PARENT_TIMESTAMP, TableSchema},
    store::{Clause, Row, Store, StoreError, Value, cell},
};

struct PendingDelta {
    rows: Vec<Row>,
    created: Instant,
}

/// Deltas computed for children and not yet collected.
pub struct DeltaStore {
    pending: Mutex<HashMap<Uuid, PendingDelta>>,
    retention: Duration,
}

impl DeltaStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Park `rows` under a fresh id, dropping deltas older than the retention.
    pub fn put(&self, rows: Vec<Row>) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut pending) = self.pending.lock() {
            let retention = self.retention;
            pending.retain(|_, d| d.created.elapsed() < retention);
            pending.insert(
                id,
                PendingDelta {
                    rows,
                    created: Instant::now(),
                },
            );
        }
        id
    }

    /// Claim a delta. Each delta can be taken once.
    pub fn take(&self, id: &Uuid) -> Option<Vec<Row>> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(id))
            .map(|d| d.rows)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn key_of(row_key: &[String], row: &Row) -> Vec<Value> {
    row_key.iter().map(|c| cell(row, c).clone()).collect()
}

/// Arrival stamp in `(high_water, ceiling)`.
fn arrived_between(row: &Row, high_water: Option<Uuid>, ceiling: Uuid) -> bool {
    cell(row, PARENT_TIMESTAMP)
        .as_uuid()
        .is_some_and(|ts| ts < ceiling && high_water.is_none_or(|hw| ts > hw))
}

/// Collect every version a child is missing for a query.
///
/// Keys are those matching `clauses` in any version; for each of them every
/// version that arrived here after `parent_timestamp` and did not originate
/// at `caller` is included. `limit` bounds the number of distinct keys.
/// Returns `None` when there is nothing to send.
///
/// Rows stamped after the first scan began are left for the next delta, so
/// the high-water mark a child derives never passes a row it has not seen.
#[allow(clippy::too_many_arguments)]
pub async fn create_query_delta(
    store: &dyn Store,
    deltas: &DeltaStore,
    keyspace: &str,
    schema: &TableSchema,
    clauses: &[Clause],
    parent_timestamp: Option<Uuid>,
    caller: i32,
    limit: Option<usize>,
) -> Result<Option<Uuid>, StoreError> {
    let row_key = schema.row_key();
    let ceiling = Uuid::now_v7();
    let matched = store.select(keyspace, &schema.name, clauses, None).await?;
    let key_only = clauses.iter().all(|c| schema.is_key_column(&c.column));

    let mut groups: Vec<(Vec<Value>, Vec<Row>)> = Vec::new();
    for row in matched {
        let key = key_of(&row_key, &row);
        match groups.last_mut() {
            Some((last, rows)) if *last == key => rows.push(row),
            _ => {
                if limit.is_some_and(|l| groups.len() >= l) {
                    break;
                }
                groups.push((key, vec![row]));
            }
        }
    }

    let mut out = Vec::new();
    for (key, rows) in groups {
        let versions = if key_only {
            rows
        } else {
            let key_clauses: Vec<Clause> = row_key
                .iter()
                .zip(key)
                .map(|(col, value)| Clause::new(col.clone(), value))
                .collect();
            store.select(keyspace, &schema.name, &key_clauses, None).await?
        };
        out.extend(versions.into_iter().filter(|r| {
            arrived_between(r, parent_timestamp, ceiling)
                && cell(r, NODE).as_int() != Some(caller as i64)
        }));
    }

    if out.is_empty() {
        return Ok(None);
    }
    tracing::debug!(
        keyspace,
        table = %schema.name,
        rows = out.len(),
        caller,
        "created query delta"
    );
    Ok(Some(deltas.put(out)))
}

/// Highest arrival stamp carried by `rows`.
pub fn high_water_mark(rows: &[Row]) -> Option<Uuid> {
    rows.iter()
        .filter_map(|r| cell(r, PARENT_TIMESTAMP).as_uuid())
        .max()
}

/// Store row versions received from another node.
///
/// Each row is re-stamped by the store with a local arrival time and its
/// dirty flag set to `dirty`. Versions already present are left untouched.
/// Returns the number of rows written.
pub async fn apply_rows(
    store: &dyn Store,
    keyspace: &str,
    table: &str,
    rows: Vec<Row>,
    dirty: bool,
) -> Result<usize, StoreError> {
    let mut applied = 0;
    for mut row in rows {
        row.insert(DIRTY.into(), Value::Bool(dirty));
        if store
            .insert_stamped(keyspace, table, row, PARENT_TIMESTAMP)
            .await?
            .is_some()
        {
            applied += 1;
        }
    }
    Ok(applied)
}
