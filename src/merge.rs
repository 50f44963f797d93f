//! Compaction of the append-only version log into current rows.
//!
//! Every write produces a new physical row. [`LogCompaction`] folds a stream of
//! such rows, ordered by primary key with the newest version first, into one
//! merged row per logical key. [`MergedRows`] drives it for a query and, for
//! log-breaking reads, re-checks each candidate against the true latest
//! version of its key before handing it out.

use std::{collections::HashSet, iter::Peekable, sync::Arc};

use crate::{
    schema::{DELETED, METADATA_COLUMNS, TableSchema},
    store::{Clause, Row, Store, StoreError, Value, cell, compare_on},
};

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    /// The query layer flagged a log-breaking read but did not pass the
    /// clauses needed to validate its candidates.
    #[error("log-breaking read on {table} issued without its clauses")]
    MissingClauses { table: String },
    /// A key that was just observed has no versions at all.
    #[error("row {key} of {keyspace}.{table} vanished while being validated")]
    VanishedRow {
        keyspace: String,
        table: String,
        key: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn is_deleted(row: &Row) -> bool {
    cell(row, DELETED) == &Value::Bool(true)
}

/// Remove the replication metadata columns from a row.
pub fn strip_metadata(mut row: Row) -> Row {
    for col in METADATA_COLUMNS {
        row.remove(col);
    }
    row
}

/// Forward-only iterator producing the latest non-deleted state of each key.
///
/// Within a key the newest version wins per column and nulls never overwrite
/// an older value. A tombstone hides the key together with every older
/// version that follows it. Metadata columns of the newest surviving version
/// are kept on the merged row.
pub struct LogCompaction<I: Iterator<Item = Row>> {
    rows: Peekable<I>,
    row_key: Vec<String>,
}

impl<I: Iterator<Item = Row>> LogCompaction<I> {
    pub fn new(rows: I, row_key: Vec<String>) -> Self {
        Self {
            rows: rows.peekable(),
            row_key,
        }
    }

    fn same_key(&self, a: &Row, b: &Row) -> bool {
        compare_on(&self.row_key, a, b).is_eq()
    }

    /// Consume every remaining version sharing `anchor`'s key.
    fn skip_group(&mut self, anchor: &Row) {
        while let Some(next) = self.rows.peek() {
            if !compare_on(&self.row_key, anchor, next).is_eq() {
                break;
            }
            self.rows.next();
        }
    }
}

impl<I: Iterator<Item = Row>> Iterator for LogCompaction<I> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        loop {
            let mut candidate = self.rows.next()?;
            if is_deleted(&candidate) {
                self.skip_group(&candidate);
                continue;
            }
            while let Some(next) = self.rows.peek() {
                if !compare_on(&self.row_key, &candidate, next).is_eq() {
                    break;
                }
                let Some(older) = self.rows.next() else { break };
                if is_deleted(&older) {
                    self.skip_group(&candidate);
                    break;
                }
                for (col, value) in older {
                    if value.is_null() {
                        continue;
                    }
                    let unset = candidate.get(&col).is_none_or(Value::is_null);
                    if unset {
                        candidate.insert(col, value);
                    }
                }
            }
            return Some(candidate);
        }
    }
}

/// Merged, metadata-free result rows of a single query.
pub struct MergedRows {
    inner: LogCompaction<std::vec::IntoIter<Row>>,
    store: Arc<dyn Store>,
    keyspace: String,
    table: String,
    row_key: Vec<String>,
    validation: Option<Vec<Clause>>,
    seen: HashSet<Vec<Value>>,
}

impl MergedRows {
    /// Wrap the raw rows returned for a query on `schema`.
    ///
    /// When `log_breaking` is set the raw rows may not be in version order for
    /// their key, and `clauses` must be the predicate that produced them.
    pub fn new(
        store: Arc<dyn Store>,
        keyspace: &str,
        schema: &TableSchema,
        rows: Vec<Row>,
        clauses: Option<&[Clause]>,
        log_breaking: bool,
    ) -> Result<Self, MergeError> {
        let validation = if log_breaking {
            let clauses = clauses.ok_or_else(|| MergeError::MissingClauses {
                table: schema.name.clone(),
            })?;
            Some(clauses.to_vec())
        } else {
            None
        };
        let row_key = schema.row_key();
        Ok(Self {
            inner: LogCompaction::new(rows.into_iter(), row_key.clone()),
            store,
            keyspace: keyspace.to_string(),
            table: schema.name.clone(),
            row_key,
            validation,
            seen: HashSet::new(),
        })
    }

    /// Produce the next row, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<Row>, MergeError> {
        loop {
            let Some(candidate) = self.inner.next() else {
                return Ok(None);
            };
            let Some(clauses) = &self.validation else {
                return Ok(Some(strip_metadata(candidate)));
            };

            let key: Vec<Value> = self
                .row_key
                .iter()
                .map(|c| cell(&candidate, c).clone())
                .collect();
            if !self.seen.insert(key.clone()) {
                continue;
            }
            let key_clauses: Vec<Clause> = self
                .row_key
                .iter()
                .zip(key.iter())
                .map(|(col, value)| Clause::new(col.clone(), value.clone()))
                .collect();
            let versions = self
                .store
                .select(&self.keyspace, &self.table, &key_clauses, None)
                .await?;
            if versions.is_empty() {
                let key = key
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(MergeError::VanishedRow {
                    keyspace: self.keyspace.clone(),
                    table: self.table.clone(),
                    key,
                });
            }
            let latest = LogCompaction::new(versions.into_iter(), self.row_key.clone()).next();
            match latest {
                Some(row) if clauses.iter().all(|c| c.matches(&row)) => {
                    return Ok(Some(strip_metadata(row)));
                }
                _ => {
                    tracing::debug!(
                        keyspace = %self.keyspace,
                        table = %self.table,
                        "discarding stale candidate of log-breaking read"
                    );
                }
            }
        }
    }

    /// Drain the stream, stopping after `limit` rows when given.
    pub async fn collect(mut self, limit: Option<usize>) -> Result<Vec<Row>, MergeError> {
        let mut out = Vec::new();
        while limit.is_none_or(|l| out.len() < l) {
            match self.next().await? {
                Some(row) => out.push(row),
                None => break,
            }
        }
        Ok(out)
    }
}
