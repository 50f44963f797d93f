//! Conversions between wire messages and domain types.

use std::collections::BTreeSet;

use tonic::Status;
use uuid::Uuid;

use crate::{
    rpc::{self, cell::Kind},
    session::{SessionToken, SessionType},
    store::{Clause, Row, Value},
};

pub fn cell_from_value(value: &Value) -> rpc::Cell {
    let kind = match value {
        Value::Null => Kind::Null(true),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Int(i) => Kind::IntValue(*i),
        Value::Text(s) => Kind::TextValue(s.clone()),
        Value::Uuid(u) => Kind::UuidValue(u.to_string()),
    };
    rpc::Cell { kind: Some(kind) }
}

pub fn value_from_cell(cell: Option<rpc::Cell>) -> Result<Value, Status> {
    Ok(match cell.and_then(|c| c.kind) {
        None | Some(Kind::Null(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntValue(i)) => Value::Int(i),
        Some(Kind::TextValue(s)) => Value::Text(s),
        Some(Kind::UuidValue(s)) => Value::Uuid(parse_uuid(&s)?),
    })
}

pub fn row_to_proto(row: &Row) -> rpc::Row {
    rpc::Row {
        columns: row
            .iter()
            .map(|(k, v)| (k.clone(), cell_from_value(v)))
            .collect(),
    }
}

pub fn row_from_proto(row: rpc::Row) -> Result<Row, Status> {
    row.columns
        .into_iter()
        .map(|(k, c)| Ok((k, value_from_cell(Some(c))?)))
        .collect()
}

pub fn rows_to_proto(rows: &[Row]) -> Vec<rpc::Row> {
    rows.iter().map(row_to_proto).collect()
}

pub fn rows_from_proto(rows: Vec<rpc::Row>) -> Result<Vec<Row>, Status> {
    rows.into_iter().map(row_from_proto).collect()
}

pub fn clauses_to_proto(clauses: &[Clause]) -> Vec<rpc::Clause> {
    clauses
        .iter()
        .map(|c| rpc::Clause {
            column: c.column.clone(),
            value: Some(cell_from_value(&c.value)),
        })
        .collect()
}

pub fn clauses_from_proto(clauses: Vec<rpc::Clause>) -> Result<Vec<Clause>, Status> {
    clauses
        .into_iter()
        .map(|c| {
            if c.column.is_empty() {
                return Err(Status::invalid_argument("clause without column"));
            }
            Ok(Clause {
                column: c.column,
                value: value_from_cell(c.value)?,
            })
        })
        .collect()
}

/// Wire limits use `0` for "no limit".
pub fn limit_to_proto(limit: Option<usize>) -> u32 {
    limit.map(|l| l.min(u32::MAX as usize) as u32).unwrap_or(0)
}

pub fn limit_from_proto(limit: u32) -> Option<usize> {
    (limit > 0).then_some(limit as usize)
}

pub fn parse_uuid(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|e| Status::invalid_argument(format!("bad uuid {raw}: {e}")))
}

/// Wire timestamps are empty when unset.
pub fn optional_uuid(raw: &str) -> Result<Option<Uuid>, Status> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_uuid(raw).map(Some)
    }
}

pub fn optional_uuid_to_proto(id: Option<Uuid>) -> String {
    id.map(|u| u.to_string()).unwrap_or_default()
}

pub fn token_to_proto(token: &SessionToken) -> rpc::SessionToken {
    let kind = match token.session_type {
        SessionType::Keyspace => rpc::SessionKind::Keyspace,
        SessionType::Table => rpc::SessionKind::Table,
    };
    rpc::SessionToken {
        session_uuid: token.session_uuid.to_string(),
        source_node: token.source_node,
        session_name: token.session_name.clone(),
        session_type: kind as i32,
        data: token.data.iter().cloned().collect(),
    }
}

/// Tokens arriving over the wire are never trusted until validated.
pub fn token_from_proto(token: rpc::SessionToken) -> Result<SessionToken, Status> {
    let session_type = match rpc::SessionKind::try_from(token.session_type) {
        Ok(rpc::SessionKind::Keyspace) => SessionType::Keyspace,
        Ok(rpc::SessionKind::Table) => SessionType::Table,
        Err(_) => return Err(Status::invalid_argument("unknown session type")),
    };
    Ok(SessionToken {
        session_uuid: parse_uuid(&token.session_uuid)?,
        source_node: token.source_node,
        session_name: token.session_name,
        session_type,
        data: token.data.into_iter().collect::<BTreeSet<_>>(),
        has_been_validated: false,
    })
}
