//! Client sessions and their on-disk form.
//!
//! A session remembers which keyspaces or tables a client touched so that,
//! when the client moves to another node, exactly that working set can be
//! migrated. Sessions are saved as one JSON object per line.

use std::{
    collections::{BTreeSet, HashMap},
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed session entry {0}")]
    MalformedEntry(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    /// Entries are keyspace names.
    Keyspace,
    /// Entries are `keyspace.table` names.
    Table,
}

/// A client's working set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub session_uuid: Uuid,
    pub source_node: i32,
    pub session_name: String,
    pub session_type: SessionType,
    pub data: BTreeSet<String>,
    /// Tokens read back from disk must be validated before they are trusted.
    #[serde(skip)]
    pub has_been_validated: bool,
}

/// A keyspace, or a single table of it, referenced by a session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionScope {
    pub keyspace: String,
    pub table: Option<String>,
}

impl SessionToken {
    pub fn new(session_name: impl Into<String>, session_type: SessionType, source_node: i32) -> Self {
        Self {
            session_uuid: Uuid::new_v4(),
            source_node,
            session_name: session_name.into(),
            session_type,
            data: BTreeSet::new(),
            has_been_validated: true,
        }
    }

    /// Record that the session touched `keyspace.table`.
    pub fn add_entry(&mut self, keyspace: &str, table: &str) {
        let entry = match self.session_type {
            SessionType::Keyspace => keyspace.to_string(),
            SessionType::Table => format!("{keyspace}.{table}"),
        };
        self.data.insert(entry);
    }

    /// Parse the entries of the token.
    pub fn scopes(&self) -> Result<Vec<SessionScope>, SessionError> {
        self.data
            .iter()
            .map(|entry| match self.session_type {
                SessionType::Keyspace => Ok(SessionScope {
                    keyspace: entry.clone(),
                    table: None,
                }),
                SessionType::Table => match entry.split_once('.') {
                    Some((ks, table)) if !ks.is_empty() && !table.is_empty() => Ok(SessionScope {
                        keyspace: ks.to_string(),
                        table: Some(table.to_string()),
                    }),
                    _ => Err(SessionError::MalformedEntry(entry.clone())),
                },
            })
            .collect()
    }

    /// Scopes grouped by keyspace. An empty table list stands for the whole
    /// keyspace.
    pub fn tables_by_keyspace(&self) -> Result<HashMap<String, Vec<String>>, SessionError> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for scope in self.scopes()? {
            let tables = out.entry(scope.keyspace).or_default();
            if let Some(table) = scope.table {
                tables.push(table);
            }
        }
        Ok(out)
    }

    pub fn mark_validated(&mut self, node: i32) {
        self.source_node = node;
        self.has_been_validated = true;
    }
}

/// Sessions of one client process.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionToken>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session called `name`, creating it if needed.
    pub fn get_or_create(&self, name: &str, session_type: SessionType, node: i32) -> SessionToken {
        if let Some(token) = self.get(name) {
            return token;
        }
        let token = SessionToken::new(name, session_type, node);
        self.put(token.clone());
        token
    }

    pub fn get(&self, name: &str) -> Option<SessionToken> {
        self.sessions.read().ok().and_then(|s| s.get(name).cloned())
    }

    pub fn put(&self, token: SessionToken) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(token.session_name.clone(), token);
        }
    }

    /// Record an access of `keyspace.table` by an existing session.
    pub fn touch(&self, name: &str, keyspace: &str, table: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(token) = sessions.get_mut(name) {
                token.add_entry(keyspace, table);
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionToken> {
        let mut out: Vec<SessionToken> = self
            .sessions
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every session to `path`, replacing its contents.
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let mut out = BufWriter::new(File::create(path)?);
        for token in self.sessions() {
            let line = serde_json::to_string(&token)
                .map_err(|source| SessionError::Json { line: 0, source })?;
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Load sessions from `path`. A missing file yields an empty manager.
    /// Loaded sessions are marked unvalidated.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let manager = Self::new();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(manager),
            Err(err) => return Err(err.into()),
        };
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let token: SessionToken = serde_json::from_str(&line)
                .map_err(|source| SessionError::Json { line: idx + 1, source })?;
            manager.put(token);
        }
        tracing::info!(sessions = manager.len(), path = %path.display(), "loaded sessions");
        Ok(manager)
    }
}
