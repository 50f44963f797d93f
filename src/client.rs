//! Application-side access to a PathStore node.
//!
//! An [`ApplicationClient`] obtains ephemeral credentials for its
//! application, remembers which tables each named session touched and, when
//! moved to another node with [`ApplicationClient::swap_node`], has the new
//! node migrate every session before it is used again.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use tonic::Status;

use crate::{
    AuthedClient, convert,
    auth::AuthInterceptor,
    config::RpcOptions,
    rpc::{
        Empty, GetSchemaInfoRequest, RegisterApplicationClientRequest, SelectRequest, WriteKind,
        WriteRequest, path_store_client::PathStoreClient,
    },
    schema::KeyspaceSchema,
    session::{SessionError, SessionManager, SessionToken, SessionType},
    store::{Clause, Row},
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("cannot reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("registration of {application} refused: {reason}")]
    Registration { application: String, reason: String },
    #[error("session {0} could not be migrated to this node")]
    SessionRejected(String),
    #[error("malformed schema from node: {0}")]
    Schema(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Rpc(#[from] Status),
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub rpc: RpcOptions,
    /// Granularity of newly created sessions.
    pub session_type: SessionType,
    /// Sessions are loaded from and saved to this file when set.
    pub session_file: Option<PathBuf>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            rpc: RpcOptions::default(),
            session_type: SessionType::Table,
            session_file: None,
        }
    }
}

#[derive(Clone, Default)]
struct Issued {
    username: String,
    password: String,
}

struct Connection {
    addr: String,
    node_id: i32,
    client: AuthedClient,
}

/// Connect to `addr` without credentials and return the node's id.
pub async fn local_node_id(addr: &str, rpc: &RpcOptions) -> Result<i32, ClientError> {
    let mut client = connect(addr, AuthInterceptor::anonymous(), rpc).await?;
    Ok(client.get_local_node_id(Empty {}).await?.into_inner().node_id)
}

async fn connect(
    addr: &str,
    interceptor: AuthInterceptor,
    rpc: &RpcOptions,
) -> Result<AuthedClient, ClientError> {
    PathStoreClient::connect_authenticated(addr.to_string(), interceptor, rpc)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })
}

/// Ask the node at `addr` for client credentials of `application`.
pub async fn register(
    addr: &str,
    application: &str,
    password: &str,
    rpc: &RpcOptions,
) -> Result<(String, String), ClientError> {
    let mut client = connect(addr, AuthInterceptor::anonymous(), rpc).await?;
    let resp = client
        .register_application_client(RegisterApplicationClientRequest {
            application_name: application.to_string(),
            password: password.to_string(),
        })
        .await?
        .into_inner();
    if !resp.valid {
        return Err(ClientError::Registration {
            application: application.to_string(),
            reason: resp.reason,
        });
    }
    Ok((resp.username, resp.password))
}

pub struct ApplicationClient {
    application: String,
    password: String,
    options: ClientOptions,
    issued: Arc<RwLock<Issued>>,
    connection: RwLock<Connection>,
    sessions: SessionManager,
}

impl ApplicationClient {
    /// Register `application` with the node at `addr`. Sessions saved in the
    /// configured session file are loaded and migrated to that node.
    pub async fn connect(
        addr: &str,
        application: &str,
        password: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let sessions = match &options.session_file {
            Some(path) => SessionManager::load(path)?,
            None => SessionManager::new(),
        };
        let issued = Arc::new(RwLock::new(Issued::default()));
        let connection = Self::open(addr, application, password, &options.rpc, &issued).await?;
        let client = Self {
            application: application.to_string(),
            password: password.to_string(),
            options,
            issued,
            connection: RwLock::new(connection),
            sessions,
        };
        client.validate_all().await?;
        tracing::info!(
            application,
            addr,
            node_id = client.node_id(),
            sessions = client.sessions.len(),
            "application client connected"
        );
        Ok(client)
    }

    async fn open(
        addr: &str,
        application: &str,
        password: &str,
        rpc: &RpcOptions,
        issued: &Arc<RwLock<Issued>>,
    ) -> Result<Connection, ClientError> {
        let node_id = local_node_id(addr, rpc).await?;
        let (username, secret) = register(addr, application, password, rpc).await?;
        if let Ok(mut issued) = issued.write() {
            *issued = Issued {
                username,
                password: secret,
            };
        }
        let source = issued.clone();
        let interceptor = AuthInterceptor::new(move || {
            source
                .read()
                .map(|i| (i.username.clone(), i.password.clone()))
                .unwrap_or_default()
        });
        let client = connect(addr, interceptor, rpc).await?;
        Ok(Connection {
            addr: addr.to_string(),
            node_id,
            client,
        })
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// Id of the node currently serving this client.
    pub fn node_id(&self) -> i32 {
        self.connection.read().map(|c| c.node_id).unwrap_or(-1)
    }

    pub fn node_addr(&self) -> String {
        self.connection
            .read()
            .map(|c| c.addr.clone())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn client(&self) -> Result<(i32, AuthedClient), ClientError> {
        self.connection
            .read()
            .map(|c| (c.node_id, c.client.clone()))
            .map_err(|_| ClientError::Rpc(Status::internal("connection state poisoned")))
    }

    /// Session `name`, validated against the current node.
    async fn session(&self, name: &str) -> Result<SessionToken, ClientError> {
        let (node_id, _) = self.client()?;
        let token = self
            .sessions
            .get_or_create(name, self.options.session_type, node_id);
        if token.has_been_validated {
            return Ok(token);
        }
        self.validate(token).await
    }

    async fn validate(&self, mut token: SessionToken) -> Result<SessionToken, ClientError> {
        let (node_id, mut client) = self.client()?;
        let valid = client
            .validate_session(convert::token_to_proto(&token))
            .await?
            .into_inner()
            .valid;
        if !valid {
            return Err(ClientError::SessionRejected(token.session_name));
        }
        token.mark_validated(node_id);
        self.sessions.put(token.clone());
        tracing::debug!(session = %token.session_name, node_id, "session validated");
        Ok(token)
    }

    async fn validate_all(&self) -> Result<(), ClientError> {
        for token in self.sessions.sessions() {
            if !token.has_been_validated {
                self.validate(token).await?;
            }
        }
        Ok(())
    }

    /// Read the current rows of `keyspace.table` on behalf of `session`.
    pub async fn select(
        &self,
        session: &str,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ClientError> {
        self.session(session).await?;
        self.sessions.touch(session, keyspace, table);
        let (_, mut client) = self.client()?;
        let rows = client
            .select(SelectRequest {
                session_name: session.to_string(),
                keyspace: keyspace.to_string(),
                table: table.to_string(),
                clauses: convert::clauses_to_proto(clauses),
                limit: convert::limit_to_proto(limit),
            })
            .await?
            .into_inner()
            .rows;
        Ok(convert::rows_from_proto(rows)?)
    }

    async fn write(
        &self,
        session: &str,
        keyspace: &str,
        table: &str,
        row: &Row,
        kind: WriteKind,
    ) -> Result<(), ClientError> {
        self.session(session).await?;
        self.sessions.touch(session, keyspace, table);
        let (_, mut client) = self.client()?;
        client
            .write(WriteRequest {
                session_name: session.to_string(),
                keyspace: keyspace.to_string(),
                table: table.to_string(),
                row: Some(convert::row_to_proto(row)),
                kind: kind as i32,
            })
            .await?;
        Ok(())
    }

    pub async fn insert(
        &self,
        session: &str,
        keyspace: &str,
        table: &str,
        row: &Row,
    ) -> Result<(), ClientError> {
        self.write(session, keyspace, table, row, WriteKind::Insert).await
    }

    /// Set the non-key columns of `row` on the key it carries.
    pub async fn update(
        &self,
        session: &str,
        keyspace: &str,
        table: &str,
        row: &Row,
    ) -> Result<(), ClientError> {
        self.write(session, keyspace, table, row, WriteKind::Update).await
    }

    pub async fn delete(
        &self,
        session: &str,
        keyspace: &str,
        table: &str,
        key: &Row,
    ) -> Result<(), ClientError> {
        self.write(session, keyspace, table, key, WriteKind::Delete).await
    }

    /// Augmented schema of `keyspace` as loaded on the current node.
    pub async fn schema(&self, keyspace: &str) -> Result<Option<KeyspaceSchema>, ClientError> {
        let (_, mut client) = self.client()?;
        let resp = client
            .get_schema_info(GetSchemaInfoRequest {
                keyspace: keyspace.to_string(),
            })
            .await?
            .into_inner();
        if !resp.found {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&resp.schema)?))
    }

    /// Move this client to the node at `addr`. Every session is migrated
    /// there before the swap returns; a session the new node refuses fails
    /// the swap.
    pub async fn swap_node(&self, addr: &str) -> Result<(), ClientError> {
        let from = self.node_id();
        let connection = Self::open(
            addr,
            &self.application,
            &self.password,
            &self.options.rpc,
            &self.issued,
        )
        .await?;
        let to = connection.node_id;
        if let Ok(mut current) = self.connection.write() {
            *current = connection;
        }
        for mut token in self.sessions.sessions() {
            token.has_been_validated = false;
            self.validate(token).await?;
        }
        tracing::info!(from, to, addr, "application client swapped node");
        Ok(())
    }

    /// Write every session to the session file, if one is configured.
    pub fn save_sessions(&self) -> Result<(), ClientError> {
        if let Some(path) = &self.options.session_file {
            self.sessions.save(path)?;
        }
        Ok(())
    }
}
