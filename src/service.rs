//! gRPC surface of a node.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{Span, field};

use crate::{
    access::{AccessError, DataAccess},
    auth::{AuthManager, Caller, Endpoint},
    cache::CacheError,
    convert,
    delta::{self, DeltaStore},
    migration::{MigrationError, Migrator},
    rpc::{
        AddQueryEntryRequest, Empty, GetDeltaRequest, GetDeltaResponse, GetSchemaInfoRequest,
        GetSchemaInfoResponse, LocalNodeIdResponse, MigrationRequest, PushRowsRequest,
        PushRowsResponse, QueryDeltaRequest, QueryDeltaResponse, RegisterApplicationClientRequest,
        RegisterApplicationClientResponse, SelectRequest, SelectResponse, SessionToken,
        ValidateSessionResponse, WriteKind, WriteRequest,
        path_store_server::{PathStore, PathStoreServer},
    },
    schema::TableSchema,
    schema_fsm::{self, SchemaFsmError},
    store::{Row, StoreError},
    telemetry,
};

fn cache_status(err: CacheError) -> Status {
    match err {
        CacheError::ParentUnavailable(msg) => Status::unavailable(msg),
        CacheError::Rejected(msg) => Status::failed_precondition(msg),
        CacheError::DeltaMissing(id) => Status::aborted(format!("delta {id} expired")),
        CacheError::Store(err) => store_status(err),
    }
}

fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::UnknownKeyspace(_) | StoreError::UnknownTable { .. } => {
            Status::not_found(err.to_string())
        }
        StoreError::UnknownColumn { .. } | StoreError::MissingPrimaryKey { .. } => {
            Status::invalid_argument(err.to_string())
        }
        StoreError::Other(msg) => Status::internal(msg),
    }
}

fn access_status(err: AccessError) -> Status {
    match err {
        AccessError::UnknownTable { .. } => Status::not_found(err.to_string()),
        AccessError::MissingKey { .. } | AccessError::ReservedColumn(_) => {
            Status::invalid_argument(err.to_string())
        }
        AccessError::Merge(err) => Status::internal(err.to_string()),
        AccessError::Store(err) => store_status(err),
        AccessError::Cache(err) => cache_status(err),
    }
}

fn migration_status(err: MigrationError) -> Status {
    match err {
        MigrationError::Peer(err) => Status::unavailable(err.to_string()),
        MigrationError::Cache(err) => cache_status(err),
        MigrationError::Session(err) => Status::invalid_argument(err.to_string()),
        MigrationError::NotAncestor { .. } => Status::failed_precondition(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

/// Implementation of the `PathStore` service.
#[derive(Clone)]
pub struct PathStoreService {
    access: Arc<DataAccess>,
    auth: Arc<AuthManager>,
    deltas: Arc<DeltaStore>,
    migrator: Arc<Migrator>,
}

impl PathStoreService {
    pub fn new(
        access: Arc<DataAccess>,
        auth: Arc<AuthManager>,
        deltas: Arc<DeltaStore>,
        migrator: Arc<Migrator>,
    ) -> Self {
        Self {
            access,
            auth,
            deltas,
            migrator,
        }
    }

    pub fn into_server(self) -> PathStoreServer<Self> {
        PathStoreServer::new(self)
    }

    fn admit<T>(&self, endpoint: Endpoint, req: &Request<T>) -> Result<Caller, Status> {
        telemetry::adopt_remote_parent(req.metadata());
        Ok(self.auth.authenticate(endpoint, req.metadata())?)
    }

    fn table(&self, keyspace: &str, table: &str) -> Result<TableSchema, Status> {
        self.access
            .schemas()
            .table(keyspace, table)
            .ok_or_else(|| Status::not_found(format!("{keyspace}.{table} is not loaded")))
    }

    fn token(token: Option<SessionToken>) -> Result<crate::session::SessionToken, Status> {
        convert::token_from_proto(token.ok_or_else(|| Status::invalid_argument("missing token"))?)
    }
}

#[tonic::async_trait]
impl PathStore for PathStoreService {
    #[tracing::instrument(skip(self, req), fields(application = field::Empty))]
    async fn register_application_client(
        &self,
        req: Request<RegisterApplicationClientRequest>,
    ) -> Result<Response<RegisterApplicationClientResponse>, Status> {
        self.admit(Endpoint::RegisterApplicationClient, &req)?;
        let r = req.into_inner();
        Span::current().record("application", field::display(&r.application_name));
        let result = schema_fsm::register_application_client(
            &self.access,
            &self.auth,
            &r.application_name,
            &r.password,
        )
        .await;
        let resp = match result {
            Ok(credential) => RegisterApplicationClientResponse {
                valid: true,
                reason: String::new(),
                username: credential.username,
                password: credential.password,
            },
            Err(
                err @ (SchemaFsmError::NotInstalled { .. }
                | SchemaFsmError::InvalidPassword(_)
                | SchemaFsmError::UnknownApplication(_)),
            ) => RegisterApplicationClientResponse {
                valid: false,
                reason: err.to_string(),
                ..Default::default()
            },
            Err(err) => return Err(Status::internal(err.to_string())),
        };
        Ok(Response::new(resp))
    }

    #[tracing::instrument(skip(self, req), fields(keyspace = field::Empty))]
    async fn get_schema_info(
        &self,
        req: Request<GetSchemaInfoRequest>,
    ) -> Result<Response<GetSchemaInfoResponse>, Status> {
        self.admit(Endpoint::GetSchemaInfo, &req)?;
        let keyspace = req.into_inner().keyspace;
        Span::current().record("keyspace", field::display(&keyspace));
        let resp = match self.access.schemas().keyspace(&keyspace) {
            Some(schema) => GetSchemaInfoResponse {
                found: true,
                schema: serde_json::to_string(schema.as_ref())
                    .map_err(|e| Status::internal(e.to_string()))?,
            },
            None => GetSchemaInfoResponse::default(),
        };
        Ok(Response::new(resp))
    }

    #[tracing::instrument(skip(self, req), fields(session = field::Empty, source = field::Empty))]
    async fn validate_session(
        &self,
        req: Request<SessionToken>,
    ) -> Result<Response<ValidateSessionResponse>, Status> {
        self.admit(Endpoint::ValidateSession, &req)?;
        let token = convert::token_from_proto(req.into_inner())?;
        let span = Span::current();
        span.record("session", field::display(&token.session_name));
        span.record("source", token.source_node);
        let valid = match self.migrator.validate_session(token).await {
            Ok(_) => true,
            Err(
                err @ (MigrationError::SourceNotDeployed(_)
                | MigrationError::NotLoaded(_)
                | MigrationError::NoCommonAncestor { .. }),
            ) => {
                tracing::info!(%err, "session rejected");
                false
            }
            Err(err) => return Err(migration_status(err)),
        };
        Ok(Response::new(ValidateSessionResponse { valid }))
    }

    #[tracing::instrument(skip(self, req), fields(lca = field::Empty))]
    async fn force_push(&self, req: Request<MigrationRequest>) -> Result<Response<Empty>, Status> {
        self.admit(Endpoint::ForcePush, &req)?;
        let r = req.into_inner();
        Span::current().record("lca", r.lca);
        let token = Self::token(r.token)?;
        self.migrator
            .force_push(&token, r.lca)
            .await
            .map_err(migration_status)?;
        Ok(Response::new(Empty {}))
    }

    #[tracing::instrument(skip(self, req), fields(lca = field::Empty))]
    async fn force_synchronize(
        &self,
        req: Request<MigrationRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.admit(Endpoint::ForceSynchronize, &req)?;
        let r = req.into_inner();
        Span::current().record("lca", r.lca);
        let token = Self::token(r.token)?;
        self.migrator
            .force_synchronize(&token, r.lca)
            .await
            .map_err(migration_status)?;
        Ok(Response::new(Empty {}))
    }

    #[tracing::instrument(skip(self, req))]
    async fn get_local_node_id(
        &self,
        req: Request<Empty>,
    ) -> Result<Response<LocalNodeIdResponse>, Status> {
        self.admit(Endpoint::GetLocalNodeId, &req)?;
        Ok(Response::new(LocalNodeIdResponse {
            node_id: self.access.node_id(),
        }))
    }

    #[tracing::instrument(
        skip(self, req),
        fields(keyspace = field::Empty, table = field::Empty, caller = field::Empty)
    )]
    async fn create_query_delta(
        &self,
        req: Request<QueryDeltaRequest>,
    ) -> Result<Response<QueryDeltaResponse>, Status> {
        let caller = self
            .admit(Endpoint::CreateQueryDelta, &req)?
            .node_id
            .ok_or_else(|| Status::unauthenticated("node id missing"))?;
        let r = req.into_inner();
        let span = Span::current();
        span.record("keyspace", field::display(&r.keyspace));
        span.record("table", field::display(&r.table));
        span.record("caller", caller);
        if r.caller_node_id != caller {
            tracing::debug!(claimed = r.caller_node_id, caller, "ignoring claimed caller id");
        }
        let schema = self.table(&r.keyspace, &r.table)?;
        let id = delta::create_query_delta(
            self.access.store().as_ref(),
            &self.deltas,
            &r.keyspace,
            &schema,
            &convert::clauses_from_proto(r.clauses)?,
            convert::optional_uuid(&r.parent_timestamp)?,
            caller,
            convert::limit_from_proto(r.limit),
        )
        .await
        .map_err(store_status)?;
        Ok(Response::new(QueryDeltaResponse {
            delta_id: convert::optional_uuid_to_proto(id),
        }))
    }

    #[tracing::instrument(skip(self, req), fields(delta = field::Empty))]
    async fn get_delta(
        &self,
        req: Request<GetDeltaRequest>,
    ) -> Result<Response<GetDeltaResponse>, Status> {
        self.admit(Endpoint::GetDelta, &req)?;
        let raw = req.into_inner().delta_id;
        Span::current().record("delta", field::display(&raw));
        let id = convert::parse_uuid(&raw)?;
        let rows = self
            .deltas
            .take(&id)
            .ok_or_else(|| Status::not_found(format!("delta {id} is unknown or expired")))?;
        Ok(Response::new(GetDeltaResponse {
            rows: convert::rows_to_proto(&rows),
        }))
    }

    #[tracing::instrument(skip(self, req), fields(keyspace = field::Empty, table = field::Empty))]
    async fn add_query_entry(
        &self,
        req: Request<AddQueryEntryRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.admit(Endpoint::AddQueryEntry, &req)?;
        let r = req.into_inner();
        let span = Span::current();
        span.record("keyspace", field::display(&r.keyspace));
        span.record("table", field::display(&r.table));
        self.table(&r.keyspace, &r.table)?;
        self.access
            .cache()
            .update_cache(
                &r.keyspace,
                &r.table,
                &convert::clauses_from_proto(r.clauses)?,
                convert::limit_from_proto(r.limit),
            )
            .await
            .map_err(cache_status)?;
        Ok(Response::new(Empty {}))
    }

    #[tracing::instrument(
        skip(self, req),
        fields(keyspace = field::Empty, table = field::Empty, rows = field::Empty)
    )]
    async fn push_rows(
        &self,
        req: Request<PushRowsRequest>,
    ) -> Result<Response<PushRowsResponse>, Status> {
        self.admit(Endpoint::PushRows, &req)?;
        let r = req.into_inner();
        let span = Span::current();
        span.record("keyspace", field::display(&r.keyspace));
        span.record("table", field::display(&r.table));
        span.record("rows", r.rows.len());
        self.table(&r.keyspace, &r.table)?;
        let rows = convert::rows_from_proto(r.rows)?;
        // the root is the end of the line; everything below keeps pushing up
        let applied = delta::apply_rows(
            self.access.store().as_ref(),
            &r.keyspace,
            &r.table,
            rows,
            !self.access.is_root(),
        )
        .await
        .map_err(store_status)?;
        Ok(Response::new(PushRowsResponse {
            applied: applied as u64,
        }))
    }

    #[tracing::instrument(
        skip(self, req),
        fields(session = field::Empty, keyspace = field::Empty, table = field::Empty)
    )]
    async fn select(&self, req: Request<SelectRequest>) -> Result<Response<SelectResponse>, Status> {
        self.admit(Endpoint::Select, &req)?;
        let r = req.into_inner();
        let span = Span::current();
        span.record("session", field::display(&r.session_name));
        span.record("keyspace", field::display(&r.keyspace));
        span.record("table", field::display(&r.table));
        let rows = self
            .access
            .select(
                &r.keyspace,
                &r.table,
                &convert::clauses_from_proto(r.clauses)?,
                convert::limit_from_proto(r.limit),
            )
            .await
            .map_err(access_status)?;
        Ok(Response::new(SelectResponse {
            rows: convert::rows_to_proto(&rows),
        }))
    }

    #[tracing::instrument(
        skip(self, req),
        fields(session = field::Empty, keyspace = field::Empty, table = field::Empty)
    )]
    async fn write(&self, req: Request<WriteRequest>) -> Result<Response<Empty>, Status> {
        self.admit(Endpoint::Write, &req)?;
        let r = req.into_inner();
        let span = Span::current();
        span.record("session", field::display(&r.session_name));
        span.record("keyspace", field::display(&r.keyspace));
        span.record("table", field::display(&r.table));
        let row = convert::row_from_proto(
            r.row
                .ok_or_else(|| Status::invalid_argument("missing row"))?,
        )?;
        let kind = WriteKind::try_from(r.kind)
            .map_err(|_| Status::invalid_argument(format!("unknown write kind {}", r.kind)))?;
        let access = &self.access;
        let written = match kind {
            WriteKind::Insert => access.insert(&r.keyspace, &r.table, row).await,
            WriteKind::Update => {
                let key_columns = self.table(&r.keyspace, &r.table)?.row_key();
                let (key, changes): (Row, Row) =
                    row.into_iter().partition(|(c, _)| key_columns.contains(c));
                access.update(&r.keyspace, &r.table, key, changes).await
            }
            WriteKind::Delete => access.delete(&r.keyspace, &r.table, row).await,
        };
        written.map_err(access_status)?;
        Ok(Response::new(Empty {}))
    }
}
