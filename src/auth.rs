//! Credentials, the per-endpoint capability table and the client-side
//! authentication envelope.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    hash::Hash,
    str::FromStr,
    sync::{Arc, RwLock},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use tonic::{
    Request, Status,
    metadata::{MetadataMap, MetadataValue},
    service::Interceptor,
};
use uuid::Uuid;

use crate::{
    config::NodeCredential,
    metrics::AUTH_FAILURES,
    store::{Clause, Row, Store, StoreError, Value, cell},
    tables::{LOCAL_AUTH, LOCAL_KEYSPACE, columns},
    telemetry,
};

pub const USERNAME_HEADER: &str = "x-pathstore-username";
pub const PASSWORD_HEADER: &str = "x-pathstore-password";
pub const NODE_ID_HEADER: &str = "x-pathstore-node-id";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing credentials for {0}")]
    Missing(&'static str),
    #[error("invalid credentials for {0}")]
    Invalid(&'static str),
    #[error("malformed credential record: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing(_) | AuthError::Invalid(_) => Status::unauthenticated(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}

/// What a credential is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialRole {
    /// Node-to-node calls inside the tree.
    Node,
    /// Ephemeral credentials handed to application clients.
    Client,
    /// Operator or tooling credentials registered by hand.
    Auxiliary,
}

impl CredentialRole {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialRole::Node => "node",
            CredentialRole::Client => "client",
            CredentialRole::Auxiliary => "auxiliary",
        }
    }
}

/// A username/password pair indexed by `searchable` (a node id, an
/// application name, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential<T> {
    pub searchable: T,
    pub username: String,
    pub password: String,
    pub role: CredentialRole,
}

impl<T> Credential<T> {
    pub fn new(
        searchable: T,
        username: impl Into<String>,
        password: impl Into<String>,
        role: CredentialRole,
    ) -> Self {
        Self {
            searchable,
            username: username.into(),
            password: password.into(),
            role,
        }
    }
}

/// Equality of credentials on username and password only.
pub trait SameCredential {
    fn username(&self) -> &str;
    fn password(&self) -> &str;

    fn is_same<O: SameCredential + ?Sized>(&self, other: &O) -> bool {
        self.username() == other.username() && self.password() == other.password()
    }
}

impl<T> SameCredential for Credential<T> {
    fn username(&self) -> &str {
        &self.username
    }

    fn password(&self) -> &str {
        &self.password
    }
}

/// Credentials presented on an incoming call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Presented {
    pub username: String,
    pub password: String,
    pub node_id: Option<i32>,
}

impl Presented {
    pub fn from_metadata(metadata: &MetadataMap) -> Option<Self> {
        let get = |key: &str| metadata.get(key).and_then(|v| v.to_str().ok());
        Some(Self {
            username: get(USERNAME_HEADER)?.to_string(),
            password: get(PASSWORD_HEADER)?.to_string(),
            node_id: get(NODE_ID_HEADER).and_then(|v| v.parse().ok()),
        })
    }
}

impl SameCredential for Presented {
    fn username(&self) -> &str {
        &self.username
    }

    fn password(&self) -> &str {
        &self.password
    }
}

/// Keys a [`CredentialCache`] can be indexed by.
pub trait Searchable: Clone + Eq + Hash + Display + FromStr + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Display + FromStr + Send + Sync + 'static> Searchable for T {}

/// In-memory credential set of one role, written through to
/// `pathstore_local.local_auth` when a store is attached.
pub struct CredentialCache<T> {
    role: CredentialRole,
    entries: RwLock<HashMap<T, Vec<Credential<T>>>>,
    store: Option<Arc<dyn Store>>,
}

impl<T: Searchable> CredentialCache<T> {
    pub fn new(role: CredentialRole, store: Option<Arc<dyn Store>>) -> Self {
        Self {
            role,
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn role(&self) -> CredentialRole {
        self.role
    }

    /// Fill the cache from the backing table. Returns the number of
    /// credentials loaded.
    pub async fn load(&self) -> Result<usize, AuthError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let rows = store
            .select(
                LOCAL_KEYSPACE,
                LOCAL_AUTH,
                &[Clause::new(columns::ROLE, self.role.as_str())],
                None,
            )
            .await?;
        let mut loaded = 0;
        for row in rows {
            match self.decode(&row) {
                Ok(credential) => {
                    self.cache(credential);
                    loaded += 1;
                }
                Err(err) => tracing::warn!(%err, role = self.role.as_str(), "skipping credential"),
            }
        }
        Ok(loaded)
    }

    fn decode(&self, row: &Row) -> Result<Credential<T>, AuthError> {
        let text = |col: &str| {
            cell(row, col)
                .as_text()
                .map(str::to_string)
                .ok_or_else(|| AuthError::Malformed(format!("{col} is not text")))
        };
        let raw = text(columns::SEARCHABLE)?;
        let searchable = raw
            .parse()
            .map_err(|_| AuthError::Malformed(format!("bad key {raw}")))?;
        Ok(Credential::new(
            searchable,
            text(columns::USERNAME)?,
            text(columns::PASSWORD)?,
            self.role,
        ))
    }

    fn cache(&self, credential: Credential<T>) {
        if let Ok(mut entries) = self.entries.write() {
            let list = entries.entry(credential.searchable.clone()).or_default();
            list.retain(|c| c.username != credential.username);
            list.push(credential);
        }
    }

    /// Register a credential, replacing one with the same key and username.
    pub async fn add(&self, credential: Credential<T>) -> Result<(), AuthError> {
        if let Some(store) = &self.store {
            let row = Row::from([
                (columns::ROLE.to_string(), Value::from(self.role.as_str())),
                (
                    columns::SEARCHABLE.to_string(),
                    Value::from(credential.searchable.to_string()),
                ),
                (columns::USERNAME.to_string(), Value::from(credential.username.as_str())),
                (columns::PASSWORD.to_string(), Value::from(credential.password.as_str())),
            ]);
            store.insert(LOCAL_KEYSPACE, LOCAL_AUTH, row).await?;
        }
        self.cache(credential);
        Ok(())
    }

    /// Drop every credential stored under `searchable`.
    pub async fn remove(&self, searchable: &T) -> Result<(), AuthError> {
        if let Some(store) = &self.store {
            store
                .delete(
                    LOCAL_KEYSPACE,
                    LOCAL_AUTH,
                    &[
                        Clause::new(columns::ROLE, self.role.as_str()),
                        Clause::new(columns::SEARCHABLE, searchable.to_string()),
                    ],
                )
                .await?;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(searchable);
        }
        Ok(())
    }

    /// Every key with at least one credential.
    pub fn keys(&self) -> Vec<T> {
        self.entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, searchable: &T) -> Vec<Credential<T>> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(searchable).cloned())
            .unwrap_or_default()
    }

    /// The cached credential matching `presented`, ignoring its key.
    pub fn find<C: SameCredential + ?Sized>(&self, presented: &C) -> Option<Credential<T>> {
        let entries = self.entries.read().ok()?;
        entries
            .values()
            .flatten()
            .find(|c| c.is_same(presented))
            .cloned()
    }

    pub fn contains<C: SameCredential + ?Sized>(&self, presented: &C) -> bool {
        self.find(presented).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fresh credentials for a client of `application`.
pub fn issue_client_credential(application: &str) -> Credential<String> {
    let secret: [u8; 24] = rand::random();
    Credential::new(
        application.to_string(),
        format!("{application}-{}", Uuid::new_v4().simple()),
        URL_SAFE_NO_PAD.encode(secret),
        CredentialRole::Client,
    )
}

/// RPC endpoints, for the capability table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    RegisterApplicationClient,
    GetSchemaInfo,
    ValidateSession,
    ForcePush,
    ForceSynchronize,
    GetLocalNodeId,
    CreateQueryDelta,
    GetDelta,
    AddQueryEntry,
    PushRows,
    Select,
    Write,
}

const NODE_ONLY: &[CredentialRole] = &[CredentialRole::Node];
const ANY_ROLE: &[CredentialRole] = &[
    CredentialRole::Node,
    CredentialRole::Client,
    CredentialRole::Auxiliary,
];

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::RegisterApplicationClient => "RegisterApplicationClient",
            Endpoint::GetSchemaInfo => "GetSchemaInfo",
            Endpoint::ValidateSession => "ValidateSession",
            Endpoint::ForcePush => "ForcePush",
            Endpoint::ForceSynchronize => "ForceSynchronize",
            Endpoint::GetLocalNodeId => "GetLocalNodeId",
            Endpoint::CreateQueryDelta => "CreateQueryDelta",
            Endpoint::GetDelta => "GetDelta",
            Endpoint::AddQueryEntry => "AddQueryEntry",
            Endpoint::PushRows => "PushRows",
            Endpoint::Select => "Select",
            Endpoint::Write => "Write",
        }
    }

    /// Roles accepted by the endpoint. Empty means unauthenticated.
    pub fn allowed_roles(self) -> &'static [CredentialRole] {
        match self {
            Endpoint::RegisterApplicationClient | Endpoint::GetLocalNodeId => &[],
            Endpoint::ForcePush
            | Endpoint::ForceSynchronize
            | Endpoint::CreateQueryDelta
            | Endpoint::GetDelta
            | Endpoint::AddQueryEntry
            | Endpoint::PushRows => NODE_ONLY,
            Endpoint::GetSchemaInfo
            | Endpoint::ValidateSession
            | Endpoint::Select
            | Endpoint::Write => ANY_ROLE,
        }
    }
}

/// Who made an accepted call. `role` is `None` on unauthenticated endpoints.
/// `node_id` is only vouched for when `role` is [`CredentialRole::Node`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub role: Option<CredentialRole>,
    pub username: Option<String>,
    pub node_id: Option<i32>,
}

/// Gatekeeper consulted by every RPC handler.
pub struct AuthManager {
    nodes: Arc<CredentialCache<i32>>,
    clients: Arc<CredentialCache<String>>,
    auxiliary: Arc<CredentialCache<String>>,
}

impl AuthManager {
    pub fn new(
        nodes: Arc<CredentialCache<i32>>,
        clients: Arc<CredentialCache<String>>,
        auxiliary: Arc<CredentialCache<String>>,
    ) -> Self {
        Self {
            nodes,
            clients,
            auxiliary,
        }
    }

    pub fn nodes(&self) -> &Arc<CredentialCache<i32>> {
        &self.nodes
    }

    pub fn clients(&self) -> &Arc<CredentialCache<String>> {
        &self.clients
    }

    pub fn auxiliary(&self) -> &Arc<CredentialCache<String>> {
        &self.auxiliary
    }

    fn matches_role(&self, role: CredentialRole, presented: &Presented) -> bool {
        match role {
            // a node credential only vouches for the node id it is stored under
            CredentialRole::Node => presented
                .node_id
                .is_some_and(|id| self.nodes.get(&id).iter().any(|c| c.is_same(presented))),
            CredentialRole::Client => self.clients.contains(presented),
            CredentialRole::Auxiliary => self.auxiliary.contains(presented),
        }
    }

    /// Hold the tree-wide node credential under `own` and every id in
    /// `members`, and under no other id. Returns the number of ids added or
    /// dropped.
    pub async fn sync_node_credentials(
        &self,
        credential: &NodeCredential,
        own: i32,
        members: impl IntoIterator<Item = i32>,
    ) -> Result<usize, AuthError> {
        let mut wanted: HashSet<i32> = members.into_iter().collect();
        wanted.insert(own);
        let mut changed = 0;
        for id in self.nodes.keys() {
            if !wanted.contains(&id) {
                self.nodes.remove(&id).await?;
                changed += 1;
            }
        }
        for id in wanted {
            let known = self
                .nodes
                .get(&id)
                .iter()
                .any(|c| c.username == credential.username && c.password == credential.password);
            if !known {
                self.nodes
                    .add(Credential::new(
                        id,
                        &credential.username,
                        &credential.password,
                        CredentialRole::Node,
                    ))
                    .await?;
                changed += 1;
            }
        }
        if changed > 0 {
            tracing::debug!(changed, "node credentials updated");
        }
        Ok(changed)
    }

    /// Check the envelope of a call to `endpoint`.
    pub fn authenticate(
        &self,
        endpoint: Endpoint,
        metadata: &MetadataMap,
    ) -> Result<Caller, AuthError> {
        let presented = Presented::from_metadata(metadata);
        let roles = endpoint.allowed_roles();
        if roles.is_empty() {
            return Ok(Caller {
                role: None,
                username: presented.as_ref().map(|p| p.username.clone()),
                node_id: presented.and_then(|p| p.node_id),
            });
        }
        let Some(presented) = presented else {
            AUTH_FAILURES.with_label_values(&[endpoint.name()]).inc();
            return Err(AuthError::Missing(endpoint.name()));
        };
        match roles.iter().find(|r| self.matches_role(**r, &presented)) {
            Some(role) => Ok(Caller {
                role: Some(*role),
                username: Some(presented.username),
                node_id: presented.node_id.filter(|_| *role == CredentialRole::Node),
            }),
            None => {
                AUTH_FAILURES.with_label_values(&[endpoint.name()]).inc();
                tracing::debug!(endpoint = endpoint.name(), user = %presented.username, "rejected call");
                Err(AuthError::Invalid(endpoint.name()))
            }
        }
    }
}

/// Source of the credentials attached to outgoing calls.
pub type CredentialSource = Arc<dyn Fn() -> (String, String) + Send + Sync>;

/// Client interceptor adding the authentication envelope and the current
/// trace context to every request.
#[derive(Clone)]
pub struct AuthInterceptor {
    credentials: CredentialSource,
    node_id: Option<i32>,
}

impl AuthInterceptor {
    pub fn new(credentials: impl Fn() -> (String, String) + Send + Sync + 'static) -> Self {
        Self {
            credentials: Arc::new(credentials),
            node_id: None,
        }
    }

    /// Interceptor presenting fixed credentials.
    pub fn fixed(username: impl Into<String>, password: impl Into<String>) -> Self {
        let (username, password) = (username.into(), password.into());
        Self::new(move || (username.clone(), password.clone()))
    }

    /// Interceptor without credentials, for unauthenticated endpoints.
    pub fn anonymous() -> Self {
        Self::fixed("", "")
    }

    /// Mark outgoing calls as coming from node `node_id`.
    pub fn with_node_id(mut self, node_id: i32) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let (username, password) = (self.credentials)();
        let metadata = request.metadata_mut();
        if !username.is_empty() {
            let username = MetadataValue::try_from(username.as_str())
                .map_err(|_| Status::invalid_argument("username is not valid metadata"))?;
            let password = MetadataValue::try_from(password.as_str())
                .map_err(|_| Status::invalid_argument("password is not valid metadata"))?;
            metadata.insert(USERNAME_HEADER, username);
            metadata.insert(PASSWORD_HEADER, password);
        }
        if let Some(node_id) = self.node_id {
            metadata.insert(NODE_ID_HEADER, MetadataValue::from(node_id));
        }
        telemetry::inject_context(metadata);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::tables::local_keyspace;

    fn manager() -> AuthManager {
        AuthManager::new(
            Arc::new(CredentialCache::new(CredentialRole::Node, None)),
            Arc::new(CredentialCache::new(CredentialRole::Client, None)),
            Arc::new(CredentialCache::new(CredentialRole::Auxiliary, None)),
        )
    }

    fn envelope(username: &str, password: &str) -> MetadataMap {
        AuthInterceptor::fixed(username, password)
            .with_node_id(3)
            .call(Request::new(()))
            .unwrap()
            .metadata()
            .clone()
    }

    #[test]
    fn sameness_ignores_the_search_key() {
        let a = Credential::new(1, "u", "p", CredentialRole::Node);
        let b = Credential::new("app".to_string(), "u", "p", CredentialRole::Client);
        let c = Credential::new(1, "u", "other", CredentialRole::Node);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }

    #[tokio::test]
    async fn capability_table_gates_endpoints() {
        let auth = manager();
        auth.nodes()
            .add(Credential::new(3, "node", "secret", CredentialRole::Node))
            .await
            .unwrap();
        auth.clients()
            .add(Credential::new("app".to_string(), "app-1", "pw", CredentialRole::Client))
            .await
            .unwrap();

        let node = envelope("node", "secret");
        let client = envelope("app-1", "pw");
        let wrong = envelope("app-1", "nope");

        let caller = auth.authenticate(Endpoint::CreateQueryDelta, &node).unwrap();
        assert_eq!(caller.role, Some(CredentialRole::Node));
        assert_eq!(caller.node_id, Some(3));
        assert!(matches!(
            auth.authenticate(Endpoint::CreateQueryDelta, &client),
            Err(AuthError::Invalid(_))
        ));
        assert_eq!(
            auth.authenticate(Endpoint::Select, &client).unwrap().role,
            Some(CredentialRole::Client)
        );
        assert!(auth.authenticate(Endpoint::Select, &wrong).is_err());
        assert!(matches!(
            auth.authenticate(Endpoint::Write, &MetadataMap::new()),
            Err(AuthError::Missing(_))
        ));
        let open = auth
            .authenticate(Endpoint::GetLocalNodeId, &MetadataMap::new())
            .unwrap();
        assert_eq!(open.role, None);
    }

    #[tokio::test]
    async fn node_credentials_are_bound_to_their_node_id() {
        let auth = manager();
        let shared = NodeCredential::default();
        assert_eq!(auth.sync_node_credentials(&shared, 1, [2, 3]).await.unwrap(), 3);
        assert_eq!(auth.sync_node_credentials(&shared, 1, [2, 3]).await.unwrap(), 0);

        let as_node = |id: i32| {
            AuthInterceptor::fixed(&shared.username, &shared.password)
                .with_node_id(id)
                .call(Request::new(()))
                .unwrap()
                .metadata()
                .clone()
        };
        let caller = auth.authenticate(Endpoint::PushRows, &as_node(2)).unwrap();
        assert_eq!(caller.node_id, Some(2));
        assert!(matches!(
            auth.authenticate(Endpoint::PushRows, &as_node(9)),
            Err(AuthError::Invalid(_))
        ));
        let anonymous_id = AuthInterceptor::fixed(&shared.username, &shared.password)
            .call(Request::new(()))
            .unwrap()
            .metadata()
            .clone();
        assert!(auth.authenticate(Endpoint::PushRows, &anonymous_id).is_err());

        // removed nodes lose access
        assert_eq!(auth.sync_node_credentials(&shared, 1, [3]).await.unwrap(), 1);
        assert!(auth.authenticate(Endpoint::PushRows, &as_node(2)).is_err());
        assert_eq!(auth.nodes().len(), 2);
    }

    #[tokio::test]
    async fn credentials_write_through_and_reload() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.create_keyspace(&local_keyspace()).await.unwrap();
        let cache: CredentialCache<String> =
            CredentialCache::new(CredentialRole::Client, Some(store.clone()));
        let issued = issue_client_credential("shop");
        cache.add(issued.clone()).await.unwrap();
        cache
            .add(Credential::new("other".to_string(), "x", "y", CredentialRole::Client))
            .await
            .unwrap();

        let reloaded: CredentialCache<String> =
            CredentialCache::new(CredentialRole::Client, Some(store.clone()));
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(reloaded.get(&"shop".to_string()), vec![issued.clone()]);
        assert!(reloaded.contains(&issued));

        reloaded.remove(&"shop".to_string()).await.unwrap();
        let again: CredentialCache<String> =
            CredentialCache::new(CredentialRole::Client, Some(store));
        assert_eq!(again.load().await.unwrap(), 1);

        // a different role never sees these rows
        let nodes: CredentialCache<i32> = CredentialCache::new(CredentialRole::Node, None);
        assert_eq!(nodes.load().await.unwrap(), 0);
    }

    #[test]
    fn issued_credentials_are_unique() {
        let a = issue_client_credential("shop");
        let b = issue_client_credential("shop");
        assert_ne!(a.username, b.username);
        assert_ne!(a.password, b.password);
        assert!(a.username.starts_with("shop-"));
    }
}
