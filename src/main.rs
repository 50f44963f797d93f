use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use hyper::{
    Body as HttpBody, Request as HttpRequest, Response as HttpResponse, Server as HyperServer,
    header::{CONTENT_TYPE, HeaderValue},
    service::{make_service_fn, service_fn},
};
use pathstore::{
    PathStoreNode,
    client::{local_node_id, register},
    config::{NodeCredential, NodeOptions, ParentOptions, RpcOptions},
    metrics,
    store::memory::MemoryStore,
    telemetry,
};
use tonic::transport::Server;
use tonic_prometheus_layer::{MetricsLayer, metrics as tl_metrics};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, field, info};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use url::Url;

#[derive(Parser)]
#[command(name = "pathstore")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a PathStore node
    Server(ServerArgs),
    /// Print the id of the node at the given address
    NodeId { addr: String },
    /// Obtain client credentials for an installed application
    RegisterClient {
        addr: String,
        application: String,
        password: String,
    },
}

#[derive(Args)]
struct ServerArgs {
    #[arg(long)]
    node_id: i32,
    /// Omit for the root of the tree
    #[arg(long, requires = "parent_addr")]
    parent_node_id: Option<i32>,
    #[arg(long, requires = "parent_node_id")]
    parent_addr: Option<String>,
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    node_addr: String,
    /// Run the deployment and schema masters (the root always does)
    #[arg(long)]
    master: bool,
    #[arg(long, default_value = "pathstore_node")]
    node_username: String,
    #[arg(long, default_value = "pathstore_node")]
    node_password: String,
    #[arg(long, default_value_t = 1_000)]
    fsm_interval_ms: u64,
    #[arg(long, default_value_t = 1_000)]
    sync_interval_ms: u64,
    #[arg(long, default_value_t = 4)]
    worker_pool: usize,
    /// Shell command provisioning a child node
    #[arg(long)]
    deploy_command: Option<String>,
    /// Shell command decommissioning a child node
    #[arg(long)]
    remove_command: Option<String>,
}

impl ServerArgs {
    fn options(&self) -> NodeOptions {
        let mut options = NodeOptions::root(self.node_id, self.node_addr.clone());
        if let (Some(node_id), Some(addr)) = (self.parent_node_id, &self.parent_addr) {
            options.parent = Some(ParentOptions {
                node_id,
                addr: addr.clone(),
            });
        }
        options.master = self.master || options.is_root();
        options.node_credential = NodeCredential {
            username: self.node_username.clone(),
            password: self.node_password.clone(),
        };
        options.loops.fsm_interval = Duration::from_millis(self.fsm_interval_ms);
        options.loops.sync_interval = Duration::from_millis(self.sync_interval_ms);
        options.deployment.worker_pool = self.worker_pool;
        options.deployment.deploy_command = self.deploy_command.clone();
        options.deployment.remove_command = self.remove_command.clone();
        options
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let guard = telemetry::init_tracing("pathstore", Some(args.node_addr.clone()))?;
            run_server(args).await?;
            if let Err(err) = guard.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
        Command::NodeId { addr } => {
            let guard = telemetry::init_tracing("pathstore-cli", None)?;
            println!("{}", local_node_id(&addr, &RpcOptions::default()).await?);
            if let Err(err) = guard.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
        Command::RegisterClient {
            addr,
            application,
            password,
        } => {
            let guard = telemetry::init_tracing("pathstore-cli", None)?;
            let (username, secret) =
                register(&addr, &application, &password, &RpcOptions::default()).await?;
            println!("username: {username}");
            println!("password: {secret}");
            if let Err(err) = guard.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
    }
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(&args.node_addr)?;
    let port = url.port().unwrap_or(80);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let metrics_port = port
        .checked_add(1000)
        .ok_or("no room for the metrics port above the gRPC port")?;
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    let node = PathStoreNode::start(args.options(), Arc::new(MemoryStore::new())).await?;

    // per-RPC metrics land in the default registry next to ours
    tl_metrics::try_init_settings(tl_metrics::GlobalSettings {
        registry: prometheus::default_registry().clone(),
        ..Default::default()
    })
    .ok();
    let metrics_layer = MetricsLayer::new();

    tokio::spawn(async move {
        let make_svc = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|_req: HttpRequest<HttpBody>| async move {
                let mut response = HttpResponse::new(HttpBody::from(metrics::encode_to_string()));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                Ok::<_, Infallible>(response)
            }))
        });

        if let Err(e) = HyperServer::bind(&metrics_addr).serve(make_svc).await {
            tracing::error!(%e, "metrics server error");
        }
    });

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for ctrl-c");
        }
    };

    info!(node_id = node.node_id(), "PathStore gRPC server listening on {addr}");
    if telemetry::tracing_disabled() {
        Server::builder()
            .layer(metrics_layer)
            .add_service(node.grpc_service())
            .serve_with_shutdown(addr, shutdown)
            .await?;
    } else {
        let trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(|request: &tonic::codegen::http::Request<_>| {
                let path = request.uri().path();
                let span = tracing::debug_span!(
                    "grpc.request",
                    otel.name = %path,
                    grpc.method = %path,
                    grpc.status_code = field::Empty,
                );
                let context = telemetry::extract_remote_context_from_headers(request.headers());
                span.set_parent(context);
                span
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));
        Server::builder()
            .layer(metrics_layer)
            .layer(trace_layer)
            .add_service(node.grpc_service())
            .serve_with_shutdown(addr, shutdown)
            .await?;
    }
    node.shutdown().await;
    Ok(())
}
