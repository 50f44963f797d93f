pub mod access;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod convert;
pub mod daemon;
pub mod delta;
pub mod deployment;
pub mod directory;
pub mod merge;
pub mod metrics;
pub mod migration;
pub mod node;
pub mod push;
pub mod schema;
pub mod schema_fsm;
pub mod service;
pub mod session;
pub mod store;
pub mod tables;
pub mod telemetry;
pub mod topology;

pub mod rpc {
    tonic::include_proto!("pathstore");
}

pub use client::ApplicationClient;
pub use node::PathStoreNode;

use tonic::{codegen::InterceptedService, transport::Channel};

/// Generated client with the authentication envelope installed.
pub type AuthedClient = rpc::path_store_client::PathStoreClient<
    InterceptedService<Channel, auth::AuthInterceptor>,
>;

impl rpc::path_store_client::PathStoreClient<Channel> {
    /// Connect to `dst`, attaching credentials and the current trace context
    /// to every request through `interceptor`.
    pub async fn connect_authenticated(
        dst: String,
        interceptor: auth::AuthInterceptor,
        options: &config::RpcOptions,
    ) -> Result<AuthedClient, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(dst)?
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .connect()
            .await?;
        Ok(rpc::path_store_client::PathStoreClient::with_interceptor(
            channel,
            interceptor,
        ))
    }

    /// Like [`Self::connect_authenticated`] but the connection is only
    /// established on first use, and re-established after failures.
    pub fn connect_lazy_authenticated(
        dst: String,
        interceptor: auth::AuthInterceptor,
        options: &config::RpcOptions,
    ) -> Result<AuthedClient, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(dst)?
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .connect_lazy();
        Ok(rpc::path_store_client::PathStoreClient::with_interceptor(
            channel,
            interceptor,
        ))
    }
}
