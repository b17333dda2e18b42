pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod grpcapi;
pub mod metrics;
pub mod model;
pub mod retries;
pub mod service;
pub mod storage;
pub mod tracing;

use crate::clients::worker::GrpcWorkerConnector;
use crate::config::MasterConfig;
use crate::service::ingest::FsVideoIngest;
use crate::service::master::Master;
use crate::service::meta::MetadataStore;
use anyhow::anyhow;
use poem::listener::Acceptor;
use poem::listener::Listener;
use prometheus::Registry;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::task::JoinSet;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct RunDetails {
    pub grpc_port: u16,
    pub http_port: u16,
}

#[derive(Clone)]
pub struct FrameflowMaster {
    config: MasterConfig,
    prometheus_registry: Registry,
    master: Arc<Master>,
}

impl FrameflowMaster {
    pub async fn new(
        config: MasterConfig,
        prometheus_registry: Registry,
    ) -> Result<Self, anyhow::Error> {
        let storage = storage::configured(&config.storage, &config.db_path);
        let connector = Arc::new(GrpcWorkerConnector::new(config.retries.clone()));
        let ingest = Arc::new(FsVideoIngest::new(MetadataStore::new(storage.clone())));

        let master = Master::new(config.clone(), storage, connector, ingest)
            .await
            .map_err(|err| anyhow!(err).context("Master initialization"))?;

        Ok(Self {
            config,
            prometheus_registry,
            master,
        })
    }

    pub fn master(&self) -> Arc<Master> {
        self.master.clone()
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        self.master.start(join_set);

        let grpc_port = self.start_grpc_server(join_set).await?;
        let http_port = self.start_http_server(join_set).await?;

        ::tracing::info!(
            "Started frameflow master on ports: http: {}, grpc: {}",
            http_port,
            grpc_port
        );

        Ok(RunDetails {
            grpc_port,
            http_port,
        })
    }

    async fn start_grpc_server(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<u16, anyhow::Error> {
        grpcapi::start_grpc_server(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.config.grpc_port).into(),
            self.master.clone(),
            join_set,
        )
        .await
        .map_err(|err| anyhow!(err).context("gRPC server failed"))
    }

    async fn start_http_server(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<u16, anyhow::Error> {
        let app = api::combined_routes(self.prometheus_registry.clone());

        let poem_listener =
            poem::listener::TcpListener::bind(format!("0.0.0.0:{}", self.config.http_port));
        let acceptor = poem_listener.into_acceptor().await?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .expect("socket address")
            .port();

        join_set.spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run(app)
                .await
                .map_err(|e| e.into())
        });

        Ok(port)
    }
}
