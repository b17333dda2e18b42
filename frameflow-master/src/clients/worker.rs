use crate::retries::{with_retries, RetryConfig};
use async_trait::async_trait;
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobParameters, CommandResult, Empty, OpPath, OpRegistration, PythonKernelRegistration,
};
use frameflow_api_grpc::proto::frameflow::worker::v1::worker_service_client::WorkerServiceClient;
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum WorkerClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("connection error: {0}")]
    Grpc(#[from] tonic::Status),
    #[error("worker returned error: {0}")]
    Rejected(String),
}

impl WorkerClientError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            WorkerClientError::Transport(_) | WorkerClientError::Grpc(_)
        )
    }
}

/// The master's view of one worker's control surface. The production
/// implementation speaks gRPC; tests substitute in-process fakes.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    fn address(&self) -> &str;

    async fn new_job(&self, params: BulkJobParameters)
        -> Result<CommandResult, WorkerClientError>;
    async fn ping(&self) -> Result<(), WorkerClientError>;
    async fn shutdown(&self) -> Result<(), WorkerClientError>;
    async fn load_op(&self, op_path: OpPath) -> Result<(), WorkerClientError>;
    async fn register_op(&self, registration: OpRegistration) -> Result<(), WorkerClientError>;
    async fn register_python_kernel(
        &self,
        registration: PythonKernelRegistration,
    ) -> Result<(), WorkerClientError>;
    async fn poke_watchdog(&self) -> Result<(), WorkerClientError>;
}

pub trait WorkerConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn WorkerConnection>, WorkerClientError>;
}

pub struct GrpcWorkerConnector {
    retries: RetryConfig,
}

impl GrpcWorkerConnector {
    pub fn new(retries: RetryConfig) -> Self {
        Self { retries }
    }
}

impl WorkerConnector for GrpcWorkerConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn WorkerConnection>, WorkerClientError> {
        let endpoint = Endpoint::from_shared(format!("http://{address}"))?;
        let channel = endpoint.connect_lazy();
        Ok(Arc::new(GrpcWorkerConnection {
            address: address.to_string(),
            client: WorkerServiceClient::new(channel),
            retries: self.retries.clone(),
        }))
    }
}

pub struct GrpcWorkerConnection {
    address: String,
    client: WorkerServiceClient<Channel>,
    retries: RetryConfig,
}

impl GrpcWorkerConnection {
    fn expect_success(result: CommandResult) -> Result<(), WorkerClientError> {
        if result.success {
            Ok(())
        } else {
            Err(WorkerClientError::Rejected(result.msg))
        }
    }
}

#[async_trait]
impl WorkerConnection for GrpcWorkerConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn new_job(
        &self,
        params: BulkJobParameters,
    ) -> Result<CommandResult, WorkerClientError> {
        with_retries(
            "worker new-job",
            &self.retries,
            WorkerClientError::is_retriable,
            || {
                let mut client = self.client.clone();
                let params = params.clone();
                async move { Ok(client.new_job(params).await?.into_inner()) }
            },
        )
        .await
    }

    async fn ping(&self) -> Result<(), WorkerClientError> {
        let mut client = self.client.clone();
        client.ping(Empty {}).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), WorkerClientError> {
        with_retries(
            "worker shutdown",
            &self.retries,
            WorkerClientError::is_retriable,
            || {
                let mut client = self.client.clone();
                async move {
                    let result = client.shutdown(Empty {}).await?.into_inner();
                    Self::expect_success(result)
                }
            },
        )
        .await
    }

    async fn load_op(&self, op_path: OpPath) -> Result<(), WorkerClientError> {
        with_retries(
            "worker load-op",
            &self.retries,
            WorkerClientError::is_retriable,
            || {
                let mut client = self.client.clone();
                let op_path = op_path.clone();
                async move {
                    let result = client.load_op(op_path).await?.into_inner();
                    Self::expect_success(result)
                }
            },
        )
        .await
    }

    async fn register_op(&self, registration: OpRegistration) -> Result<(), WorkerClientError> {
        with_retries(
            "worker register-op",
            &self.retries,
            WorkerClientError::is_retriable,
            || {
                let mut client = self.client.clone();
                let registration = registration.clone();
                async move {
                    let result = client.register_op(registration).await?.into_inner();
                    Self::expect_success(result)
                }
            },
        )
        .await
    }

    async fn register_python_kernel(
        &self,
        registration: PythonKernelRegistration,
    ) -> Result<(), WorkerClientError> {
        with_retries(
            "worker register-python-kernel",
            &self.retries,
            WorkerClientError::is_retriable,
            || {
                let mut client = self.client.clone();
                let registration = registration.clone();
                async move {
                    let result = client
                        .register_python_kernel(registration)
                        .await?
                        .into_inner();
                    Self::expect_success(result)
                }
            },
        )
        .await
    }

    async fn poke_watchdog(&self) -> Result<(), WorkerClientError> {
        let mut client = self.client.clone();
        client.poke_watchdog(Empty {}).await?;
        Ok(())
    }
}
