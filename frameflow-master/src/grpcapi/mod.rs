use crate::error::{error_result, ok_result};
use crate::service::master::Master;
use crate::service::state::WorkResponse;
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobParameters, CommandResult, Empty, OpPath, OpRegistration, PythonKernelRegistration,
};
use frameflow_api_grpc::proto::frameflow::master::v1::master_service_server::{
    MasterService, MasterServiceServer,
};
use frameflow_api_grpc::proto::frameflow::master::v1::{
    next_work_response, ActiveWorkersResponse, DeleteTablesRequest, FinishedWorkRequest,
    GetOpInfoRequest, GetOpInfoResponse, GetTablesRequest, GetTablesResponse, IngestVideosRequest,
    IngestVideosResponse, JobStatusResponse, ListTablesResponse, NextWorkResponse, NodeInfo,
    RegisterWorkerRequest, RegisterWorkerResponse, TaskAssignment,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

pub struct MasterGrpcApi {
    pub master: Arc<Master>,
}

#[async_trait::async_trait]
impl MasterService for MasterGrpcApi {
    async fn list_tables(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ListTablesResponse>, Status> {
        let table_names = self.master.list_tables().await;
        Ok(Response::new(ListTablesResponse { table_names }))
    }

    async fn get_tables(
        &self,
        request: Request<GetTablesRequest>,
    ) -> Result<Response<GetTablesResponse>, Status> {
        let request = request.into_inner();
        let (result, tables) = self.master.get_tables(&request.table_names).await;
        Ok(Response::new(GetTablesResponse {
            result: Some(result),
            tables,
        }))
    }

    async fn delete_tables(
        &self,
        request: Request<DeleteTablesRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        self.master
            .delete_tables(&request.table_names)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn ingest_videos(
        &self,
        request: Request<IngestVideosRequest>,
    ) -> Result<Response<IngestVideosResponse>, Status> {
        let request = request.into_inner();
        let (result, failed) = self
            .master
            .ingest_videos(&request.table_names, &request.video_paths, request.inplace)
            .await;
        Ok(Response::new(IngestVideosResponse {
            result: Some(result),
            failed_paths: failed.iter().map(|f| f.path.clone()).collect(),
            failed_messages: failed.into_iter().map(|f| f.message).collect(),
        }))
    }

    async fn load_op(
        &self,
        request: Request<OpPath>,
    ) -> Result<Response<CommandResult>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.master.load_op(request.path).await))
    }

    async fn register_op(
        &self,
        request: Request<OpRegistration>,
    ) -> Result<Response<CommandResult>, Status> {
        let registration = request.into_inner();
        Ok(Response::new(self.master.register_op(registration).await))
    }

    async fn register_python_kernel(
        &self,
        request: Request<PythonKernelRegistration>,
    ) -> Result<Response<CommandResult>, Status> {
        let registration = request.into_inner();
        Ok(Response::new(
            self.master.register_python_kernel(registration).await,
        ))
    }

    async fn get_op_info(
        &self,
        request: Request<GetOpInfoRequest>,
    ) -> Result<Response<GetOpInfoResponse>, Status> {
        let request = request.into_inner();
        let (result, variadic_inputs, input_columns, output_columns) =
            self.master.get_op_info(&request.op_name).await;
        Ok(Response::new(GetOpInfoResponse {
            result: Some(result),
            variadic_inputs,
            input_columns,
            output_columns,
        }))
    }

    async fn new_job(
        &self,
        request: Request<BulkJobParameters>,
    ) -> Result<Response<CommandResult>, Status> {
        let params = request.into_inner();
        Ok(Response::new(self.master.new_job(params).await))
    }

    async fn get_job_status(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<JobStatusResponse>, Status> {
        Ok(Response::new(self.master.job_status().await))
    }

    async fn shutdown(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<CommandResult>, Status> {
        Ok(Response::new(self.master.request_shutdown()))
    }

    async fn poke_watchdog(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.master.poke_watchdog().await;
        Ok(Response::new(Empty {}))
    }

    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let peer_ip = request.remote_addr().map(|addr| addr.ip().to_string());
        let port = request.into_inner().port;

        let Some(peer_ip) = peer_ip else {
            return Ok(Response::new(RegisterWorkerResponse {
                result: Some(error_result(
                    "Could not determine the worker's address from the connection",
                )),
                node_id: -1,
            }));
        };

        let response = match self.master.register_worker(&peer_ip, port as u16).await {
            Ok(node_id) => RegisterWorkerResponse {
                result: Some(ok_result()),
                node_id,
            },
            Err(err) => RegisterWorkerResponse {
                result: Some(error_result(err.to_string())),
                node_id: -1,
            },
        };
        Ok(Response::new(response))
    }

    async fn unregister_worker(
        &self,
        request: Request<NodeInfo>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        self.master
            .unregister_worker(request.node_id)
            .await
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn active_workers(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ActiveWorkersResponse>, Status> {
        let workers = self.master.active_workers().await;
        Ok(Response::new(ActiveWorkersResponse { workers }))
    }

    async fn next_work(
        &self,
        request: Request<NodeInfo>,
    ) -> Result<Response<NextWorkResponse>, Status> {
        let request = request.into_inner();
        let assignment = match self.master.next_work(request.node_id).await {
            WorkResponse::NoMoreWork => next_work_response::Assignment::NoMoreWork(Empty {}),
            WorkResponse::WaitForWork => next_work_response::Assignment::WaitForWork(Empty {}),
            WorkResponse::Task {
                table_id,
                job_index,
                task_index,
                output_rows,
            } => next_work_response::Assignment::Task(TaskAssignment {
                table_id,
                job_index,
                task_index,
                output_rows,
            }),
        };
        Ok(Response::new(NextWorkResponse {
            assignment: Some(assignment),
        }))
    }

    async fn finished_work(
        &self,
        request: Request<FinishedWorkRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        self.master
            .finished_work(
                request.node_id,
                request.job_index,
                request.task_index,
                request.num_rows,
            )
            .await;
        Ok(Response::new(Empty {}))
    }

    async fn finished_job(&self, request: Request<NodeInfo>) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        self.master.finished_job(request.node_id).await;
        Ok(Response::new(Empty {}))
    }
}

pub async fn start_grpc_server(
    addr: SocketAddr,
    master: Arc<Master>,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
) -> Result<u16, anyhow::Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<MasterServiceServer<MasterGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(frameflow_api_grpc::proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    let shutdown = master.shutdown_token();

    join_set.spawn(async move {
        Server::builder()
            .add_service(reflection_service)
            .add_service(health_service)
            .add_service(MasterServiceServer::new(MasterGrpcApi { master }))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
            .map_err(anyhow::Error::from)
    });

    Ok(port)
}
