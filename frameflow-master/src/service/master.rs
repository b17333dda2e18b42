use crate::clients::worker::WorkerConnector;
use crate::config::MasterConfig;
use crate::error::{error_result, ok_result, MasterError};
use crate::metrics;
use crate::model::WorkerHistory;
use crate::service::ingest::{FailedVideo, IngestService};
use crate::service::meta::{MetadataStore, TableMetaCache};
use crate::service::state::{FinishedOutcome, MasterState, WorkResponse, WorkerEntry};
use crate::storage::BlobStorage;
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobParameters, Column, CommandResult, OpRegistration, PythonKernelRegistration,
    TableDescriptor,
};
use frameflow_api_grpc::proto::frameflow::master::v1::{JobStatusResponse, WorkerInfo};
use futures::stream::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const MAX_CONCURRENT_WORKER_RPCS: usize = 16;

/// The cluster coordinator: owns the catalog, the worker registry, the op
/// replay log and the scheduling state of the one active bulk job, all
/// behind a single work lock.
pub struct Master {
    pub(crate) config: MasterConfig,
    pub(crate) store: MetadataStore,
    pub(crate) table_metas: TableMetaCache,
    pub(crate) connector: Arc<dyn WorkerConnector>,
    pub(crate) ingest: Arc<dyn IngestService>,
    pub(crate) state: Mutex<MasterState>,
    /// Raised while a bulk job is being driven.
    pub(crate) active: watch::Sender<bool>,
    /// Raised when the current bulk job's tasks are all used up.
    pub(crate) finished: watch::Sender<bool>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) watchdog_awake: AtomicBool,
}

impl Master {
    pub async fn new(
        config: MasterConfig,
        storage: Arc<dyn BlobStorage>,
        connector: Arc<dyn WorkerConnector>,
        ingest: Arc<dyn IngestService>,
    ) -> Result<Arc<Self>, MasterError> {
        let store = MetadataStore::new(storage);

        debug!("Reading database metadata");
        let meta = store.read_db_meta().await?;
        let table_metas = TableMetaCache::new(store.clone());
        if config.prefetch_table_metadata {
            table_metas.prefetch(&meta).await;
        }
        store.write_db_meta(&meta).await?;
        debug!("Database initialized");

        let (active, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            table_metas,
            connector,
            ingest,
            state: Mutex::new(MasterState::new(meta)),
            active,
            finished,
            shutdown: CancellationToken::new(),
            watchdog_awake: AtomicBool::new(true),
        }))
    }

    /// Spawns the job processor and the self-watchdog.
    pub fn start(self: &Arc<Self>, join_set: &mut JoinSet<Result<(), anyhow::Error>>) {
        let master = self.clone();
        join_set.spawn(async move {
            master.job_processor_loop().await;
            Ok(())
        });
        let master = self.clone();
        join_set.spawn(async move {
            master.watchdog_loop().await;
            Ok(())
        });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    pub fn subscribe_finished(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }

    pub(crate) fn set_finished(&self) {
        self.finished.send_replace(true);
    }

    // Catalog operations ----------------------------------------------------

    /// Names of tables visible to clients. Visibility is gated on the
    /// owning bulk job having committed.
    pub async fn list_tables(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.meta.committed_table_names()
    }

    pub async fn get_tables(&self, names: &[String]) -> (CommandResult, Vec<TableDescriptor>) {
        let state = self.state.lock().await;
        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let table_id = state
                .meta
                .get_table_id(name)
                .filter(|id| state.meta.table_is_committed(*id));
            let Some(table_id) = table_id else {
                return (
                    error_result(format!("Requested table {name} is not in database.")),
                    Vec::new(),
                );
            };
            match self.table_metas.get_or_load(table_id).await {
                Ok(Some(table)) => tables.push(table.descriptor().clone()),
                Ok(None) => {
                    return (
                        error_result(format!("Table {name} has no descriptor")),
                        Vec::new(),
                    )
                }
                Err(err) => return (error_result(err.to_string()), Vec::new()),
            }
        }
        (ok_result(), tables)
    }

    /// Removes catalog entries. The table blobs themselves are left in
    /// place; reclaiming them is deferred.
    pub async fn delete_tables(&self, names: &[String]) -> Result<(), MasterError> {
        let mut state = self.state.lock().await;
        for name in names {
            if let Some(table_id) = state.meta.get_table_id(name) {
                state.meta.remove_table(table_id);
                self.table_metas.remove(table_id);
            }
        }
        self.store.write_db_meta(&state.meta).await
    }

    pub async fn ingest_videos(
        &self,
        table_names: &[String],
        video_paths: &[String],
        inplace: bool,
    ) -> (CommandResult, Vec<FailedVideo>) {
        let failed = match self
            .ingest
            .ingest_videos(table_names, video_paths, inplace)
            .await
        {
            Ok(failed) => failed,
            Err(err) => return (error_result(err.to_string()), Vec::new()),
        };

        // Refresh the catalog so the ingested tables become visible.
        let mut state = self.state.lock().await;
        match self.store.read_db_meta().await {
            Ok(meta) => {
                state.meta = meta;
                if self.config.prefetch_table_metadata {
                    self.table_metas.prefetch(&state.meta).await;
                }
                (ok_result(), failed)
            }
            Err(err) => (error_result(err.to_string()), failed),
        }
    }

    // Op and kernel registry ------------------------------------------------

    pub async fn load_op(&self, path: String) -> CommandResult {
        let mut state = self.state.lock().await;
        if tokio::fs::metadata(&path).await.is_err() {
            return error_result(format!("Op library was not found: {path}"));
        }
        info!("Master registering op library: {path}");
        state.ops.add_so_path(path.clone());

        for worker in state.active_workers() {
            if let Err(err) = worker
                .connection
                .load_op(frameflow_api_grpc::proto::frameflow::common::OpPath {
                    path: path.clone(),
                })
                .await
            {
                warn!(
                    "Master could not load op for worker at {}: {err}",
                    worker.address
                );
            }
        }
        ok_result()
    }

    pub async fn register_op(&self, registration: OpRegistration) -> CommandResult {
        let mut state = self.state.lock().await;
        info!("Master registering Op: {}", registration.name);
        if let Err(msg) = state.ops.add_op(registration.clone()) {
            warn!("Master failed to register op {}", registration.name);
            return error_result(msg);
        }

        for worker in state.active_workers() {
            if let Err(err) = worker.connection.register_op(registration.clone()).await {
                warn!(
                    "Master could not register op for worker at {}: {err}",
                    worker.address
                );
            }
        }
        ok_result()
    }

    pub async fn register_python_kernel(
        &self,
        registration: PythonKernelRegistration,
    ) -> CommandResult {
        let mut state = self.state.lock().await;
        info!("Master registering Python Kernel: {}", registration.op_name);
        if let Err(msg) = state.ops.add_python_kernel(registration.clone()) {
            return error_result(msg);
        }

        for worker in state.active_workers() {
            if let Err(err) = worker
                .connection
                .register_python_kernel(registration.clone())
                .await
            {
                warn!(
                    "Master could not register python kernel for worker at {}: {err}",
                    worker.address
                );
            }
        }
        ok_result()
    }

    pub async fn get_op_info(
        &self,
        op_name: &str,
    ) -> (CommandResult, bool, Vec<Column>, Vec<Column>) {
        let state = self.state.lock().await;
        match state.ops.get_op(op_name) {
            None => (
                error_result(format!("Op {op_name} does not exist")),
                false,
                Vec::new(),
                Vec::new(),
            ),
            Some(registration) => (
                ok_result(),
                registration.variadic_inputs,
                registration.input_columns.clone(),
                registration.output_columns.clone(),
            ),
        }
    }

    // Bulk job lifecycle ----------------------------------------------------

    /// Accepts a bulk job and wakes the job processor. All validation
    /// happens on the processor; its outcome is surfaced through
    /// `GetJobStatus`.
    pub async fn new_job(&self, params: BulkJobParameters) -> CommandResult {
        let mut state = self.state.lock().await;
        if *self.active.borrow() {
            return error_result("A bulk job is already active");
        }
        info!("Master received NewJob {}", params.job_name);
        state.job_params = Some(params);
        self.finished.send_replace(false);
        self.active.send_replace(true);
        ok_result()
    }

    pub async fn job_status(&self) -> JobStatusResponse {
        let active = *self.active.borrow();
        let state = self.state.lock().await;

        let blacklisted = state.bulk.blacklisted_jobs.len() as i64;
        let mut status = JobStatusResponse {
            finished: !active,
            result: Some(state.last_job_result.clone()),
            tasks_done: state.bulk.total_tasks_used,
            total_tasks: state.bulk.total_tasks,
            // While driving, jobs ahead of the cursor are done; afterwards
            // every non-blacklisted job is.
            jobs_done: if active {
                (state.bulk.next_job - 1).max(0)
            } else {
                state.bulk.num_jobs - blacklisted
            },
            jobs_failed: blacklisted,
            total_jobs: state.bulk.num_jobs,
            num_workers: state.num_active_workers() as i32,
            failed_workers: state.bulk.num_failed_workers,
        };
        if active {
            status.result = None;
        }
        status
    }

    pub fn request_shutdown(&self) -> CommandResult {
        info!("Master received shutdown!");
        self.shutdown.cancel();
        ok_result()
    }

    /// Defers the self-watchdog and forwards the poke to every active
    /// worker.
    pub async fn poke_watchdog(&self) {
        self.watchdog_awake.store(true, Ordering::SeqCst);

        let targets: Vec<(i32, Arc<dyn crate::clients::worker::WorkerConnection>)> = {
            let state = self.state.lock().await;
            state
                .active_workers()
                .map(|w| (w.id, w.connection.clone()))
                .collect()
        };

        futures::stream::iter(targets)
            .map(poke_worker_watchdog)
            .buffer_unordered(MAX_CONCURRENT_WORKER_RPCS)
            .collect::<Vec<()>>()
            .await;
    }

    // Worker membership -----------------------------------------------------

    /// Adds a worker to the cluster and replays every accumulated op and
    /// kernel registration over the new connection.
    pub async fn register_worker(&self, peer_ip: &str, port: u16) -> Result<i32, MasterError> {
        let address = format!("{peer_ip}:{port}");
        let connection = self
            .connector
            .connect(&address)
            .map_err(|err| MasterError::internal(err.to_string()))?;

        let mut state = self.state.lock().await;
        let node_id = state.workers.len() as i32;
        info!("Adding worker: {node_id}, {address}");
        state.workers.push(WorkerEntry {
            id: node_id,
            address: address.clone(),
            active: true,
            connection: connection.clone(),
            failed_pings: 0,
            history: WorkerHistory::started_now(),
        });
        metrics::ACTIVE_WORKERS.inc();

        for path in &state.ops.so_paths {
            if let Err(err) = connection
                .load_op(frameflow_api_grpc::proto::frameflow::common::OpPath {
                    path: path.clone(),
                })
                .await
            {
                warn!("Master could not load op for worker at {address}: {err}");
            }
        }
        for registration in &state.ops.op_registrations {
            if let Err(err) = connection.register_op(registration.clone()).await {
                warn!("Master could not register op for worker at {address}: {err}");
            }
        }
        for registration in &state.ops.py_kernel_registrations {
            if let Err(err) = connection.register_python_kernel(registration.clone()).await {
                warn!("Master could not register python kernel for worker at {address}: {err}");
            }
        }

        // Picked up by the driver's per-loop scan if a job is running.
        state.bulk.unstarted_workers.push(node_id);

        Ok(node_id)
    }

    pub async fn unregister_worker(&self, worker_id: i32) -> Result<(), MasterError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.worker(worker_id).is_none() {
            return Err(MasterError::validation(format!(
                "Unknown worker {worker_id}"
            )));
        }
        self.remove_worker_locked(state, worker_id);
        Ok(())
    }

    pub async fn active_workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.lock().await;
        state
            .active_workers()
            .map(|w| WorkerInfo {
                id: w.id,
                address: w.address.clone(),
            })
            .collect()
    }

    // Pull-model work distribution ------------------------------------------

    pub async fn next_work(&self, worker_id: i32) -> WorkResponse {
        let mut state = self.state.lock().await;
        if !state.worker_is_active(worker_id) {
            return WorkResponse::NoMoreWork;
        }

        let finished = *self.finished.borrow();
        let response = state.bulk.next_work(worker_id, finished);
        if let WorkResponse::Task { .. } = response {
            if let Some(entry) = state.worker_mut(worker_id) {
                entry.history.tasks_assigned += 1;
            }
            metrics::TASKS_DISPATCHED.inc();
        }
        response
    }

    pub async fn finished_work(
        &self,
        worker_id: i32,
        job_index: i64,
        task_index: i64,
        _num_rows: i64,
    ) {
        let mut state = self.state.lock().await;
        if !state.worker_is_active(worker_id) {
            // The worker's tasks were already reassigned.
            return;
        }

        match state.bulk.finished_work(worker_id, job_index, task_index) {
            FinishedOutcome::Untracked => {
                warn!(
                    "Worker {worker_id} finished task ({job_index}, {task_index}) it does not hold"
                );
            }
            FinishedOutcome::Retired { bulk_job_finished } => {
                if let Some(entry) = state.worker_mut(worker_id) {
                    entry.history.tasks_retired += 1;
                }
                metrics::TASKS_RETIRED.inc();
                if bulk_job_finished {
                    debug!("Master FinishedWork triggered finished!");
                    self.set_finished();
                }
            }
        }
    }

    pub async fn finished_job(&self, worker_id: i32) {
        let mut state = self.state.lock().await;
        state.bulk.unfinished_workers.insert(worker_id, false);
    }
}

async fn poke_worker_watchdog(
    (worker_id, connection): (i32, Arc<dyn crate::clients::worker::WorkerConnection + '_>),
) {
    if connection.poke_watchdog().await.is_err() {
        warn!("Could not poke worker {worker_id}!");
    }
}
