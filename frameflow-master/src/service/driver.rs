use crate::clients::worker::WorkerConnection;
use crate::error::{error_result, ok_result};
use crate::metrics;
use crate::model::TableMetadata;
use crate::service::master::{Master, MAX_CONCURRENT_WORKER_RPCS};
use crate::service::state::MasterState;
use crate::service::{dag, partition};
use chrono::Utc;
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobDescriptor, BulkJobParameters, CommandResult, TableDescriptor,
};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DRIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Master {
    /// The single-threaded bulk-job loop: waits for `NewJob` to raise the
    /// active flag, runs the job state machine, then goes back to sleep.
    pub(crate) async fn job_processor_loop(self: Arc<Self>) {
        debug!("Starting job processor");
        let mut active_rx = self.active.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.clone().cancelled_owned() => break,
                changed = active_rx.wait_for(|active| *active) => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.process_job().await;
        }
        debug!("Job processor stopped");
    }

    async fn process_job(self: &Arc<Self>) {
        let result = self.run_bulk_job().await;
        if !result.success {
            metrics::BULK_JOBS_FAILED.inc();
            warn!("Bulk job failed: {}", result.msg);
        } else {
            info!("Master finished job");
        }

        let mut state = self.state.lock().await;
        state.last_job_result = result;
        self.set_finished();
        self.active.send_replace(false);
    }

    async fn run_bulk_job(self: &Arc<Self>) -> CommandResult {
        // 1. Reset all bulk job state and take the submitted parameters.
        let params = {
            let mut state = self.state.lock().await;
            state.bulk = Default::default();
            match state.job_params.clone() {
                Some(params) => params,
                None => return error_result("No bulk job parameters were submitted"),
            }
        };
        metrics::BULK_JOBS_STARTED.inc();

        // 2. Validate packet sizes.
        let (work_packet_size, io_packet_size) =
            match partition::resolve_packet_sizes(params.work_packet_size, params.io_packet_size)
            {
                Ok(sizes) => sizes,
                Err(err) => return error_result(err.to_string()),
            };

        // Load every bound input table into the cache before validation so
        // the analyzer can run without touching storage.
        let mut tables = HashMap::new();
        {
            let meta = {
                let state = self.state.lock().await;
                state.meta.clone()
            };
            for job in &params.jobs {
                for column_input in &job.inputs {
                    if tables.contains_key(&column_input.table_name) {
                        continue;
                    }
                    match self
                        .table_metas
                        .get_by_name(&meta, &column_input.table_name)
                        .await
                    {
                        Ok(Some(table)) => {
                            tables.insert(column_input.table_name.clone(), table);
                        }
                        Ok(None) => {}
                        Err(err) => return error_result(err.to_string()),
                    }
                }
            }
        }

        // 3-5. Validate the DAG, resolve output schemas, partition tasks and
        // register the uncommitted bulk job and tables. Nothing is persisted
        // until validation has fully passed.
        let (bulk_job_id, table_ids, mut job_descriptor) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let info = match dag::validate_jobs_and_ops(
                &state.meta,
                &tables,
                &params.jobs,
                &params.ops,
                &state.ops,
            ) {
                Ok(info) => info,
                Err(err) => return error_result(err.to_string()),
            };
            let info =
                match dag::determine_input_rows_to_slices(&tables, &params.jobs, &params.ops, info)
                {
                    Ok(info) => info,
                    Err(err) => return error_result(err.to_string()),
                };
            let job_output_columns = match dag::resolve_job_output_columns(
                &tables,
                &params.jobs,
                &params.ops,
                &state.ops,
            ) {
                Ok(columns) => columns,
                Err(err) => return error_result(err.to_string()),
            };
            let job_tasks =
                match partition::partition_job_tasks(&params.jobs, &info, io_packet_size as i64) {
                    Ok(tasks) => tasks,
                    Err(err) => return error_result(err.to_string()),
                };

            // Validation is done; reserve ids and create the uncommitted
            // descriptors.
            let bulk_job_id = state.meta.add_bulk_job(&params.job_name);

            let mut table_ids = Vec::with_capacity(params.jobs.len());
            for (job_idx, job) in params.jobs.iter().enumerate() {
                let table_id = state.meta.add_table(&job.output_table_name);
                state.bulk.job_to_table_id.insert(job_idx as i64, table_id);

                let mut end_rows = Vec::with_capacity(job_tasks[job_idx].len());
                let mut total_rows = 0i64;
                for task_rows in &job_tasks[job_idx] {
                    total_rows += task_rows.len() as i64;
                    end_rows.push(total_rows);
                }

                let descriptor = TableDescriptor {
                    id: table_id,
                    name: job.output_table_name.clone(),
                    columns: job_output_columns[job_idx].clone(),
                    end_rows,
                    job_id: bulk_job_id,
                    timestamp: Utc::now().timestamp(),
                };
                self.table_metas.update(TableMetadata::new(descriptor));
                table_ids.push(table_id);
            }

            state.bulk.tasks_used_per_job = vec![0; params.jobs.len()];
            state.bulk.num_jobs = params.jobs.len() as i64;
            state.bulk.total_tasks = job_tasks.iter().map(|t| t.len() as i64).sum();
            state.bulk.job_tasks = job_tasks;
            state.bulk.next_job = 0;
            state.bulk.next_task = 0;
            state.bulk.num_tasks = 0;
            state.bulk.task_result = ok_result();

            let job_descriptor = BulkJobDescriptor {
                id: bulk_job_id,
                name: params.job_name.clone(),
                work_packet_size,
                io_packet_size,
                num_nodes: state.workers.len() as i32,
                jobs: params.jobs.clone(),
            };

            info!(
                "Total jobs: {}, total tasks: {}",
                state.bulk.num_jobs, state.bulk.total_tasks
            );

            if state.bulk.total_tasks == 0 {
                self.set_finished();
            }

            (bulk_job_id, table_ids, job_descriptor)
        };

        // 4. Persist the preliminary bulk job descriptor.
        if let Err(err) = self.store.write_bulk_job_meta(&job_descriptor).await {
            return error_result(err.to_string());
        }

        // 5. Write the uncommitted table descriptors in parallel.
        let write_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            * 4;
        let write_errors: Vec<String> = futures::stream::iter(table_ids.clone())
            .map(|table_id| {
                let store = self.store.clone();
                let table = self.table_metas.get(table_id);
                async move {
                    match table {
                        Some(table) => store
                            .write_table_meta(&table)
                            .await
                            .err()
                            .map(|e| e.to_string()),
                        None => Some(format!("table {table_id} missing from cache")),
                    }
                }
            })
            .buffer_unordered(write_parallelism)
            .filter_map(futures::future::ready)
            .collect()
            .await;
        if let Some(err) = write_errors.into_iter().next() {
            return error_result(err);
        }

        // 6. Persist the catalog so workers can read it.
        let meta_snapshot = {
            let state = self.state.lock().await;
            state.meta.clone()
        };
        if let Err(err) = self.store.write_db_meta(&meta_snapshot).await {
            return error_result(err.to_string());
        }

        // 7. Snapshot locality maps and broadcast the job to every active
        // worker.
        let targets = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let hosts: Vec<String> = state.workers.iter().map(|w| w.host().to_string()).collect();
            for host in hosts {
                *state.bulk.local_totals.entry(host).or_insert(0) += 1;
            }
            let worker_ids: Vec<i32> = state.active_workers().map(|w| w.id).collect();
            state.bulk.unstarted_workers.clear();
            Self::prepare_worker_job_params(state, &worker_ids, &params)
        };
        info!("Sending new job command to {} workers", targets.len());
        self.start_job_on_workers(targets).await;

        // 8. Ping workers while the job runs to make sure they are alive.
        let pinger_stop = CancellationToken::new();
        {
            let master = self.clone();
            let stop = pinger_stop.clone();
            tokio::spawn(async move { master.worker_pinger_loop(stop).await });
        }

        // 9. Drive the job to completion.
        let drive_result = self.drive(&params).await;
        pinger_stop.cancel();

        // 10. Commit on success; leave everything uncommitted on failure so
        // clients cannot see partial results.
        let success = drive_result.is_ok();
        let (meta_snapshot, task_result) = {
            let mut state = self.state.lock().await;
            if success {
                for (job_idx, table_id) in table_ids.iter().enumerate() {
                    if !state.bulk.blacklisted_jobs.contains(&(job_idx as i64)) {
                        state.meta.commit_table(*table_id);
                    }
                }
                state.meta.commit_bulk_job(bulk_job_id);
            }
            job_descriptor.num_nodes = state.workers.len() as i32;
            (state.meta.clone(), state.bulk.task_result.clone())
        };
        if let Err(err) = self.store.write_db_meta(&meta_snapshot).await {
            return error_result(err.to_string());
        }

        // 11. Rewrite the job descriptor with the final node count.
        if let Err(err) = self.store.write_bulk_job_meta(&job_descriptor).await {
            return error_result(err.to_string());
        }

        match drive_result {
            Err(msg) => error_result(msg),
            Ok(()) if !task_result.success => task_result,
            Ok(()) => ok_result(),
        }
    }

    /// Waits until every active worker reports finished and all tasks are
    /// used, failing if work remains with no workers for too long. Late
    /// joiners are announced along the way.
    async fn drive(&self, params: &BulkJobParameters) -> Result<(), String> {
        info!("Waiting for workers to finish");
        let mut no_workers_since = Instant::now();
        loop {
            if self.shutdown.is_cancelled() {
                return Err("Master is shutting down".to_string());
            }

            // Announce the job to workers that registered after it started.
            let late_targets = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let unstarted = std::mem::take(&mut state.bulk.unstarted_workers);
                let unstarted: Vec<i32> = unstarted
                    .into_iter()
                    .filter(|id| state.worker_is_active(*id))
                    .collect();
                if unstarted.is_empty() {
                    Vec::new()
                } else {
                    for worker_id in &unstarted {
                        let host = state.worker(*worker_id).unwrap().host().to_string();
                        *state.bulk.local_totals.entry(host).or_insert(0) += 1;
                    }
                    Self::prepare_worker_job_params(state, &unstarted, params)
                }
            };
            if !late_targets.is_empty() {
                self.start_job_on_workers(late_targets).await;
            }

            let all_workers_finished = {
                let state = self.state.lock().await;
                !state
                    .bulk
                    .unfinished_workers
                    .iter()
                    .any(|(worker_id, unfinished)| {
                        *unfinished && state.worker_is_active(*worker_id)
                    })
            };
            let finished = *self.finished.borrow();

            if all_workers_finished && finished {
                return Ok(());
            }
            if all_workers_finished {
                if no_workers_since.elapsed() >= self.config.no_workers_timeout {
                    return Err(format!(
                        "No workers but have unfinished work after {} seconds",
                        self.config.no_workers_timeout.as_secs()
                    ));
                }
            } else {
                no_workers_since = Instant::now();
            }

            tokio::time::sleep(DRIVE_POLL_INTERVAL).await;
        }
    }

    /// Assigns host-local ids to the given workers and marks them
    /// unfinished. Must run under the work lock.
    fn prepare_worker_job_params(
        state: &mut MasterState,
        worker_ids: &[i32],
        base: &BulkJobParameters,
    ) -> Vec<(i32, Arc<dyn WorkerConnection>, BulkJobParameters)> {
        let MasterState { workers, bulk, .. } = state;
        let mut targets = Vec::with_capacity(worker_ids.len());
        for worker_id in worker_ids {
            let Some(entry) = usize::try_from(*worker_id)
                .ok()
                .and_then(|idx| workers.get(idx))
            else {
                continue;
            };
            let host = entry.host().to_string();
            let local_total = bulk.local_totals.get(&host).copied().unwrap_or(0);
            let local_id = bulk.local_ids.entry(host).or_insert(0);

            let mut worker_params = base.clone();
            worker_params.local_id = *local_id;
            worker_params.local_total = local_total;
            *local_id += 1;

            bulk.unfinished_workers.insert(*worker_id, true);
            targets.push((*worker_id, entry.connection.clone(), worker_params));
        }
        targets
    }

    /// Fans the `NewJob` command out to the given workers with bounded
    /// parallelism, collecting failures as warnings.
    async fn start_job_on_workers(
        &self,
        targets: Vec<(i32, Arc<dyn WorkerConnection>, BulkJobParameters)>,
    ) {
        let results = futures::stream::iter(targets)
            .map(start_job_on_worker)
            .buffer_unordered(MAX_CONCURRENT_WORKER_RPCS)
            .collect::<Vec<_>>()
            .await;

        for (worker_id, result) in results {
            match result {
                Ok(reply) if !reply.success => {
                    warn!("Worker {worker_id} returned error: {}", reply.msg);
                }
                Err(err) => {
                    warn!("Failed to send NewJob to worker {worker_id}: {err}");
                }
                Ok(_) => {
                    debug!("Worker {worker_id} NewJob returned");
                }
            }
        }
    }
}

async fn start_job_on_worker(
    (worker_id, connection, worker_params): (i32, Arc<dyn WorkerConnection>, BulkJobParameters),
) -> (
    i32,
    Result<CommandResult, crate::clients::worker::WorkerClientError>,
) {
    (worker_id, connection.new_job(worker_params).await)
}
