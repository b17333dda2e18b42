use crate::clients::worker::WorkerConnection;
use crate::metrics;
use crate::service::master::Master;
use crate::service::state::MasterState;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl Master {
    /// Polls every active worker while a bulk job runs; a worker that fails
    /// enough consecutive pings is removed and its work reassigned.
    pub(crate) async fn worker_pinger_loop(self: Arc<Self>, stop: CancellationToken) {
        debug!("Starting worker pinger");
        let mut interval = tokio::time::interval(self.config.worker_ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.clone().cancelled_owned() => break,
                _ = interval.tick() => {
                    if *self.finished.borrow() {
                        break;
                    }
                    self.ping_workers_once().await;
                }
            }
        }
        debug!("Worker pinger stopped");
    }

    async fn ping_workers_once(&self) {
        let targets: Vec<(i32, Arc<dyn WorkerConnection>)> = {
            let state = self.state.lock().await;
            state
                .active_workers()
                .map(|w| (w.id, w.connection.clone()))
                .collect()
        };

        for (worker_id, connection) in targets {
            match connection.ping().await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if let Some(entry) = state.worker_mut(worker_id) {
                        entry.failed_pings = 0;
                    }
                }
                Err(err) => {
                    metrics::FAILED_PINGS.inc();
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    let Some(entry) = state.worker_mut(worker_id) else {
                        continue;
                    };
                    if !entry.active {
                        continue;
                    }
                    entry.failed_pings += 1;
                    if entry.failed_pings >= self.config.failed_pings_before_removal {
                        warn!(
                            "Worker {worker_id} did not respond to Ping ({err}). \
                             Removing worker from active list."
                        );
                        self.remove_worker_locked(state, worker_id);
                        state.bulk.num_failed_workers += 1;
                    }
                }
            }
        }
    }

    /// Flips the worker inactive and, if a bulk job is running, reclaims its
    /// outstanding tasks. The entry itself is retained for history.
    pub(crate) fn remove_worker_locked(&self, state: &mut MasterState, worker_id: i32) {
        let job_active = *self.active.borrow();
        let Some(entry) = state.worker_mut(worker_id) else {
            return;
        };
        if !entry.active {
            return;
        }
        entry.active = false;
        let address = entry.address.clone();
        metrics::ACTIVE_WORKERS.dec();

        if job_active {
            self.stop_job_on_worker_locked(state, worker_id);
        }

        info!("Removing worker {worker_id} ({address}).");
    }

    /// Puts the worker's in-flight tasks back on the queue (to the back, so
    /// they are retried before fresh work) and counts the failures,
    /// blacklisting jobs whose tasks keep dying.
    fn stop_job_on_worker_locked(&self, state: &mut MasterState, worker_id: i32) {
        let outcome = state
            .bulk
            .reassign_worker_tasks(worker_id, self.config.task_failures_before_blacklist);
        if outcome.reassigned > 0 {
            info!(
                "Reassigning worker {worker_id}'s {} task samples.",
                outcome.reassigned
            );
            metrics::TASKS_REASSIGNED.inc_by(outcome.reassigned as u64);
        }
        for job_index in &outcome.newly_blacklisted {
            warn!("Blacklisted job {job_index}");
            metrics::JOBS_BLACKLISTED.inc();
        }
        if !outcome.newly_blacklisted.is_empty() && outcome.bulk_job_finished {
            debug!("Master blacklisting job triggered finished!");
            self.set_finished();
        }

        if let Some(entry) = state.worker_mut(worker_id) {
            entry.history.ended_at = Some(Utc::now());
        }
        state.bulk.unfinished_workers.insert(worker_id, false);
    }

    /// The self-watchdog: when enabled, tears the master down if no client
    /// has poked it for a full timeout interval. Always shuts workers down
    /// before exiting.
    pub(crate) async fn watchdog_loop(self: Arc<Self>) {
        if !self.config.watchdog_enabled {
            self.shutdown.clone().cancelled_owned().await;
        } else {
            loop {
                tokio::select! {
                    _ = self.shutdown.clone().cancelled_owned() => break,
                    _ = tokio::time::sleep(self.config.watchdog_timeout) => {
                        if !self.watchdog_awake.swap(false, Ordering::SeqCst) {
                            error!(
                                "Master did not receive heartbeat in {:?}. Shutting down.",
                                self.config.watchdog_timeout
                            );
                            self.shutdown.cancel();
                        }
                    }
                }
            }
        }

        self.shutdown_workers().await;
    }

    async fn shutdown_workers(&self) {
        let targets: Vec<(i32, Arc<dyn WorkerConnection>)> = {
            let state = self.state.lock().await;
            state
                .active_workers()
                .map(|w| (w.id, w.connection.clone()))
                .collect()
        };
        for (worker_id, connection) in targets {
            if let Err(err) = connection.shutdown().await {
                warn!("Master could not send shutdown message to worker {worker_id}: {err}");
            }
        }
    }
}
