use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, IntCounter, IntGauge, Registry,
};

lazy_static! {
    pub static ref BULK_JOBS_STARTED: IntCounter = register_int_counter!(
        "frameflow_bulk_jobs_started_total",
        "Number of bulk jobs accepted by the master"
    )
    .unwrap();
    pub static ref BULK_JOBS_FAILED: IntCounter = register_int_counter!(
        "frameflow_bulk_jobs_failed_total",
        "Number of bulk jobs that failed or were aborted"
    )
    .unwrap();
    pub static ref TASKS_DISPATCHED: IntCounter = register_int_counter!(
        "frameflow_tasks_dispatched_total",
        "Number of task samples handed to workers"
    )
    .unwrap();
    pub static ref TASKS_RETIRED: IntCounter = register_int_counter!(
        "frameflow_tasks_retired_total",
        "Number of task samples reported finished by workers"
    )
    .unwrap();
    pub static ref TASKS_REASSIGNED: IntCounter = register_int_counter!(
        "frameflow_tasks_reassigned_total",
        "Number of task samples requeued after worker loss"
    )
    .unwrap();
    pub static ref JOBS_BLACKLISTED: IntCounter = register_int_counter!(
        "frameflow_jobs_blacklisted_total",
        "Number of jobs abandoned after repeated task failures"
    )
    .unwrap();
    pub static ref ACTIVE_WORKERS: IntGauge = register_int_gauge!(
        "frameflow_active_workers",
        "Number of workers currently in the active set"
    )
    .unwrap();
    pub static ref FAILED_PINGS: IntCounter = register_int_counter!(
        "frameflow_failed_worker_pings_total",
        "Number of worker liveness probes that failed"
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    prometheus::default_registry().clone()
}
