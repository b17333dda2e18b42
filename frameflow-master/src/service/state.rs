use crate::clients::worker::WorkerConnection;
use crate::error::ok_result;
use crate::model::{DatabaseMetadata, WorkerHistory};
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobParameters, CommandResult, OpRegistration, PythonKernelRegistration,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// (job index, task index)
pub type TaskKey = (i64, i64);

/// One registered worker. Entries are never erased; the `active` flag flips
/// on failure or unregistration so removed workers stay describable.
pub struct WorkerEntry {
    pub id: i32,
    pub address: String,
    pub active: bool,
    pub connection: Arc<dyn WorkerConnection>,
    pub failed_pings: u32,
    pub history: WorkerHistory,
}

impl WorkerEntry {
    pub fn host(&self) -> &str {
        self.address.split(':').next().unwrap_or(&self.address)
    }
}

/// Process-wide op and kernel registrations, kept in arrival order so they
/// can be replayed to workers that join later.
#[derive(Default)]
pub struct OpLog {
    pub so_paths: Vec<String>,
    pub op_registrations: Vec<OpRegistration>,
    pub py_kernel_registrations: Vec<PythonKernelRegistration>,
    ops_by_name: HashMap<String, OpRegistration>,
}

impl OpLog {
    pub fn has_op(&self, name: &str) -> bool {
        self.ops_by_name.contains_key(name)
    }

    pub fn get_op(&self, name: &str) -> Option<&OpRegistration> {
        self.ops_by_name.get(name)
    }

    pub fn add_op(&mut self, registration: OpRegistration) -> Result<(), String> {
        if self.ops_by_name.contains_key(&registration.name) {
            return Err(format!("Op {} is already registered", registration.name));
        }
        self.ops_by_name
            .insert(registration.name.clone(), registration.clone());
        self.op_registrations.push(registration);
        Ok(())
    }

    pub fn add_python_kernel(
        &mut self,
        registration: PythonKernelRegistration,
    ) -> Result<(), String> {
        if !self.ops_by_name.contains_key(&registration.op_name) {
            return Err(format!(
                "Op {} does not exist, cannot register a kernel for it",
                registration.op_name
            ));
        }
        self.py_kernel_registrations.push(registration);
        Ok(())
    }

    pub fn add_so_path(&mut self, path: String) {
        self.so_paths.push(path);
    }
}

pub enum WorkResponse {
    NoMoreWork,
    WaitForWork,
    Task {
        table_id: i32,
        job_index: i64,
        task_index: i64,
        output_rows: Vec<i64>,
    },
}

pub enum FinishedOutcome {
    /// The worker did not hold this task (it was reassigned already).
    Untracked,
    Retired {
        bulk_job_finished: bool,
    },
}

pub struct ReassignOutcome {
    pub reassigned: usize,
    pub newly_blacklisted: Vec<i64>,
    pub bulk_job_finished: bool,
}

/// All scheduling state of the one active bulk job. Reset by the driver at
/// job start; mutated only under the master's work lock.
pub struct BulkJobState {
    pub job_to_table_id: HashMap<i64, i32>,
    /// job index -> task index -> output rows.
    pub job_tasks: Vec<Vec<Vec<i64>>>,
    /// Freshly created tasks are pushed to the front, reassigned tasks to
    /// the back; consumers pop the back, so reassigned work is retried
    /// before new work is handed out.
    pub unallocated_tasks: VecDeque<TaskKey>,
    pub next_job: i64,
    pub num_jobs: i64,
    pub next_task: i64,
    pub num_tasks: i64,
    pub total_tasks: i64,
    pub total_tasks_used: i64,
    pub tasks_used_per_job: Vec<i64>,
    pub blacklisted_jobs: HashSet<i64>,
    pub task_failures: HashMap<TaskKey, u32>,
    /// Worker id -> tasks currently in flight on that worker.
    pub outstanding_tasks: HashMap<i32, HashSet<TaskKey>>,
    /// Worker id -> still working on the current bulk job.
    pub unfinished_workers: HashMap<i32, bool>,
    /// Workers that registered while a job was active and have not yet been
    /// sent the job.
    pub unstarted_workers: Vec<i32>,
    pub local_ids: HashMap<String, i32>,
    pub local_totals: HashMap<String, i32>,
    pub num_failed_workers: i32,
    pub task_result: CommandResult,
}

impl Default for BulkJobState {
    fn default() -> Self {
        Self {
            job_to_table_id: HashMap::new(),
            job_tasks: Vec::new(),
            unallocated_tasks: VecDeque::new(),
            next_job: 0,
            num_jobs: 0,
            next_task: 0,
            num_tasks: 0,
            total_tasks: 0,
            total_tasks_used: 0,
            tasks_used_per_job: Vec::new(),
            blacklisted_jobs: HashSet::new(),
            task_failures: HashMap::new(),
            outstanding_tasks: HashMap::new(),
            unfinished_workers: HashMap::new(),
            unstarted_workers: Vec::new(),
            local_ids: HashMap::new(),
            local_totals: HashMap::new(),
            num_failed_workers: 0,
            task_result: ok_result(),
        }
    }
}

impl BulkJobState {
    /// Serves one `NextWork` pull. Lazily extends the queue from the task
    /// cursor, then pops from the back of the deque.
    pub fn next_work(&mut self, worker_id: i32, finished: bool) -> WorkResponse {
        if self.unallocated_tasks.is_empty() {
            // If the current job is drained, advance to the next one.
            if self.next_task == self.num_tasks
                && self.next_job < self.num_jobs
                && self.task_result.success
            {
                self.next_task = 0;
                self.num_tasks = self.job_tasks[self.next_job as usize].len() as i64;
                self.next_job += 1;
            }

            if self.next_task < self.num_tasks {
                let current_job = self.next_job - 1;
                let current_task = self.next_task;
                self.unallocated_tasks.push_front((current_job, current_task));
                self.next_task += 1;
            }
        }

        let Some(task_key) = self.unallocated_tasks.pop_back() else {
            return if finished {
                WorkResponse::NoMoreWork
            } else {
                WorkResponse::WaitForWork
            };
        };

        let (job_index, task_index) = task_key;

        // Tasks of a blacklisted job are thrown away when they surface.
        if self.blacklisted_jobs.contains(&job_index) {
            return WorkResponse::WaitForWork;
        }

        let output_rows = self.job_tasks[job_index as usize][task_index as usize].clone();
        self.outstanding_tasks
            .entry(worker_id)
            .or_default()
            .insert(task_key);

        WorkResponse::Task {
            table_id: self.job_to_table_id[&job_index],
            job_index,
            task_index,
            output_rows,
        }
    }

    pub fn finished_work(
        &mut self,
        worker_id: i32,
        job_index: i64,
        task_index: i64,
    ) -> FinishedOutcome {
        let task_key = (job_index, task_index);
        let tracked = self
            .outstanding_tasks
            .get_mut(&worker_id)
            .map(|tasks| tasks.remove(&task_key))
            .unwrap_or(false);
        if !tracked {
            return FinishedOutcome::Untracked;
        }

        // A blacklisted job's remaining tasks were already counted as used.
        if !self.blacklisted_jobs.contains(&job_index) {
            self.total_tasks_used += 1;
            self.tasks_used_per_job[job_index as usize] += 1;
        }

        FinishedOutcome::Retired {
            bulk_job_finished: self.all_tasks_used(),
        }
    }

    /// Puts a removed worker's outstanding tasks back on the queue and
    /// counts each as one failure, blacklisting jobs whose tasks keep
    /// failing.
    pub fn reassign_worker_tasks(
        &mut self,
        worker_id: i32,
        failures_before_blacklist: u32,
    ) -> ReassignOutcome {
        let mut outcome = ReassignOutcome {
            reassigned: 0,
            newly_blacklisted: Vec::new(),
            bulk_job_finished: false,
        };
        let Some(tasks) = self.outstanding_tasks.remove(&worker_id) else {
            return outcome;
        };
        for task_key in tasks {
            self.unallocated_tasks.push_back(task_key);
            outcome.reassigned += 1;

            let failures = self.task_failures.entry(task_key).or_insert(0);
            *failures += 1;
            if *failures >= failures_before_blacklist && self.blacklist_job(task_key.0) {
                outcome.newly_blacklisted.push(task_key.0);
            }
        }
        outcome.bulk_job_finished = self.all_tasks_used();
        outcome
    }

    /// Abandons a job: its remaining tasks are counted as used at once so
    /// the bulk-job completion invariant can fire. Returns false if the job
    /// was already blacklisted.
    pub fn blacklist_job(&mut self, job_index: i64) -> bool {
        if !self.blacklisted_jobs.insert(job_index) {
            return false;
        }
        let remaining = self.job_tasks[job_index as usize].len() as i64
            - self.tasks_used_per_job[job_index as usize];
        self.total_tasks_used += remaining;
        true
    }

    pub fn all_tasks_used(&self) -> bool {
        self.total_tasks_used == self.total_tasks
    }
}

/// Everything the master mutates under its single work lock.
pub struct MasterState {
    pub meta: DatabaseMetadata,
    pub workers: Vec<WorkerEntry>,
    pub ops: OpLog,
    pub bulk: BulkJobState,
    pub job_params: Option<BulkJobParameters>,
    pub last_job_result: CommandResult,
}

impl MasterState {
    pub fn new(meta: DatabaseMetadata) -> Self {
        Self {
            meta,
            workers: Vec::new(),
            ops: OpLog::default(),
            bulk: BulkJobState::default(),
            job_params: None,
            last_job_result: ok_result(),
        }
    }

    pub fn worker(&self, worker_id: i32) -> Option<&WorkerEntry> {
        usize::try_from(worker_id)
            .ok()
            .and_then(|idx| self.workers.get(idx))
    }

    pub fn worker_mut(&mut self, worker_id: i32) -> Option<&mut WorkerEntry> {
        usize::try_from(worker_id)
            .ok()
            .and_then(|idx| self.workers.get_mut(idx))
    }

    pub fn worker_is_active(&self, worker_id: i32) -> bool {
        self.worker(worker_id).map(|w| w.active).unwrap_or(false)
    }

    pub fn active_workers(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.iter().filter(|w| w.active)
    }

    pub fn num_active_workers(&self) -> usize {
        self.active_workers().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_tasks(tasks_per_job: &[usize]) -> BulkJobState {
        let mut state = BulkJobState::default();
        let mut total = 0i64;
        for (job_idx, &num_tasks) in tasks_per_job.iter().enumerate() {
            let tasks: Vec<Vec<i64>> = (0..num_tasks)
                .map(|t| vec![t as i64 * 10, t as i64 * 10 + 1])
                .collect();
            state.job_tasks.push(tasks);
            state.job_to_table_id.insert(job_idx as i64, job_idx as i32);
            state.tasks_used_per_job.push(0);
            total += num_tasks as i64;
        }
        state.num_jobs = tasks_per_job.len() as i64;
        state.total_tasks = total;
        state
    }

    fn pull(state: &mut BulkJobState, worker: i32) -> Option<TaskKey> {
        match state.next_work(worker, false) {
            WorkResponse::Task {
                job_index,
                task_index,
                ..
            } => Some((job_index, task_index)),
            _ => None,
        }
    }

    #[test]
    fn fresh_tasks_are_served_in_order() {
        let mut state = state_with_tasks(&[3]);
        assert_eq!(pull(&mut state, 0), Some((0, 0)));
        assert_eq!(pull(&mut state, 0), Some((0, 1)));
        assert_eq!(pull(&mut state, 1), Some((0, 2)));
        assert!(matches!(
            state.next_work(0, false),
            WorkResponse::WaitForWork
        ));
        assert!(matches!(state.next_work(0, true), WorkResponse::NoMoreWork));
    }

    #[test]
    fn jobs_are_drained_one_after_another() {
        let mut state = state_with_tasks(&[2, 2]);
        assert_eq!(pull(&mut state, 0), Some((0, 0)));
        assert_eq!(pull(&mut state, 0), Some((0, 1)));
        assert_eq!(pull(&mut state, 0), Some((1, 0)));
        assert_eq!(pull(&mut state, 0), Some((1, 1)));
        assert!(pull(&mut state, 0).is_none());
    }

    #[test]
    fn reassigned_tasks_take_precedence_over_fresh_ones() {
        let mut state = state_with_tasks(&[4]);
        assert_eq!(pull(&mut state, 0), Some((0, 0)));
        assert_eq!(pull(&mut state, 0), Some((0, 1)));

        let outcome = state.reassign_worker_tasks(0, 5);
        assert_eq!(outcome.reassigned, 2);
        assert!(outcome.newly_blacklisted.is_empty());

        // Both reassigned tasks come back before task 2.
        let first = pull(&mut state, 1).unwrap();
        let second = pull(&mut state, 1).unwrap();
        assert!(first.1 < 2 && second.1 < 2 && first != second);
        assert_eq!(pull(&mut state, 1), Some((0, 2)));
    }

    #[test]
    fn a_task_is_outstanding_on_at_most_one_worker() {
        let mut state = state_with_tasks(&[2]);
        assert_eq!(pull(&mut state, 0), Some((0, 0)));
        assert_eq!(pull(&mut state, 1), Some((0, 1)));
        state.reassign_worker_tasks(0, 5);

        // Task 0 is reassigned to worker 1; worker 0 no longer holds it.
        assert_eq!(pull(&mut state, 1), Some((0, 0)));
        assert!(state.outstanding_tasks.get(&0).is_none());
        assert_eq!(state.outstanding_tasks[&1].len(), 2);
    }

    #[test]
    fn finishing_every_task_completes_the_job() {
        let mut state = state_with_tasks(&[2]);
        pull(&mut state, 0);
        pull(&mut state, 0);
        assert!(matches!(
            state.finished_work(0, 0, 0),
            FinishedOutcome::Retired {
                bulk_job_finished: false
            }
        ));
        assert!(matches!(
            state.finished_work(0, 0, 1),
            FinishedOutcome::Retired {
                bulk_job_finished: true
            }
        ));
    }

    #[test]
    fn finished_work_from_a_reassigned_task_is_ignored() {
        let mut state = state_with_tasks(&[2]);
        pull(&mut state, 0);
        state.reassign_worker_tasks(0, 5);
        assert!(matches!(
            state.finished_work(0, 0, 0),
            FinishedOutcome::Untracked
        ));
        assert_eq!(state.total_tasks_used, 0);
    }

    #[test]
    fn repeated_failures_blacklist_the_job_and_complete_the_bulk() {
        let mut state = state_with_tasks(&[3]);
        for round in 0..5 {
            let task = pull(&mut state, round).unwrap();
            assert_eq!(task, (0, 0));
            let outcome = state.reassign_worker_tasks(round, 5);
            if round < 4 {
                assert!(outcome.newly_blacklisted.is_empty());
                assert!(!outcome.bulk_job_finished);
            } else {
                assert_eq!(outcome.newly_blacklisted, vec![0]);
                assert!(outcome.bulk_job_finished);
                assert_eq!(state.total_tasks_used, state.total_tasks);
            }
        }
    }

    #[test]
    fn blacklisting_is_idempotent() {
        let mut state = state_with_tasks(&[2]);
        assert!(state.blacklist_job(0));
        assert!(!state.blacklist_job(0));
        assert_eq!(state.total_tasks_used, 2);
    }

    #[test]
    fn blacklisted_tasks_are_discarded_when_they_surface() {
        let mut state = state_with_tasks(&[2]);
        let task = pull(&mut state, 0).unwrap();
        state.blacklist_job(0);
        state.reassign_worker_tasks(0, 5);
        assert_eq!(state.unallocated_tasks.len(), 1);
        assert_eq!(state.unallocated_tasks.back(), Some(&task));
        assert!(matches!(
            state.next_work(1, false),
            WorkResponse::WaitForWork
        ));
    }

    #[test]
    fn op_log_replays_in_registration_order() {
        let mut log = OpLog::default();
        log.add_op(OpRegistration {
            name: "X".to_string(),
            ..Default::default()
        })
        .unwrap();
        log.add_op(OpRegistration {
            name: "Y".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(log
            .add_op(OpRegistration {
                name: "X".to_string(),
                ..Default::default()
            })
            .is_err());
        let names: Vec<&str> = log
            .op_registrations
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["X", "Y"]);
    }

    #[test]
    fn python_kernels_require_a_registered_op() {
        let mut log = OpLog::default();
        assert!(log
            .add_python_kernel(PythonKernelRegistration {
                op_name: "X".to_string(),
                ..Default::default()
            })
            .is_err());
        log.add_op(OpRegistration {
            name: "X".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(log
            .add_python_kernel(PythonKernelRegistration {
                op_name: "X".to_string(),
                ..Default::default()
            })
            .is_ok());
    }
}
