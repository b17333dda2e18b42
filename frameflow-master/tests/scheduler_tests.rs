use assert2::check;
use async_trait::async_trait;
use frameflow_api_grpc::proto::frameflow::common::slice_partitioner::Kind;
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobParameters, Column, ColumnInput, ColumnType, CommandResult, Job, Op, OpInput, OpPath,
    OpRegistration, PythonKernelRegistration, RangePartitioner, SliceArgs, SlicePartitioner,
    TableDescriptor,
};
use frameflow_master::clients::worker::{WorkerClientError, WorkerConnection, WorkerConnector};
use frameflow_master::config::{BlobStorageConfig, MasterConfig};
use frameflow_master::model::{TableMetadata, INPUT_OP_NAME, OUTPUT_OP_NAME, SLICE_OP_NAME};
use frameflow_master::service::ingest::FsVideoIngest;
use frameflow_master::service::master::Master;
use frameflow_master::service::meta::MetadataStore;
use frameflow_master::service::state::WorkResponse;
use frameflow_master::storage::memory::InMemoryBlobStorage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;

struct FakeWorker {
    address: String,
    healthy: AtomicBool,
    shutdown_received: AtomicBool,
    new_jobs: Mutex<Vec<BulkJobParameters>>,
    op_events: Mutex<Vec<String>>,
}

impl FakeWorker {
    fn new(address: String) -> Arc<Self> {
        Arc::new(Self {
            address,
            healthy: AtomicBool::new(true),
            shutdown_received: AtomicBool::new(false),
            new_jobs: Mutex::new(Vec::new()),
            op_events: Mutex::new(Vec::new()),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn op_events(&self) -> Vec<String> {
        self.op_events.lock().unwrap().clone()
    }

    fn new_job_count(&self) -> usize {
        self.new_jobs.lock().unwrap().len()
    }

    fn check_healthy(&self) -> Result<(), WorkerClientError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerClientError::Rejected("worker is down".to_string()))
        }
    }
}

#[async_trait]
impl WorkerConnection for FakeWorker {
    fn address(&self) -> &str {
        &self.address
    }

    async fn new_job(
        &self,
        params: BulkJobParameters,
    ) -> Result<CommandResult, WorkerClientError> {
        self.check_healthy()?;
        self.new_jobs.lock().unwrap().push(params);
        Ok(CommandResult {
            success: true,
            msg: String::new(),
        })
    }

    async fn ping(&self) -> Result<(), WorkerClientError> {
        self.check_healthy()
    }

    async fn shutdown(&self) -> Result<(), WorkerClientError> {
        self.shutdown_received.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn load_op(&self, op_path: OpPath) -> Result<(), WorkerClientError> {
        self.op_events
            .lock()
            .unwrap()
            .push(format!("load:{}", op_path.path));
        Ok(())
    }

    async fn register_op(&self, registration: OpRegistration) -> Result<(), WorkerClientError> {
        self.op_events
            .lock()
            .unwrap()
            .push(format!("op:{}", registration.name));
        Ok(())
    }

    async fn register_python_kernel(
        &self,
        registration: PythonKernelRegistration,
    ) -> Result<(), WorkerClientError> {
        self.op_events
            .lock()
            .unwrap()
            .push(format!("kernel:{}", registration.op_name));
        Ok(())
    }

    async fn poke_watchdog(&self) -> Result<(), WorkerClientError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,
}

impl FakeConnector {
    fn insert(&self, address: String, worker: Arc<FakeWorker>) {
        self.workers.lock().unwrap().insert(address, worker);
    }
}

impl WorkerConnector for FakeConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn WorkerConnection>, WorkerClientError> {
        let workers = self.workers.lock().unwrap();
        let worker = workers
            .get(address)
            .cloned()
            .expect("no fake worker registered at this address");
        Ok(worker)
    }
}

struct TestCluster {
    master: Arc<Master>,
    connector: Arc<FakeConnector>,
    store: MetadataStore,
    _join_set: JoinSet<Result<(), anyhow::Error>>,
}

impl TestCluster {
    async fn add_worker(&self, host: &str, port: u16) -> (i32, Arc<FakeWorker>) {
        let address = format!("{host}:{port}");
        let worker = FakeWorker::new(address.clone());
        self.connector.insert(address, worker.clone());
        let node_id = self.master.register_worker(host, port).await.unwrap();
        (node_id, worker)
    }

    async fn wait_for_worker_removal(&self, worker_id: i32) {
        timeout(Duration::from_secs(10), async {
            loop {
                let active = self.master.active_workers().await;
                if !active.iter().any(|w| w.id == worker_id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker was not removed in time");
    }
}

async fn setup(tables: &[(&str, i64)], tweak: impl FnOnce(&mut MasterConfig)) -> TestCluster {
    let storage = Arc::new(InMemoryBlobStorage::new());
    let store = MetadataStore::new(storage.clone());

    let mut meta = store.read_db_meta().await.unwrap();
    for (name, rows) in tables {
        let id = meta.add_table(name);
        meta.commit_table(id);
        store
            .write_table_meta(&TableMetadata::new(TableDescriptor {
                id,
                name: name.to_string(),
                columns: vec![Column {
                    id: 0,
                    name: "frame".to_string(),
                    r#type: ColumnType::Video as i32,
                }],
                end_rows: vec![*rows],
                job_id: -1,
                timestamp: 0,
            }))
            .await
            .unwrap();
    }
    store.write_db_meta(&meta).await.unwrap();

    let mut config = MasterConfig {
        storage: BlobStorageConfig::InMemory,
        worker_ping_interval: Duration::from_millis(25),
        ..Default::default()
    };
    tweak(&mut config);

    let connector = Arc::new(FakeConnector::default());
    let ingest = Arc::new(FsVideoIngest::new(store.clone()));
    let master = Master::new(config, storage, connector.clone(), ingest)
        .await
        .unwrap();
    let mut join_set = JoinSet::new();
    master.start(&mut join_set);

    TestCluster {
        master,
        connector,
        store,
        _join_set: join_set,
    }
}

fn resize_registration() -> OpRegistration {
    OpRegistration {
        name: "Resize".to_string(),
        variadic_inputs: false,
        input_columns: vec![Column {
            id: 0,
            name: "frame".to_string(),
            r#type: ColumnType::Video as i32,
        }],
        output_columns: vec![Column {
            id: 0,
            name: "frame".to_string(),
            r#type: ColumnType::Video as i32,
        }],
        can_stencil: false,
        preferred_stencil: vec![0],
        has_bounded_state: false,
        warmup: 0,
        has_unbounded_state: false,
    }
}

fn input_op() -> Op {
    Op {
        name: INPUT_OP_NAME.to_string(),
        inputs: vec![OpInput {
            op_index: -1,
            column: "frame".to_string(),
        }],
        stencil: vec![],
        warmup: 0,
    }
}

fn op(name: &str, producer: i32) -> Op {
    Op {
        name: name.to_string(),
        inputs: vec![OpInput {
            op_index: producer,
            column: "frame".to_string(),
        }],
        stencil: vec![],
        warmup: 0,
    }
}

fn job_over(input_table: &str, output_table: &str) -> Job {
    Job {
        output_table_name: output_table.to_string(),
        inputs: vec![ColumnInput {
            op_index: 0,
            table_name: input_table.to_string(),
            column_name: "frame".to_string(),
        }],
        slice_args: vec![],
    }
}

fn bulk(
    job_name: &str,
    jobs: Vec<Job>,
    ops: Vec<Op>,
    work_packet_size: i32,
    io_packet_size: i32,
) -> BulkJobParameters {
    BulkJobParameters {
        job_name: job_name.to_string(),
        jobs,
        ops,
        work_packet_size,
        io_packet_size,
        local_id: 0,
        local_total: 0,
    }
}

fn resize_pipeline() -> Vec<Op> {
    vec![input_op(), op("Resize", 0), op(OUTPUT_OP_NAME, 1)]
}

async fn pull_task(master: &Master, worker: i32) -> Option<(i64, i64, Vec<i64>)> {
    timeout(Duration::from_secs(10), async {
        loop {
            match master.next_work(worker).await {
                WorkResponse::Task {
                    job_index,
                    task_index,
                    output_rows,
                    ..
                } => return Some((job_index, task_index, output_rows)),
                WorkResponse::WaitForWork => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                WorkResponse::NoMoreWork => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for work")
}

async fn drain(master: &Master, worker: i32) -> Vec<(i64, i64)> {
    let mut done = Vec::new();
    while let Some((job_index, task_index, output_rows)) = pull_task(master, worker).await {
        master
            .finished_work(worker, job_index, task_index, output_rows.len() as i64)
            .await;
        done.push((job_index, task_index));
    }
    done
}

async fn wait_job_done(master: &Master, workers: &[i32]) {
    let mut active_rx = master.subscribe_active();
    timeout(Duration::from_secs(10), async {
        loop {
            for worker in workers {
                master.finished_job(*worker).await;
            }
            if !*active_rx.borrow() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bulk job did not finish in time");
}

#[tokio::test]
async fn happy_path_commits_one_table() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (w0, _) = cluster.add_worker("10.0.0.1", 7001).await;
    let (w1, _) = cluster.add_worker("10.0.0.2", 7001).await;

    let result = master
        .new_job(bulk(
            "hundred",
            vec![job_over("videos", "out")],
            resize_pipeline(),
            25,
            25,
        ))
        .await;
    check!(result.success);

    let (done0, done1) = tokio::join!(drain(master, w0), drain(master, w1));
    check!(done0.len() + done1.len() == 4);

    wait_job_done(master, &[w0, w1]).await;

    let status = master.job_status().await;
    check!(status.finished);
    check!(status.tasks_done == 4);
    check!(status.total_tasks == 4);
    check!(status.jobs_done == 1);
    check!(status.jobs_failed == 0);
    check!(status.result.unwrap().success);

    let tables = master.list_tables().await;
    check!(tables.contains(&"out".to_string()));

    let (result, descriptors) = master.get_tables(&["out".to_string()]).await;
    check!(result.success);
    check!(descriptors[0].end_rows == vec![25, 50, 75, 100]);
    check!(descriptors[0].columns.len() == 1);
}

#[tokio::test]
async fn uncommitted_tables_are_invisible_until_commit() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (w0, _) = cluster.add_worker("10.0.0.1", 7001).await;

    check!(
        master
            .new_job(bulk(
                "hundred",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );

    // The job is running: its output table exists uncommitted and must not
    // be visible.
    let first = pull_task(master, w0).await.unwrap();
    check!(master.list_tables().await == vec!["videos".to_string()]);
    let (result, _) = master.get_tables(&["out".to_string()]).await;
    check!(!result.success);

    master
        .finished_work(w0, first.0, first.1, first.2.len() as i64)
        .await;
    let _ = drain(master, w0).await;
    wait_job_done(master, &[w0]).await;

    check!(master.list_tables().await.contains(&"out".to_string()));
}

#[tokio::test]
async fn lost_worker_tasks_are_reassigned_before_fresh_work() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (wa, fa) = cluster.add_worker("10.0.0.1", 7001).await;
    let (wb, _fb) = cluster.add_worker("10.0.0.2", 7001).await;

    check!(
        master
            .new_job(bulk(
                "hundred",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );

    // Worker A takes the first two tasks and then stops responding.
    let t0 = pull_task(master, wa).await.unwrap();
    let t1 = pull_task(master, wa).await.unwrap();
    check!(t0.1 == 0);
    check!(t1.1 == 1);
    fa.set_healthy(false);

    cluster.wait_for_worker_removal(wa).await;

    // B drains everything; the reassigned tasks come back first.
    let done = drain(master, wb).await;
    check!(done.len() == 4);
    let first_two: HashSet<(i64, i64)> = done[..2].iter().copied().collect();
    check!(first_two == HashSet::from([(0, 0), (0, 1)]));
    check!(done[2..] == [(0, 2), (0, 3)]);

    wait_job_done(master, &[wb]).await;

    let status = master.job_status().await;
    check!(status.finished);
    check!(status.failed_workers == 1);
    check!(status.result.unwrap().success);
    check!(master.list_tables().await.contains(&"out".to_string()));
}

#[tokio::test]
async fn repeated_task_failures_blacklist_only_that_job() {
    let cluster = setup(&[("videos", 50)], |config| {
        config.worker_ping_interval = Duration::from_millis(20);
    })
    .await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);

    check!(
        master
            .new_job(bulk(
                "mixed",
                vec![job_over("videos", "bad"), job_over("videos", "good")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );

    // Five rounds of a worker taking task (0, 0) and dying.
    for round in 0..5u16 {
        let (worker, fake) = cluster.add_worker("10.0.0.9", 7100 + round).await;
        let task = pull_task(master, worker).await.unwrap();
        check!(task.0 == 0);
        check!(task.1 == 0);
        fake.set_healthy(false);
        cluster.wait_for_worker_removal(worker).await;
    }

    // Job 0 is now blacklisted; a fresh worker only sees job 1's tasks.
    let (worker, _) = cluster.add_worker("10.0.0.9", 7200).await;
    let done = drain(master, worker).await;
    check!(done == vec![(1, 0), (1, 1)]);

    wait_job_done(master, &[worker]).await;

    let status = master.job_status().await;
    check!(status.finished);
    check!(status.jobs_failed == 1);
    check!(status.jobs_done == 1);
    check!(status.failed_workers == 5);
    check!(status.result.unwrap().success);

    let tables = master.list_tables().await;
    check!(tables.contains(&"good".to_string()));
    check!(!tables.contains(&"bad".to_string()));
}

#[tokio::test]
async fn no_workers_with_unfinished_work_fails_the_job() {
    let cluster = setup(&[("videos", 100)], |config| {
        config.no_workers_timeout = Duration::from_millis(300);
    })
    .await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (worker, _) = cluster.add_worker("10.0.0.1", 7001).await;

    check!(
        master
            .new_job(bulk(
                "doomed",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );

    // Make sure the job is being driven, then pull the only worker out.
    let _ = pull_task(master, worker).await.unwrap();
    master.unregister_worker(worker).await.unwrap();

    let mut active_rx = master.subscribe_active();
    timeout(Duration::from_secs(5), active_rx.wait_for(|active| !*active))
        .await
        .expect("job did not fail in time")
        .unwrap();

    let status = master.job_status().await;
    check!(status.finished);
    let result = status.result.unwrap();
    check!(!result.success);
    check!(result.msg.contains("No workers but have unfinished work"));

    check!(master.list_tables().await == vec!["videos".to_string()]);
}

#[tokio::test]
async fn sliced_jobs_are_partitioned_on_group_boundaries() {
    let cluster = setup(&[("videos", 60)], |_| {}).await;
    let master = &cluster.master;

    let (worker, _) = cluster.add_worker("10.0.0.1", 7001).await;

    let job = Job {
        output_table_name: "sliced".to_string(),
        inputs: vec![ColumnInput {
            op_index: 0,
            table_name: "videos".to_string(),
            column_name: "frame".to_string(),
        }],
        slice_args: vec![SliceArgs {
            op_index: 1,
            partitioner: Some(SlicePartitioner {
                kind: Some(Kind::Ranges(RangePartitioner {
                    ends: vec![10, 30, 60],
                })),
            }),
        }],
    };
    let ops = vec![input_op(), op(SLICE_OP_NAME, 0), op(OUTPUT_OP_NAME, 1)];

    check!(master.new_job(bulk("sliced", vec![job], ops, 100, 100)).await.success);

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let (job_index, task_index, output_rows) = pull_task(master, worker).await.unwrap();
        master
            .finished_work(worker, job_index, task_index, output_rows.len() as i64)
            .await;
        tasks.push(output_rows);
    }

    check!(tasks[0] == (0..10).collect::<Vec<i64>>());
    check!(tasks[1] == (10..30).collect::<Vec<i64>>());
    check!(tasks[2] == (30..60).collect::<Vec<i64>>());

    wait_job_done(master, &[worker]).await;

    let (result, descriptors) = master.get_tables(&["sliced".to_string()]).await;
    check!(result.success);
    check!(descriptors[0].end_rows == vec![10, 30, 60]);
}

#[tokio::test]
async fn op_registrations_are_replayed_to_late_workers_in_order() {
    let cluster = setup(&[], |_| {}).await;
    let master = &cluster.master;

    let mut op_x = resize_registration();
    op_x.name = "X".to_string();
    check!(master.register_op(op_x).await.success);

    let (_w1, f1) = cluster.add_worker("10.0.0.1", 7001).await;
    check!(f1.op_events() == vec!["op:X".to_string()]);

    let mut op_y = resize_registration();
    op_y.name = "Y".to_string();
    check!(master.register_op(op_y).await.success);
    check!(f1.op_events() == vec!["op:X".to_string(), "op:Y".to_string()]);

    let kernel = PythonKernelRegistration {
        op_name: "X".to_string(),
        device_type: 0,
        kernel_code: b"def kernel(): pass".to_vec(),
        pickled_config: vec![],
        batch_size: 1,
    };
    check!(master.register_python_kernel(kernel).await.success);

    let (_w2, f2) = cluster.add_worker("10.0.0.2", 7001).await;
    check!(
        f2.op_events()
            == vec![
                "op:X".to_string(),
                "op:Y".to_string(),
                "kernel:X".to_string()
            ]
    );
    check!(
        f1.op_events()
            == vec![
                "op:X".to_string(),
                "op:Y".to_string(),
                "kernel:X".to_string()
            ]
    );
}

#[tokio::test]
async fn mismatched_packet_sizes_reject_the_job_without_persisting() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (_worker, _) = cluster.add_worker("10.0.0.1", 7001).await;

    check!(
        master
            .new_job(bulk(
                "misaligned",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                30,
            ))
            .await
            .success
    );

    let mut active_rx = master.subscribe_active();
    timeout(Duration::from_secs(5), active_rx.wait_for(|active| !*active))
        .await
        .expect("job was not rejected in time")
        .unwrap();

    let status = master.job_status().await;
    let result = status.result.unwrap();
    check!(!result.success);
    check!(result.msg.contains("multiple of"));

    // Nothing was persisted for the rejected job.
    let meta = cluster.store.read_db_meta().await.unwrap();
    check!(!meta.has_table("out"));
}

#[tokio::test]
async fn a_second_bulk_job_is_rejected_while_one_is_active() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (worker, _) = cluster.add_worker("10.0.0.1", 7001).await;

    check!(
        master
            .new_job(bulk(
                "first",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );
    let first = pull_task(master, worker).await.unwrap();

    let second = master
        .new_job(bulk(
            "second",
            vec![job_over("videos", "out2")],
            resize_pipeline(),
            25,
            25,
        ))
        .await;
    check!(!second.success);
    check!(second.msg.contains("already active"));

    master
        .finished_work(worker, first.0, first.1, first.2.len() as i64)
        .await;
    let _ = drain(master, worker).await;
    wait_job_done(master, &[worker]).await;
}

#[tokio::test]
async fn shutdown_aborts_the_running_job_without_committing() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (worker, fake) = cluster.add_worker("10.0.0.1", 7001).await;

    check!(
        master
            .new_job(bulk(
                "aborted",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );
    let _ = pull_task(master, worker).await.unwrap();

    check!(master.request_shutdown().success);

    let mut active_rx = master.subscribe_active();
    timeout(Duration::from_secs(5), active_rx.wait_for(|active| !*active))
        .await
        .expect("job did not abort in time")
        .unwrap();

    let status = master.job_status().await;
    check!(!status.result.unwrap().success);
    check!(!master.list_tables().await.contains(&"out".to_string()));

    // The watchdog task tells workers to shut down on its way out.
    timeout(Duration::from_secs(5), async {
        while !fake.shutdown_received.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker was never told to shut down");
}

#[tokio::test]
async fn late_joining_workers_receive_the_running_job() {
    let cluster = setup(&[("videos", 100)], |_| {}).await;
    let master = &cluster.master;

    check!(master.register_op(resize_registration()).await.success);
    let (w0, f0) = cluster.add_worker("10.0.0.1", 7001).await;

    check!(
        master
            .new_job(bulk(
                "joined",
                vec![job_over("videos", "out")],
                resize_pipeline(),
                25,
                25,
            ))
            .await
            .success
    );
    let first = pull_task(master, w0).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while f0.new_job_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first worker never received the job");

    // A worker that registers mid-job is announced by the driver's scan.
    let (w1, f1) = cluster.add_worker("10.0.0.2", 7001).await;
    timeout(Duration::from_secs(5), async {
        while f1.new_job_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late worker never received the job");

    master
        .finished_work(w0, first.0, first.1, first.2.len() as i64)
        .await;
    let (a, b) = tokio::join!(drain(master, w0), drain(master, w1));
    check!(a.len() + b.len() == 3);
    wait_job_done(master, &[w0, w1]).await;

    let status = master.job_status().await;
    check!(status.finished);
    check!(status.result.unwrap().success);
}

#[tokio::test]
async fn unknown_workers_cannot_unregister() {
    let cluster = setup(&[], |_| {}).await;
    check!(cluster.master.unregister_worker(42).await.is_err());
}

#[tokio::test]
async fn watchdog_without_pokes_tears_the_master_down() {
    let cluster = setup(&[], |config| {
        config.watchdog_enabled = true;
        config.watchdog_timeout = Duration::from_millis(100);
    })
    .await;
    let master = &cluster.master;

    let (_worker, fake) = cluster.add_worker("10.0.0.1", 7001).await;

    let token = master.shutdown_token();
    timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("watchdog never fired");

    timeout(Duration::from_secs(5), async {
        while !fake.shutdown_received.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker was never told to shut down");
}

#[tokio::test]
async fn poking_the_watchdog_defers_the_teardown() {
    let cluster = setup(&[], |config| {
        config.watchdog_enabled = true;
        config.watchdog_timeout = Duration::from_millis(200);
    })
    .await;
    let master = &cluster.master;

    let token = master.shutdown_token();
    for _ in 0..10 {
        master.poke_watchdog().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        check!(!token.is_cancelled());
    }
}
