use crate::error::MasterError;
use crate::model::{
    is_builtin_op, DatabaseMetadata, TableMetadata, INPUT_OP_NAME, OUTPUT_OP_NAME, SLICE_OP_NAME,
    UNSLICE_OP_NAME,
};
use crate::service::state::OpLog;
use frameflow_api_grpc::proto::frameflow::common::slice_partitioner::Kind;
use frameflow_api_grpc::proto::frameflow::common::{Column, Job, Op, OpInput};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Result of analyzing a bulk job's operator DAG against the catalog.
#[derive(Clone, Debug, Default)]
pub struct DagAnalysisInfo {
    /// Input-op index -> column index in the assembled input collection.
    pub input_ops: BTreeMap<i64, i64>,
    /// Indices of slice ops in the DAG (at most one).
    pub slice_ops: Vec<i64>,
    /// Per job: slice-op index -> rows entering that slice group.
    pub slice_input_rows: Vec<BTreeMap<i64, i64>>,
    /// Per job: total rows the job writes to its output table.
    pub total_output_rows: Vec<i64>,
}

fn validation(msg: String) -> MasterError {
    MasterError::Validation(msg)
}

/// Validates the shared op DAG and every job's bindings. Fails before any
/// persistent state is touched.
pub fn validate_jobs_and_ops(
    meta: &DatabaseMetadata,
    tables: &HashMap<String, TableMetadata>,
    jobs: &[Job],
    ops: &[Op],
    registry: &OpLog,
) -> Result<DagAnalysisInfo, MasterError> {
    if jobs.is_empty() {
        return Err(validation("Bulk job contains no jobs".to_string()));
    }
    if ops.is_empty() {
        return Err(validation("Job DAG contains no ops".to_string()));
    }
    let last_op = ops.last().unwrap();
    if last_op.name != OUTPUT_OP_NAME {
        return Err(validation(format!(
            "Last op in the DAG must be {OUTPUT_OP_NAME}, got {}",
            last_op.name
        )));
    }

    let mut info = DagAnalysisInfo::default();

    // Column names each op publishes downstream, and the slice nesting depth
    // of its row stream.
    let mut published: Vec<Vec<String>> = Vec::with_capacity(ops.len());
    let mut slice_depth: Vec<i32> = Vec::with_capacity(ops.len());

    for (idx, op) in ops.iter().enumerate() {
        match op.name.as_str() {
            INPUT_OP_NAME => {
                if op.inputs.len() != 1 || op.inputs[0].op_index != -1 {
                    return Err(validation(format!(
                        "Input op {idx} must declare exactly one published column"
                    )));
                }
                if op.inputs[0].column.is_empty() {
                    return Err(validation(format!(
                        "Input op {idx} publishes an unnamed column"
                    )));
                }
                let column_idx = info.input_ops.len() as i64;
                info.input_ops.insert(idx as i64, column_idx);
                published.push(vec![op.inputs[0].column.clone()]);
                slice_depth.push(0);
            }
            OUTPUT_OP_NAME => {
                if idx != ops.len() - 1 {
                    return Err(validation(format!(
                        "{OUTPUT_OP_NAME} op must be the final op in the DAG"
                    )));
                }
                if op.inputs.is_empty() {
                    return Err(validation(format!(
                        "{OUTPUT_OP_NAME} op has no input columns"
                    )));
                }
                let depth = check_op_inputs(idx, op, ops, &published, &slice_depth)?;
                published.push(vec![]);
                slice_depth.push(depth);
            }
            SLICE_OP_NAME => {
                if op.inputs.len() != 1 {
                    return Err(validation(format!(
                        "{SLICE_OP_NAME} op {idx} must have exactly one input"
                    )));
                }
                let depth = check_op_inputs(idx, op, ops, &published, &slice_depth)?;
                info.slice_ops.push(idx as i64);
                published.push(op.inputs.iter().map(|i| i.column.clone()).collect());
                slice_depth.push(depth + 1);
            }
            UNSLICE_OP_NAME => {
                if op.inputs.len() != 1 {
                    return Err(validation(format!(
                        "{UNSLICE_OP_NAME} op {idx} must have exactly one input"
                    )));
                }
                let depth = check_op_inputs(idx, op, ops, &published, &slice_depth)?;
                if depth == 0 {
                    return Err(validation(format!(
                        "{UNSLICE_OP_NAME} op {idx} has no matching {SLICE_OP_NAME}"
                    )));
                }
                published.push(op.inputs.iter().map(|i| i.column.clone()).collect());
                slice_depth.push(depth - 1);
            }
            name => {
                let Some(registration) = registry.get_op(name) else {
                    return Err(validation(format!("Op {name} is not registered")));
                };
                if op.inputs.is_empty() {
                    return Err(validation(format!("Op {idx} ({name}) has no inputs")));
                }
                if !registration.variadic_inputs
                    && op.inputs.len() != registration.input_columns.len()
                {
                    return Err(validation(format!(
                        "Op {idx} ({name}) takes {} input columns but {} were provided",
                        registration.input_columns.len(),
                        op.inputs.len()
                    )));
                }
                let depth = check_op_inputs(idx, op, ops, &published, &slice_depth)?;
                published.push(
                    registration
                        .output_columns
                        .iter()
                        .map(|c| c.name.clone())
                        .collect(),
                );
                slice_depth.push(depth);
            }
        }
    }

    if info.input_ops.is_empty() {
        return Err(validation("Job DAG has no input ops".to_string()));
    }
    if info.slice_ops.len() > 1 {
        return Err(validation(
            "Jobs with more than one slice group are not supported".to_string(),
        ));
    }

    // Per-job bindings.
    let mut output_names: HashSet<&str> = HashSet::new();
    for job in jobs {
        if job.output_table_name.is_empty() {
            return Err(validation("Job is missing an output table name".to_string()));
        }
        if meta.has_table(&job.output_table_name) {
            return Err(validation(format!(
                "Table {} already exists in the database",
                job.output_table_name
            )));
        }
        if !output_names.insert(&job.output_table_name) {
            return Err(validation(format!(
                "Two jobs write to the same output table {}",
                job.output_table_name
            )));
        }

        let mut bound: HashSet<i64> = HashSet::new();
        for column_input in &job.inputs {
            let op_idx = column_input.op_index as i64;
            let is_input_op = ops
                .get(column_input.op_index as usize)
                .map(|op| op.name == INPUT_OP_NAME)
                .unwrap_or(false);
            if !is_input_op {
                return Err(validation(format!(
                    "Job {}: column input bound to op {op_idx}, which is not an input op",
                    job.output_table_name
                )));
            }
            if !bound.insert(op_idx) {
                return Err(validation(format!(
                    "Job {}: input op {op_idx} is bound twice",
                    job.output_table_name
                )));
            }
            let Some(table) = tables.get(&column_input.table_name) else {
                return Err(validation(format!(
                    "Requested table {} is not in database.",
                    column_input.table_name
                )));
            };
            if !table.has_column(&column_input.column_name) {
                return Err(validation(format!(
                    "Table {} has no column {}",
                    column_input.table_name, column_input.column_name
                )));
            }
        }
        for input_op_idx in info.input_ops.keys() {
            if !bound.contains(input_op_idx) {
                return Err(validation(format!(
                    "Job {}: no column input bound for input op {input_op_idx}",
                    job.output_table_name
                )));
            }
        }

        for slice_args in &job.slice_args {
            if !info.slice_ops.contains(&(slice_args.op_index as i64)) {
                return Err(validation(format!(
                    "Job {}: slice partitioner given for op {}, which is not a {SLICE_OP_NAME} op",
                    job.output_table_name, slice_args.op_index
                )));
            }
        }
        for slice_idx in &info.slice_ops {
            if !job
                .slice_args
                .iter()
                .any(|a| a.op_index as i64 == *slice_idx)
            {
                return Err(validation(format!(
                    "Job {}: no slice partitioner given for {SLICE_OP_NAME} op {slice_idx}",
                    job.output_table_name
                )));
            }
        }
    }

    Ok(info)
}

/// Checks that an op only references columns produced by earlier ops and
/// that all of its inputs sit at the same slice depth, which it returns.
fn check_op_inputs(
    idx: usize,
    op: &Op,
    ops: &[Op],
    published: &[Vec<String>],
    slice_depth: &[i32],
) -> Result<i32, MasterError> {
    let mut depth: Option<i32> = None;
    for input in &op.inputs {
        let producer_idx = input.op_index;
        if producer_idx < 0 || producer_idx as usize >= idx {
            return Err(validation(format!(
                "Op {idx} ({}) references op {producer_idx}, which is not an earlier op",
                op.name
            )));
        }
        let producer = producer_idx as usize;
        if !published[producer].iter().any(|c| c == &input.column) {
            return Err(validation(format!(
                "Op {idx} ({}) references column {} which op {producer} ({}) does not produce",
                op.name, input.column, ops[producer].name
            )));
        }
        match depth {
            None => depth = Some(slice_depth[producer]),
            Some(d) if d == slice_depth[producer] => {}
            Some(_) => {
                return Err(validation(format!(
                    "Op {idx} ({}) mixes inputs from different slice levels",
                    op.name
                )))
            }
        }
    }
    Ok(depth.unwrap_or(0))
}

/// Computes per-job total output rows and the rows entering each slice
/// group. Ops are row-count preserving, so both derive from the bound input
/// tables.
pub fn determine_input_rows_to_slices(
    tables: &HashMap<String, TableMetadata>,
    jobs: &[Job],
    _ops: &[Op],
    mut info: DagAnalysisInfo,
) -> Result<DagAnalysisInfo, MasterError> {
    for job in jobs {
        let mut rows: Option<i64> = None;
        for column_input in &job.inputs {
            let table = tables.get(&column_input.table_name).ok_or_else(|| {
                MasterError::internal(format!(
                    "table {} disappeared during analysis",
                    column_input.table_name
                ))
            })?;
            let table_rows = table.num_rows();
            match rows {
                None => rows = Some(table_rows),
                Some(prev) if prev == table_rows => {}
                Some(prev) => {
                    return Err(validation(format!(
                        "Job {}: input tables disagree on row count ({prev} vs {table_rows})",
                        job.output_table_name
                    )))
                }
            }
        }
        let rows = rows.unwrap_or(0);
        info.total_output_rows.push(rows);

        let mut slice_rows = BTreeMap::new();
        for slice_idx in &info.slice_ops {
            slice_rows.insert(*slice_idx, rows);
        }
        info.slice_input_rows.push(slice_rows);
    }
    Ok(info)
}

/// Converts a job's slice grouping into the partition boundaries its tasks
/// must respect. The boundaries always start at 0 and end at the job's total
/// output rows.
pub fn derive_slice_output_rows(
    job: &Job,
    slice_op_idx: i64,
    slice_in_rows: i64,
    total_output_rows: i64,
) -> Result<Vec<i64>, MasterError> {
    let args = job
        .slice_args
        .iter()
        .find(|a| a.op_index as i64 == slice_op_idx)
        .ok_or_else(|| {
            validation(format!(
                "Job {}: no slice partitioner given for op {slice_op_idx}",
                job.output_table_name
            ))
        })?;
    let kind = args
        .partitioner
        .as_ref()
        .and_then(|p| p.kind.as_ref())
        .ok_or_else(|| {
            validation(format!(
                "Job {}: empty slice partitioner for op {slice_op_idx}",
                job.output_table_name
            ))
        })?;

    let mut boundaries: Vec<i64> = vec![0];
    match kind {
        Kind::Ranges(ranges) => {
            if ranges.ends.is_empty() {
                return Err(validation(format!(
                    "Job {}: slice partitioner has no groups",
                    job.output_table_name
                )));
            }
            let mut prev = 0;
            for end in &ranges.ends {
                if *end <= prev {
                    return Err(validation(format!(
                        "Job {}: slice group ends must be strictly increasing",
                        job.output_table_name
                    )));
                }
                prev = *end;
                boundaries.push(*end);
            }
            if prev != slice_in_rows {
                return Err(validation(format!(
                    "Job {}: slice groups end at row {prev} but the slice receives {slice_in_rows} rows",
                    job.output_table_name
                )));
            }
        }
        Kind::GroupSize(group) => {
            if group.rows_per_group <= 0 {
                return Err(validation(format!(
                    "Job {}: slice group size must be positive",
                    job.output_table_name
                )));
            }
            let mut row = group.rows_per_group;
            while row < slice_in_rows {
                boundaries.push(row);
                row += group.rows_per_group;
            }
            boundaries.push(slice_in_rows);
        }
    }

    if boundaries.last().copied().unwrap_or(0) != total_output_rows {
        return Err(MasterError::internal(format!(
            "slice boundaries end at {} but the job produces {total_output_rows} rows",
            boundaries.last().unwrap()
        )));
    }
    Ok(boundaries)
}

/// Resolves each job's output table schema: the columns feeding the final
/// output op, with structural ops walked through transparently.
pub fn resolve_job_output_columns(
    tables: &HashMap<String, TableMetadata>,
    jobs: &[Job],
    ops: &[Op],
    registry: &OpLog,
) -> Result<Vec<Vec<Column>>, MasterError> {
    let last_op = ops.last().expect("validated non-empty op list");

    let mut all = Vec::with_capacity(jobs.len());
    for job in jobs {
        let mut bound_columns: HashMap<i64, Column> = HashMap::new();
        for column_input in &job.inputs {
            let table = tables.get(&column_input.table_name).ok_or_else(|| {
                MasterError::internal(format!(
                    "table {} disappeared during analysis",
                    column_input.table_name
                ))
            })?;
            let mut column = table
                .column(&column_input.column_name)
                .cloned()
                .ok_or_else(|| {
                    MasterError::internal(format!(
                        "column {} disappeared during analysis",
                        column_input.column_name
                    ))
                })?;
            column.id = 0;
            bound_columns.insert(column_input.op_index as i64, column);
        }

        let mut output_columns = Vec::with_capacity(last_op.inputs.len());
        for input in &last_op.inputs {
            let mut column = determine_column_info(input, ops, &bound_columns, registry)?;
            column.id = output_columns.len() as i32;
            output_columns.push(column);
        }
        all.push(output_columns);
    }
    Ok(all)
}

fn determine_column_info(
    op_input: &OpInput,
    ops: &[Op],
    bound_columns: &HashMap<i64, Column>,
    registry: &OpLog,
) -> Result<Column, MasterError> {
    let producer_idx = op_input.op_index as i64;
    let producer = ops
        .get(op_input.op_index as usize)
        .ok_or_else(|| MasterError::internal(format!("op {producer_idx} out of range")))?;

    if producer.name == INPUT_OP_NAME {
        if producer.inputs[0].column != op_input.column {
            return Err(MasterError::internal(format!(
                "input op {producer_idx} does not publish column {}",
                op_input.column
            )));
        }
        return bound_columns.get(&producer_idx).cloned().ok_or_else(|| {
            MasterError::internal(format!("no binding for input op {producer_idx}"))
        });
    }

    if is_builtin_op(&producer.name) {
        // Structural ops pass columns through untouched.
        let upstream = producer
            .inputs
            .iter()
            .find(|i| i.column == op_input.column)
            .ok_or_else(|| {
                MasterError::internal(format!(
                    "op {producer_idx} ({}) does not carry column {}",
                    producer.name, op_input.column
                ))
            })?;
        return determine_column_info(upstream, ops, bound_columns, registry);
    }

    let registration = registry.get_op(&producer.name).ok_or_else(|| {
        MasterError::internal(format!("op {} vanished from the registry", producer.name))
    })?;
    registration
        .output_columns
        .iter()
        .find(|c| c.name == op_input.column)
        .cloned()
        .ok_or_else(|| {
            MasterError::internal(format!(
                "op {} has no output column {}",
                producer.name, op_input.column
            ))
        })
}
