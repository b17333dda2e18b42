use crate::error::MasterError;
use crate::service::dag::{derive_slice_output_rows, DagAnalysisInfo};
use frameflow_api_grpc::proto::frameflow::common::Job;

/// Resolves and validates the packet sizes of a bulk job. An unset
/// `io_packet_size` (-1) falls back to the work packet size; zero is
/// rejected outright.
pub fn resolve_packet_sizes(
    work_packet_size: i32,
    io_packet_size: i32,
) -> Result<(i32, i32), MasterError> {
    if work_packet_size <= 0 {
        return Err(MasterError::validation(
            "Work packet size must be positive",
        ));
    }
    let io_packet_size = if io_packet_size == -1 {
        work_packet_size
    } else {
        io_packet_size
    };
    if io_packet_size <= 0 {
        return Err(MasterError::validation("IO packet size must be positive"));
    }
    if io_packet_size % work_packet_size != 0 {
        return Err(MasterError::validation(
            "IO packet size must be a multiple of Work packet size.",
        ));
    }
    Ok((work_packet_size, io_packet_size))
}

/// Splits every job's output row range into tasks: contiguous chunks of
/// `io_packet_size` rows, or the slice group boundaries when the job's DAG
/// contains a slice.
pub fn partition_job_tasks(
    jobs: &[Job],
    info: &DagAnalysisInfo,
    io_packet_size: i64,
) -> Result<Vec<Vec<Vec<i64>>>, MasterError> {
    let mut job_tasks = Vec::with_capacity(jobs.len());
    for (job_idx, job) in jobs.iter().enumerate() {
        let total_output_rows = info.total_output_rows[job_idx];
        let slice_input_rows = &info.slice_input_rows[job_idx];

        let boundaries = if slice_input_rows.is_empty() {
            let mut boundaries: Vec<i64> = (0..total_output_rows)
                .step_by(io_packet_size as usize)
                .collect();
            boundaries.push(total_output_rows);
            boundaries
        } else {
            let (&slice_op_idx, &slice_in_rows) = slice_input_rows.iter().next().unwrap();
            derive_slice_output_rows(job, slice_op_idx, slice_in_rows, total_output_rows)?
        };

        let mut tasks = Vec::with_capacity(boundaries.len().saturating_sub(1));
        for pair in boundaries.windows(2) {
            tasks.push((pair[0]..pair[1]).collect::<Vec<i64>>());
        }
        job_tasks.push(tasks);
    }
    Ok(job_tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use frameflow_api_grpc::proto::frameflow::common::slice_partitioner::Kind;
    use frameflow_api_grpc::proto::frameflow::common::{
        RangePartitioner, SliceArgs, SlicePartitioner,
    };
    use std::collections::BTreeMap;

    fn plain_job(name: &str) -> Job {
        Job {
            output_table_name: name.to_string(),
            inputs: vec![],
            slice_args: vec![],
        }
    }

    #[test]
    fn io_packet_size_must_be_a_multiple_of_work_packet_size() {
        assert!(resolve_packet_sizes(10, 25).is_err());
        assert_eq!(resolve_packet_sizes(10, 20).unwrap(), (10, 20));
    }

    #[test]
    fn unset_io_packet_size_falls_back_to_work_packet_size() {
        assert_eq!(resolve_packet_sizes(10, -1).unwrap(), (10, 10));
    }

    #[test]
    fn zero_packet_sizes_are_rejected() {
        assert!(resolve_packet_sizes(0, 10).is_err());
        assert!(resolve_packet_sizes(10, 0).is_err());
    }

    #[test]
    fn unsliced_jobs_are_chunked_by_io_packet_size() {
        let info = DagAnalysisInfo {
            total_output_rows: vec![100],
            slice_input_rows: vec![BTreeMap::new()],
            ..Default::default()
        };
        let tasks = partition_job_tasks(&[plain_job("out")], &info, 25).unwrap();
        assert_eq!(tasks[0].len(), 4);
        assert_eq!(tasks[0][0], (0..25).collect::<Vec<i64>>());
        assert_eq!(tasks[0][3], (75..100).collect::<Vec<i64>>());
    }

    #[test]
    fn the_final_chunk_may_be_short() {
        let info = DagAnalysisInfo {
            total_output_rows: vec![55],
            slice_input_rows: vec![BTreeMap::new()],
            ..Default::default()
        };
        let tasks = partition_job_tasks(&[plain_job("out")], &info, 25).unwrap();
        assert_eq!(tasks[0].len(), 3);
        assert_eq!(tasks[0][2], (50..55).collect::<Vec<i64>>());
    }

    #[test]
    fn sliced_jobs_follow_group_boundaries_not_packet_size() {
        let job = Job {
            output_table_name: "out".to_string(),
            inputs: vec![],
            slice_args: vec![SliceArgs {
                op_index: 1,
                partitioner: Some(SlicePartitioner {
                    kind: Some(Kind::Ranges(RangePartitioner {
                        ends: vec![10, 30, 60],
                    })),
                }),
            }],
        };
        let info = DagAnalysisInfo {
            total_output_rows: vec![60],
            slice_input_rows: vec![BTreeMap::from([(1i64, 60i64)])],
            ..Default::default()
        };
        let tasks = partition_job_tasks(&[job], &info, 100).unwrap();
        assert_eq!(tasks[0].len(), 3);
        assert_eq!(tasks[0][0], (0..10).collect::<Vec<i64>>());
        assert_eq!(tasks[0][1], (10..30).collect::<Vec<i64>>());
        assert_eq!(tasks[0][2], (30..60).collect::<Vec<i64>>());
    }

    #[test]
    fn a_job_with_no_rows_produces_no_tasks() {
        let info = DagAnalysisInfo {
            total_output_rows: vec![0],
            slice_input_rows: vec![BTreeMap::new()],
            ..Default::default()
        };
        let tasks = partition_job_tasks(&[plain_job("out")], &info, 25).unwrap();
        assert!(tasks[0].is_empty());
    }
}
