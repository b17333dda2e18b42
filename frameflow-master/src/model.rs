use chrono::{DateTime, Utc};
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobDescriptor, BulkJobEntry, Column, DatabaseDescriptor, TableDescriptor, TableEntry,
};
use std::collections::{BTreeMap, HashMap};

pub const INPUT_OP_NAME: &str = "Input";
pub const OUTPUT_OP_NAME: &str = "Output";
pub const SLICE_OP_NAME: &str = "Slice";
pub const UNSLICE_OP_NAME: &str = "Unslice";

pub fn is_builtin_op(name: &str) -> bool {
    matches!(
        name,
        INPUT_OP_NAME | OUTPUT_OP_NAME | SLICE_OP_NAME | UNSLICE_OP_NAME
    )
}

pub fn db_metadata_path() -> String {
    "db_metadata.bin".to_string()
}

pub fn table_descriptor_path(table_id: i32) -> String {
    format!("tables/{table_id}/descriptor.bin")
}

pub fn bulk_job_descriptor_path(bulk_job_id: i32) -> String {
    format!("jobs/{bulk_job_id}/descriptor.bin")
}

/// The in-memory catalog: table and bulk-job name/id bijections with
/// per-entry committed flags. Mutated only under the master's work lock and
/// persisted on every structural change.
#[derive(Clone, Debug, Default)]
pub struct DatabaseMetadata {
    next_table_id: i32,
    next_bulk_job_id: i32,
    table_names: BTreeMap<i32, String>,
    table_committed: BTreeMap<i32, bool>,
    table_ids: HashMap<String, i32>,
    bulk_job_names: BTreeMap<i32, String>,
    bulk_job_committed: BTreeMap<i32, bool>,
    bulk_job_ids: HashMap<String, i32>,
}

impl DatabaseMetadata {
    pub fn from_descriptor(descriptor: &DatabaseDescriptor) -> Self {
        let mut meta = DatabaseMetadata {
            next_table_id: descriptor.next_table_id,
            next_bulk_job_id: descriptor.next_bulk_job_id,
            ..Default::default()
        };
        for entry in &descriptor.tables {
            meta.table_names.insert(entry.id, entry.name.clone());
            meta.table_committed.insert(entry.id, entry.committed);
            meta.table_ids.insert(entry.name.clone(), entry.id);
        }
        for entry in &descriptor.bulk_jobs {
            meta.bulk_job_names.insert(entry.id, entry.name.clone());
            meta.bulk_job_committed.insert(entry.id, entry.committed);
            meta.bulk_job_ids.insert(entry.name.clone(), entry.id);
        }
        meta
    }

    pub fn to_descriptor(&self) -> DatabaseDescriptor {
        DatabaseDescriptor {
            next_table_id: self.next_table_id,
            next_bulk_job_id: self.next_bulk_job_id,
            tables: self
                .table_names
                .iter()
                .map(|(id, name)| TableEntry {
                    id: *id,
                    name: name.clone(),
                    committed: self.table_committed.get(id).copied().unwrap_or(false),
                })
                .collect(),
            bulk_jobs: self
                .bulk_job_names
                .iter()
                .map(|(id, name)| BulkJobEntry {
                    id: *id,
                    name: name.clone(),
                    committed: self.bulk_job_committed.get(id).copied().unwrap_or(false),
                })
                .collect(),
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table_ids.contains_key(name)
    }

    pub fn has_table_id(&self, table_id: i32) -> bool {
        self.table_names.contains_key(&table_id)
    }

    pub fn get_table_id(&self, name: &str) -> Option<i32> {
        self.table_ids.get(name).copied()
    }

    pub fn get_table_name(&self, table_id: i32) -> Option<&str> {
        self.table_names.get(&table_id).map(|s| s.as_str())
    }

    /// Registers a new, uncommitted table and returns its id.
    pub fn add_table(&mut self, name: &str) -> i32 {
        let table_id = self.next_table_id;
        self.next_table_id += 1;
        self.table_names.insert(table_id, name.to_string());
        self.table_committed.insert(table_id, false);
        self.table_ids.insert(name.to_string(), table_id);
        table_id
    }

    pub fn remove_table(&mut self, table_id: i32) {
        if let Some(name) = self.table_names.remove(&table_id) {
            self.table_ids.remove(&name);
        }
        self.table_committed.remove(&table_id);
    }

    pub fn commit_table(&mut self, table_id: i32) {
        if let Some(committed) = self.table_committed.get_mut(&table_id) {
            *committed = true;
        }
    }

    pub fn table_is_committed(&self, table_id: i32) -> bool {
        self.table_committed.get(&table_id).copied().unwrap_or(false)
    }

    pub fn table_ids(&self) -> Vec<i32> {
        self.table_names.keys().copied().collect()
    }

    pub fn committed_table_names(&self) -> Vec<String> {
        self.table_names
            .iter()
            .filter(|(id, _)| self.table_is_committed(**id))
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn has_bulk_job(&self, name: &str) -> bool {
        self.bulk_job_ids.contains_key(name)
    }

    /// Registers a new, uncommitted bulk job and returns its id.
    pub fn add_bulk_job(&mut self, name: &str) -> i32 {
        let bulk_job_id = self.next_bulk_job_id;
        self.next_bulk_job_id += 1;
        self.bulk_job_names.insert(bulk_job_id, name.to_string());
        self.bulk_job_committed.insert(bulk_job_id, false);
        self.bulk_job_ids.insert(name.to_string(), bulk_job_id);
        bulk_job_id
    }

    pub fn commit_bulk_job(&mut self, bulk_job_id: i32) {
        if let Some(committed) = self.bulk_job_committed.get_mut(&bulk_job_id) {
            *committed = true;
        }
    }

    pub fn bulk_job_is_committed(&self, bulk_job_id: i32) -> bool {
        self.bulk_job_committed
            .get(&bulk_job_id)
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct TableMetadata {
    descriptor: TableDescriptor,
}

impl TableMetadata {
    pub fn new(descriptor: TableDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> i32 {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.descriptor.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.descriptor.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.descriptor.columns.iter().find(|c| c.name == name)
    }

    pub fn num_rows(&self) -> i64 {
        self.descriptor.end_rows.last().copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct BulkJobMetadata {
    descriptor: BulkJobDescriptor,
}

impl BulkJobMetadata {
    pub fn new(descriptor: BulkJobDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &BulkJobDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> i32 {
        self.descriptor.id
    }
}

#[derive(Clone, Debug)]
pub struct WorkerHistory {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks_assigned: i64,
    pub tasks_retired: i64,
}

impl WorkerHistory {
    pub fn started_now() -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            tasks_assigned: 0,
            tasks_retired: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ids_are_monotonic_and_start_uncommitted() {
        let mut meta = DatabaseMetadata::default();
        let a = meta.add_table("a");
        let b = meta.add_table("b");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(!meta.table_is_committed(a));
        assert!(meta.committed_table_names().is_empty());

        meta.commit_table(a);
        assert!(meta.table_is_committed(a));
        assert_eq!(meta.committed_table_names(), vec!["a".to_string()]);
    }

    #[test]
    fn removing_a_table_keeps_the_id_counter() {
        let mut meta = DatabaseMetadata::default();
        let a = meta.add_table("a");
        meta.remove_table(a);
        assert!(!meta.has_table("a"));
        let b = meta.add_table("b");
        assert_eq!(b, 1);
    }

    #[test]
    fn descriptor_round_trip_preserves_commit_flags() {
        let mut meta = DatabaseMetadata::default();
        let a = meta.add_table("a");
        let _b = meta.add_table("b");
        meta.commit_table(a);
        let job = meta.add_bulk_job("job");
        meta.commit_bulk_job(job);

        let restored = DatabaseMetadata::from_descriptor(&meta.to_descriptor());
        assert!(restored.table_is_committed(a));
        assert!(!restored.table_is_committed(1));
        assert!(restored.bulk_job_is_committed(job));
        assert_eq!(restored.add_table("c"), 2);
    }
}
