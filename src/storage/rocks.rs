//! RocksDB storage adapter
//!
//! One database holds the three tables as key spaces prefixed with the
//! configured table name:
//!
//! ```text
//! {experiments}:id:{id}                 -> ExperimentRecord
//! {experiments}:name:{name}             -> id
//! {treatments}:id:{id}                  -> TreatmentRecord
//! {treatments}:exp:{experiment}:{name}  -> id
//! {users_treatments}:row:{experiment}:{seq}      -> AssignmentRow
//! {users_treatments}:ident:{experiment}:{identity} -> seq
//! ```
//!
//! Numeric key parts are zero padded so prefix scans come back in id order.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rocksdb::{Direction, FlushOptions, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{
    ExperimentRecord, ParentRef, ResultCursor, ResultRecord, ResultsPage, StorageAdapter,
    TreatmentRecord,
};
use crate::config::{ScenarioConfig, TableNames, WriteMode};
use crate::experiment::{ExperimentId, ExperimentMetadata, TreatmentId};
use crate::identity::Identity;

// Id counters live outside every table key space
const NEXT_EXPERIMENT_KEY: &str = "__meta:next_experiment";
const NEXT_TREATMENT_KEY: &str = "__meta:next_treatment";
const NEXT_ASSIGNMENT_KEY: &str = "__meta:next_assignment";

/// Helper trait to iterate over RocksDB results, logging instead of dropping errors
trait LogErrors<T> {
    fn log_errors(self) -> impl Iterator<Item = T>;
}

impl<I, T, E> LogErrors<T> for I
where
    I: Iterator<Item = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    fn log_errors(self) -> impl Iterator<Item = T> {
        self.filter_map(|r| match r {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("RocksDB iterator error (continuing): {}", e);
                None
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssignmentRow {
    identity: Identity,
    experiment_id: ExperimentId,
    treatment_id: TreatmentId,
    completed: bool,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .context("Failed to serialize storage record")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("Failed to deserialize storage record")?;
    Ok(value)
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("expected 8-byte counter, found {} bytes", bytes.len()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Storage adapter backed by an embedded RocksDB database
pub struct RocksStorage {
    db: DB,
    tables: TableNames,
    write_mode: WriteMode,
    path: PathBuf,
    /// Serializes read-check-write sequences within this process
    write_lock: Mutex<()>,
}

impl RocksStorage {
    pub fn open(path: &Path, tables: TableNames, write_mode: WriteMode) -> Result<Self> {
        if !tables.is_valid() {
            bail!("invalid table names {tables:?}");
        }
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create storage directory {}", path.display()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_manual_wal_flush(false);
        opts.set_max_background_jobs(2);

        let db = DB::open(&opts, path)
            .with_context(|| format!("Failed to open RocksDB at {}", path.display()))?;

        tracing::info!(
            "Storage initialized at {:?} with {:?} write mode (latency: {})",
            path,
            write_mode,
            if write_mode == WriteMode::Sync {
                "2-10ms per write"
            } else {
                "<1ms per write"
            }
        );

        Ok(Self {
            db,
            tables,
            write_mode,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &ScenarioConfig) -> Result<Self> {
        Self::open(&config.storage_path, config.tables.clone(), config.write_mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush memtables to disk, blocking until done
    pub fn flush(&self) -> Result<()> {
        let mut flush_opts = FlushOptions::default();
        flush_opts.set_wait(true);
        self.db
            .flush_opt(&flush_opts)
            .map_err(|e| anyhow!("Failed to flush database: {e}"))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.write_mode == WriteMode::Sync);
        write_opts
    }

    fn experiment_key(&self, id: ExperimentId) -> String {
        format!("{}:id:{:020}", self.tables.experiments, id.0)
    }

    fn experiment_name_key(&self, name: &str) -> String {
        format!("{}:name:{}", self.tables.experiments, name)
    }

    fn treatment_key(&self, id: TreatmentId) -> String {
        format!("{}:id:{:020}", self.tables.treatments, id.0)
    }

    fn treatment_name_prefix(&self, experiment: ExperimentId) -> String {
        format!("{}:exp:{:020}:", self.tables.treatments, experiment.0)
    }

    fn assignment_row_prefix(&self, experiment: ExperimentId) -> String {
        format!("{}:row:{:020}:", self.tables.users_treatments, experiment.0)
    }

    fn assignment_row_key(&self, experiment: ExperimentId, seq: u64) -> String {
        format!("{}{:020}", self.assignment_row_prefix(experiment), seq)
    }

    fn assignment_ident_key(&self, experiment: ExperimentId, identity: &Identity) -> String {
        format!(
            "{}:ident:{:020}:{}",
            self.tables.users_treatments,
            experiment.0,
            identity.as_str()
        )
    }

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self
            .db
            .get(key.as_bytes())
            .with_context(|| format!("Failed to read key {key}"))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_id(&self, key: &str) -> Result<Option<u64>> {
        match self
            .db
            .get(key.as_bytes())
            .with_context(|| format!("Failed to read key {key}"))?
        {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys and values under `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + '_ {
        self.scan_from(prefix, prefix)
    }

    /// Lazy scan of the keys under `prefix` starting at `start`
    fn scan_from(
        &self,
        prefix: &str,
        start: &str,
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + '_ {
        let prefix = prefix.as_bytes().to_vec();
        self.db
            .iterator(IteratorMode::From(start.as_bytes(), Direction::Forward))
            .log_errors()
            .take_while(move |(key, _)| key.starts_with(&prefix))
    }

    /// Allocate the next id for a counter; caller holds `write_lock`
    fn next_id(&self, counter: &str, batch: &mut WriteBatch) -> Result<u64> {
        let next = self.get_id(counter)?.unwrap_or(0) + 1;
        batch.put(counter.as_bytes(), next.to_be_bytes());
        Ok(next)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write_opt(batch, &self.write_opts())
            .context("Failed to write batch to RocksDB")
    }

    fn family(&self, experiment: ExperimentId) -> Result<Vec<ExperimentId>> {
        let mut ids = vec![experiment];
        ids.extend(self.child_experiment_ids(experiment)?);
        ids.sort();
        Ok(ids)
    }

    /// Sequence number encoded in an assignment row key
    fn row_seq(prefix: &str, key: &[u8]) -> Result<u64> {
        let suffix = key
            .get(prefix.len()..)
            .ok_or_else(|| anyhow!("assignment row key shorter than its prefix"))?;
        std::str::from_utf8(suffix)
            .context("assignment row key is not UTF-8")?
            .parse()
            .context("assignment row key has no sequence number")
    }

    fn parent_ref(&self, record: &ExperimentRecord) -> Result<Option<ParentRef>> {
        let Some(pid) = record.parent_id else {
            return Ok(None);
        };
        Ok(self.get_experiment_by_id(pid)?.map(|p| ParentRef {
            id: p.id,
            name: p.name,
            data: Some(p.metadata),
        }))
    }

    fn assignment_for(
        &self,
        experiment: ExperimentId,
        identity: &Identity,
    ) -> Result<Option<(String, AssignmentRow)>> {
        let Some(seq) = self.get_id(&self.assignment_ident_key(experiment, identity))? else {
            return Ok(None);
        };
        let row_key = self.assignment_row_key(experiment, seq);
        Ok(self
            .get_value::<AssignmentRow>(&row_key)?
            .map(|row| (row_key, row)))
    }
}

impl StorageAdapter for RocksStorage {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        match self.get_id(&self.experiment_name_key(name))? {
            Some(id) => self.get_experiment_by_id(ExperimentId(id)),
            None => Ok(None),
        }
    }

    fn get_experiment_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentRecord>> {
        self.get_value(&self.experiment_key(id))
    }

    fn add_experiment(
        &self,
        name: &str,
        metadata: &ExperimentMetadata,
    ) -> Result<ExperimentRecord> {
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.get_experiment_by_name(name)? {
            return Ok(existing);
        }

        let parent_id = match &metadata.parent {
            Some(parent) => Some(
                self.get_experiment_by_name(parent)?
                    .ok_or_else(|| anyhow!("parent experiment '{parent}' does not exist"))?
                    .id,
            ),
            None => None,
        };

        let mut batch = WriteBatch::default();
        let id = ExperimentId(self.next_id(NEXT_EXPERIMENT_KEY, &mut batch)?);
        let record = ExperimentRecord {
            id,
            name: name.to_string(),
            metadata: metadata.clone(),
            parent_id,
            created_at: Utc::now(),
        };
        batch.put(self.experiment_key(id).as_bytes(), encode(&record)?);
        batch.put(self.experiment_name_key(name).as_bytes(), id.0.to_be_bytes());
        self.commit(batch)
            .with_context(|| format!("Failed to add experiment '{name}'"))?;

        tracing::debug!(experiment = name, id = %id, "Experiment row created");
        Ok(record)
    }

    fn update_experiment(&self, id: ExperimentId, metadata: &ExperimentMetadata) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut record = self
            .get_experiment_by_id(id)?
            .ok_or_else(|| anyhow!("experiment {id} does not exist"))?;
        record.metadata = metadata.clone();
        self.db
            .put_opt(self.experiment_key(id).as_bytes(), encode(&record)?, &self.write_opts())
            .with_context(|| format!("Failed to update experiment {id}"))
    }

    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        let prefix = format!("{}:id:", self.tables.experiments);
        self.scan_prefix(&prefix)
            .map(|(_, value)| decode(&value))
            .collect()
    }

    fn child_experiment_ids(&self, parent: ExperimentId) -> Result<Vec<ExperimentId>> {
        Ok(self
            .list_experiments()?
            .into_iter()
            .filter(|e| e.parent_id == Some(parent))
            .map(|e| e.id)
            .collect())
    }

    fn get_treatment_for_identity(
        &self,
        experiment: ExperimentId,
        identity: &Identity,
    ) -> Result<Option<TreatmentRecord>> {
        match self.assignment_for(experiment, identity)? {
            Some((_, row)) => self.get_value(&self.treatment_key(row.treatment_id)),
            None => Ok(None),
        }
    }

    fn get_treatment_by_name(
        &self,
        experiment: ExperimentId,
        name: &str,
    ) -> Result<Option<TreatmentRecord>> {
        let key = format!("{}{}", self.treatment_name_prefix(experiment), name);
        match self.get_id(&key)? {
            Some(id) => self.get_value(&self.treatment_key(TreatmentId(id))),
            None => Ok(None),
        }
    }

    fn treatments_for_experiment(&self, experiment: ExperimentId) -> Result<Vec<TreatmentRecord>> {
        let mut treatments = Vec::new();
        for (_, value) in self.scan_prefix(&self.treatment_name_prefix(experiment)) {
            let id = TreatmentId(decode_u64(&value)?);
            if let Some(record) = self.get_value::<TreatmentRecord>(&self.treatment_key(id))? {
                treatments.push(record);
            }
        }
        treatments.sort_by_key(|t| t.id);
        Ok(treatments)
    }

    fn set_treatment(
        &self,
        experiment: ExperimentId,
        treatment: &str,
        identity: &Identity,
    ) -> Result<TreatmentRecord> {
        let _guard = self.write_lock.lock();
        if self.get_experiment_by_id(experiment)?.is_none() {
            bail!("experiment {experiment} does not exist");
        }
        if let Some((_, row)) = self.assignment_for(experiment, identity)? {
            return self
                .get_value(&self.treatment_key(row.treatment_id))?
                .ok_or_else(|| {
                    anyhow!("assignment references missing treatment {}", row.treatment_id)
                });
        }

        let mut batch = WriteBatch::default();
        let record = match self.get_treatment_by_name(experiment, treatment)? {
            Some(existing) => existing,
            None => {
                let id = TreatmentId(self.next_id(NEXT_TREATMENT_KEY, &mut batch)?);
                let record = TreatmentRecord {
                    id,
                    experiment_id: experiment,
                    name: treatment.to_string(),
                };
                batch.put(self.treatment_key(id).as_bytes(), encode(&record)?);
                batch.put(
                    format!("{}{}", self.treatment_name_prefix(experiment), treatment).as_bytes(),
                    id.0.to_be_bytes(),
                );
                record
            }
        };

        let seq = self.next_id(NEXT_ASSIGNMENT_KEY, &mut batch)?;
        let row = AssignmentRow {
            identity: identity.clone(),
            experiment_id: experiment,
            treatment_id: record.id,
            completed: false,
        };
        batch.put(self.assignment_row_key(experiment, seq).as_bytes(), encode(&row)?);
        batch.put(
            self.assignment_ident_key(experiment, identity).as_bytes(),
            seq.to_be_bytes(),
        );
        self.commit(batch)
            .with_context(|| format!("Failed to store assignment for {identity}"))?;

        Ok(record)
    }

    fn get_results_page(
        &self,
        experiment: ExperimentId,
        after: Option<ResultCursor>,
        limit: usize,
    ) -> Result<ResultsPage> {
        let mut page = ResultsPage::default();

        for exp_id in self.family(experiment)? {
            if page.len() >= limit {
                break;
            }
            let prefix = self.assignment_row_prefix(exp_id);
            let start = match after {
                Some(c) if c.experiment > exp_id => continue,
                Some(c) if c.experiment == exp_id => match c.row.checked_add(1) {
                    Some(next) => self.assignment_row_key(exp_id, next),
                    None => continue,
                },
                _ => prefix.clone(),
            };
            let Some(record) = self.get_experiment_by_id(exp_id)? else {
                continue;
            };
            let parent = self.parent_ref(&record)?;

            for (key, value) in self.scan_from(&prefix, &start).take(limit - page.len()) {
                let row: AssignmentRow = decode(&value)?;
                let treatment: TreatmentRecord = self
                    .get_value(&self.treatment_key(row.treatment_id))?
                    .ok_or_else(|| {
                        anyhow!("assignment references missing treatment {}", row.treatment_id)
                    })?;
                page.cursor = Some(ResultCursor {
                    experiment: exp_id,
                    row: Self::row_seq(&prefix, &key)?,
                });
                page.records.push(ResultRecord {
                    identity: row.identity,
                    completed: row.completed,
                    treatment_name: treatment.name,
                    treatment_id: Some(treatment.id),
                    experiment_name: record.name.clone(),
                    experiment_id: record.id,
                    experiment_data: Some(record.metadata.clone()),
                    parent: parent.clone(),
                });
            }
        }

        Ok(page)
    }

    fn finish_treatment(
        &self,
        experiment: ExperimentId,
        treatment: &str,
        identity: &Identity,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(stored) = self.get_treatment_by_name(experiment, treatment)? else {
            bail!("treatment '{treatment}' does not exist in experiment {experiment}");
        };
        let Some((row_key, mut row)) = self.assignment_for(experiment, identity)? else {
            return Ok(false);
        };
        if row.treatment_id != stored.id {
            return Ok(false);
        }
        row.completed = true;
        self.db
            .put_opt(row_key.as_bytes(), encode(&row)?, &self.write_opts())
            .with_context(|| format!("Failed to finish treatment for {identity}"))?;
        Ok(true)
    }

    fn clear_experiment(&self, experiment: ExperimentId, delete: bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.get_experiment_by_id(experiment)?.is_none() {
            bail!("experiment {experiment} does not exist");
        }

        let mut batch = WriteBatch::default();
        for exp_id in self.family(experiment)? {
            for (key, value) in self.scan_prefix(&self.assignment_row_prefix(exp_id)) {
                let row: AssignmentRow = decode(&value)?;
                batch.delete(&key);
                batch.delete(self.assignment_ident_key(exp_id, &row.identity).as_bytes());
            }
            for (key, value) in self.scan_prefix(&self.treatment_name_prefix(exp_id)) {
                batch.delete(&key);
                batch.delete(self.treatment_key(TreatmentId(decode_u64(&value)?)).as_bytes());
            }
            if delete {
                if let Some(record) = self.get_experiment_by_id(exp_id)? {
                    batch.delete(self.experiment_name_key(&record.name).as_bytes());
                }
                batch.delete(self.experiment_key(exp_id).as_bytes());
            }
        }
        self.commit(batch)
            .with_context(|| format!("Failed to clear experiment {experiment}"))?;

        tracing::info!(experiment = %experiment, delete, "Experiment data cleared");
        Ok(())
    }
}

impl Drop for RocksStorage {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Failed to flush storage on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> RocksStorage {
        RocksStorage::open(dir.path(), TableNames::default(), WriteMode::Async).unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_assignment_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let exp_id = {
            let storage = open(&dir);
            let exp = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();
            storage.set_treatment(exp.id, "alternate", &id("v1")).unwrap();
            storage.finish_treatment(exp.id, "alternate", &id("v1")).unwrap();
            exp.id
        };

        let storage = open(&dir);
        let t = storage.get_treatment_for_identity(exp_id, &id("v1")).unwrap().unwrap();
        assert_eq!(t.name, "alternate");
        let page = storage.get_results_page(exp_id, None, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert!(page.records[0].completed);

        // counters continue after reopen
        let second = storage.add_experiment("hero", &ExperimentMetadata::default()).unwrap();
        assert!(second.id > exp_id);
    }

    #[test]
    fn test_set_treatment_is_insert_if_absent() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let exp = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();

        let first = storage.set_treatment(exp.id, "default", &id("v1")).unwrap();
        let again = storage.set_treatment(exp.id, "alternate", &id("v1")).unwrap();
        assert_eq!(first, again);
        assert_eq!(storage.treatments_for_experiment(exp.id).unwrap().len(), 1);
    }

    #[test]
    fn test_results_pages_resume_across_children() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let parent = storage
            .add_experiment(
                "home",
                &ExperimentMetadata {
                    multivariate: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let child_meta = ExperimentMetadata {
            parent: Some("home".to_string()),
            ..Default::default()
        };
        let a = storage.add_experiment("home.a", &child_meta).unwrap();
        let b = storage.add_experiment("home.b", &child_meta).unwrap();
        for i in 0..3 {
            storage.set_treatment(a.id, "default", &id(&format!("v{i}"))).unwrap();
            storage.set_treatment(b.id, "alternate", &id(&format!("v{i}"))).unwrap();
        }

        let first = storage.get_results_page(parent.id, None, 4).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first.cursor.map(|c| c.experiment), Some(b.id));
        let rest = storage.get_results_page(parent.id, first.cursor, 4).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.records.iter().all(|r| r.experiment_name == "home.b"));
        assert!(first
            .records
            .iter()
            .all(|r| r.parent.as_ref().map(|p| p.id) == Some(parent.id)));
        assert!(storage.get_results_page(parent.id, rest.cursor, 4).unwrap().is_empty());
    }

    #[test]
    fn test_custom_table_names_and_clear() {
        let dir = TempDir::new().unwrap();
        let tables = TableNames {
            experiments: "ab_experiments".to_string(),
            treatments: "ab_treatments".to_string(),
            users_treatments: "ab_users".to_string(),
        };
        let storage = RocksStorage::open(dir.path(), tables, WriteMode::Sync).unwrap();
        let exp = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();
        storage.set_treatment(exp.id, "default", &id("v1")).unwrap();

        storage.clear_experiment(exp.id, false).unwrap();
        assert!(storage.get_results_page(exp.id, None, 10).unwrap().is_empty());
        assert!(storage.get_treatment_for_identity(exp.id, &id("v1")).unwrap().is_none());

        storage.clear_experiment(exp.id, true).unwrap();
        assert!(storage.get_experiment_by_name("cta").unwrap().is_none());
    }
}
