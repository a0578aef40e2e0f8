//! In-process storage adapter
//!
//! Keeps every table in memory behind one `RwLock`. Assignment rows are keyed
//! by (experiment, sequence), so a results page is a range read that starts
//! at the caller's cursor.

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    ExperimentRecord, ParentRef, ResultCursor, ResultRecord, ResultsPage, StorageAdapter,
    TreatmentRecord,
};
use crate::experiment::{ExperimentId, ExperimentMetadata, TreatmentId};
use crate::identity::Identity;

#[derive(Debug, Clone)]
struct AssignmentRow {
    identity: Identity,
    experiment_id: ExperimentId,
    treatment_id: TreatmentId,
    completed: bool,
}

#[derive(Debug, Default)]
struct Tables {
    experiments: BTreeMap<ExperimentId, ExperimentRecord>,
    experiment_names: HashMap<String, ExperimentId>,
    treatments: BTreeMap<TreatmentId, TreatmentRecord>,
    assignments: BTreeMap<(ExperimentId, u64), AssignmentRow>,
    assignment_index: HashMap<(ExperimentId, Identity), u64>,
    next_experiment_id: u64,
    next_treatment_id: u64,
    next_assignment_seq: u64,
}

impl Tables {
    fn treatment_named(&self, experiment: ExperimentId, name: &str) -> Option<&TreatmentRecord> {
        self.treatments
            .values()
            .find(|t| t.experiment_id == experiment && t.name == name)
    }

    fn ensure_treatment(&mut self, experiment: ExperimentId, name: &str) -> TreatmentRecord {
        if let Some(existing) = self.treatment_named(experiment, name) {
            return existing.clone();
        }
        self.next_treatment_id += 1;
        let record = TreatmentRecord {
            id: TreatmentId(self.next_treatment_id),
            experiment_id: experiment,
            name: name.to_string(),
        };
        self.treatments.insert(record.id, record.clone());
        record
    }

    /// The experiment plus its sub-experiments, ascending
    fn family(&self, experiment: ExperimentId) -> Vec<ExperimentId> {
        let mut ids = vec![experiment];
        ids.extend(
            self.experiments
                .values()
                .filter(|e| e.parent_id == Some(experiment))
                .map(|e| e.id),
        );
        ids.sort();
        ids
    }

    fn assignment(&self, experiment: ExperimentId, identity: &Identity) -> Option<&AssignmentRow> {
        let seq = self.assignment_index.get(&(experiment, identity.clone()))?;
        self.assignments.get(&(experiment, *seq))
    }

    fn to_result(&self, row: &AssignmentRow) -> Result<ResultRecord> {
        let experiment = self
            .experiments
            .get(&row.experiment_id)
            .ok_or_else(|| {
                anyhow!("assignment references missing experiment {}", row.experiment_id)
            })?;
        let treatment = self
            .treatments
            .get(&row.treatment_id)
            .ok_or_else(|| {
                anyhow!("assignment references missing treatment {}", row.treatment_id)
            })?;
        let parent = experiment.parent_id.and_then(|pid| {
            self.experiments.get(&pid).map(|p| ParentRef {
                id: p.id,
                name: p.name.clone(),
                data: Some(p.metadata.clone()),
            })
        });

        Ok(ResultRecord {
            identity: row.identity.clone(),
            completed: row.completed,
            treatment_name: treatment.name.clone(),
            treatment_id: Some(treatment.id),
            experiment_name: experiment.name.clone(),
            experiment_id: experiment.id,
            experiment_data: Some(experiment.metadata.clone()),
            parent,
        })
    }
}

/// Storage adapter backed by in-memory tables
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    writes: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls that changed state
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn assignment_count(&self) -> usize {
        self.tables.read().assignments.len()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .experiment_names
            .get(name)
            .and_then(|id| tables.experiments.get(id))
            .cloned())
    }

    fn get_experiment_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentRecord>> {
        Ok(self.tables.read().experiments.get(&id).cloned())
    }

    fn add_experiment(
        &self,
        name: &str,
        metadata: &ExperimentMetadata,
    ) -> Result<ExperimentRecord> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables
            .experiment_names
            .get(name)
            .and_then(|id| tables.experiments.get(id))
        {
            return Ok(existing.clone());
        }

        let parent_id = match &metadata.parent {
            Some(parent) => Some(
                *tables
                    .experiment_names
                    .get(parent)
                    .ok_or_else(|| anyhow!("parent experiment '{parent}' does not exist"))?,
            ),
            None => None,
        };

        tables.next_experiment_id += 1;
        let record = ExperimentRecord {
            id: ExperimentId(tables.next_experiment_id),
            name: name.to_string(),
            metadata: metadata.clone(),
            parent_id,
            created_at: Utc::now(),
        };
        tables.experiment_names.insert(name.to_string(), record.id);
        tables.experiments.insert(record.id, record.clone());
        drop(tables);

        self.record_write();
        Ok(record)
    }

    fn update_experiment(&self, id: ExperimentId, metadata: &ExperimentMetadata) -> Result<()> {
        let mut tables = self.tables.write();
        let record = tables
            .experiments
            .get_mut(&id)
            .ok_or_else(|| anyhow!("experiment {id} does not exist"))?;
        record.metadata = metadata.clone();
        drop(tables);

        self.record_write();
        Ok(())
    }

    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        Ok(self.tables.read().experiments.values().cloned().collect())
    }

    fn child_experiment_ids(&self, parent: ExperimentId) -> Result<Vec<ExperimentId>> {
        // BTreeMap iteration is already ascending by id
        Ok(self
            .tables
            .read()
            .experiments
            .values()
            .filter(|e| e.parent_id == Some(parent))
            .map(|e| e.id)
            .collect())
    }

    fn get_treatment_for_identity(
        &self,
        experiment: ExperimentId,
        identity: &Identity,
    ) -> Result<Option<TreatmentRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .assignment(experiment, identity)
            .and_then(|row| tables.treatments.get(&row.treatment_id))
            .cloned())
    }

    fn get_treatment_by_name(
        &self,
        experiment: ExperimentId,
        name: &str,
    ) -> Result<Option<TreatmentRecord>> {
        Ok(self.tables.read().treatment_named(experiment, name).cloned())
    }

    fn treatments_for_experiment(&self, experiment: ExperimentId) -> Result<Vec<TreatmentRecord>> {
        Ok(self
            .tables
            .read()
            .treatments
            .values()
            .filter(|t| t.experiment_id == experiment)
            .cloned()
            .collect())
    }

    fn set_treatment(
        &self,
        experiment: ExperimentId,
        treatment: &str,
        identity: &Identity,
    ) -> Result<TreatmentRecord> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&experiment) {
            bail!("experiment {experiment} does not exist");
        }

        if let Some(existing) = tables.assignment(experiment, identity).map(|r| r.treatment_id) {
            return tables
                .treatments
                .get(&existing)
                .cloned()
                .ok_or_else(|| anyhow!("assignment references missing treatment {existing}"));
        }

        let record = tables.ensure_treatment(experiment, treatment);
        tables.next_assignment_seq += 1;
        let seq = tables.next_assignment_seq;
        tables.assignments.insert(
            (experiment, seq),
            AssignmentRow {
                identity: identity.clone(),
                experiment_id: experiment,
                treatment_id: record.id,
                completed: false,
            },
        );
        tables
            .assignment_index
            .insert((experiment, identity.clone()), seq);
        drop(tables);

        self.record_write();
        Ok(record)
    }

    fn get_results_page(
        &self,
        experiment: ExperimentId,
        after: Option<ResultCursor>,
        limit: usize,
    ) -> Result<ResultsPage> {
        let tables = self.tables.read();
        let mut page = ResultsPage::default();

        for exp_id in tables.family(experiment) {
            if page.len() >= limit {
                break;
            }
            let lower = match after {
                Some(c) if c.experiment > exp_id => continue,
                Some(c) if c.experiment == exp_id => Bound::Excluded((exp_id, c.row)),
                _ => Bound::Included((exp_id, 0)),
            };
            let rows = tables
                .assignments
                .range((lower, Bound::Included((exp_id, u64::MAX))))
                .take(limit - page.len());
            for (&(exp, row), assignment) in rows {
                page.records.push(tables.to_result(assignment)?);
                page.cursor = Some(ResultCursor { experiment: exp, row });
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
        let mut tables = self.tables.write();
        let Some(stored) = tables.treatment_named(experiment, treatment).map(|t| t.id) else {
            bail!("treatment '{treatment}' does not exist in experiment {experiment}");
        };
        let Some(&seq) = tables.assignment_index.get(&(experiment, identity.clone())) else {
            return Ok(false);
        };
        let Some(row) = tables.assignments.get_mut(&(experiment, seq)) else {
            return Ok(false);
        };
        if row.treatment_id != stored {
            return Ok(false);
        }
        row.completed = true;
        drop(tables);

        self.record_write();
        Ok(true)
    }

    fn clear_experiment(&self, experiment: ExperimentId, delete: bool) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&experiment) {
            bail!("experiment {experiment} does not exist");
        }
        let family = tables.family(experiment);

        tables
            .assignments
            .retain(|(exp_id, _), _| !family.contains(exp_id));
        tables
            .assignment_index
            .retain(|(exp_id, _), _| !family.contains(exp_id));
        tables
            .treatments
            .retain(|_, t| !family.contains(&t.experiment_id));

        if delete {
            for id in &family {
                if let Some(record) = tables.experiments.remove(id) {
                    tables.experiment_names.remove(&record.name);
                }
            }
        }
        drop(tables);

        self.record_write();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_add_experiment_is_idempotent() {
        let storage = InMemoryStorage::new();
        let a = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();
        let b = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(storage.list_experiments().unwrap().len(), 1);
    }

    #[test]
    fn test_child_requires_existing_parent() {
        let storage = InMemoryStorage::new();
        let meta = ExperimentMetadata {
            parent: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(storage.add_experiment("missing.color", &meta).is_err());
    }

    #[test]
    fn test_set_treatment_keeps_first_assignment() {
        let storage = InMemoryStorage::new();
        let exp = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();

        let first = storage.set_treatment(exp.id, "alternate", &id("v1")).unwrap();
        let second = storage.set_treatment(exp.id, "default", &id("v1")).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.name, "alternate");
        assert_eq!(storage.assignment_count(), 1);
    }

    #[test]
    fn test_finish_marks_completed_once_assigned() {
        let storage = InMemoryStorage::new();
        let exp = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();
        storage.set_treatment(exp.id, "default", &id("v1")).unwrap();
        storage.set_treatment(exp.id, "alternate", &id("v2")).unwrap();

        assert!(storage.finish_treatment(exp.id, "default", &id("v1")).unwrap());
        // v2 holds a different treatment
        assert!(!storage.finish_treatment(exp.id, "default", &id("v2")).unwrap());
        // unknown treatment is an error, not a silent miss
        assert!(storage.finish_treatment(exp.id, "purple", &id("v1")).is_err());

        let page = storage.get_results_page(exp.id, None, 10).unwrap().records;
        assert!(page[0].completed);
        assert!(!page[1].completed);
    }

    #[test]
    fn test_parent_pages_include_children() {
        let storage = InMemoryStorage::new();
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
        assert_eq!(storage.child_experiment_ids(parent.id).unwrap(), vec![a.id, b.id]);

        storage.set_treatment(a.id, "default", &id("v1")).unwrap();
        storage.set_treatment(b.id, "alternate", &id("v1")).unwrap();

        let page = storage.get_results_page(parent.id, None, 10).unwrap().records;
        assert_eq!(page.len(), 2);
        let parent_ref = page[0].parent.as_ref().unwrap();
        assert_eq!(parent_ref.id, parent.id);
        assert_eq!(parent_ref.name, "home");
    }

    #[test]
    fn test_parent_pages_resume_inside_a_child() {
        let storage = InMemoryStorage::new();
        storage
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
        // interleaved writes; pages still come back grouped by experiment
        for i in 0..3 {
            storage.set_treatment(b.id, "alternate", &id(&format!("v{i}"))).unwrap();
            storage.set_treatment(a.id, "default", &id(&format!("v{i}"))).unwrap();
        }
        let parent = storage.get_experiment_by_name("home").unwrap().unwrap();

        let first = storage.get_results_page(parent.id, None, 4).unwrap();
        assert_eq!(first.cursor.map(|c| c.experiment), Some(b.id));
        let rest = storage.get_results_page(parent.id, first.cursor, 4).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.records.iter().all(|r| r.experiment_id == b.id));
        assert_eq!(
            first.records.iter().filter(|r| r.experiment_id == a.id).count(),
            3
        );
    }

    #[test]
    fn test_clear_and_delete() {
        let storage = InMemoryStorage::new();
        let exp = storage.add_experiment("cta", &ExperimentMetadata::default()).unwrap();
        storage.set_treatment(exp.id, "default", &id("v1")).unwrap();

        storage.clear_experiment(exp.id, false).unwrap();
        assert_eq!(storage.assignment_count(), 0);
        assert!(storage.get_experiment_by_name("cta").unwrap().is_some());
        assert!(storage.treatments_for_experiment(exp.id).unwrap().is_empty());

        storage.clear_experiment(exp.id, true).unwrap();
        assert!(storage.get_experiment_by_name("cta").unwrap().is_none());
    }
}
