//! Result consolidation
//!
//! Folds raw trial records into per-experiment, per-treatment counters.
//! Records of a multivariate experiment arrive one per sub-experiment; they are
//! buffered per (parent, identity) until every sibling has reported and then
//! counted once under the composite key, e.g. `red:large`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::constants::{COMPOSITE_KEY_DELIMITER, DEFAULT_CONTROL_NAME};
use crate::errors::{Result, ScenarioError, StorageResultExt};
use crate::experiment::ExperimentId;
use crate::identity::Identity;
use crate::metrics::{CONSOLIDATED_RECORDS_TOTAL, PENDING_MULTIVARIATE};
use crate::storage::{ParentRef, ResultPages, ResultRecord, StorageAdapter};

/// Trials and completions for one treatment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreatmentCounter {
    pub total: u64,
    pub completed: u64,
}

/// Counters for one experiment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExperimentCounters {
    pub multivariate: bool,
    /// Control treatment, or the joined sibling controls for a multivariate test
    pub control: String,
    pub treatments: BTreeMap<String, TreatmentCounter>,
}

impl ExperimentCounters {
    pub fn total(&self) -> u64 {
        self.treatments.values().map(|c| c.total).sum()
    }

    pub fn completed(&self) -> u64 {
        self.treatments.values().map(|c| c.completed).sum()
    }
}

/// Consolidated counters keyed by experiment name
///
/// Counts only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CounterTable {
    experiments: BTreeMap<String, ExperimentCounters>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one trial
    pub fn record(
        &mut self,
        experiment: &str,
        control: &str,
        multivariate: bool,
        treatment: &str,
        completed: bool,
    ) {
        let entry = self.entry(experiment, control, multivariate);
        let counter = entry.treatments.entry(treatment.to_string()).or_default();
        counter.total += 1;
        if completed {
            counter.completed += 1;
        }
    }

    /// Ensure `experiment` has an entry, with zero counters for `treatments`
    ///
    /// Counts and the control already taken from results are kept.
    pub fn seed<'t>(
        &mut self,
        experiment: &str,
        control: &str,
        multivariate: bool,
        treatments: impl IntoIterator<Item = &'t str>,
    ) {
        let entry = self.entry(experiment, control, multivariate);
        for treatment in treatments {
            entry.treatments.entry(treatment.to_string()).or_default();
        }
    }

    fn entry(
        &mut self,
        experiment: &str,
        control: &str,
        multivariate: bool,
    ) -> &mut ExperimentCounters {
        self.experiments
            .entry(experiment.to_string())
            .or_insert_with(|| ExperimentCounters {
                multivariate,
                control: control.to_string(),
                treatments: BTreeMap::new(),
            })
    }

    pub fn get(&self, experiment: &str) -> Option<&ExperimentCounters> {
        self.experiments.get(experiment)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExperimentCounters)> {
        self.experiments.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    treatment: String,
    control: String,
    completed: bool,
}

/// Counts of what one consolidation run consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    pub records: u64,
    pub simple: u64,
    /// Sub-experiment records, whether or not their sibling set completed
    pub multivariate: u64,
    /// Complete sibling sets counted under a composite key
    pub joined: u64,
    pub skipped: u64,
}

/// Stateful consolidation run
pub struct Consolidator<'a> {
    storage: &'a dyn StorageAdapter,
    counters: CounterTable,
    pending: HashMap<(ExperimentId, Identity), BTreeMap<ExperimentId, PendingEntry>>,
    siblings: HashMap<ExperimentId, Vec<ExperimentId>>,
    stats: ConsolidationStats,
}

impl<'a> Consolidator<'a> {
    pub fn new(storage: &'a dyn StorageAdapter) -> Self {
        Self {
            storage,
            counters: CounterTable::new(),
            pending: HashMap::new(),
            siblings: HashMap::new(),
            stats: ConsolidationStats::default(),
        }
    }

    /// Consume a result stream
    ///
    /// Records that fail validation are logged and skipped. A stream error or
    /// a sub-experiment whose parent cannot be resolved aborts the run.
    pub fn consolidate<I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = anyhow::Result<ResultRecord>>,
    {
        for record in records {
            let record = record.map_storage_err()?;
            self.stats.records += 1;
            match self.add(record) {
                Ok(()) => {}
                Err(ScenarioError::Consolidation(reason)) => {
                    self.stats.skipped += 1;
                    CONSOLIDATED_RECORDS_TOTAL.with_label_values(&["skipped"]).inc();
                    tracing::warn!("Skipping result record: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
        PENDING_MULTIVARIATE.set(self.pending_len() as i64);
        Ok(())
    }

    /// Fold a single record into the counters
    pub fn add(&mut self, record: ResultRecord) -> Result<()> {
        if record.treatment_name.trim().is_empty() {
            return Err(ScenarioError::Consolidation(format!(
                "record for {} in '{}' has no treatment",
                record.identity, record.experiment_name
            )));
        }
        if record.experiment_data.as_ref().is_some_and(|d| d.multivariate) {
            return Err(ScenarioError::Consolidation(format!(
                "multivariate experiment '{}' holds a direct assignment for {}",
                record.experiment_name, record.identity
            )));
        }

        let declared_parent = record.experiment_data.as_ref().and_then(|d| d.parent.clone());
        match (record.parent.clone(), declared_parent) {
            (Some(parent), _) => self.add_sub_experiment(parent, record),
            (None, Some(parent_name)) => Err(ScenarioError::invalid_experiment(
                &record.experiment_name,
                format!("parent experiment '{parent_name}' could not be resolved"),
            )),
            (None, None) => {
                let control = control_of(&record);
                self.counters.record(
                    &record.experiment_name,
                    &control,
                    false,
                    &record.treatment_name,
                    record.completed,
                );
                self.stats.simple += 1;
                CONSOLIDATED_RECORDS_TOTAL.with_label_values(&["simple"]).inc();
                Ok(())
            }
        }
    }

    fn add_sub_experiment(&mut self, parent: ParentRef, record: ResultRecord) -> Result<()> {
        let siblings = self.siblings_of(&parent)?;
        if !siblings.contains(&record.experiment_id) {
            return Err(ScenarioError::invalid_experiment(
                &parent.name,
                format!(
                    "sub-experiment '{}' is not a child of its parent",
                    record.experiment_name
                ),
            ));
        }

        let entry_key = (parent.id, record.identity.clone());
        let set = self.pending.entry(entry_key.clone()).or_default();
        if set.contains_key(&record.experiment_id) {
            return Err(ScenarioError::Consolidation(format!(
                "duplicate result for {} in '{}'",
                record.identity, record.experiment_name
            )));
        }
        set.insert(
            record.experiment_id,
            PendingEntry {
                control: control_of(&record),
                treatment: record.treatment_name,
                completed: record.completed,
            },
        );
        self.stats.multivariate += 1;
        CONSOLIDATED_RECORDS_TOTAL.with_label_values(&["multivariate"]).inc();

        if set.len() < siblings.len() {
            return Ok(());
        }

        let Some(set) = self.pending.remove(&entry_key) else {
            return Ok(());
        };
        // siblings are ascending, so the BTreeMap order is child-id order
        let delimiter = COMPOSITE_KEY_DELIMITER.to_string();
        let key = set
            .values()
            .map(|e| e.treatment.as_str())
            .collect::<Vec<_>>()
            .join(&delimiter);
        let control = set
            .values()
            .map(|e| e.control.as_str())
            .collect::<Vec<_>>()
            .join(&delimiter);
        let completed = set.values().all(|e| e.completed);

        self.counters.record(&parent.name, &control, true, &key, completed);
        self.stats.joined += 1;
        Ok(())
    }

    fn siblings_of(&mut self, parent: &ParentRef) -> Result<Vec<ExperimentId>> {
        if let Some(ids) = self.siblings.get(&parent.id) {
            return Ok(ids.clone());
        }
        let mut ids = self
            .storage
            .child_experiment_ids(parent.id)
            .map_storage_err()?;
        if ids.is_empty() {
            return Err(ScenarioError::invalid_experiment(
                &parent.name,
                "multivariate parent has no sub-experiments in storage",
            ));
        }
        ids.sort();
        self.siblings.insert(parent.id, ids.clone());
        Ok(ids)
    }

    /// Identities still waiting on sibling results
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ConsolidationStats {
        self.stats
    }

    pub fn counters(&self) -> &CounterTable {
        &self.counters
    }

    /// Finish the run; partial sibling sets are dropped uncounted
    pub fn into_counters(self) -> CounterTable {
        if !self.pending.is_empty() {
            tracing::debug!(
                pending = self.pending.len(),
                "Discarding incomplete multivariate sets"
            );
        }
        self.counters
    }
}

fn control_of(record: &ResultRecord) -> String {
    record
        .experiment_data
        .as_ref()
        .map(|d| d.control.clone())
        .unwrap_or_else(|| DEFAULT_CONTROL_NAME.to_string())
}

/// Consolidate every stored result of one experiment, paging through storage
pub fn consolidate_experiment(
    storage: &dyn StorageAdapter,
    experiment: ExperimentId,
    batch_size: usize,
) -> Result<(CounterTable, ConsolidationStats)> {
    let mut consolidator = Consolidator::new(storage);
    consolidator.consolidate(ResultPages::new(storage, experiment, batch_size))?;
    let stats = consolidator.stats();
    tracing::info!(
        experiment = %experiment,
        records = stats.records,
        skipped = stats.skipped,
        pending = consolidator.pending_len(),
        "Consolidation finished"
    );
    Ok((consolidator.into_counters(), stats))
}
