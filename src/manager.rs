//! Engine facade
//!
//! [`ScenarioManager`] ties the registry, storage and resolver together. It is
//! constructed explicitly with a storage adapter and configuration; callers
//! pass identities in on every call.

use parking_lot::RwLock;
use rand::RngCore;
use serde_json::Value;
use std::sync::Arc;

use crate::analyzer::AnalysisReport;
use crate::config::ScenarioConfig;
use crate::constants::{
    COMPOSITE_KEY_DELIMITER, DEFAULT_ALTERNATE_NAME, DEFAULT_TREATMENT_WEIGHT,
};
use crate::consolidator::consolidate_experiment;
use crate::errors::{Result, ScenarioError, StorageResultExt};
use crate::experiment::{
    compose_multivariate, Experiment, ExperimentId, ExperimentKey, ExperimentMetadata,
    ExperimentRegistry, MultivariateComposition, SelectionStrategy, WeightedRandom, Weighting,
};
use crate::identity::Identity;
use crate::metrics::{Timer, ANALYSIS_DURATION};
use crate::resolver::{Assignment, AssignmentResolver};
use crate::storage::{ExperimentRecord, StorageAdapter};

pub struct ScenarioManager {
    config: ScenarioConfig,
    storage: Arc<dyn StorageAdapter>,
    registry: RwLock<ExperimentRegistry>,
    resolver: AssignmentResolver,
}

impl ScenarioManager {
    pub fn new(storage: Arc<dyn StorageAdapter>, config: ScenarioConfig) -> Self {
        let resolver = AssignmentResolver::new(storage.clone());
        Self::from_parts(storage, config, resolver)
    }

    /// Manager drawing treatments from the given random source
    pub fn with_rng(
        storage: Arc<dyn StorageAdapter>,
        config: ScenarioConfig,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        let resolver = AssignmentResolver::with_rng(storage.clone(), rng);
        Self::from_parts(storage, config, resolver)
    }

    fn from_parts(
        storage: Arc<dyn StorageAdapter>,
        config: ScenarioConfig,
        resolver: AssignmentResolver,
    ) -> Self {
        Self {
            config,
            storage,
            registry: RwLock::new(ExperimentRegistry::new()),
            resolver,
        }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    /// Look up an experiment, loading it from storage or creating it on first use
    ///
    /// Unknown names are created as simple control/alternate experiments when
    /// `create_missing_experiments` is set, and rejected otherwise.
    pub fn experiment(&self, name: &str) -> Result<Experiment> {
        let key = self.key_for(name, self.config.create_missing_experiments)?;
        self.registry
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ScenarioError::ExperimentNotFound(name.to_string()))
    }

    /// Define (or re-weight) a simple experiment
    ///
    /// An existing experiment keeps its control; treatments in `weighting` are
    /// added or re-weighted, and other stored treatments are left alone.
    pub fn define_experiment(
        &self,
        name: &str,
        weighting: Weighting,
        control: &str,
    ) -> Result<Experiment> {
        let mut registry = self.registry.write();
        let existing = match registry.find(name) {
            Some(key) => Some(key),
            None => self.load_by_name(&mut registry, name)?,
        };

        let key = match existing {
            Some(key) => {
                let experiment = registry
                    .get_mut(key)
                    .ok_or_else(|| ScenarioError::ExperimentNotFound(name.to_string()))?;
                if experiment.is_multivariate() {
                    return Err(ScenarioError::invalid_experiment(
                        name,
                        "already defined as a multivariate experiment",
                    ));
                }
                if experiment.control() != control {
                    tracing::warn!(
                        experiment = name,
                        stored = experiment.control(),
                        requested = control,
                        "Control treatment of an existing experiment cannot change"
                    );
                }
                let mut dirty = false;
                for (treatment, weight) in weighting.iter() {
                    dirty |= experiment.set_weight(treatment, weight);
                }
                if dirty {
                    self.sync_metadata(&registry, key)?;
                }
                key
            }
            None => {
                let key = registry.insert(Experiment::new(name, weighting, control)?)?;
                self.persist(&mut registry, key)?;
                key
            }
        };

        registry
            .get(key)
            .cloned()
            .ok_or_else(|| ScenarioError::ExperimentNotFound(name.to_string()))
    }

    /// Define (or reconcile) a multivariate experiment from declarative input
    pub fn define_multivariate(&self, name: &str, raw: &Value) -> Result<MultivariateComposition> {
        let mut registry = self.registry.write();
        match registry.find(name) {
            Some(key) => self.refresh_family(&mut registry, key)?,
            None => {
                self.load_by_name(&mut registry, name)?;
            }
        }

        let composition = compose_multivariate(&mut registry, name, raw)?;
        if registry.get(composition.parent).and_then(Experiment::row_id).is_none() {
            self.persist(&mut registry, composition.parent)?;
        }
        for change in &composition.changes {
            if change.created {
                self.persist(&mut registry, change.key)?;
            } else if change.is_dirty() {
                self.sync_metadata(&registry, change.key)?;
            }
        }

        tracing::info!(
            experiment = name,
            variants = composition.changes.len(),
            created = composition.created_parent,
            "Multivariate experiment defined"
        );
        Ok(composition)
    }

    /// Treatment for an identity, assigning one when `create` is set
    pub fn treatment(
        &self,
        name: &str,
        identity: &Identity,
        create: bool,
    ) -> Result<Option<Assignment>> {
        let key = match self.key_for(name, create && self.config.create_missing_experiments) {
            Ok(key) => key,
            Err(ScenarioError::ExperimentNotFound(_)) if !create => return Ok(None),
            Err(e) => return Err(e),
        };
        let registry = self.registry.read();
        self.resolver.get_treatment(&registry, key, identity, create)
    }

    /// Whether the identity sees the control (assigning if needed)
    ///
    /// For a multivariate experiment every sub-experiment must be at its control.
    pub fn is_control(&self, name: &str, identity: &Identity) -> Result<bool> {
        let Some(assignment) = self.treatment(name, identity, true)? else {
            return Ok(false);
        };
        let registry = self.registry.read();
        Ok(assignment.treatments().iter().all(|t| {
            registry
                .lookup(t.experiment())
                .is_some_and(|e| e.control() == t.name())
        }))
    }

    /// Record a goal completion; a no-op for unassigned identities
    ///
    /// Returns true when a stored assignment was marked completed.
    pub fn complete(&self, name: &str, identity: &Identity) -> Result<bool> {
        let Some(assignment) = self.treatment(name, identity, false)? else {
            tracing::debug!(
                experiment = name,
                %identity,
                "Completion for unassigned identity ignored"
            );
            return Ok(false);
        };
        let registry = self.registry.read();
        self.resolver.finish_assignment(&registry, &assignment, identity)
    }

    /// Consolidate and summarize all stored results of an experiment
    ///
    /// The report always holds a record for `name`; without traffic its
    /// totals and rates are zero.
    pub fn results(&self, name: &str) -> Result<AnalysisReport> {
        let _timer = Timer::new(ANALYSIS_DURATION.clone());
        let record = self
            .storage
            .get_experiment_by_name(name)
            .map_storage_err()?
            .ok_or_else(|| ScenarioError::ExperimentNotFound(name.to_string()))?;

        let (mut counters, stats) = consolidate_experiment(
            self.storage.as_ref(),
            record.id,
            self.config.results_batch_size,
        )?;

        let multivariate = record.metadata.multivariate;
        let control = self.report_control(&record)?;
        let treatments: Vec<&str> = if multivariate {
            // a parent without sub-experiments has no control combination
            Some(control.as_str()).filter(|c| !c.is_empty()).into_iter().collect()
        } else {
            record.metadata.weighting.names().collect()
        };
        counters.seed(name, &control, multivariate, treatments);
        Ok(AnalysisReport::new(name, &counters, stats))
    }

    /// Control key as reported: sibling controls joined for a multivariate parent
    fn report_control(&self, record: &ExperimentRecord) -> Result<String> {
        if !record.metadata.multivariate {
            return Ok(record.metadata.control.clone());
        }
        let mut controls = Vec::new();
        for child_id in self.storage.child_experiment_ids(record.id).map_storage_err()? {
            if let Some(child) = self.storage.get_experiment_by_id(child_id).map_storage_err()? {
                controls.push(child.metadata.control);
            }
        }
        Ok(controls.join(&COMPOSITE_KEY_DELIMITER.to_string()))
    }

    /// Remove an experiment's assignments, and with `delete` the experiment itself
    pub fn clear_experiment(&self, name: &str, delete: bool) -> Result<()> {
        let record = self
            .storage
            .get_experiment_by_name(name)
            .map_storage_err()?
            .ok_or_else(|| ScenarioError::ExperimentNotFound(name.to_string()))?;
        self.storage
            .clear_experiment(record.id, delete)
            .map_storage_err()?;

        if delete {
            let mut registry = self.registry.write();
            if let Some(key) = registry.find(name) {
                registry.remove(key);
            }
        }
        tracing::info!(experiment = name, delete, "Experiment cleared");
        Ok(())
    }

    pub fn list_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        self.storage.list_experiments().map_storage_err()
    }

    fn key_for(&self, name: &str, create_missing: bool) -> Result<ExperimentKey> {
        {
            let registry = self.registry.read();
            if let Some(key) = registry.find(name) {
                if self.missing_children(&registry, key)?.1.is_empty() {
                    return Ok(key);
                }
            }
        }

        let mut registry = self.registry.write();
        // another caller may have loaded it between the locks
        if let Some(key) = registry.find(name) {
            self.refresh_family(&mut registry, key)?;
            return Ok(key);
        }
        if let Some(key) = self.load_by_name(&mut registry, name)? {
            return Ok(key);
        }
        if !create_missing {
            return Err(ScenarioError::ExperimentNotFound(name.to_string()));
        }

        let control = self.config.control_name.as_str();
        let mut weighting = Weighting::new().with(control, DEFAULT_TREATMENT_WEIGHT);
        if control != DEFAULT_ALTERNATE_NAME {
            weighting.insert(DEFAULT_ALTERNATE_NAME, DEFAULT_TREATMENT_WEIGHT);
        }
        let key = registry.insert(Experiment::new(name, weighting, control)?)?;
        self.persist(&mut registry, key)?;
        tracing::info!(experiment = name, "Experiment created on first use");
        Ok(key)
    }

    /// Load a stored experiment (with its parent family) into the registry
    ///
    /// A parent that is already registered is kept and only gains the
    /// sub-experiments it is missing.
    fn load_by_name(
        &self,
        registry: &mut ExperimentRegistry,
        name: &str,
    ) -> Result<Option<ExperimentKey>> {
        let Some(record) = self.storage.get_experiment_by_name(name).map_storage_err()? else {
            return Ok(None);
        };

        let root = match record.parent_id {
            Some(parent_id) => self
                .storage
                .get_experiment_by_id(parent_id)
                .map_storage_err()?
                .ok_or_else(|| {
                    ScenarioError::invalid_experiment(
                        name,
                        format!("parent experiment {parent_id} is missing"),
                    )
                })?,
            None => record,
        };

        let root_key = match registry.find(&root.name) {
            Some(key) => key,
            None => {
                let key = registry.insert(restore(&root)?)?;
                tracing::debug!(experiment = %root.name, "Experiment loaded from storage");
                key
            }
        };
        self.refresh_family(registry, root_key)?;
        Ok(registry.find(name))
    }

    /// Stored sub-experiments of `key`'s family that the registry lacks
    ///
    /// Returns the family root with the missing row ids. Simple experiments
    /// never touch storage here.
    fn missing_children(
        &self,
        registry: &ExperimentRegistry,
        key: ExperimentKey,
    ) -> Result<(ExperimentKey, Vec<ExperimentId>)> {
        let root = registry.get(key).and_then(Experiment::parent).unwrap_or(key);
        let Some(parent) = registry.get(root).filter(|e| e.is_multivariate()) else {
            return Ok((root, Vec::new()));
        };
        let Some(row_id) = parent.row_id() else {
            return Ok((root, Vec::new()));
        };

        let known: Vec<ExperimentId> = parent
            .children()
            .iter()
            .filter_map(|&c| registry.get(c).and_then(Experiment::row_id))
            .collect();
        let missing = self
            .storage
            .child_experiment_ids(row_id)
            .map_storage_err()?
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        Ok((root, missing))
    }

    /// Register sub-experiments another manager added to storage
    fn refresh_family(&self, registry: &mut ExperimentRegistry, key: ExperimentKey) -> Result<()> {
        let (root, missing) = self.missing_children(registry, key)?;
        for child_id in missing {
            let Some(child) = self.storage.get_experiment_by_id(child_id).map_storage_err()? else {
                continue;
            };
            if let Some(existing) = registry.find(&child.name) {
                // registered without its row id
                if let Some(experiment) = registry.get_mut(existing) {
                    experiment.set_row_id(Some(child.id));
                }
                continue;
            }
            registry.add_child(root, restore(&child)?)?;
            tracing::debug!(experiment = %child.name, "Sub-experiment loaded from storage");
        }
        Ok(())
    }

    fn persist(&self, registry: &mut ExperimentRegistry, key: ExperimentKey) -> Result<()> {
        let (name, metadata) = registry_entry(registry, key)?;
        let record = self
            .storage
            .add_experiment(&name, &metadata)
            .map_storage_err()?;
        if let Some(experiment) = registry.get_mut(key) {
            experiment.set_row_id(Some(record.id));
        }
        Ok(())
    }

    fn sync_metadata(&self, registry: &ExperimentRegistry, key: ExperimentKey) -> Result<()> {
        let (name, metadata) = registry_entry(registry, key)?;
        let row_id = registry
            .get(key)
            .and_then(Experiment::row_id)
            .ok_or_else(|| {
                ScenarioError::invalid_experiment(&name, "experiment has not been stored")
            })?;
        self.storage
            .update_experiment(row_id, &metadata)
            .map_storage_err()?;
        tracing::debug!(experiment = %name, "Experiment weighting updated");
        Ok(())
    }
}

fn registry_entry(
    registry: &ExperimentRegistry,
    key: ExperimentKey,
) -> Result<(String, ExperimentMetadata)> {
    let experiment = registry.get(key).ok_or_else(|| {
        ScenarioError::InvalidArgument("experiment is not registered".to_string())
    })?;
    let metadata = registry
        .metadata(key)
        .ok_or_else(|| ScenarioError::ExperimentNotFound(experiment.name().to_string()))?;
    Ok((experiment.name().to_string(), metadata))
}

fn restore(record: &ExperimentRecord) -> Result<Experiment> {
    let experiment = Experiment::from_metadata(&record.name, record.id, &record.metadata)?;
    if record.metadata.strategy != WeightedRandom.name() {
        tracing::warn!(
            experiment = %record.name,
            strategy = %record.metadata.strategy,
            "Stored selection strategy cannot be restored, using weighted random"
        );
    }
    Ok(experiment)
}
