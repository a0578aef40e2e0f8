//! Experiment definitions
//!
//! Experiments live in an [`ExperimentRegistry`] arena. A multivariate parent
//! owns the keys of its sub-experiments and each sub-experiment refers back to
//! its parent by key, so the parent/child graph has no reference cycles.

pub mod composer;
pub mod weighting;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::constants::{DEFAULT_ALTERNATE_NAME, DEFAULT_CONTROL_NAME, DEFAULT_TREATMENT_WEIGHT};
use crate::errors::{Result, ScenarioError};

pub use composer::{
    compose_multivariate, ensure_variant, normalize_multivariate_spec, MultivariateComposition,
    VariantChange, VariantSpec,
};
pub use weighting::{
    choose_weighted, FixedTreatment, SelectionStrategy, WeightedRandom, Weighting, WeightingError,
};

/// Storage row id of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExperimentId(pub u64);

/// Storage row id of a treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreatmentId(pub u64);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TreatmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an experiment inside its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExperimentKey(usize);

/// Definition data persisted alongside an experiment row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub weighting: Weighting,
    pub control: String,
    /// Set on multivariate parents
    #[serde(default)]
    pub multivariate: bool,
    /// Name of the multivariate parent, for sub-experiments
    #[serde(default)]
    pub parent: Option<String>,
    /// Short name of a sub-experiment within its parent
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default = "default_strategy_name")]
    pub strategy: String,
}

fn default_strategy_name() -> String {
    WeightedRandom.name().to_string()
}

impl Default for ExperimentMetadata {
    fn default() -> Self {
        Self {
            weighting: default_weighting(),
            control: DEFAULT_CONTROL_NAME.to_string(),
            multivariate: false,
            parent: None,
            variant: None,
            strategy: default_strategy_name(),
        }
    }
}

/// 50/50 control vs alternate weighting
pub fn default_weighting() -> Weighting {
    Weighting::new()
        .with(DEFAULT_CONTROL_NAME, DEFAULT_TREATMENT_WEIGHT)
        .with(DEFAULT_ALTERNATE_NAME, DEFAULT_TREATMENT_WEIGHT)
}

/// A named A/B or multivariate test
#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    row_id: Option<ExperimentId>,
    weighting: Weighting,
    control: String,
    variant: Option<String>,
    multivariate: bool,
    parent: Option<ExperimentKey>,
    children: Vec<ExperimentKey>,
    strategy: Arc<dyn SelectionStrategy>,
}

impl Experiment {
    /// Create a simple experiment
    ///
    /// The weighting must be non-empty and contain the control treatment.
    pub fn new(
        name: impl Into<String>,
        weighting: Weighting,
        control: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let control = control.into();
        validate_definition(&name, &weighting, &control)?;
        Ok(Self {
            name,
            row_id: None,
            weighting,
            control,
            variant: None,
            multivariate: false,
            parent: None,
            children: Vec::new(),
            strategy: Arc::new(WeightedRandom),
        })
    }

    /// Simple experiment with the default 50/50 control/alternate split
    pub fn simple(name: impl Into<String>) -> Result<Self> {
        Self::new(name, default_weighting(), DEFAULT_CONTROL_NAME)
    }

    /// Empty multivariate parent; sub-experiments are added through the registry
    pub fn multivariate(name: impl Into<String>) -> Result<Self> {
        let mut experiment = Self::new(
            name,
            Weighting::new().with(DEFAULT_CONTROL_NAME, DEFAULT_TREATMENT_WEIGHT),
            DEFAULT_CONTROL_NAME,
        )?;
        experiment.multivariate = true;
        Ok(experiment)
    }

    /// Rebuild an experiment from its stored metadata
    pub fn from_metadata(
        name: impl Into<String>,
        row_id: ExperimentId,
        metadata: &ExperimentMetadata,
    ) -> Result<Self> {
        let mut experiment = Self::new(name, metadata.weighting.clone(), metadata.control.clone())?;
        experiment.row_id = Some(row_id);
        experiment.multivariate = metadata.multivariate;
        experiment.variant = metadata.variant.clone();
        Ok(experiment)
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn set_strategy(&mut self, strategy: Arc<dyn SelectionStrategy>) {
        self.strategy = strategy;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short name within the multivariate parent, or the full name
    pub fn variant_name(&self) -> &str {
        self.variant.as_deref().unwrap_or(&self.name)
    }

    pub fn row_id(&self) -> Option<ExperimentId> {
        self.row_id
    }

    pub fn set_row_id(&mut self, row_id: Option<ExperimentId>) {
        self.row_id = row_id;
    }

    pub fn weighting(&self) -> &Weighting {
        &self.weighting
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn strategy(&self) -> &Arc<dyn SelectionStrategy> {
        &self.strategy
    }

    pub fn is_multivariate(&self) -> bool {
        self.multivariate
    }

    pub fn parent(&self) -> Option<ExperimentKey> {
        self.parent
    }

    pub fn children(&self) -> &[ExperimentKey] {
        &self.children
    }

    /// Update one treatment weight in place; returns true when it changed
    pub fn set_weight(&mut self, treatment: &str, weight: u32) -> bool {
        self.weighting.insert(treatment, weight) != Some(weight)
    }

    /// Draw a new treatment using this experiment's selection strategy
    pub fn draw_treatment(&self, rng: &mut dyn RngCore) -> Result<Treatment> {
        let name = self
            .strategy
            .select(&self.weighting, rng)
            .map_err(|e| ScenarioError::invalid_experiment(&self.name, e.to_string()))?;
        Ok(Treatment::new(name, self.name.clone()))
    }
}

fn validate_definition(name: &str, weighting: &Weighting, control: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ScenarioError::InvalidArgument(
            "experiment name must not be empty".to_string(),
        ));
    }
    if weighting.is_empty() {
        return Err(ScenarioError::invalid_experiment(name, "weighting has no treatments"));
    }
    if weighting.names().any(|t| t.trim().is_empty()) {
        return Err(ScenarioError::invalid_experiment(name, "treatment names must not be empty"));
    }
    if !weighting.contains(control) {
        return Err(ScenarioError::invalid_experiment(
            name,
            format!("control treatment '{control}' is missing from {weighting}"),
        ));
    }
    Ok(())
}

/// An assignment choice belonging to one experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treatment {
    name: String,
    experiment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    row_id: Option<TreatmentId>,
}

impl Treatment {
    pub fn new(name: impl Into<String>, experiment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experiment: experiment.into(),
            row_id: None,
        }
    }

    pub fn with_row_id(mut self, row_id: TreatmentId) -> Self {
        self.row_id = Some(row_id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning experiment
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn row_id(&self) -> Option<TreatmentId> {
        self.row_id
    }

    /// A treatment is valid once both its name and experiment are set
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.experiment.trim().is_empty()
    }
}

/// Arena of experiments with name lookup
#[derive(Debug, Default)]
pub struct ExperimentRegistry {
    slots: Vec<Option<Experiment>>,
    by_name: HashMap<String, ExperimentKey>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a top-level experiment
    pub fn insert(&mut self, experiment: Experiment) -> Result<ExperimentKey> {
        if self.by_name.contains_key(experiment.name()) {
            return Err(ScenarioError::invalid_experiment(
                experiment.name(),
                "an experiment with this name is already registered",
            ));
        }
        let key = ExperimentKey(self.slots.len());
        self.by_name.insert(experiment.name().to_string(), key);
        self.slots.push(Some(experiment));
        Ok(key)
    }

    /// Register `child` as a sub-experiment of the multivariate `parent`
    pub fn add_child(
        &mut self,
        parent: ExperimentKey,
        mut child: Experiment,
    ) -> Result<ExperimentKey> {
        let parent_exp = self.get(parent).ok_or_else(|| {
            ScenarioError::InvalidArgument("parent experiment is not registered".to_string())
        })?;
        if !parent_exp.is_multivariate() || parent_exp.parent().is_some() {
            return Err(ScenarioError::invalid_experiment(
                parent_exp.name(),
                "sub-experiments can only be added to a top-level multivariate experiment",
            ));
        }
        if child.is_multivariate() {
            return Err(ScenarioError::invalid_experiment(
                child.name(),
                "a multivariate experiment cannot be nested",
            ));
        }
        child.parent = Some(parent);
        let key = self.insert(child)?;
        if let Some(Some(parent_exp)) = self.slots.get_mut(parent.0) {
            parent_exp.children.push(key);
        }
        Ok(key)
    }

    pub fn get(&self, key: ExperimentKey) -> Option<&Experiment> {
        self.slots.get(key.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, key: ExperimentKey) -> Option<&mut Experiment> {
        self.slots.get_mut(key.0).and_then(Option::as_mut)
    }

    pub fn find(&self, name: &str) -> Option<ExperimentKey> {
        self.by_name.get(name).copied()
    }

    pub fn lookup(&self, name: &str) -> Option<&Experiment> {
        self.find(name).and_then(|key| self.get(key))
    }

    pub fn parent_of(&self, key: ExperimentKey) -> Option<&Experiment> {
        self.get(key)?.parent().and_then(|p| self.get(p))
    }

    /// Sub-experiment of `parent` with the given short name
    pub fn child_named(&self, parent: ExperimentKey, variant: &str) -> Option<ExperimentKey> {
        self.get(parent)?
            .children()
            .iter()
            .copied()
            .find(|&c| self.get(c).is_some_and(|e| e.variant_name() == variant))
    }

    /// Remove an experiment and, for a multivariate parent, all of its children
    pub fn remove(&mut self, key: ExperimentKey) -> Vec<Experiment> {
        let Some(experiment) = self.slots.get_mut(key.0).and_then(Option::take) else {
            return Vec::new();
        };
        self.by_name.remove(experiment.name());

        if let Some(parent) = experiment.parent() {
            if let Some(Some(p)) = self.slots.get_mut(parent.0) {
                p.children.retain(|&c| c != key);
            }
        }

        let mut removed = Vec::new();
        for &child in experiment.children() {
            removed.extend(self.remove(child));
        }
        removed.insert(0, experiment);
        removed
    }

    /// Metadata to persist for the experiment at `key`
    pub fn metadata(&self, key: ExperimentKey) -> Option<ExperimentMetadata> {
        let experiment = self.get(key)?;
        Some(ExperimentMetadata {
            weighting: experiment.weighting().clone(),
            control: experiment.control().to_string(),
            multivariate: experiment.is_multivariate(),
            parent: self.parent_of(key).map(|p| p.name().to_string()),
            variant: experiment.variant.clone(),
            strategy: experiment.strategy().name().to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExperimentKey, &Experiment)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (ExperimentKey(i), e)))
    }
}
