//! Assignment resolution
//!
//! Maps (experiment, identity) to a treatment. Stored assignments always win;
//! new ones are drawn with the experiment's selection strategy and persisted
//! through storage's insert-if-absent, so concurrent first requests converge
//! on whatever storage kept.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{Result, ScenarioError, StorageResultExt};
use crate::experiment::{Experiment, ExperimentKey, ExperimentRegistry, Treatment};
use crate::identity::Identity;
use crate::metrics::{ASSIGNMENTS_TOTAL, COMPLETIONS_TOTAL};
use crate::storage::StorageAdapter;

/// Treatment(s) held by one identity in one experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Assignment {
    Single(Treatment),
    /// Multivariate assignment keyed by sub-experiment short name
    Composite {
        experiment: String,
        treatments: BTreeMap<String, Treatment>,
    },
}

impl Assignment {
    pub fn experiment(&self) -> &str {
        match self {
            Self::Single(t) => t.experiment(),
            Self::Composite { experiment, .. } => experiment,
        }
    }

    /// The single treatment, if this is not a composite assignment
    pub fn single(&self) -> Option<&Treatment> {
        match self {
            Self::Single(t) => Some(t),
            Self::Composite { .. } => None,
        }
    }

    /// Treatment for one sub-experiment of a composite assignment
    pub fn variant(&self, name: &str) -> Option<&Treatment> {
        match self {
            Self::Single(_) => None,
            Self::Composite { treatments, .. } => treatments.get(name),
        }
    }

    /// Every leaf treatment in this assignment
    pub fn treatments(&self) -> Vec<&Treatment> {
        match self {
            Self::Single(t) => vec![t],
            Self::Composite { treatments, .. } => treatments.values().collect(),
        }
    }
}

/// Resolves and completes assignments against a storage adapter
pub struct AssignmentResolver {
    storage: Arc<dyn StorageAdapter>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl AssignmentResolver {
    /// Resolver drawing from an entropy-seeded generator
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::with_rng(storage, Box::new(StdRng::from_entropy()))
    }

    /// Resolver with an injected random source
    pub fn with_rng(storage: Arc<dyn StorageAdapter>, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            storage,
            rng: Mutex::new(rng),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    /// Existing assignment, or a new one when `create` is set
    ///
    /// With `create == false` nothing is written; an unassigned identity
    /// yields `None`. For a multivariate experiment every sub-experiment is
    /// resolved with the same identity and flag. Without `create`, unassigned
    /// sub-experiments are left out of the composite.
    pub fn get_treatment(
        &self,
        registry: &ExperimentRegistry,
        key: ExperimentKey,
        identity: &Identity,
        create: bool,
    ) -> Result<Option<Assignment>> {
        let experiment = registry.get(key).ok_or_else(|| {
            ScenarioError::InvalidArgument("experiment is not registered".to_string())
        })?;

        if !experiment.is_multivariate() {
            return Ok(self
                .resolve_leaf(experiment, identity, create)?
                .map(Assignment::Single));
        }

        let mut treatments = BTreeMap::new();
        for &child_key in experiment.children() {
            let child = registry.get(child_key).ok_or_else(|| {
                ScenarioError::invalid_experiment(
                    experiment.name(),
                    "sub-experiment missing from registry",
                )
            })?;
            match self.resolve_leaf(child, identity, create)? {
                Some(t) => {
                    treatments.insert(child.variant_name().to_string(), t);
                }
                None if create => {
                    return Err(ScenarioError::InvalidArgument(format!(
                        "could not resolve sub-experiment '{}' of '{}'",
                        child.name(),
                        experiment.name()
                    )));
                }
                None => {}
            }
        }

        if treatments.is_empty() {
            return Ok(None);
        }
        Ok(Some(Assignment::Composite {
            experiment: experiment.name().to_string(),
            treatments,
        }))
    }

    fn resolve_leaf(
        &self,
        experiment: &Experiment,
        identity: &Identity,
        create: bool,
    ) -> Result<Option<Treatment>> {
        let Some(row_id) = experiment.row_id() else {
            if create {
                return Err(ScenarioError::invalid_experiment(
                    experiment.name(),
                    "experiment has not been stored",
                ));
            }
            ASSIGNMENTS_TOTAL.with_label_values(&["unassigned"]).inc();
            return Ok(None);
        };

        if let Some(stored) = self
            .storage
            .get_treatment_for_identity(row_id, identity)
            .map_storage_err()?
        {
            ASSIGNMENTS_TOTAL.with_label_values(&["existing"]).inc();
            return Ok(Some(stored.into_treatment(experiment.name())));
        }
        if !create {
            ASSIGNMENTS_TOTAL.with_label_values(&["unassigned"]).inc();
            return Ok(None);
        }

        let drawn = {
            let mut rng = self.rng.lock();
            experiment.draw_treatment(&mut **rng)?
        };
        let stored = self
            .storage
            .set_treatment(row_id, drawn.name(), identity)
            .map_storage_err()?;

        if stored.name != drawn.name() {
            tracing::debug!(
                experiment = experiment.name(),
                drawn = drawn.name(),
                kept = %stored.name,
                "Concurrent assignment won, keeping stored treatment"
            );
        } else {
            tracing::debug!(
                experiment = experiment.name(),
                treatment = %stored.name,
                "Assignment created"
            );
        }
        ASSIGNMENTS_TOTAL.with_label_values(&["created"]).inc();
        Ok(Some(stored.into_treatment(experiment.name())))
    }

    /// Mark a treatment completed for the identity
    ///
    /// Returns false when the identity holds no assignment with that treatment.
    pub fn finish(
        &self,
        registry: &ExperimentRegistry,
        treatment: &Treatment,
        identity: &Identity,
    ) -> Result<bool> {
        if !treatment.is_valid() {
            return Err(ScenarioError::InvalidArgument(
                "cannot finish a treatment without a name and experiment".to_string(),
            ));
        }
        let experiment = registry
            .lookup(treatment.experiment())
            .ok_or_else(|| ScenarioError::ExperimentNotFound(treatment.experiment().to_string()))?;
        let Some(row_id) = experiment.row_id() else {
            COMPLETIONS_TOTAL.with_label_values(&["no_assignment"]).inc();
            return Ok(false);
        };

        let finished = self
            .storage
            .finish_treatment(row_id, treatment.name(), identity)
            .map_storage_err()?;

        let label = if finished { "finished" } else { "no_assignment" };
        COMPLETIONS_TOTAL.with_label_values(&[label]).inc();
        tracing::debug!(
            experiment = treatment.experiment(),
            treatment = treatment.name(),
            finished,
            "Treatment completion recorded"
        );
        Ok(finished)
    }

    /// Finish every treatment of an assignment; true when any row changed
    pub fn finish_assignment(
        &self,
        registry: &ExperimentRegistry,
        assignment: &Assignment,
        identity: &Identity,
    ) -> Result<bool> {
        let mut any = false;
        for treatment in assignment.treatments() {
            any |= self.finish(registry, treatment, identity)?;
        }
        Ok(any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{compose_multivariate, FixedTreatment, Weighting};
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryStorage>, AssignmentResolver, ExperimentRegistry) {
        let storage = Arc::new(InMemoryStorage::new());
        let resolver =
            AssignmentResolver::with_rng(storage.clone(), Box::new(StdRng::seed_from_u64(11)));
        (storage, resolver, ExperimentRegistry::new())
    }

    fn persist(storage: &InMemoryStorage, registry: &mut ExperimentRegistry, key: ExperimentKey) {
        let meta = registry.metadata(key).unwrap();
        let name = registry.get(key).unwrap().name().to_string();
        let row = storage.add_experiment(&name, &meta).unwrap();
        registry.get_mut(key).unwrap().set_row_id(Some(row.id));
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_assignment_is_sticky() {
        let (storage, resolver, mut registry) = setup();
        let key = registry.insert(Experiment::simple("cta").unwrap()).unwrap();
        persist(&storage, &mut registry, key);

        let first = resolver.get_treatment(&registry, key, &id("v1"), true).unwrap().unwrap();
        for _ in 0..20 {
            let again = resolver.get_treatment(&registry, key, &id("v1"), true).unwrap().unwrap();
            assert_eq!(first, again);
        }
        assert_eq!(storage.assignment_count(), 1);
    }

    #[test]
    fn test_lookup_without_create_writes_nothing() {
        let (storage, resolver, mut registry) = setup();
        let key = registry.insert(Experiment::simple("cta").unwrap()).unwrap();
        persist(&storage, &mut registry, key);
        let writes = storage.write_count();

        assert!(resolver.get_treatment(&registry, key, &id("v1"), false).unwrap().is_none());
        assert_eq!(storage.write_count(), writes);
    }

    #[test]
    fn test_create_on_unstored_experiment_fails() {
        let (_storage, resolver, mut registry) = setup();
        let key = registry.insert(Experiment::simple("cta").unwrap()).unwrap();
        let err = resolver.get_treatment(&registry, key, &id("v1"), true).unwrap_err();
        assert_eq!(err.code(), "INVALID_EXPERIMENT");
    }

    #[test]
    fn test_composite_assignment_covers_every_child() {
        let (storage, resolver, mut registry) = setup();
        let composed =
            compose_multivariate(&mut registry, "home", &json!(["color", "size"])).unwrap();
        let parent = registry.find("home").unwrap();
        persist(&storage, &mut registry, parent);
        for change in &composed.changes {
            persist(&storage, &mut registry, change.key);
        }

        let assignment = resolver
            .get_treatment(&registry, parent, &id("v1"), true)
            .unwrap()
            .unwrap();
        assert_eq!(assignment.experiment(), "home");
        assert!(assignment.variant("color").is_some());
        assert!(assignment.variant("size").is_some());
        assert_eq!(assignment.treatments().len(), 2);
        assert_eq!(storage.assignment_count(), 2);
    }

    #[test]
    fn test_finish_requires_matching_assignment() {
        let (storage, resolver, mut registry) = setup();
        let weighting = Weighting::new().with("default", 1).with("alt", 1);
        let exp = Experiment::new("cta", weighting, "default")
            .unwrap()
            .with_strategy(Arc::new(FixedTreatment("alt".to_string())));
        let key = registry.insert(exp).unwrap();
        persist(&storage, &mut registry, key);

        let assignment = resolver.get_treatment(&registry, key, &id("v1"), true).unwrap().unwrap();
        assert!(resolver.finish_assignment(&registry, &assignment, &id("v1")).unwrap());
        // v2 never had a row
        let t = assignment.single().unwrap().clone();
        assert!(!resolver.finish(&registry, &t, &id("v2")).unwrap());
    }

    #[test]
    fn test_finish_rejects_invalid_treatment() {
        let (_storage, resolver, registry) = setup();
        let err = resolver
            .finish(&registry, &Treatment::new("", "cta"), &id("v1"))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
