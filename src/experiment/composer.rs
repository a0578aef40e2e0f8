//! Multivariate experiment composition
//!
//! Accepts the shorthand forms callers use to declare multivariate tests and
//! expands them into one canonical [`VariantSpec`] per sub-experiment:
//!
//! ```json
//! ["headline", "button"]
//! {"headline": true, "button": ["green", "orange"]}
//! {"layout": {"control": {"classic": 60}, "alternates": {"grid": 40}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Experiment, ExperimentKey, ExperimentRegistry, Weighting};
use crate::constants::{
    COMPOSITE_KEY_DELIMITER, DEFAULT_ALTERNATE_NAME, DEFAULT_CONTROL_NAME,
    DEFAULT_TREATMENT_WEIGHT,
};
use crate::errors::{Result, ScenarioError};

/// Separator between a multivariate parent name and its sub-experiment name
pub const VARIANT_NAME_SEPARATOR: char = '.';

/// Canonical weighting for one sub-experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub control: Weighting,
    pub alternates: Weighting,
}

impl Default for VariantSpec {
    fn default() -> Self {
        Self {
            control: default_control(),
            alternates: Weighting::new().with(DEFAULT_ALTERNATE_NAME, DEFAULT_TREATMENT_WEIGHT),
        }
    }
}

impl VariantSpec {
    /// Implicit control plus the given alternates at the default weight
    pub fn with_alternates<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            control: default_control(),
            alternates: Weighting::from_pairs(
                names.into_iter().map(|n| (n, DEFAULT_TREATMENT_WEIGHT)),
            ),
        }
    }

    /// Name of the control treatment (first control entry)
    pub fn control_name(&self) -> &str {
        self.control.first().unwrap_or(DEFAULT_CONTROL_NAME)
    }

    /// Control entries followed by alternates
    pub fn merged(&self) -> Weighting {
        let mut merged = self.control.clone();
        merged.extend_missing(&self.alternates);
        merged
    }

    fn validate(&self, variant: &str) -> Result<()> {
        if self.control.is_empty() {
            return Err(ScenarioError::invalid_experiment(variant, "control weighting is empty"));
        }
        for name in self.control.names().chain(self.alternates.names()) {
            if name.trim().is_empty() {
                return Err(ScenarioError::invalid_experiment(variant, "empty treatment name"));
            }
            if name.contains(COMPOSITE_KEY_DELIMITER) {
                return Err(ScenarioError::invalid_experiment(
                    variant,
                    format!("treatment '{name}' contains reserved '{COMPOSITE_KEY_DELIMITER}'"),
                ));
            }
        }
        Ok(())
    }
}

fn default_control() -> Weighting {
    Weighting::new().with(DEFAULT_CONTROL_NAME, DEFAULT_TREATMENT_WEIGHT)
}

/// Expand a declarative multivariate spec into ordered sub-experiment specs
pub fn normalize_multivariate_spec(raw: &Value) -> Result<Vec<(String, VariantSpec)>> {
    let mut specs: Vec<(String, VariantSpec)> = Vec::new();

    match raw {
        Value::Array(names) => {
            for item in names {
                let name = item.as_str().ok_or_else(|| {
                    ScenarioError::InvalidArgument(format!(
                        "sub-experiment list must contain names, got {item}"
                    ))
                })?;
                push_spec(&mut specs, name, VariantSpec::default())?;
            }
        }
        Value::Object(map) => {
            for (name, value) in map {
                match normalize_variant(name, value)? {
                    Some(spec) => push_spec(&mut specs, name, spec)?,
                    None => debug!(variant = %name, "Sub-experiment disabled in spec, skipping"),
                }
            }
        }
        other => {
            return Err(ScenarioError::InvalidArgument(format!(
                "multivariate spec must be a list or a mapping, got {other}"
            )))
        }
    }

    if specs.is_empty() {
        return Err(ScenarioError::InvalidArgument(
            "multivariate spec defines no sub-experiments".to_string(),
        ));
    }
    Ok(specs)
}

fn push_spec(specs: &mut Vec<(String, VariantSpec)>, name: &str, spec: VariantSpec) -> Result<()> {
    let name = name.trim();
    if name.is_empty() || name.contains(VARIANT_NAME_SEPARATOR) {
        return Err(ScenarioError::InvalidArgument(format!(
            "invalid sub-experiment name '{name}'"
        )));
    }
    if specs.iter().any(|(n, _)| n == name) {
        return Err(ScenarioError::InvalidArgument(format!(
            "sub-experiment '{name}' declared twice"
        )));
    }
    spec.validate(name)?;
    specs.push((name.to_string(), spec));
    Ok(())
}

fn normalize_variant(name: &str, value: &Value) -> Result<Option<VariantSpec>> {
    match value {
        Value::Bool(true) => Ok(Some(VariantSpec::default())),
        Value::Bool(false) => Ok(None),
        Value::String(alternate) => Ok(Some(VariantSpec::with_alternates([alternate.as_str()]))),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ScenarioError::invalid_experiment(name, "alternate list is empty"));
            }
            let alternates = items
                .iter()
                .map(|item| {
                    item.as_str().ok_or_else(|| {
                        ScenarioError::invalid_experiment(
                            name,
                            format!("alternate names must be strings, got {item}"),
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(VariantSpec::with_alternates(alternates)))
        }
        Value::Object(fields) => {
            if let Some(unknown) = fields.keys().find(|k| *k != "control" && *k != "alternates") {
                return Err(ScenarioError::invalid_experiment(
                    name,
                    format!("unknown key '{unknown}' (expected 'control' or 'alternates')"),
                ));
            }
            let control = match fields.get("control") {
                Some(v) => parse_weighting(name, "control", v)?,
                None => default_control(),
            };
            let alternates = match fields.get("alternates") {
                Some(v) => parse_weighting(name, "alternates", v)?,
                None => Weighting::new(),
            };
            Ok(Some(VariantSpec { control, alternates }))
        }
        other => Err(ScenarioError::invalid_experiment(
            name,
            format!("unsupported sub-experiment definition {other}"),
        )),
    }
}

fn parse_weighting(variant: &str, field: &str, value: &Value) -> Result<Weighting> {
    match value {
        Value::Object(entries) => {
            let mut weighting = Weighting::new();
            for (treatment, weight) in entries {
                let weight = weight
                    .as_u64()
                    .and_then(|w| u32::try_from(w).ok())
                    .ok_or_else(|| {
                        ScenarioError::invalid_experiment(
                            variant,
                            format!("{field}.{treatment}: weight must be a non-negative integer"),
                        )
                    })?;
                weighting.insert(treatment.as_str(), weight);
            }
            Ok(weighting)
        }
        Value::Array(names) => {
            let mut weighting = Weighting::new();
            for item in names {
                let treatment = item.as_str().ok_or_else(|| {
                    ScenarioError::invalid_experiment(
                        variant,
                        format!("{field}: expected treatment names, got {item}"),
                    )
                })?;
                weighting.insert(treatment, DEFAULT_TREATMENT_WEIGHT);
            }
            Ok(weighting)
        }
        other => Err(ScenarioError::invalid_experiment(
            variant,
            format!("{field} must be a mapping of weights, got {other}"),
        )),
    }
}

/// What `ensure_variant` did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantChange {
    pub key: ExperimentKey,
    pub created: bool,
    /// Treatments whose weight was updated in place
    pub reweighted: Vec<String>,
    /// Treatments added to an existing sub-experiment
    pub added: Vec<String>,
}

impl VariantChange {
    /// Whether storage needs to be told about this sub-experiment
    pub fn is_dirty(&self) -> bool {
        self.created || !self.reweighted.is_empty() || !self.added.is_empty()
    }
}

/// Create or reconcile the sub-experiment `variant` of a multivariate parent
///
/// Existing sub-experiments keep their treatments and control; only weights
/// that differ from `spec` are rewritten and missing treatments appended.
/// Persisting the change is left to the caller.
pub fn ensure_variant(
    registry: &mut ExperimentRegistry,
    parent: ExperimentKey,
    variant: &str,
    spec: &VariantSpec,
) -> Result<VariantChange> {
    spec.validate(variant)?;
    let merged = spec.merged();

    if let Some(key) = registry.child_named(parent, variant) {
        let child = registry.get_mut(key).ok_or_else(|| {
            ScenarioError::Internal(anyhow::anyhow!("sub-experiment key {key:?} is dangling"))
        })?;
        if child.control() != spec.control_name() {
            warn!(
                experiment = %child.name(),
                stored = %child.control(),
                requested = %spec.control_name(),
                "Control of an existing sub-experiment cannot change, keeping stored control"
            );
        }

        let mut change = VariantChange {
            key,
            created: false,
            reweighted: Vec::new(),
            added: Vec::new(),
        };
        for (treatment, weight) in merged.iter() {
            match child.weighting().get(treatment) {
                Some(current) if current == weight => {}
                Some(_) => {
                    child.set_weight(treatment, weight);
                    change.reweighted.push(treatment.to_string());
                }
                None => {
                    child.set_weight(treatment, weight);
                    change.added.push(treatment.to_string());
                }
            }
        }
        if change.is_dirty() {
            debug!(
                experiment = %child.name(),
                reweighted = ?change.reweighted,
                added = ?change.added,
                "Reconciled sub-experiment weighting"
            );
        }
        return Ok(change);
    }

    let parent_name = registry
        .get(parent)
        .map(|p| p.name().to_string())
        .ok_or_else(|| {
            ScenarioError::InvalidArgument("parent experiment is not registered".to_string())
        })?;
    let qualified = format!("{parent_name}{VARIANT_NAME_SEPARATOR}{variant}");

    let mut child = Experiment::new(qualified, merged, spec.control_name())?;
    child.variant = Some(variant.to_string());
    let key = registry.add_child(parent, child)?;
    debug!(parent = %parent_name, variant = %variant, "Created sub-experiment");

    Ok(VariantChange {
        key,
        created: true,
        reweighted: Vec::new(),
        added: Vec::new(),
    })
}

/// Result of composing a multivariate experiment into a registry
#[derive(Debug, Clone)]
pub struct MultivariateComposition {
    pub parent: ExperimentKey,
    pub created_parent: bool,
    pub changes: Vec<VariantChange>,
}

/// Register (or reconcile) a multivariate experiment from a raw spec
pub fn compose_multivariate(
    registry: &mut ExperimentRegistry,
    name: &str,
    raw: &Value,
) -> Result<MultivariateComposition> {
    let specs = normalize_multivariate_spec(raw)?;

    let (parent, created_parent) = match registry.find(name) {
        Some(key) => {
            let is_mv = registry.get(key).is_some_and(Experiment::is_multivariate);
            if !is_mv {
                return Err(ScenarioError::invalid_experiment(
                    name,
                    "already registered as a simple experiment",
                ));
            }
            (key, false)
        }
        None => (registry.insert(Experiment::multivariate(name)?)?, true),
    };

    let changes = specs
        .iter()
        .map(|(variant, spec)| ensure_variant(registry, parent, variant, spec))
        .collect::<Result<Vec<_>>>()?;

    Ok(MultivariateComposition {
        parent,
        created_parent,
        changes,
    })
}
