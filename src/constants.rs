//! Documented constants for the split-testing engine
//!
//! This module contains the tunable defaults with the reasoning behind their values.
//! Centralizing constants prevents magic numbers and keeps storage formats stable.

// =============================================================================
// TREATMENT NAMING
// =============================================================================

/// Name of the control (baseline) treatment
///
/// Every experiment compares its treatments against this one unless the
/// experiment is defined with a different control. `ScenarioManager::is_control`
/// checks assignments against it.
pub const DEFAULT_CONTROL_NAME: &str = "default";

/// Name of the single alternate generated by shorthand multivariate specs
///
/// `["color", "size"]` and `{"color": true}` both expand to a control/alternate
/// pair using this name.
pub const DEFAULT_ALTERNATE_NAME: &str = "alternate";

/// Weight given to each treatment generated from shorthand input
///
/// Weights are relative. Using 50 keeps generated two-way tests at an even
/// split and stays readable when stored next to hand-written weightings.
pub const DEFAULT_TREATMENT_WEIGHT: u32 = 50;

// =============================================================================
// CONSOLIDATION
// =============================================================================

/// Number of raw result rows fetched per storage page
///
/// Consolidation keeps at most one page resident plus the multivariate pending
/// buffer. 1000 rows is a few hundred KB for typical identity lengths.
/// A page shorter than this signals the end of the data.
pub const DEFAULT_RESULTS_BATCH_SIZE: usize = 1000;

/// Upper bound accepted for a configured batch size
pub const MAX_RESULTS_BATCH_SIZE: usize = 100_000;

/// Separator used to join sibling treatment names into a composite key
///
/// A multivariate participant assigned `red` for `color` and `large` for `size`
/// is counted under `red:large` (siblings ordered by experiment id).
pub const COMPOSITE_KEY_DELIMITER: char = ':';

// =============================================================================
// STATISTICS
// =============================================================================

/// Two-sided critical value of the standard normal distribution at 95%
///
/// `high_confidence = standard_error * Z_95`. Fixed rather than configurable
/// so stored reports stay comparable across runs.
pub const Z_95: f64 = 1.96;
