//! Storage adapters for experiments, treatments and assignments
//!
//! The engine only talks to storage through [`StorageAdapter`]. Adapters
//! report failures as `anyhow::Error`; the engine wraps them into
//! `ScenarioError::Storage` at the call site and never retries.

pub mod memory;
pub mod rocks;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::experiment::{ExperimentId, ExperimentMetadata, Treatment, TreatmentId};
use crate::identity::Identity;

pub use memory::InMemoryStorage;
pub use rocks::RocksStorage;

/// Stored experiment row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub name: String,
    pub metadata: ExperimentMetadata,
    /// Row id of the multivariate parent, for sub-experiments
    pub parent_id: Option<ExperimentId>,
    pub created_at: DateTime<Utc>,
}

/// Stored treatment row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentRecord {
    pub id: TreatmentId,
    pub experiment_id: ExperimentId,
    pub name: String,
}

impl TreatmentRecord {
    pub fn into_treatment(self, experiment_name: &str) -> Treatment {
        Treatment::new(self.name, experiment_name).with_row_id(self.id)
    }
}

/// Reference from a sub-experiment result to its multivariate parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: ExperimentId,
    pub name: String,
    pub data: Option<ExperimentMetadata>,
}

/// One raw trial: an identity's assignment in one experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub identity: Identity,
    pub completed: bool,
    pub treatment_name: String,
    pub treatment_id: Option<TreatmentId>,
    pub experiment_name: String,
    pub experiment_id: ExperimentId,
    pub experiment_data: Option<ExperimentMetadata>,
    pub parent: Option<ParentRef>,
}

/// Position of a results row: experiment id, then the row's sequence number
///
/// Pages are served in ascending cursor order, so the cursor of a page's last
/// row is where the next page resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultCursor {
    pub experiment: ExperimentId,
    pub row: u64,
}

/// One page of raw results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsPage {
    pub records: Vec<ResultRecord>,
    /// Cursor of the last row in `records`, `None` for an empty page
    pub cursor: Option<ResultCursor>,
}

impl ResultsPage {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Persistence collaborator used by the engine
///
/// Implementations must make [`set_treatment`](Self::set_treatment) an atomic
/// insert-if-absent so concurrent first requests for the same
/// (experiment, identity) converge on one stored treatment.
pub trait StorageAdapter: Send + Sync {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>>;

    fn get_experiment_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentRecord>>;

    /// Insert an experiment, or return the existing row with that name
    ///
    /// `metadata.parent` names the multivariate parent, which must already exist.
    fn add_experiment(&self, name: &str, metadata: &ExperimentMetadata) -> Result<ExperimentRecord>;

    fn update_experiment(&self, id: ExperimentId, metadata: &ExperimentMetadata) -> Result<()>;

    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>>;

    /// Sub-experiment ids of a multivariate parent, ascending
    fn child_experiment_ids(&self, parent: ExperimentId) -> Result<Vec<ExperimentId>>;

    fn get_treatment_for_identity(
        &self,
        experiment: ExperimentId,
        identity: &Identity,
    ) -> Result<Option<TreatmentRecord>>;

    fn get_treatment_by_name(
        &self,
        experiment: ExperimentId,
        name: &str,
    ) -> Result<Option<TreatmentRecord>>;

    fn treatments_for_experiment(&self, experiment: ExperimentId) -> Result<Vec<TreatmentRecord>>;

    /// Store `treatment` for the identity unless an assignment already exists
    ///
    /// Returns the stored treatment, which is the earlier one when the
    /// identity was already assigned.
    fn set_treatment(
        &self,
        experiment: ExperimentId,
        treatment: &str,
        identity: &Identity,
    ) -> Result<TreatmentRecord>;

    /// Up to `limit` raw results strictly after `after`, in cursor order
    ///
    /// For a multivariate parent this covers the rows of all its
    /// sub-experiments. A page shorter than `limit` means no more data.
    /// Adapters must only touch the rows they return.
    fn get_results_page(
        &self,
        experiment: ExperimentId,
        after: Option<ResultCursor>,
        limit: usize,
    ) -> Result<ResultsPage>;

    /// Mark the identity's assignment to `treatment` as completed
    ///
    /// Returns false when the identity holds no assignment with that treatment.
    fn finish_treatment(
        &self,
        experiment: ExperimentId,
        treatment: &str,
        identity: &Identity,
    ) -> Result<bool>;

    /// Remove assignments and treatments; with `delete`, the experiment too
    ///
    /// Applies to sub-experiments as well when `experiment` is a multivariate parent.
    fn clear_experiment(&self, experiment: ExperimentId, delete: bool) -> Result<()>;
}

/// Lazy iterator over an experiment's raw results, one storage page at a time
///
/// Stops after the first page shorter than the batch size. A storage error is
/// yielded once and ends the iteration.
pub struct ResultPages<'a> {
    storage: &'a dyn StorageAdapter,
    experiment: ExperimentId,
    batch_size: usize,
    cursor: Option<ResultCursor>,
    buffer: std::vec::IntoIter<ResultRecord>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<'a> ResultPages<'a> {
    pub fn new(
        storage: &'a dyn StorageAdapter,
        experiment: ExperimentId,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            experiment,
            batch_size: batch_size.max(1),
            cursor: None,
            buffer: Vec::new().into_iter(),
            exhausted: false,
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl Iterator for ResultPages<'_> {
    type Item = Result<ResultRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.next() {
                return Some(Ok(record));
            }
            if self.exhausted {
                return None;
            }

            match self
                .storage
                .get_results_page(self.experiment, self.cursor, self.batch_size)
            {
                Ok(page) => {
                    self.pages_fetched += 1;
                    if page.cursor.is_some() {
                        self.cursor = page.cursor;
                    }
                    if page.len() < self.batch_size {
                        self.exhausted = true;
                    }
                    tracing::debug!(
                        experiment = %self.experiment,
                        page = self.pages_fetched,
                        rows = page.len(),
                        "Fetched results page"
                    );
                    self.buffer = page.records.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(storage: &InMemoryStorage, rows: usize) -> ExperimentId {
        let exp = storage
            .add_experiment("paging", &ExperimentMetadata::default())
            .unwrap();
        for i in 0..rows {
            let id = Identity::new(format!("visitor-{i}")).unwrap();
            storage.set_treatment(exp.id, "default", &id).unwrap();
        }
        exp.id
    }

    #[test]
    fn test_pages_stop_on_short_page() {
        let storage = InMemoryStorage::new();
        let exp = seed(&storage, 25);

        let mut pages = ResultPages::new(&storage, exp, 10);
        let count = pages.by_ref().filter_map(|r| r.ok()).count();
        assert_eq!(count, 25);
        assert_eq!(pages.pages_fetched(), 3);
    }

    #[test]
    fn test_exact_multiple_needs_one_empty_page() {
        let storage = InMemoryStorage::new();
        let exp = seed(&storage, 20);

        let mut pages = ResultPages::new(&storage, exp, 10);
        assert_eq!(pages.by_ref().count(), 20);
        assert_eq!(pages.pages_fetched(), 3);
    }

    #[test]
    fn test_pages_resume_after_cursor() {
        let storage = InMemoryStorage::new();
        let exp = seed(&storage, 5);

        let first = storage.get_results_page(exp, None, 3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = storage.get_results_page(exp, first.cursor, 3).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.cursor > first.cursor);

        let seen: Vec<&str> = first
            .records
            .iter()
            .chain(&rest.records)
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(seen, ["visitor-0", "visitor-1", "visitor-2", "visitor-3", "visitor-4"]);
        assert!(storage.get_results_page(exp, rest.cursor, 3).unwrap().is_empty());
    }

    #[test]
    fn test_empty_experiment() {
        let storage = InMemoryStorage::new();
        let exp = seed(&storage, 0);
        assert_eq!(ResultPages::new(&storage, exp, 1000).count(), 0);
    }
}
