//! Consolidation and Analysis Tests
//!
//! Drives raw results through storage, consolidation and analysis:
//! - The 100-visitor 60/40 reference example
//! - Paging boundaries during consolidation
//! - Multivariate sibling joins
//! - Reports from a RocksDB store across restarts

use std::sync::Arc;
use tempfile::TempDir;

use scenario::consolidator::consolidate_experiment;
use scenario::experiment::ExperimentMetadata;
use scenario::storage::StorageAdapter;
use scenario::{
    Identity, InMemoryStorage, RocksStorage, ScenarioConfig, ScenarioManager, TableNames, WriteMode,
};

fn visitor(i: usize) -> Identity {
    Identity::new(format!("visitor-{i}")).expect("valid identity")
}

/// 60 visitors on default (30 convert), 40 on alternate (10 convert)
fn seed_sixty_forty(storage: &dyn StorageAdapter) -> scenario::experiment::ExperimentId {
    let exp = storage
        .add_experiment("newsletter", &ExperimentMetadata::default())
        .expect("add experiment");
    for i in 0..100 {
        let treatment = if i < 60 { "default" } else { "alternate" };
        let converts = if i < 60 { i < 30 } else { i < 70 };
        storage.set_treatment(exp.id, treatment, &visitor(i)).unwrap();
        if converts {
            assert!(storage.finish_treatment(exp.id, treatment, &visitor(i)).unwrap());
        }
    }
    exp.id
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ============================================================================
// REFERENCE EXAMPLE
// ============================================================================

#[test]
fn test_sixty_forty_report() {
    let storage = Arc::new(InMemoryStorage::new());
    seed_sixty_forty(storage.as_ref());
    let manager = ScenarioManager::new(storage, ScenarioConfig::default());

    let report = manager.results("newsletter").unwrap();
    let record = report.record().expect("record for newsletter");

    assert_eq!(record.total_tested, 100);
    assert_eq!(record.total_converted, 40);
    assert!(close(record.conversion_rate, 0.4));

    let default = record.treatment("default").unwrap();
    assert_eq!(default.total_tested, 60);
    assert!(close(default.conversion_rate, 0.5));
    assert!(default.z_score.is_none());

    let alternate = record.treatment("alternate").unwrap();
    assert_eq!(alternate.total_tested, 40);
    assert!(close(alternate.conversion_rate, 0.25));
    assert!(close(alternate.percent_tested, 0.4));
    let z = alternate.z_score.unwrap();
    assert!((z + 2.6568).abs() < 1e-3, "z-score {z}");
}

#[test]
fn test_page_size_does_not_change_counts() {
    let storage = InMemoryStorage::new();
    let exp = seed_sixty_forty(&storage);

    let (baseline, _) = consolidate_experiment(&storage, exp, 1000).unwrap();
    for batch in [1, 7, 50, 100, 101] {
        let (counters, stats) = consolidate_experiment(&storage, exp, batch).unwrap();
        assert_eq!(counters, baseline, "batch size {batch}");
        assert_eq!(stats.records, 100);
    }
}

#[test]
fn test_report_for_experiment_without_traffic() {
    let storage = Arc::new(InMemoryStorage::new());
    let manager = ScenarioManager::new(storage, ScenarioConfig::default());
    manager.experiment("quiet").unwrap();

    let report = manager.results("quiet").unwrap();
    let record = report.record().expect("record even without traffic");
    assert_eq!(record.total_tested, 0);
    assert_eq!(record.total_converted, 0);
    assert_eq!(record.conversion_rate, 0.0);
    assert_eq!(record.control, "default");
    assert_eq!(record.treatments.len(), 2);
    for (name, t) in &record.treatments {
        assert_eq!(t.total_tested, 0, "{name}");
        assert_eq!(t.conversion_rate, 0.0, "{name}");
        assert_eq!(t.percent_tested, 0.0, "{name}");
        assert_eq!(t.standard_error, 0.0, "{name}");
    }
    assert!(record.treatment("default").unwrap().z_score.is_none());
    assert_eq!(record.treatment("alternate").unwrap().z_score, Some(0.0));
}

#[test]
fn test_multivariate_report_without_traffic() {
    let storage = Arc::new(InMemoryStorage::new());
    let manager = ScenarioManager::new(storage, ScenarioConfig::default());
    manager
        .define_multivariate(
            "homepage",
            &serde_json::json!({
                "color": {"control": {"blue": 50}, "alternates": {"red": 50}},
                "size": ["large"]
            }),
        )
        .unwrap();

    let report = manager.results("homepage").unwrap();
    let record = report.record().expect("record even without traffic");
    assert!(record.multivariate);
    assert_eq!(record.control, "blue:default");
    assert_eq!(record.total_tested, 0);
    assert_eq!(record.conversion_rate, 0.0);
}

#[test]
fn test_report_for_unknown_experiment_is_not_found() {
    let storage = Arc::new(InMemoryStorage::new());
    let manager = ScenarioManager::new(storage.clone(), ScenarioConfig::default());
    let err = manager.results("missing").unwrap_err();
    assert_eq!(err.code(), "EXPERIMENT_NOT_FOUND");
    assert_eq!(storage.write_count(), 0);
}

// ============================================================================
// MULTIVARIATE
// ============================================================================

#[test]
fn test_multivariate_report_counts_complete_sets() {
    let storage = Arc::new(InMemoryStorage::new());
    let manager = ScenarioManager::new(storage.clone(), ScenarioConfig::default());
    manager
        .define_multivariate(
            "homepage",
            &serde_json::json!({
                "color": {"control": {"blue": 50}, "alternates": {"red": 50}},
                "size": ["large"]
            }),
        )
        .unwrap();

    let color = storage.get_experiment_by_name("homepage.color").unwrap().unwrap();
    let size = storage.get_experiment_by_name("homepage.size").unwrap().unwrap();

    // two visitors with full sets, one with only a color row
    storage.set_treatment(color.id, "red", &visitor(1)).unwrap();
    storage.set_treatment(size.id, "large", &visitor(1)).unwrap();
    storage.set_treatment(color.id, "red", &visitor(2)).unwrap();
    storage.set_treatment(size.id, "large", &visitor(2)).unwrap();
    storage.set_treatment(color.id, "blue", &visitor(3)).unwrap();
    manager.complete("homepage", &visitor(1)).unwrap();

    let report = manager.results("homepage").unwrap();
    let record = report.record().unwrap();
    assert!(record.multivariate);
    assert_eq!(record.control, "blue:default");
    assert_eq!(record.total_tested, 2);
    assert_eq!(record.total_converted, 1);

    let combo = record.treatment("red:large").unwrap();
    assert_eq!(combo.total_tested, 2);
    // control combination saw no traffic
    assert_eq!(combo.z_score, Some(0.0));
    assert_eq!(report.consolidation.joined, 2);
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[test]
fn test_rocksdb_report_after_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = ScenarioConfig {
        storage_path: temp_dir.path().to_path_buf(),
        results_batch_size: 16,
        ..Default::default()
    };

    {
        let storage = RocksStorage::from_config(&config).expect("open storage");
        seed_sixty_forty(&storage);
        storage.flush().unwrap();
    }

    let storage = RocksStorage::open(temp_dir.path(), TableNames::default(), WriteMode::Async)
        .expect("reopen storage");
    let manager = ScenarioManager::new(Arc::new(storage), config);
    let report = manager.results("newsletter").unwrap();
    let record = report.record().unwrap();
    assert_eq!(record.total_tested, 100);
    assert_eq!(record.total_converted, 40);

    let json = report.to_json_pretty().unwrap();
    assert!(json.contains("\"newsletter\""));
}

#[test]
fn test_clear_resets_report() {
    let storage = Arc::new(InMemoryStorage::new());
    seed_sixty_forty(storage.as_ref());
    let manager = ScenarioManager::new(storage.clone(), ScenarioConfig::default());

    manager.clear_experiment("newsletter", false).unwrap();
    let cleared = manager.results("newsletter").unwrap();
    assert_eq!(cleared.record().map(|r| r.total_tested), Some(0));

    manager.clear_experiment("newsletter", true).unwrap();
    assert!(manager.list_experiments().unwrap().is_empty());
}
