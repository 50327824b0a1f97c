//! End-to-end tests: preparation, training, bundle persistence and evaluation.

mod common;

use std::fs;

use aq_forecast::ml::persistence::{METADATA_FILE, ModelMetadata, RECIPE_FILE, load_bundle};
use aq_forecast::ml::PersistenceError;
use aq_forecast::training::ModelTrainer;
use aq_forecast::training::tracking::Tracker;
use common::{small_config, synthetic_site};
use tempfile::tempdir;

/// A saved bundle reproduces the in-memory model's predictions.
#[test]
fn test_train_save_load_predicts_identically() {
    let dir = tempdir().unwrap();
    let mut trainer = ModelTrainer::with_tracker(small_config(dir.path()), Tracker::disabled());
    let data = trainer
        .prepare_data(vec![synthetic_site(160, 0.0), synthetic_site(140, 0.7)])
        .unwrap();

    let outcome = trainer
        .train_model(trainer.config().model.clone(), &data, true)
        .unwrap();
    let bundle_dir = outcome.bundle_dir.expect("bundle saved");
    assert!(bundle_dir.starts_with(dir.path().join("models")));
    assert!(bundle_dir.join("network.bin").exists());
    assert!(bundle_dir.join("training_history.json").exists());

    let test = data.test.as_ref().expect("test sequences");
    let (_, model) = trainer.models().next().unwrap();
    let expected = model.predict(&test.x).unwrap();

    let bundle = load_bundle(&bundle_dir).unwrap();
    assert_eq!(bundle.recipe, data.recipe);
    assert_eq!(bundle.metadata.input_shape, (6, data.recipe.feature_names().len()));
    assert_eq!(bundle.metadata.output_shape, (3, 2));
    assert_eq!(bundle.model.history().epochs(), outcome.history.epochs());

    let actual = bundle.model.predict(&test.x).unwrap();
    assert_eq!(expected.shape(), actual.shape());
    for (a, b) in expected.iter().zip(actual.iter()) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
}

/// Missing or inconsistent bundle parts are errors, never silently repaired.
#[test]
fn test_bundle_consistency_errors() {
    let dir = tempdir().unwrap();
    let mut trainer = ModelTrainer::with_tracker(small_config(dir.path()), Tracker::disabled());
    let data = trainer.prepare_data(vec![synthetic_site(150, 0.0)]).unwrap();
    let bundle_dir = trainer
        .train_model(trainer.config().model.clone(), &data, true)
        .unwrap()
        .bundle_dir
        .unwrap();

    let metadata_path = bundle_dir.join(METADATA_FILE);
    let original = fs::read_to_string(&metadata_path).unwrap();
    let metadata: ModelMetadata = serde_json::from_str(&original).unwrap();

    let mut renamed = metadata.clone();
    renamed.feature_names[0] = "not_a_feature".to_string();
    fs::write(&metadata_path, serde_json::to_string(&renamed).unwrap()).unwrap();
    assert!(matches!(load_bundle(&bundle_dir), Err(PersistenceError::Inconsistent(_))));

    let mut future = metadata.clone();
    future.version = ModelMetadata::CURRENT_VERSION + 1;
    fs::write(&metadata_path, serde_json::to_string(&future).unwrap()).unwrap();
    assert!(matches!(
        load_bundle(&bundle_dir),
        Err(PersistenceError::VersionMismatch { .. })
    ));

    fs::write(&metadata_path, &original).unwrap();
    assert!(load_bundle(&bundle_dir).is_ok());

    fs::remove_file(bundle_dir.join(RECIPE_FILE)).unwrap();
    assert!(matches!(load_bundle(&bundle_dir), Err(PersistenceError::FileNotFound(_))));
}

/// An unfitted model cannot be saved.
#[test]
fn test_save_unfitted_model_fails() {
    let dir = tempdir().unwrap();
    let trainer = ModelTrainer::with_tracker(small_config(dir.path()), Tracker::disabled());
    let data = trainer.prepare_data(vec![synthetic_site(120, 0.0)]).unwrap();
    let model = aq_forecast::ForecastModel::new(trainer.config().model.clone());
    assert!(matches!(
        aq_forecast::save_bundle(&dir.path().join("unfitted"), &model, &data.recipe),
        Err(PersistenceError::NotFitted)
    ));
}

/// Evaluating a saved bundle replays its recipe on the test split.
#[test]
fn test_evaluate_bundle_on_test_split() {
    let dir = tempdir().unwrap();
    let mut trainer = ModelTrainer::with_tracker(small_config(dir.path()), Tracker::disabled());
    let segments = vec![synthetic_site(200, 0.0)];
    let data = trainer.prepare_data(segments.clone()).unwrap();
    let bundle_dir = trainer
        .train_model(trainer.config().model.clone(), &data, true)
        .unwrap()
        .bundle_dir
        .unwrap();

    let bundle = load_bundle(&bundle_dir).unwrap();
    let report = trainer.evaluate_bundle(&bundle, segments).unwrap();
    assert!(report.rmse.is_finite());
    assert_eq!(report.targets.len(), 2);
    assert!((0.0..=100.0).contains(&report.overall_accuracy_score));
}

/// Training data from a directory of per-site CSV files.
#[test]
fn test_load_segments_from_directory() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    synthetic_site(100, 0.0).write_csv(&data_dir.join("site_a.csv")).unwrap();
    synthetic_site(90, 1.0).write_csv(&data_dir.join("site_b.csv")).unwrap();
    fs::write(data_dir.join("notes.txt"), "ignored").unwrap();

    let segments = ModelTrainer::load_segments(&data_dir).unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].len(), 100);
    assert_eq!(segments[1].len(), 90);
}
