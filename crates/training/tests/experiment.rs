mod common;

use common::{config, line_loader, LinearRegressor};
use tempfile::tempdir;
use training::{
    ExactMatchEvaluator, Experiment, LocalCoordinator, RunContext, StopReason, TrainingError,
};

fn experiment(
    dir: &std::path::Path,
    overrides: &[&str],
) -> Experiment<LinearRegressor, LocalCoordinator> {
    Experiment::new(
        config(dir, overrides),
        RunContext::local(),
        LinearRegressor::new(),
        LocalCoordinator,
        Box::new(ExactMatchEvaluator),
    )
    .expect("experiment builds")
}

#[test]
fn validation_without_training_is_rejected() {
    let dir = tempdir().unwrap();
    let mut run = experiment(dir.path(), &["experiment.do_train=false"]);

    let err = run.run(None, None, None).unwrap_err();
    assert!(matches!(err, TrainingError::Configuration(_)));
}

#[test]
fn full_run_trains_validates_and_tests_best_checkpoint() {
    let dir = tempdir().unwrap();
    let mut run = experiment(dir.path(), &["training.epochs=2"]);
    let train = line_loader(3, 2);
    let valid = line_loader(1, 2);
    let test = line_loader(1, 2).with_references(vec!["1.0".into(), "1.2".into()]);

    let outcome = run.run(Some(&train), Some(&valid), Some(&test)).unwrap();

    let fit = outcome.fit.expect("training ran");
    assert_eq!(fit.reason, StopReason::Exhausted);
    assert_eq!(fit.epochs_run, 2);
    assert!(outcome.valid_result.is_some());
    let metrics = outcome.test_result.expect("best checkpoint was evaluated");
    assert!(metrics.contains_key("exact_match"));
    assert!(run
        .trainer()
        .checkpoints()
        .directory()
        .join("toy-unit.txt")
        .is_file());
}

#[test]
fn do_valid_off_trains_without_validation() {
    let dir = tempdir().unwrap();
    let mut run = experiment(
        dir.path(),
        &["training.epochs=1", "experiment.do_valid=false", "experiment.do_test=false"],
    );
    let train = line_loader(2, 2);
    let valid = line_loader(1, 2);

    let outcome = run.run(Some(&train), Some(&valid), None).unwrap();

    assert!(outcome.valid_result.is_none());
    assert!(outcome.test_result.is_none());
    assert!(run.trainer().valid_results().is_empty());
}

#[test]
fn test_only_run_with_missing_checkpoint_reports_nothing() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("gone.pth");
    let mut run = experiment(
        dir.path(),
        &[
            "experiment.do_train=false",
            "experiment.do_valid=false",
            &format!("experiment.load_experiment={}", missing.display()),
        ],
    );
    let test = line_loader(1, 2).with_references(vec!["1.0".into(), "1.2".into()]);

    let outcome = run.run(None, None, Some(&test)).unwrap();

    assert!(outcome.fit.is_none());
    assert!(outcome.test_result.is_none());
}
