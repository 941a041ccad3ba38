mod common;

use common::{config, line_loader, row_loader, LinearRegressor, RecordingCoordinator, ScriptedModel};
use tempfile::tempdir;
use training::{
    BestResolution, DataLoader, ExactMatchEvaluator, InMemoryLoader, LocalCoordinator, RunContext,
    StopReason, Trainer, TrainingError,
};

fn regressor_trainer(
    dir: &std::path::Path,
    overrides: &[&str],
) -> Trainer<LinearRegressor, LocalCoordinator> {
    Trainer::new(
        config(dir, overrides),
        RunContext::local(),
        LinearRegressor::new(),
        LocalCoordinator,
        Box::new(ExactMatchEvaluator),
    )
    .expect("trainer builds")
}

#[test]
fn optimizer_steps_once_per_accumulation_group() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(
        tmp.path(),
        &["training.epochs=3", "training.accumulation_steps=2"],
    );
    let train = line_loader(5, 2);

    let outcome = trainer.fit(&train, None).unwrap();

    assert_eq!(outcome.reason, StopReason::Exhausted);
    assert_eq!(outcome.epochs_run, 3);
    assert_eq!(trainer.timestamp().train_step, 9);
    assert_eq!(trainer.optimizer().steps(), 9);
    assert_eq!(outcome.train_losses.len(), 3);
    assert!(outcome.train_losses[2] < outcome.train_losses[0]);
}

#[test]
fn accumulated_groups_match_one_large_batch() {
    let small = tempdir().unwrap();
    let mut accumulated = regressor_trainer(
        small.path(),
        &[
            "optimizer.name=sgd",
            "training.epochs=2",
            "training.accumulation_steps=2",
        ],
    );
    accumulated.fit(&line_loader(4, 2), None).unwrap();

    let large = tempdir().unwrap();
    let mut single = regressor_trainer(large.path(), &["optimizer.name=sgd", "training.epochs=2"]);
    single.fit(&line_loader(2, 4), None).unwrap();

    let (w_a, b_a) = accumulated.model().weights();
    let (w_s, b_s) = single.model().weights();
    assert!((w_a - w_s).abs() < 1e-5, "{w_a} vs {w_s}");
    assert!((b_a - b_s).abs() < 1e-5, "{b_a} vs {b_s}");
    assert_eq!(accumulated.optimizer().steps(), single.optimizer().steps());
}

#[test]
fn max_steps_stops_mid_epoch() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(tmp.path(), &["training.max_steps=6", "training.epochs=1"]);

    let outcome = trainer.fit(&line_loader(4, 1), None).unwrap();

    assert_eq!(outcome.reason, StopReason::MaxSteps { max_steps: 6 });
    assert_eq!(outcome.epochs_run, 2);
    assert_eq!(trainer.timestamp().train_step, 6);
    assert_eq!(trainer.optimizer().steps(), 6);
}

#[test]
fn max_steps_on_epoch_boundary_opens_no_empty_epoch() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(tmp.path(), &["training.max_steps=4"]);

    let outcome = trainer.fit(&line_loader(4, 1), None).unwrap();

    assert_eq!(outcome.reason, StopReason::MaxSteps { max_steps: 4 });
    assert_eq!(outcome.epochs_run, 1);
    assert_eq!(outcome.train_losses.len(), 1);
}

#[test]
fn max_steps_wins_over_a_patient_stopping_rule() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(
            tmp.path(),
            &["training.max_steps=3", "training.stopping_steps=5"],
        ),
        RunContext::local(),
        ScriptedModel::new(&[1.0, 0.8, 0.6, 0.4]),
        LocalCoordinator,
        Box::new(ExactMatchEvaluator),
    )
    .unwrap();
    let train = row_loader(&["a", "b"], &[]);
    let valid = row_loader(&["v"], &["v"]);

    let outcome = trainer.fit(&train, Some(&valid)).unwrap();

    assert_eq!(outcome.reason, StopReason::MaxSteps { max_steps: 3 });
    assert_eq!(trainer.timestamp().train_step, 3);
    assert_eq!(trainer.optimizer().steps(), 3);
    assert_eq!(trainer.stopping_count(), 0);
}

#[test]
fn zero_valid_steps_never_validates_or_saves() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(tmp.path(), &["training.valid_steps=0", "training.epochs=3"]),
        RunContext::local(),
        LinearRegressor::new(),
        RecordingCoordinator::new(1),
        Box::new(ExactMatchEvaluator),
    )
    .unwrap();
    let valid = line_loader(1, 2);

    let outcome = trainer.fit(&line_loader(2, 2), Some(&valid)).unwrap();

    assert_eq!(outcome.reason, StopReason::Exhausted);
    assert!(outcome.best.is_none());
    assert!(trainer.valid_results().is_empty());
    assert!(trainer.checkpoints().list().unwrap().is_empty());
    assert!(!trainer.checkpoints().best_path().exists());
    assert_eq!(trainer.coordinator().barriers.get(), 1);
}

#[test]
fn early_stopping_after_streak_exceeds_threshold() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(tmp.path(), &["training.epochs=10", "training.stopping_steps=2"]),
        RunContext::local(),
        ScriptedModel::new(&[1.0, 0.5, 0.6, 0.7, 0.8, 0.9]),
        RecordingCoordinator::new(4),
        Box::new(ExactMatchEvaluator),
    )
    .unwrap();
    let train = row_loader(&["a", "b"], &[]);
    let valid = row_loader(&["v"], &["v"]);

    let outcome = trainer.fit(&train, Some(&valid)).unwrap();

    assert_eq!(outcome.reason, StopReason::EarlyStopping { non_best: 3 });
    assert_eq!(outcome.epochs_run, 5);
    assert_eq!(trainer.stopping_count(), 3);
    assert_eq!(trainer.valid_results().len(), 5);

    let best = outcome.best.expect("a best validation exists");
    assert_eq!(best.timestamp.valid_epoch, 2);
    assert!((best.as_dict()["loss"] - 0.5).abs() < 1e-6);
    assert!((trainer.best_valid_score().unwrap() + 0.5).abs() < 1e-6);

    let coordinator = trainer.coordinator();
    assert!(coordinator.prepared);
    assert_eq!(coordinator.gathers.get(), 5);
    assert_eq!(coordinator.barriers.get(), 6);
}

#[test]
fn pruned_best_checkpoint_is_detected() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(tmp.path(), &["training.epochs=4", "training.max_save=2"]),
        RunContext::local(),
        ScriptedModel::new(&[0.5, 0.6, 0.7, 0.8]),
        LocalCoordinator,
        Box::new(ExactMatchEvaluator),
    )
    .unwrap();
    let train = row_loader(&["a"], &[]);
    let valid = row_loader(&["v"], &["v"]);

    trainer.fit(&train, Some(&valid)).unwrap();

    let store = trainer.checkpoints();
    assert_eq!(store.list().unwrap(), vec![3, 4]);
    match store.resolve_best().unwrap() {
        BestResolution::Dangling { serial, .. } => assert_eq!(serial, 1),
        other => panic!("expected a dangling pointer, got {other:?}"),
    }
    assert!(store.load_best().unwrap().is_none());
}

#[test]
fn step_cadence_validates_every_n_groups() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(
        tmp.path(),
        &[
            "training.epochs=2",
            "training.valid_strategy=step",
            "training.valid_steps=2",
        ],
    );
    let valid = line_loader(1, 2);

    trainer.fit(&line_loader(3, 1), Some(&valid)).unwrap();

    let serials: Vec<usize> = trainer.valid_results().keys().copied().collect();
    assert_eq!(serials, vec![1, 2, 3]);
    let steps: Vec<usize> = trainer
        .valid_results()
        .values()
        .map(|summary| summary.timestamp.train_step)
        .collect();
    assert_eq!(steps, vec![2, 4, 6]);
    assert_eq!(trainer.checkpoints().list().unwrap(), vec![2, 3]);
}

#[test]
fn non_writer_workers_leave_the_filesystem_alone() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(tmp.path(), &["training.epochs=2"]),
        RunContext::local(),
        LinearRegressor::new(),
        RecordingCoordinator::follower(2),
        Box::new(ExactMatchEvaluator),
    )
    .unwrap();
    let valid = line_loader(1, 2);

    trainer.fit(&line_loader(2, 2), Some(&valid)).unwrap();

    assert_eq!(trainer.valid_results().len(), 2);
    assert!(!trainer.checkpoints().directory().exists());
    assert_eq!(trainer.coordinator().barriers.get(), 3);
}

#[test]
fn shutdown_signal_is_polled_at_group_boundaries() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(tmp.path(), &["training.epochs=5"]);
    let valid = line_loader(1, 2);
    let mut polls = 0;

    let outcome = trainer
        .fit_with_shutdown(&line_loader(5, 1), Some(&valid), || {
            polls += 1;
            polls >= 3
        })
        .unwrap();

    assert_eq!(outcome.reason, StopReason::Interrupted);
    assert_eq!(outcome.epochs_run, 1);
    assert_eq!(trainer.timestamp().train_step, 3);
    assert!(trainer.valid_results().is_empty());
}

#[test]
fn warmup_schedule_drives_learning_rate() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(
        tmp.path(),
        &[
            "training.max_steps=2",
            "optimizer.scheduler=constant",
            "optimizer.scheduler_kwargs.warmup_steps=4",
        ],
    );

    trainer.fit(&line_loader(4, 1), None).unwrap();

    assert!((trainer.optimizer().learning_rate() - 0.025).abs() < 1e-12);
}

#[test]
fn empty_training_loader_is_rejected() {
    let tmp = tempdir().unwrap();
    let mut trainer = regressor_trainer(tmp.path(), &[]);
    let empty: InMemoryLoader<common::Points> = InMemoryLoader::new(Vec::new());
    assert!(empty.is_empty());

    let err = trainer.fit(&empty, None).unwrap_err();
    assert!(matches!(err, TrainingError::Configuration(_)));
}
