use std::{fs, path::PathBuf, thread};

use comms::LocalGroup;
use orchestra::{
    RunSummary, TrainingConfig,
    logging::LOG_FILE_NAME,
    run,
    training::{METRICS_LOG_NAME, Outcome, PRIMARY_METRIC},
};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("unet3d-run-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn small_config(dir: &PathBuf) -> TrainingConfig {
    let mut config = TrainingConfig {
        epochs: 3,
        batch_size: 2,
        dataset_size: 16,
        seed: Some(7),
        evaluate_every: Some(1),
        start_eval_at: Some(1),
        output_dir: dir.join("out"),
        log_dir: dir.join("logs"),
        save_ckpt_path: Some(dir.join("ckpt").join("model.json")),
        ..TrainingConfig::default()
    };
    config.data.voxels = 8;
    config.data.val_size = 4;
    config
}

fn run_ranks(config: &TrainingConfig, world: usize) -> Vec<RunSummary> {
    let group = LocalGroup::new(world);
    thread::scope(|s| {
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let connector = group.connector(rank);
                s.spawn(move || run(config, connector).unwrap())
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn two_ranks_train_to_the_threshold() {
    let dir = scratch("train");
    let config = TrainingConfig {
        quality_threshold: 0.0,
        ..small_config(&dir)
    };

    let summaries = run_ranks(&config, 2);
    for summary in &summaries {
        let RunSummary::Trained(report) = summary else {
            panic!("expected a training run, got {summary:?}");
        };
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.epochs_run, 1);
        assert!(report.last_metrics.as_ref().unwrap().contains_key(PRIMARY_METRIC));
    }

    assert!(config.output_dir.join(LOG_FILE_NAME).exists());
    assert!(config.save_ckpt_path.as_ref().unwrap().exists());

    let metrics_log = fs::read_to_string(config.log_dir.join(METRICS_LOG_NAME)).unwrap();
    let events: Vec<serde_json::Value> = metrics_log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(kinds, ["fit_start", "epoch_end", "fit_end"]);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn unreachable_threshold_runs_every_epoch() {
    let dir = scratch("epochs");
    let config = TrainingConfig {
        quality_threshold: 2.0,
        optimizer: "adam".into(),
        ..small_config(&dir)
    };

    for summary in run_ranks(&config, 2) {
        let RunSummary::Trained(report) = summary else {
            panic!("expected a training run");
        };
        assert_eq!(report.epochs_run, 3);
        assert_eq!(report.outcome, Outcome::EpochLimitReached);
        // 16 volumes over 2 ranks in batches of 2, for 3 epochs
        assert_eq!(report.optimizer_steps, 12);
    }

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn evaluate_mode_reports_the_same_metrics_everywhere() {
    let dir = scratch("evaluate");
    let config = TrainingConfig {
        exec_mode: "evaluate".into(),
        ..small_config(&dir)
    };

    let metrics: Vec<_> = run_ranks(&config, 2)
        .into_iter()
        .map(|summary| match summary {
            RunSummary::Evaluated(metrics) => metrics,
            other => panic!("expected an evaluation, got {other:?}"),
        })
        .collect();

    assert_eq!(metrics[0], metrics[1]);
    assert!(metrics[0].contains_key(PRIMARY_METRIC));

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn unknown_exec_mode_skips_the_run() {
    let dir = scratch("skip");
    let config = TrainingConfig {
        exec_mode: "benchmark".into(),
        ..small_config(&dir)
    };

    let summaries = run_ranks(&config, 2);
    assert!(summaries.iter().all(|s| matches!(s, RunSummary::Skipped)));

    fs::remove_dir_all(dir).unwrap();
}
