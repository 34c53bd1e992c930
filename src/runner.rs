//! One rank's whole run: group formation, seeding, the reference
//! collaborators and the selected execution mode.

use std::{fs, sync::Arc};

use comms::{Collective, Connector};
use log::{error, info, warn};

use crate::{
    cadence::{EpochSizing, EvalCadence},
    config::{ExecMode, OptimizerKind},
    info0, logging,
    progress::ProgressTracker,
    reference::{
        BceLoss, DiceEvaluator, DistributedSampler, ParamOptimizer, VolumeDataset, VolumeLoader,
        VoxelClassifier, build_optimizer,
    },
    seeds::{seed_everything, setup_seeds},
    topology::{Layout, MAX_PORT_ATTEMPTS, Topology},
    training::{
        CheckpointListener, DataLoader, Device, EvalRequest, Evaluator, FitReport, Listeners,
        Metrics, MetricsLogger, Trainer,
    },
    Result, TrainingConfig,
};

/// What a rank did.
#[derive(Debug, Clone)]
pub enum RunSummary {
    Trained(FitReport),
    Evaluated(Metrics),
    /// The execution mode was unknown, nothing ran.
    Skipped,
}

/// Runs one rank from group formation to finalization.
///
/// Every rank of the group must call it with the same configuration.
///
/// # Arguments
/// * `config` - The run configuration.
/// * `connector` - How this rank joins the group.
///
/// # Returns
/// What the rank did, or the first fatal error. On error the group is left
/// without finalizing, so the remaining ranks fail instead of waiting.
pub fn run<C: Connector>(config: &TrainingConfig, connector: C) -> Result<RunSummary> {
    config.validate()?;
    let optimizer_kind = config.optimizer_kind()?;

    let mut topology = Topology::new(connector);
    let layout = topology.initialize()?;
    logging::set_rank(layout.global_rank, layout.is_global_leader());

    let summary = run_rank(config, optimizer_kind, &mut topology, layout)?;
    topology.finalize()?;
    Ok(summary)
}

fn run_rank<C: Connector>(
    config: &TrainingConfig,
    optimizer_kind: OptimizerKind,
    topology: &mut Topology<C>,
    layout: Layout,
) -> Result<RunSummary> {
    let endpoint = topology.negotiate_master_endpoint(
        config.master_port,
        config.host_suffix.as_deref(),
        MAX_PORT_ATTEMPTS,
    )?;
    info0!(
        world_size = layout.world_size,
        nodes = layout.num_nodes();
        "master endpoint {endpoint}"
    );

    // The leader creates the log before anyone else tries to open it.
    if layout.is_global_leader() {
        fs::create_dir_all(&config.output_dir)?;
        let path = logging::log_to_file(&config.output_dir, true)?;
        info!("logging to {}", path.display());
    }
    topology.barrier()?;
    if !layout.is_global_leader() {
        if let Err(e) = logging::log_to_file(&config.output_dir, false) {
            warn!("no runtime log on this node: {e}");
        }
    }

    // The reference collaborators compute on the host.
    let device = Device::for_local_rank(layout.local_rank, 0);
    let comm: &mut dyn Collective = topology.comm()?;

    let seeds = setup_seeds(comm, config.seed, config.epochs)?;
    let worker_seed = seeds
        .worker_seed(layout.local_rank)
        .unwrap_or(seeds.master_seed);
    let shuffling_seed = seeds.shuffling_seed().unwrap_or(seeds.master_seed);

    let mut model = VoxelClassifier::new(config.data.voxels, seeds.master_seed);
    let host_rng = seed_everything(worker_seed, &mut [&mut model]);
    model.sync_from_root(comm)?;

    let train_set = VolumeDataset::synthetic(config.dataset_size, &config.data, seeds.master_seed)?;
    let val_set = VolumeDataset::synthetic(
        config.data.val_size,
        &config.data,
        seeds.master_seed.wrapping_add(1),
    )?;

    let train_sampler = DistributedSampler::new(
        train_set.len(),
        layout.global_rank,
        layout.world_size,
        true,
        shuffling_seed,
    );
    let val_sampler =
        DistributedSampler::new(val_set.len(), layout.global_rank, layout.world_size, false, 0);

    let mut train_loader = VolumeLoader::new(Arc::new(train_set), train_sampler, config.batch_size)
        .with_jitter(host_rng, config.data.jitter)?;
    let mut evaluator = DiceEvaluator::new(VolumeLoader::new(
        Arc::new(val_set),
        val_sampler,
        config.batch_size,
    ));

    let sizing = EpochSizing {
        world_size: layout.world_size,
        steps_per_epoch: train_loader.len(),
        batch_size: config.batch_size,
    };
    let cadence = EvalCadence::resolve(
        config.dataset_size,
        sizing,
        config.evaluate_every,
        config.start_eval_at,
    )?;
    info0!(
        evaluate_every = cadence.evaluate_every,
        start_eval_at = cadence.start_eval_at;
        "evaluation cadence resolved"
    );

    let mut optimizer = build_optimizer(optimizer_kind, model.params(), config);
    let mut listeners = leader_listeners(config, &layout)?;

    match config.exec_mode() {
        Ok(ExecMode::Train) => {
            let mut trainer = Trainer::new(config, comm, device, cadence);
            if config.verbose && layout.is_global_leader() {
                trainer = trainer.with_progress(ProgressTracker::new(config.progress_every));
            }

            let report = trainer.fit(
                &mut model,
                &BceLoss,
                &mut optimizer,
                &mut train_loader,
                &mut evaluator,
                &mut listeners,
            )?;

            if layout.is_local_leader() {
                info!("Total training time: {:.8} [s]", report.elapsed.as_secs_f64());
            }
            info0!(
                epochs = report.epochs_run,
                optimizer_steps = report.optimizer_steps;
                "training finished: {:?}",
                report.outcome
            );

            Ok(RunSummary::Trained(report))
        }
        Ok(ExecMode::Evaluate) => {
            let request = EvalRequest {
                epoch: None,
                comm,
                device: &device,
            };
            let metrics = evaluator.evaluate(request, &mut model)?;

            if layout.is_local_leader() {
                for (name, value) in &metrics {
                    info!("{name} {value}");
                }
            }

            Ok(RunSummary::Evaluated(metrics))
        }
        Err(_) => {
            error!("Invalid exec_mode.");
            Ok(RunSummary::Skipped)
        }
    }
}

/// The metrics log and the checkpoint writer, registered on the leader only.
fn leader_listeners(
    config: &TrainingConfig,
    layout: &Layout,
) -> Result<Listeners<VoxelClassifier, ParamOptimizer>> {
    let mut listeners = Listeners::new();
    if !layout.is_global_leader() {
        return Ok(listeners);
    }

    let logger = MetricsLogger::create(&config.log_dir)?;
    info!("metrics logged to {}", logger.path().display());
    listeners.push(logger);

    if let Some(path) = &config.save_ckpt_path {
        listeners.push(CheckpointListener::new(path.clone()));
    }

    Ok(listeners)
}
