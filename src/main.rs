use std::{env, thread};

use anyhow::{Context, Result, anyhow, bail};
use comms::{LocalGroup, TcpConfig};
use log::{error, info};

use orchestra::{RunSummary, TrainingConfig, logging, run};

const USAGE: &str = "usage: unet3d-train <config.json> [--local-ranks N]";

fn main() -> Result<()> {
    logging::init();

    let mut args = env::args().skip(1);
    let config_path = args.next().ok_or_else(|| anyhow!(USAGE))?;

    let mut local_ranks = 1;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--local-ranks" => {
                local_ranks = args
                    .next()
                    .ok_or_else(|| anyhow!(USAGE))?
                    .parse()
                    .context("--local-ranks must be a positive integer")?;
            }
            other => bail!("unexpected argument `{other}`\n{USAGE}"),
        }
    }

    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("loading {config_path}"))?;

    if env::var_os("WORLD_SIZE").is_some() {
        let tcp = TcpConfig::from_env().context("reading the process group environment")?;
        info!("joining a group of {} as rank {}", tcp.size, tcp.rank);
        report(run(&config, tcp)?);
        return Ok(());
    }

    if local_ranks == 0 {
        bail!("--local-ranks must be a positive integer");
    }

    let group = LocalGroup::new(local_ranks);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..local_ranks)
            .map(|rank| {
                let connector = group.connector(rank);
                let config = &config;
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(s, move || run(config, connector))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| -> Result<_> {
                let handle = handle.context("spawning a rank")?;
                let summary = handle
                    .join()
                    .map_err(|_| anyhow!("a rank panicked"))??;
                Ok(summary)
            })
            .collect()
    });

    let mut first_err = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(summary) if rank == 0 => report(summary),
            Ok(_) => {}
            Err(e) => {
                error!("rank {rank} failed: {e:#}");
                first_err.get_or_insert(e);
            }
        }
    }

    first_err.map_or(Ok(()), Err)
}

fn report(summary: RunSummary) {
    match summary {
        RunSummary::Trained(report) => info!(
            "run finished: {:?}, {} epochs, {} optimizer steps",
            report.outcome, report.epochs_run, report.optimizer_steps
        ),
        RunSummary::Evaluated(metrics) => info!("evaluation finished: {metrics:?}"),
        RunSummary::Skipped => {}
    }
}
