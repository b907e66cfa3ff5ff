//! Parallel dispatch of experiments.
//!
//! A batch boots one emulator per experiment, waits the configured boot
//! time, runs the experiments on a thread pool and finally tears every
//! emulator down again. A failing experiment never stops its siblings.

use std::{fmt, path::Path, sync::Arc, thread};

use rayon::prelude::*;

use crate::config::ExperimentConfig;
use crate::emulator;
use crate::error::{Error, Result};
use crate::experiment::Experiment;
use crate::layout;
use crate::ports::PortAllocator;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: Vec<String>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed",
            self.succeeded,
            self.failed.len()
        )
    }
}

/// Runs the whole pipeline for every apk in `apks_dir`.
pub fn run_experiments(apks_dir: &Path, config: ExperimentConfig) -> Result<BatchSummary> {
    let apks = layout::apk_files(apks_dir)?;
    if apks.is_empty() {
        log::warn!("No apk files found in {:?}", apks_dir);
        return Ok(BatchSummary::default());
    }
    log::info!("Found {} apks in {:?}", apks.len(), apks_dir);

    let config = Arc::new(config);
    let ports = Arc::new(PortAllocator::new(config.first_emulator_port));
    let experiments = apks
        .into_iter()
        .map(|apk| Experiment::new(apk, Arc::clone(&config), Arc::clone(&ports)))
        .collect::<Result<Vec<_>>>()?;

    run_batch(&experiments, &config, Experiment::execute)
}

/// Starts every emulator, waits for them to boot, runs `work` on each
/// experiment with up to `jobs` in parallel and terminates every emulator.
pub fn run_batch<F>(
    experiments: &[Experiment],
    config: &ExperimentConfig,
    work: F,
) -> Result<BatchSummary>
where
    F: Fn(&Experiment) -> Result<()> + Sync,
{
    let started: Vec<bool> = experiments
        .iter()
        .map(|experiment| match experiment.start() {
            Ok(()) => true,
            Err(err) => {
                log::error!("Error `{}` when starting the emulator of {}", err, experiment);
                false
            }
        })
        .collect();

    if started.iter().any(|started| *started) {
        emulator::wait_for_boot(config.boot_wait_secs);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.jobs.max(1))
        .build()
        .map_err(|err| Error::Command {
            command: "thread pool".to_owned(),
            reason: err.to_string(),
        })?;

    // Installed from a plain thread: a calling rayon worker (a base
    // experiment dispatching its seeds) must not pick up other experiments
    // while it waits for this batch.
    let failed: Vec<String> = thread::scope(|scope| {
        scope
            .spawn(|| {
                pool.install(|| {
                    experiments
                        .par_iter()
                        .zip(started.par_iter())
                        .filter_map(|(experiment, started)| {
                            if !started {
                                return Some(experiment.to_string());
                            }
                            match work(experiment) {
                                Ok(()) => None,
                                Err(err) => {
                                    log::error!(
                                        "Error `{}` when running the experiment in {}",
                                        err,
                                        experiment
                                    );
                                    Some(experiment.to_string())
                                }
                            }
                        })
                        .collect()
                })
            })
            .join()
    })
    .map_err(|_| Error::Command {
        command: "experiment batch".to_owned(),
        reason: "worker thread panicked".to_owned(),
    })?;

    for experiment in experiments {
        if let Err(err) = experiment.terminate() {
            log::error!("Error `{}` stopping AVD in {}", err, experiment);
        }
    }

    Ok(BatchSummary {
        succeeded: experiments.len() - failed.len(),
        failed,
    })
}
