mod config;
mod emulator;
mod error;
mod experiment;
mod grammar;
mod grammar_fuzzer;
mod inputs;
mod layout;
mod logback;
mod orchestrator;
mod ports;
mod report;
mod tool;
mod util;

use std::{env, path::PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::{ExperimentConfig, FuzzOverrides, RunOverrides};

/// Runs the droidgram experiment pipeline: explore every app on its own
/// emulator, extract a grammar, fuzz it into seed inputs and replay them.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CommandLineArgs {
    /// TOML configuration file, `droidgram.toml` is used when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the complete experiment over every apk of a directory
    Run {
        /// Directory holding the instrumented apks and their `.apk.json` files
        apks_dir: PathBuf,

        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Generate seed input files from an extracted grammar
    Fuzz {
        /// Experiment whose `grammar.txt` is fuzzed, e.g. `emulator5554`
        #[arg(long)]
        avd_name: String,

        #[command(flatten)]
        overrides: FuzzOverrides,
    },
    /// Summarise grammar and code coverage of a finished experiment
    Report {
        /// Experiment to summarise, e.g. `emulator5554`
        #[arg(long)]
        avd_name: String,

        /// Number of seeds the experiment was expected to produce
        #[arg(long)]
        seeds: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = CommandLineArgs::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp(None)
        .init();

    let mut config = ExperimentConfig::resolve(args.config.as_deref())?;

    match args.command {
        Command::Run {
            apks_dir,
            overrides,
        } => {
            config.apply_run_overrides(&overrides, env::var_os("AVDMANAGER_COMMAND"));

            let summary = orchestrator::run_experiments(&apks_dir, config)
                .with_context(|| format!("Failed to run experiments over {:?}", apks_dir))?;
            log::info!("Experiments finished: {}", summary);
            if !summary.is_success() {
                bail!("Failed experiments: {}", summary.failed.join(", "));
            }
        }
        Command::Fuzz {
            avd_name,
            overrides,
        } => {
            config.apply_fuzz_overrides(&overrides);

            let grammar_input_dir = config.input_dir.join(&avd_name);
            let files =
                grammar_fuzzer::fuzz_seed_inputs(&grammar_input_dir, &config.fuzzer, config.seeds)
                    .with_context(|| format!("Failed to fuzz the grammar of {}", avd_name))?;
            log::info!(
                "Wrote {} seed files with strategy {} into {:?}",
                files.len(),
                config.fuzzer.strategy,
                grammar_input_dir
            );
        }
        Command::Report { avd_name, seeds } => {
            if let Some(seeds) = seeds {
                config.seeds = seeds;
            }

            let report = report::generate(&config, &avd_name)
                .with_context(|| format!("Failed to build the report of {}", avd_name))?;
            println!("{}", report.app);
            for row in &report.seeds {
                println!("{}", row);
            }
        }
    }

    Ok(())
}
