//! One experiment: an apk (or one seed derived from it) bound to its own
//! emulator and directory layout.
//!
//! The pipeline of a base experiment is:
//! 1. explore the app (`01.sh`),
//! 2. extract the grammar from the exploration model (`02.sh`),
//! 3. fuzz the grammar into seed inputs and derive one seed experiment per
//!    seed file,
//! 4. replay every seed on its own emulator (`04.sh`).

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::config::ExperimentConfig;
use crate::emulator::Emulator;
use crate::error::{Error, IoContext, Result};
use crate::grammar_fuzzer;
use crate::inputs::{self, GRAMMAR_FILE, TRANSLATION_TABLE_FILE};
use crate::layout::{RunLayout, MODEL_DIR};
use crate::logback;
use crate::orchestrator;
use crate::ports::PortAllocator;
use crate::tool::ToolCommand;
use crate::util;

#[derive(Debug)]
pub struct Experiment {
    apk: PathBuf,
    seed: Option<u32>,
    emulator: Emulator,
    layout: RunLayout,
    config: Arc<ExperimentConfig>,
    ports: Arc<PortAllocator>,
}

impl Experiment {
    /// A base experiment for `apk`, with a fresh emulator port and a clean
    /// logs directory.
    pub fn new(
        apk: PathBuf,
        config: Arc<ExperimentConfig>,
        ports: Arc<PortAllocator>,
    ) -> Result<Self> {
        let emulator = Emulator::new(ports.next()?, &config);
        let layout = RunLayout::base(&config, emulator.avd_name());
        Self::with_layout(apk, None, emulator, layout, config, ports)
    }

    /// A seed experiment replaying `inputs<seed>.txt` of this experiment.
    fn seed(&self, seed: u32) -> Result<Self> {
        let emulator = Emulator::new(self.ports.next()?, &self.config);
        let layout = RunLayout::seed(&self.config, self.emulator.avd_name(), seed);
        Self::with_layout(
            self.apk.clone(),
            Some(seed),
            emulator,
            layout,
            Arc::clone(&self.config),
            Arc::clone(&self.ports),
        )
    }

    fn with_layout(
        apk: PathBuf,
        seed: Option<u32>,
        emulator: Emulator,
        layout: RunLayout,
        config: Arc<ExperimentConfig>,
        ports: Arc<PortAllocator>,
    ) -> Result<Self> {
        let experiment = Self {
            apk,
            seed,
            emulator,
            layout,
            config,
            ports,
        };
        experiment.describe();
        experiment.layout.clean_logs_dir()?;
        Ok(experiment)
    }

    fn describe(&self) {
        log::debug!("APK {:?}", self.apk);
        log::debug!("JSON {:?}", crate::layout::instrumentation_json(&self.apk));
        log::debug!("Emulator: {}", self.emulator.name());
        log::debug!("AVD Name: {}", self.emulator.avd_name());
        if let Some(seed) = self.seed {
            log::debug!("Seed: {}", seed);
        }
        self.layout.describe();
    }

    /// Writes the logback config for `stage` and returns its path.
    fn logback_config(&self, stage: &str) -> PathBuf {
        let name = format!("{}-{}", self.emulator.avd_name(), stage);
        logback::write_config(&self.config.logback_dir, &self.layout.logs_dir, &name)
    }

    /// Creates the AVD and boots the emulator in the background.
    pub fn start(&self) -> Result<()> {
        let emulator_binary = self.config.emulator_binary()?;
        self.emulator.create_avd(&self.layout.logs_dir)?;
        self.emulator.start(&emulator_binary, &self.layout.logs_dir)
    }

    /// Steps 1 to 3, which include the replay of every derived seed.
    pub fn execute(&self) -> Result<()> {
        self.run_exploration()?;
        self.extract_grammar()?;
        self.fuzz_grammar()
    }

    /// Stops the emulator and deletes its AVD.
    pub fn terminate(&self) -> Result<()> {
        self.emulator.terminate(&self.layout.logs_dir)
    }

    pub fn exploration_command(&self, logback_config: &Path) -> ToolCommand {
        ToolCommand::new(&self.config.explore_script)
            .arg(logback_config.as_os_str())
            .arg(self.layout.apk_dir.as_os_str())
            .arg(self.config.action_limit.to_string())
            .arg(self.emulator.name())
            .arg(self.layout.output_dir.as_os_str())
    }

    pub fn extraction_command(&self, logback_config: &Path) -> ToolCommand {
        let mut target = self.layout.grammar_input_dir.clone().into_os_string();
        target.push("/");
        ToolCommand::new(&self.config.extract_script)
            .arg(logback_config.as_os_str())
            .arg(self.layout.grammar_input_dir.as_os_str())
            .arg(target)
    }

    pub fn replay_command(&self, logback_config: &Path) -> ToolCommand {
        ToolCommand::new(&self.config.replay_script)
            .arg(logback_config.as_os_str())
            .arg(self.layout.grammar_input_dir.as_os_str())
            .arg(self.layout.apk_dir.as_os_str())
            .arg(self.layout.output_dir.as_os_str())
            .arg(self.emulator.name())
    }

    /// Step 1: explore the app with `action_limit` actions.
    pub fn run_exploration(&self) -> Result<()> {
        log::info!("[{}] Step 1: exploration", self);
        self.layout.clean_output_dir()?;
        self.layout.copy_original_apk(&self.apk)?;

        let config = self.logback_config("01explore");
        self.exploration_command(&config).run()?;
        Ok(())
    }

    /// Step 2: hand the exploration model to the grammar extraction.
    pub fn extract_grammar(&self) -> Result<()> {
        log::info!("[{}] Step 2: grammar extraction", self);
        self.layout.clean_grammar_input_dir()?;

        let model = self.layout.exploration_model_dir();
        if !model.is_dir() {
            return Err(Error::MissingArtifact(model));
        }
        util::move_dir(&model, &self.layout.grammar_model_dir())?;

        let config = self.logback_config("02extract");
        self.extraction_command(&config).run()?;
        Ok(())
    }

    /// Step 3: fuzz the grammar into seed files, then replay every seed on
    /// its own emulator.
    pub fn fuzz_grammar(&self) -> Result<()> {
        log::info!("[{}] Step 3: grammar fuzzing", self);
        self.generate_seed_inputs()?;

        let seeds = self.prepare_seeds()?;
        if seeds.is_empty() {
            log::warn!("[{}] No seed inputs were generated", self);
            return Ok(());
        }

        let summary =
            orchestrator::run_batch(&seeds, &self.config, Experiment::run_grammar_inputs)?;
        log::info!("[{}] Seeds finished: {}", self, summary);
        Ok(())
    }

    fn generate_seed_inputs(&self) -> Result<()> {
        let fuzzer = &self.config.fuzzer;
        match &fuzzer.external {
            Some(command) => {
                let (program, args) = command.split_first().ok_or_else(|| Error::Command {
                    command: String::new(),
                    reason: "empty external fuzzer command".to_owned(),
                })?;
                let command = args
                    .iter()
                    .fold(ToolCommand::new(program), |command, arg| command.arg(arg))
                    .arg(self.config.input_dir.as_os_str())
                    .arg(self.emulator.avd_name())
                    .arg(self.config.seeds.to_string());
                command.run()?;
            }
            None => {
                grammar_fuzzer::fuzz_seed_inputs(
                    &self.layout.grammar_input_dir,
                    fuzzer,
                    self.config.seeds,
                )?;
            }
        }
        Ok(())
    }

    /// Sets up `seed<N>` next to every `inputs<N>.txt` with the grammar,
    /// translation table and a private copy of the exploration model.
    fn prepare_seeds(&self) -> Result<Vec<Experiment>> {
        let input_dir = &self.layout.grammar_input_dir;
        log::info!("Processing dir {:?}", input_dir);

        let mut seeds = Vec::new();
        for (seed, file) in inputs::seed_files(input_dir)? {
            log::info!("Processing seed file {:?}", file);
            let experiment = self.seed(seed)?;
            let seed_dir = &experiment.layout.grammar_input_dir;
            fs::create_dir_all(seed_dir).at(seed_dir)?;

            util::copy_into(&file, seed_dir)?;
            util::copy_into(&input_dir.join(GRAMMAR_FILE), seed_dir)?;
            util::copy_into(&input_dir.join(TRANSLATION_TABLE_FILE), seed_dir)?;

            let model = self.layout.grammar_model_dir();
            let seed_model = seed_dir.join(MODEL_DIR);
            log::info!("Copying output folder from {:?} to {:?}", model, seed_model);
            util::remove_dir_best_effort(&seed_model);
            util::copy_dir_all(&model, &seed_model)?;

            seeds.push(experiment);
        }
        Ok(seeds)
    }

    /// Step 4: replay the seed inputs.
    pub fn run_grammar_inputs(&self) -> Result<()> {
        log::info!("[{}] Step 4: replaying grammar inputs", self);
        fs::create_dir_all(&self.layout.output_dir).at(&self.layout.output_dir)?;

        let config = self.logback_config("04run");
        self.replay_command(&config).run()?;
        Ok(())
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Emulator: {}\tAPK {}", self.emulator.name(), self.apk.display())?;
        if let Some(seed) = self.seed {
            write!(f, "\tSeed {}", seed)?;
        }
        Ok(())
    }
}
