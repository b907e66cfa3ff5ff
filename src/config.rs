//! Experiment configuration, loaded from TOML and overridden from the
//! command line.

use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

use clap::Args;

use serde::Deserialize;

use crate::error::{Error, IoContext, Result};
use crate::grammar_fuzzer::Strategy;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "droidgram.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_apks_dir")]
    pub apks_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_action_limit")]
    pub action_limit: u32,
    #[serde(default = "default_seeds")]
    pub seeds: u32,

    #[serde(default = "default_first_emulator_port")]
    pub first_emulator_port: u16,
    #[serde(default = "default_boot_wait_secs")]
    pub boot_wait_secs: u64,
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    #[serde(default = "default_system_image")]
    pub system_image: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_avdmanager")]
    pub avdmanager: PathBuf,
    /// Falls back to `$ANDROID_HOME/emulator/emulator-headless`.
    #[serde(default)]
    pub emulator: Option<PathBuf>,

    #[serde(default = "default_explore_script")]
    pub explore_script: PathBuf,
    #[serde(default = "default_extract_script")]
    pub extract_script: PathBuf,
    #[serde(default = "default_replay_script")]
    pub replay_script: PathBuf,
    #[serde(default = "default_logback_dir")]
    pub logback_dir: PathBuf,

    #[serde(default)]
    pub fuzzer: FuzzerConfig,
}

/// Command line overrides of the `run` subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct RunOverrides {
    /// Number of actions of the initial exploration
    #[arg(long)]
    pub action_limit: Option<u32>,

    /// Number of seed input files generated per app
    #[arg(long)]
    pub seeds: Option<u32>,

    /// Experiments running in parallel
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Seconds to wait for the emulators to boot
    #[arg(long)]
    pub boot_wait_secs: Option<u64>,

    /// The avdmanager command, can also be set with the
    /// `AVDMANAGER_COMMAND` environment variable
    #[arg(long)]
    pub avdmanager: Option<PathBuf>,
}

/// Command line overrides of the `fuzz` subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct FuzzOverrides {
    /// Root of the grammar input directories
    #[arg(long)]
    pub input_root: Option<PathBuf>,

    /// Number of seed input files
    #[arg(long)]
    pub seeds: Option<u32>,

    /// Symbols the inputs should cover
    #[arg(long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Maximum number of inputs per seed
    #[arg(long)]
    pub max_inputs: Option<usize>,
}

/// How step 3 turns `grammar.txt` into seed input files.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_max_inputs")]
    pub max_inputs: usize,
    /// External generator invoked as `<command...> <input_root> <avd> <seeds>`,
    /// e.g. `["python3", "grammar_terminal_inputs.py"]`.
    #[serde(default)]
    pub external: Option<Vec<String>>,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_inputs: default_max_inputs(),
            external: None,
        }
    }
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_input_dir() -> PathBuf {
    PathBuf::from("./input")
}
fn default_apks_dir() -> PathBuf {
    PathBuf::from("./apks")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_action_limit() -> u32 {
    500
}
fn default_seeds() -> u32 {
    10
}
fn default_first_emulator_port() -> u16 {
    5554
}
fn default_boot_wait_secs() -> u64 {
    30
}
pub fn default_jobs() -> usize {
    num_cpus::get()
}
fn default_system_image() -> String {
    "system-images;android-28;google_apis;x86".to_owned()
}
fn default_device() -> String {
    "pixel".to_owned()
}
fn default_avdmanager() -> PathBuf {
    PathBuf::from("avdmanager")
}
fn default_explore_script() -> PathBuf {
    PathBuf::from("./01.sh")
}
fn default_extract_script() -> PathBuf {
    PathBuf::from("./02.sh")
}
fn default_replay_script() -> PathBuf {
    PathBuf::from("./04.sh")
}
fn default_logback_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_inputs() -> usize {
    100
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            input_dir: default_input_dir(),
            apks_dir: default_apks_dir(),
            output_dir: default_output_dir(),
            action_limit: default_action_limit(),
            seeds: default_seeds(),
            first_emulator_port: default_first_emulator_port(),
            boot_wait_secs: default_boot_wait_secs(),
            jobs: default_jobs(),
            system_image: default_system_image(),
            device: default_device(),
            avdmanager: default_avdmanager(),
            emulator: None,
            explore_script: default_explore_script(),
            extract_script: default_extract_script(),
            replay_script: default_replay_script(),
            logback_dir: default_logback_dir(),
            fuzzer: FuzzerConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at(path)?;
        Self::from_toml(&content).map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads `path` if given, else `droidgram.toml` of the working
    /// directory if it exists, else the built-in defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        Self::resolve_with_default(path, Path::new(DEFAULT_CONFIG_FILE))
    }

    fn resolve_with_default(path: Option<&Path>, default_path: &Path) -> Result<Self> {
        match path {
            Some(path) => {
                log::info!("Loading configuration from {:?}", path);
                Self::load_from_file(path)
            }
            None => {
                if default_path.exists() {
                    log::info!("Loading default configuration from {:?}", default_path);
                    Self::load_from_file(default_path)
                } else {
                    log::debug!("No configuration file found, using built-in defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Applies the `run` flags. `AVDMANAGER_COMMAND` (passed as
    /// `avdmanager_env`) wins over `--avdmanager`.
    pub fn apply_run_overrides(
        &mut self,
        overrides: &RunOverrides,
        avdmanager_env: Option<OsString>,
    ) {
        if let Some(action_limit) = overrides.action_limit {
            self.action_limit = action_limit;
        }
        if let Some(seeds) = overrides.seeds {
            self.seeds = seeds;
        }
        if let Some(jobs) = overrides.jobs {
            self.jobs = jobs;
        }
        if let Some(boot_wait_secs) = overrides.boot_wait_secs {
            self.boot_wait_secs = boot_wait_secs;
        }
        if let Some(avdmanager) = &overrides.avdmanager {
            self.avdmanager = avdmanager.clone();
        }
        if let Some(command) = avdmanager_env {
            self.avdmanager = PathBuf::from(command);
        }
    }

    pub fn apply_fuzz_overrides(&mut self, overrides: &FuzzOverrides) {
        if let Some(input_root) = &overrides.input_root {
            self.input_dir = input_root.clone();
        }
        if let Some(seeds) = overrides.seeds {
            self.seeds = seeds;
        }
        if let Some(strategy) = overrides.strategy {
            self.fuzzer.strategy = strategy;
        }
        if let Some(max_inputs) = overrides.max_inputs {
            self.fuzzer.max_inputs = max_inputs;
        }
    }

    /// The emulator binary, either configured or derived from `ANDROID_HOME`.
    pub fn emulator_binary(&self) -> Result<PathBuf> {
        if let Some(emulator) = &self.emulator {
            return Ok(emulator.clone());
        }

        let android_home = env::var_os("ANDROID_HOME").ok_or(Error::AndroidHomeMissing)?;
        Ok(PathBuf::from(android_home)
            .join("emulator")
            .join("emulator-headless"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ExperimentConfig::from_toml("").unwrap();
        assert_eq!(config.logs_dir, PathBuf::from("./logs"));
        assert_eq!(config.action_limit, 500);
        assert_eq!(config.seeds, 10);
        assert_eq!(config.first_emulator_port, 5554);
        assert_eq!(config.boot_wait_secs, 30);
        assert_eq!(config.system_image, "system-images;android-28;google_apis;x86");
        assert_eq!(config.fuzzer.strategy, Strategy::Terminal);
        assert!(config.fuzzer.external.is_none());
    }

    #[test]
    fn kebab_case_keys_override_defaults() {
        let config = ExperimentConfig::from_toml(
            r#"
            action-limit = 20
            seeds = 3
            output-dir = "/tmp/out"
            emulator = "/opt/sdk/emulator/emulator"

            [fuzzer]
            strategy = "non-terminal"
            external = ["python3", "grammar_terminal_inputs.py"]
            "#,
        )
        .unwrap();

        assert_eq!(config.action_limit, 20);
        assert_eq!(config.seeds, 3);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.fuzzer.strategy, Strategy::NonTerminal);
        assert_eq!(
            config.fuzzer.external,
            Some(vec!["python3".to_owned(), "grammar_terminal_inputs.py".to_owned()])
        );
        assert_eq!(
            config.emulator_binary().unwrap(),
            PathBuf::from("/opt/sdk/emulator/emulator")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ExperimentConfig::from_toml("action_limit = 3").is_err());
    }

    #[test]
    fn load_from_missing_file_reports_path() {
        let err = ExperimentConfig::load_from_file(Path::new("/nonexistent/droidgram.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/droidgram.toml"));
    }

    #[test]
    fn default_file_is_loaded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join(DEFAULT_CONFIG_FILE);

        let config = ExperimentConfig::resolve_with_default(None, &default_path).unwrap();
        assert_eq!(config.seeds, 10);

        fs::write(&default_path, "seeds = 4\naction-limit = 50\n").unwrap();
        let config = ExperimentConfig::resolve_with_default(None, &default_path).unwrap();
        assert_eq!(config.seeds, 4);
        assert_eq!(config.action_limit, 50);
    }

    #[test]
    fn explicit_path_wins_over_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join(DEFAULT_CONFIG_FILE);
        let explicit = dir.path().join("other.toml");
        fs::write(&default_path, "seeds = 4\n").unwrap();
        fs::write(&explicit, "seeds = 7\n").unwrap();

        let config =
            ExperimentConfig::resolve_with_default(Some(&explicit), &default_path).unwrap();
        assert_eq!(config.seeds, 7);
    }

    #[test]
    fn run_flags_override_config_and_env_overrides_flag() {
        let mut config = ExperimentConfig::from_toml("seeds = 4\njobs = 8\n").unwrap();
        let overrides = RunOverrides {
            seeds: Some(2),
            boot_wait_secs: Some(0),
            avdmanager: Some(PathBuf::from("/flag/avdmanager")),
            ..RunOverrides::default()
        };

        config.apply_run_overrides(&overrides, None);
        assert_eq!(config.seeds, 2);
        assert_eq!(config.jobs, 8);
        assert_eq!(config.boot_wait_secs, 0);
        assert_eq!(config.action_limit, 500);
        assert_eq!(config.avdmanager, PathBuf::from("/flag/avdmanager"));

        config.apply_run_overrides(&overrides, Some(OsString::from("/env/avdmanager")));
        assert_eq!(config.avdmanager, PathBuf::from("/env/avdmanager"));
    }

    #[test]
    fn fuzz_flags_override_config() {
        let mut config =
            ExperimentConfig::from_toml("[fuzzer]\nstrategy = \"non-terminal\"\nmax-inputs = 5\n")
                .unwrap();

        config.apply_fuzz_overrides(&FuzzOverrides::default());
        assert_eq!(config.fuzzer.strategy, Strategy::NonTerminal);
        assert_eq!(config.fuzzer.max_inputs, 5);

        config.apply_fuzz_overrides(&FuzzOverrides {
            input_root: Some(PathBuf::from("/data/input")),
            strategy: Some(Strategy::Terminal),
            ..FuzzOverrides::default()
        });
        assert_eq!(config.input_dir, PathBuf::from("/data/input"));
        assert_eq!(config.fuzzer.strategy, Strategy::Terminal);
        assert_eq!(config.fuzzer.max_inputs, 5);
    }
}
