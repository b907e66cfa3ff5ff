//! Directory layout of one experiment run.
//!
//! A base run owns `<root>/<avd>` in each of the input, output, apks and
//! logs roots. A seed run nests below its parent's directories as
//! `seed<N>` and shares the parent's apk directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::ExperimentConfig;
use crate::error::{Error, IoContext, Result};
use crate::util;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLayout {
    pub grammar_input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub apk_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl RunLayout {
    pub fn base(config: &ExperimentConfig, avd_name: &str) -> Self {
        Self {
            grammar_input_dir: config.input_dir.join(avd_name),
            output_dir: config.output_dir.join(avd_name),
            apk_dir: config.apks_dir.join(avd_name),
            logs_dir: config.logs_dir.join(avd_name),
        }
    }

    pub fn seed(config: &ExperimentConfig, parent_avd_name: &str, seed: u32) -> Self {
        let seed_dir = seed_dir_name(seed);
        Self {
            grammar_input_dir: config.input_dir.join(parent_avd_name).join(&seed_dir),
            output_dir: config.output_dir.join(parent_avd_name).join(&seed_dir),
            apk_dir: config.apks_dir.join(parent_avd_name),
            logs_dir: config.logs_dir.join(parent_avd_name).join(&seed_dir),
        }
    }

    pub fn describe(&self) {
        log::debug!("Grammar input dir: {:?}", self.grammar_input_dir);
        log::debug!("Output dir: {:?}", self.output_dir);
        log::debug!("APKs dir: {:?}", self.apk_dir);
        log::debug!("Logs dir: {:?}", self.logs_dir);
    }

    pub fn clean_logs_dir(&self) -> Result<()> {
        util::reset_dir(&self.logs_dir)
    }

    pub fn clean_output_dir(&self) -> Result<()> {
        util::reset_dir(&self.output_dir)
    }

    pub fn clean_grammar_input_dir(&self) -> Result<()> {
        util::reset_dir(&self.grammar_input_dir)
    }

    /// Resets the apk directory and copies the apk and its instrumentation
    /// file into it.
    pub fn copy_original_apk(&self, apk: &Path) -> Result<()> {
        util::reset_dir(&self.apk_dir)?;
        util::copy_into(apk, &self.apk_dir)?;

        let json = instrumentation_json(apk);
        if !json.is_file() {
            return Err(Error::MissingArtifact(json));
        }
        util::copy_into(&json, &self.apk_dir)
    }

    /// Where the exploration tool stores its model.
    pub fn exploration_model_dir(&self) -> PathBuf {
        self.output_dir.join(MODEL_DIR)
    }

    /// Where the grammar extraction expects the exploration model.
    pub fn grammar_model_dir(&self) -> PathBuf {
        self.grammar_input_dir.join(MODEL_DIR)
    }
}

/// Name of the exploration model directory produced by the explore stage.
pub const MODEL_DIR: &str = "droidMate";

pub fn seed_dir_name(seed: u32) -> String {
    format!("seed{}", seed)
}

/// The instrumentation file accompanying an apk:
/// `app-instrumented.apk` maps to `app.apk.json`.
pub fn instrumentation_json(apk: &Path) -> PathBuf {
    let path = apk.to_string_lossy();
    PathBuf::from(path.replace("-instrumented", "").replace(".apk", ".apk.json"))
}

/// Regular files ending in `.apk` directly inside `dir`, sorted by path.
pub fn apk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut apks = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        let is_apk = path
            .file_name()
            .map_or(false, |name| name.to_string_lossy().ends_with(".apk"));
        if is_apk && path.is_file() {
            apks.push(path);
        }
    }
    apks.sort();
    Ok(apks)
}
