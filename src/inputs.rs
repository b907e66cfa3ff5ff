//! Seed input files exchanged between the grammar fuzzer and the replay
//! stage.
//!
//! Each seed is a file `inputs<NN>.txt` in the grammar input directory,
//! with one test input per line and the terminals of an input separated
//! by spaces.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::{IoContext, Result};

pub const GRAMMAR_FILE: &str = "grammar.txt";
pub const TRANSLATION_TABLE_FILE: &str = "translationTable.txt";

const INPUTS_PREFIX: &str = "inputs";
const INPUTS_SUFFIX: &str = ".txt";

pub fn inputs_file_name(seed: u32) -> String {
    format!("{}{:02}{}", INPUTS_PREFIX, seed, INPUTS_SUFFIX)
}

/// `inputs07.txt` yields 7; anything not of the form `inputs<digits>.txt`
/// yields `None`.
pub fn parse_seed_number(file_name: &str) -> Option<u32> {
    let digits = file_name
        .strip_prefix(INPUTS_PREFIX)?
        .strip_suffix(INPUTS_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The seed input files directly inside `dir`, ordered by seed number.
pub fn seed_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut seeds: Vec<(u32, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match parse_seed_number(&name) {
            Some(seed) => seeds.push((seed, path)),
            None if name.starts_with(INPUTS_PREFIX) && name.ends_with(INPUTS_SUFFIX) => {
                log::warn!("Ignoring malformed seed file {:?}", path);
            }
            None => {}
        }
    }
    seeds.sort();
    // `inputs7.txt` and `inputs07.txt` name the same seed directory.
    seeds.dedup_by(|duplicate, kept| {
        let same = duplicate.0 == kept.0;
        if same {
            log::warn!(
                "Ignoring {:?}, seed {} is already provided by {:?}",
                duplicate.1,
                kept.0,
                kept.1
            );
        }
        same
    });
    Ok(seeds)
}

/// Non-empty lines of a seed file.
pub fn read_inputs(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).at(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect())
}

pub fn write_inputs(path: &Path, inputs: &[String]) -> Result<()> {
    let mut content = inputs.join("\n");
    content.push('\n');
    fs::write(path, content).at(path)
}

/// Number of terminals in one input line.
pub fn input_size(input: &str) -> usize {
    input.split_whitespace().count()
}
