//! Grammar and code coverage of a finished experiment.
//!
//! Reads what the replay stage leaves in every `output/<avd>/seed<N>`
//! directory and writes per seed `grammarCoverage.txt` and
//! `codeCoverage.txt`, plus `inputSize.txt`, a tab separated
//! `summary.txt` and the per app `appSummary.txt` for the experiment.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Write},
    fs,
    path::{Path, PathBuf},
};

use crate::config::ExperimentConfig;
use crate::error::{Error, IoContext, Result};
use crate::inputs;
use crate::layout::RunLayout;
use crate::util;

/// Written by the replay model for every input it could execute.
pub const REACHED_TERMINALS_FILE: &str = "reachedTerminals.txt";
pub const GRAMMAR_COVERAGE_FILE: &str = "grammarCoverage.txt";
pub const CODE_COVERAGE_FILE: &str = "codeCoverage.txt";
pub const INPUT_SIZE_FILE: &str = "inputSize.txt";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const APP_SUMMARY_FILE: &str = "appSummary.txt";

const INSTRUMENTATION_SUFFIX: &str = ".apk.json";

#[derive(Clone, Debug, PartialEq)]
pub struct CoverageResult<T: Ord> {
    pub all: BTreeSet<T>,
    pub reached: BTreeSet<T>,
    pub missed: BTreeSet<T>,
}

impl<T: Ord + Clone + fmt::Display> CoverageResult<T> {
    pub fn new(all: BTreeSet<T>, reached: BTreeSet<T>) -> Self {
        let missed = all.difference(&reached).cloned().collect();
        Self {
            all,
            reached,
            missed,
        }
    }

    /// Share of `all` that was reached, 0 when there is nothing to reach.
    pub fn coverage(&self) -> f64 {
        if self.all.is_empty() {
            return 0.0;
        }
        (self.all.len() - self.missed.len()) as f64 / self.all.len() as f64
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(text, "Total: {}", self.all.len());
        let _ = writeln!(text, "Reached: {}", self.reached.len());
        let _ = writeln!(text, "Missed: {}", self.missed.len());
        let _ = writeln!(text, "Coverage: {}", self.coverage());
        let _ = writeln!(text, "Missed entries:");
        for missed in &self.missed {
            let _ = writeln!(text, "{}", missed);
        }
        text
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).at(path)
    }
}

/// Normalises one line of `reachedTerminals.txt` to the terminal it
/// stands for: the text before `);`, closed with `)`.
pub fn parse_reached_terminal(line: &str) -> Option<String> {
    let head = line.split(");").next().unwrap_or(line).trim();
    let terminal = format!("{})", head);
    if terminal.contains('(') && terminal.ends_with(')') {
        Some(terminal)
    } else {
        None
    }
}

/// Terminals reached in any replay below `dir`.
pub fn reached_terminals(dir: &Path) -> Result<BTreeSet<String>> {
    let files = util::walk_files(dir, &|path: &Path| {
        path.file_name()
            .map_or(false, |name| name == REACHED_TERMINALS_FILE)
    })?;

    let mut reached = BTreeSet::new();
    for file in files {
        let content = fs::read_to_string(&file).at(&file)?;
        for line in content.lines().filter(|line| !line.is_empty()) {
            let terminal = parse_reached_terminal(line).ok_or_else(|| Error::Report {
                path: file.clone(),
                entry: line.to_owned(),
            })?;
            reached.insert(terminal);
        }
    }
    Ok(reached)
}

/// Statement ids found in `*/coverage/*-statements-*` files below `dir`.
pub fn reached_statements(dir: &Path) -> Result<BTreeSet<u64>> {
    let files = util::walk_files(dir, &|path: &Path| {
        let in_coverage_dir = path
            .parent()
            .and_then(Path::file_name)
            .map_or(false, |name| name == "coverage")
            || path.to_string_lossy().contains("/coverage/");
        let is_statements = path
            .file_name()
            .map_or(false, |name| name.to_string_lossy().contains("-statements-"));
        in_coverage_dir && is_statements
    })?;

    let count = files.len();
    let mut reached = BTreeSet::new();
    for (index, file) in files.iter().enumerate() {
        log::debug!("Processing file {:?} ({}/{})", file, index, count);
        if index % 100 == 0 {
            log::info!("Processing file {:?} ({}/{})", file, index, count);
        }

        let content = fs::read_to_string(file).at(file)?;
        for line in content.lines().filter(|line| !line.is_empty()) {
            let id = line.split(';').next().unwrap_or(line).trim();
            let id = id.parse::<u64>().map_err(|_| Error::Report {
                path: file.clone(),
                entry: line.to_owned(),
            })?;
            reached.insert(id);
        }
    }
    Ok(reached)
}

/// Distinct terminals of the given input lines.
pub fn input_terminals(inputs: &[String]) -> BTreeSet<String> {
    inputs
        .iter()
        .flat_map(|input| input.split_whitespace())
        .map(str::to_owned)
        .collect()
}

pub fn grammar_coverage(inputs: &[String], dir: &Path) -> Result<CoverageResult<String>> {
    let result = CoverageResult::new(input_terminals(inputs), reached_terminals(dir)?);
    check_ratio("terminal", result.coverage());
    Ok(result)
}

pub fn code_coverage(statements: &BTreeSet<u64>, dir: &Path) -> Result<CoverageResult<u64>> {
    let result = CoverageResult::new(statements.clone(), reached_statements(dir)?);
    check_ratio("code", result.coverage());
    Ok(result)
}

fn check_ratio(kind: &str, coverage: f64) {
    if !(0.0..=1.0).contains(&coverage) {
        log::warn!(
            "Expected {} coverage between 0 and 1. Found {}",
            kind,
            coverage
        );
    }
}

pub fn render_input_size(inputs: &[String]) -> String {
    let sizes: Vec<usize> = inputs.iter().map(|input| inputs::input_size(input)).collect();
    let mut text = format!("Total input size: {}\n", sizes.iter().sum::<usize>());
    for (index, size) in sizes.iter().enumerate() {
        text.push_str(&format!("{}\t{}\n", index, size));
    }
    text
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeedRow {
    pub seed: u32,
    pub input_size: usize,
    pub grammar: CoverageResult<String>,
    pub code: CoverageResult<u64>,
}

impl fmt::Display for SeedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.seed,
            self.input_size,
            self.grammar.reached.len(),
            self.grammar.missed.len(),
            self.grammar.coverage(),
            self.code.reached.len(),
            self.code.missed.len(),
            self.code.coverage()
        )
    }
}

pub fn render_summary(rows: &[SeedRow]) -> String {
    let mut text = String::from(
        "Seed\tInput Size\tGrammarReached\tGrammarMissed\tGrammarCov\tCodeReached\tCodeMissed\tCodeCov\n",
    );
    for row in rows {
        text.push_str(&row.to_string());
        text.push('\n');
    }
    text
}

/// Per app figures shared by every seed of an experiment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppData {
    pub avd_name: String,
    /// Statements instrumented in the apk, the keys of `allMethods`.
    pub instrumented_statements: usize,
    pub translation_entries: usize,
    /// Statements reached by the exploration the grammar was extracted from.
    pub original_statements: usize,
}

impl fmt::Display for AppData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.avd_name,
            self.instrumented_statements,
            self.translation_entries,
            self.original_statements
        )
    }
}

pub fn render_app_summary(app: &AppData) -> String {
    format!(
        "App\tInstrumentedStatements\tTranslationEntries\tOriginalStatements\n{}\n",
        app
    )
}

/// Everything `generate` computed for one experiment.
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentReport {
    pub app: AppData,
    pub seeds: Vec<SeedRow>,
}

/// The first `*.apk.json` instrumentation file below `apk_dir`.
pub fn find_instrumentation_file(apk_dir: &Path) -> Result<PathBuf> {
    util::walk_files(apk_dir, &|path: &Path| {
        path.file_name()
            .map_or(false, |name| name.to_string_lossy().ends_with(INSTRUMENTATION_SUFFIX))
    })?
    .into_iter()
    .next()
    .ok_or_else(|| Error::MissingArtifact(apk_dir.join(format!("*{}", INSTRUMENTATION_SUFFIX))))
}

/// Statement ids listed under `allMethods` in an instrumentation file.
pub fn instrumented_statements(json_file: &Path) -> Result<BTreeSet<u64>> {
    let content = fs::read_to_string(json_file).at(json_file)?;
    let json: serde_json::Value =
        serde_json::from_str(&content).map_err(|source| Error::InstrumentationParse {
            path: json_file.to_owned(),
            source,
        })?;

    let methods = json
        .get("allMethods")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| Error::Report {
            path: json_file.to_owned(),
            entry: "allMethods".to_owned(),
        })?;

    methods
        .keys()
        .map(|key| {
            key.parse::<u64>().map_err(|_| Error::Report {
                path: json_file.to_owned(),
                entry: key.clone(),
            })
        })
        .collect()
}

/// Non-empty lines of the translation table, 0 when the file is missing.
pub fn translation_entries(input_dir: &Path) -> Result<usize> {
    let file = input_dir.join(inputs::TRANSLATION_TABLE_FILE);
    if !file.is_file() {
        log::warn!("Input directory {:?} missing translation table file", input_dir);
        return Ok(0);
    }
    let content = fs::read_to_string(&file).at(&file)?;
    Ok(content.lines().filter(|line| !line.is_empty()).count())
}

/// `seed<N>` directories of `dir`, ordered by N.
fn seed_dirs(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut seeds = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        let seed = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("seed"))
            .and_then(|number| number.parse::<u32>().ok());
        if let (Some(seed), true) = (seed, path.is_dir()) {
            seeds.push((seed, path));
        }
    }
    seeds.sort();
    Ok(seeds)
}

/// Builds every report file for the experiment run on `avd_name`.
pub fn generate(config: &ExperimentConfig, avd_name: &str) -> Result<ExperimentReport> {
    let layout = RunLayout::base(config, avd_name);
    let input_dir = &layout.grammar_input_dir;
    let output_dir = &layout.output_dir;
    log::debug!("Processing input dir: {:?}", input_dir);
    log::debug!("Processing output dir: {:?}", output_dir);

    let model_dir = layout.grammar_model_dir();
    if !model_dir.is_dir() {
        log::warn!("Exploration model not found in {:?}", model_dir);
    }

    let json_file = find_instrumentation_file(&layout.apk_dir)?;
    log::debug!("Processing instrumentation file: {:?}", json_file);
    let instrumented = instrumented_statements(&json_file)?;
    let translation_entries = translation_entries(input_dir)?;

    let mut seed_inputs = BTreeMap::new();
    for (seed, file) in inputs::seed_files(input_dir)? {
        seed_inputs.insert(seed, inputs::read_inputs(&file)?);
    }
    if seed_inputs.is_empty() {
        log::warn!("Input directory {:?} doesn't contain any input file (inputs*.txt)", input_dir);
    }
    if seed_inputs.len() != config.seeds as usize {
        log::warn!(
            "Expecting {} seeds per app. Found {}",
            config.seeds,
            seed_inputs.len()
        );
    }

    let statements = reached_statements(&model_dir)?;
    log::info!("Original exploration reached {} statements", statements.len());
    let app = AppData {
        avd_name: avd_name.to_owned(),
        instrumented_statements: instrumented.len(),
        translation_entries,
        original_statements: statements.len(),
    };

    let seed_dirs = seed_dirs(output_dir)?;
    if seed_dirs.len() != config.seeds as usize {
        log::warn!(
            "Expecting {} seed results. Found {}",
            config.seeds,
            seed_dirs.len()
        );
    }

    let mut rows = Vec::new();
    for (seed, seed_dir) in seed_dirs {
        let Some(seed_input) = seed_inputs.get(&seed) else {
            log::warn!("No inputs for seed result {:?}, skipping", seed_dir);
            continue;
        };
        log::info!("Writing seed {} into summary", seed);

        let grammar = grammar_coverage(seed_input, &seed_dir)?;
        grammar.save(&seed_dir.join(GRAMMAR_COVERAGE_FILE))?;
        let code = code_coverage(&statements, &seed_dir)?;
        code.save(&seed_dir.join(CODE_COVERAGE_FILE))?;

        rows.push(SeedRow {
            seed,
            input_size: seed_input.iter().map(|input| inputs::input_size(input)).sum(),
            grammar,
            code,
        });
    }

    let all_inputs: Vec<String> = seed_inputs.into_values().flatten().collect();
    let input_size_file = output_dir.join(INPUT_SIZE_FILE);
    fs::write(&input_size_file, render_input_size(&all_inputs)).at(&input_size_file)?;

    let summary_file = output_dir.join(SUMMARY_FILE);
    fs::write(&summary_file, render_summary(&rows)).at(&summary_file)?;
    log::info!("Wrote summary of {} seeds to {:?}", rows.len(), summary_file);

    let app_file = output_dir.join(APP_SUMMARY_FILE);
    fs::write(&app_file, render_app_summary(&app)).at(&app_file)?;

    Ok(ExperimentReport { app, seeds: rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn reached_terminal_lines_are_normalised() {
        assert_eq!(
            parse_reached_terminal("click(w1);Click on widget w1"),
            Some("click(w1)".to_owned())
        );
        assert_eq!(
            parse_reached_terminal("  setText(w2,abc)"),
            Some("setText(w2,abc))".to_owned())
        );
        assert_eq!(parse_reached_terminal("garbage"), None);
    }

    #[test]
    fn coverage_ratio() {
        let result = CoverageResult::new(set(&["a", "b", "c", "d"]), set(&["a", "c", "x"]));
        assert_eq!(result.missed, set(&["b", "d"]));
        assert_eq!(result.coverage(), 0.5);
        assert!(result.render().contains("Coverage: 0.5"));

        let empty: CoverageResult<String> = CoverageResult::new(BTreeSet::new(), set(&["a"]));
        assert_eq!(empty.coverage(), 0.0);
    }

    #[test]
    fn reached_statements_only_reads_coverage_files() {
        let dir = tempdir().unwrap();
        let coverage = dir.path().join("model").join("coverage");
        fs::create_dir_all(&coverage).unwrap();
        fs::write(coverage.join("app-statements-1"), "10;a\n11;b\n\n").unwrap();
        fs::write(coverage.join("app-statements-2"), "11;b\n12;c\n").unwrap();
        fs::write(coverage.join("app-methods-1"), "99;m\n").unwrap();
        fs::write(dir.path().join("model").join("x-statements-3"), "98;n\n").unwrap();

        let reached = reached_statements(dir.path()).unwrap();
        assert_eq!(reached, [10, 11, 12].into_iter().collect());
    }

    #[test]
    fn malformed_statement_is_an_error() {
        let dir = tempdir().unwrap();
        let coverage = dir.path().join("coverage");
        fs::create_dir_all(&coverage).unwrap();
        fs::write(coverage.join("app-statements-1"), "abc;x\n").unwrap();

        assert!(matches!(
            reached_statements(dir.path()),
            Err(Error::Report { .. })
        ));
    }

    #[test]
    fn input_size_report() {
        let inputs = vec!["a(1) b(2)".to_owned(), "c(3)".to_owned()];
        assert_eq!(render_input_size(&inputs), "Total input size: 3\n0\t2\n1\t1\n");
    }

    #[test]
    fn generate_writes_summary_for_every_seed() {
        let root = tempdir().unwrap();
        let config = ExperimentConfig {
            input_dir: root.path().join("input"),
            output_dir: root.path().join("output"),
            seeds: 2,
            ..ExperimentConfig::default()
        };
        let layout = RunLayout::base(&config, "emulator5554");

        fs::create_dir_all(&layout.apk_dir).unwrap();
        fs::write(layout.apk_dir.join("app.apk"), "apk").unwrap();
        fs::write(
            layout.apk_dir.join("app.apk.json"),
            r#"{"allMethods": {"1": "a", "2": "b", "3": "c", "4": "d", "5": "e"}}"#,
        )
        .unwrap();

        let model_coverage = layout.grammar_model_dir().join("coverage");
        fs::create_dir_all(&model_coverage).unwrap();
        fs::write(model_coverage.join("app-statements-0"), "1;x\n2;y\n3;z\n4;w\n").unwrap();
        fs::write(
            layout.grammar_input_dir.join("translationTable.txt"),
            "w1;u1\nw2;u2\n\n",
        )
        .unwrap();
        fs::write(
            layout.grammar_input_dir.join("inputs00.txt"),
            "click(w1) tick(w2)\nlongClick(w3)\n",
        )
        .unwrap();
        fs::write(layout.grammar_input_dir.join("inputs01.txt"), "click(w1)\n").unwrap();

        let seed0 = layout.output_dir.join("seed0");
        fs::create_dir_all(seed0.join("model").join("coverage")).unwrap();
        fs::write(seed0.join("model").join(REACHED_TERMINALS_FILE), "click(w1);c\ntick(w2);t\n").unwrap();
        fs::write(seed0.join("model").join("coverage").join("app-statements-5"), "1;x\n2;y\n").unwrap();

        let seed1 = layout.output_dir.join("seed1");
        fs::create_dir_all(&seed1).unwrap();
        fs::write(seed1.join(REACHED_TERMINALS_FILE), "click(w1);c\n").unwrap();

        let report = generate(&config, "emulator5554").unwrap();
        let rows = &report.seeds;

        assert_eq!(
            report.app,
            AppData {
                avd_name: "emulator5554".to_owned(),
                instrumented_statements: 5,
                translation_entries: 2,
                original_statements: 4,
            }
        );
        let app_summary = fs::read_to_string(layout.output_dir.join(APP_SUMMARY_FILE)).unwrap();
        assert_eq!(
            app_summary,
            "App\tInstrumentedStatements\tTranslationEntries\tOriginalStatements\n\
             emulator5554\t5\t2\t4\n"
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].input_size, 3);
        assert_eq!(rows[0].grammar.reached.len(), 2);
        assert_eq!(rows[0].grammar.missed, set(&["longClick(w3)"]));
        assert_eq!(rows[0].code.coverage(), 0.5);
        assert_eq!(rows[1].grammar.coverage(), 1.0);
        assert_eq!(rows[1].code.coverage(), 0.0);

        let summary = fs::read_to_string(layout.output_dir.join(SUMMARY_FILE)).unwrap();
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Seed\tInput Size"));
        assert!(lines[1].starts_with("0\t3\t2\t1\t"));
        assert!(seed0.join(GRAMMAR_COVERAGE_FILE).is_file());
        assert!(seed1.join(CODE_COVERAGE_FILE).is_file());
        assert!(layout.output_dir.join(INPUT_SIZE_FILE).is_file());
    }

    #[test]
    fn instrumentation_requires_numeric_all_methods_keys() {
        let dir = tempdir().unwrap();
        let json = dir.path().join("app.apk.json");

        fs::write(&json, r#"{"allMethods": {"7": "m", "9": "n"}}"#).unwrap();
        assert_eq!(
            instrumented_statements(&json).unwrap(),
            [7, 9].into_iter().collect()
        );

        fs::write(&json, r#"{"allMethods": {"x": "m"}}"#).unwrap();
        assert!(matches!(
            instrumented_statements(&json),
            Err(Error::Report { .. })
        ));

        fs::write(&json, r#"{"methods": {}}"#).unwrap();
        assert!(instrumented_statements(&json).is_err());
    }

    #[test]
    fn missing_instrumentation_file_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("app.apk"), "apk").unwrap();
        assert!(matches!(
            find_instrumentation_file(dir.path()),
            Err(Error::MissingArtifact(_))
        ));
    }
}
