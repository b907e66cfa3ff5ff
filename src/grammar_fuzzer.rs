//! Coverage guided grammar fuzzer turning `grammar.txt` into seed input
//! files.
//!
//! Derivations always expand the leftmost non-terminal. While the
//! expansion budget lasts, alternatives that introduce not yet covered
//! symbols are preferred, first directly and then through the symbols
//! they can reach. Once the budget is spent the cheapest alternative is
//! taken so every derivation terminates.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    hash::Hasher,
    path::{Path, PathBuf},
};

use fasthash::{farm::Hasher128, FastHasher, HasherExt};
use libafl_bolts::rands::{Rand, StdRand};
use serde::Deserialize;
use strum_macros::{Display, EnumIter};

use crate::config::FuzzerConfig;
use crate::error::Result;
use crate::grammar::{production_cost, Grammar, Production, Symbol};
use crate::inputs;

/// Expansions per input before switching to cheapest alternatives.
const MAX_EXPANSIONS: usize = 100;

/// Which symbols an expansion covers.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display, EnumIter, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    /// Cover every terminal (widget interaction) of the grammar.
    #[default]
    Terminal,
    /// Cover every non-terminal (GUI state) of the grammar.
    NonTerminal,
}

impl Strategy {
    fn tracked<'a>(&self, production: &'a Production) -> Vec<&'a Symbol> {
        match self {
            Strategy::Terminal => production.terminals().collect(),
            Strategy::NonTerminal => production.non_terminals().collect(),
        }
    }

    fn targets(&self, grammar: &Grammar) -> BTreeSet<Symbol> {
        match self {
            Strategy::Terminal => grammar.defined_terminals(),
            Strategy::NonTerminal => grammar.defined_non_terminals(),
        }
    }
}

pub struct GrammarFuzzer {
    grammar: Grammar,
    strategy: Strategy,
    max_inputs: usize,
    rand: StdRand,
    covered: BTreeSet<Symbol>,
    costs: BTreeMap<Symbol, usize>,
    /// Tracked symbols each non-terminal can eventually produce.
    reachable_symbols: BTreeMap<Symbol, BTreeSet<Symbol>>,
}

impl GrammarFuzzer {
    pub fn new(grammar: Grammar, strategy: Strategy, max_inputs: usize) -> Result<Self> {
        grammar.validate()?;

        let costs = grammar.min_costs();
        let reachable_symbols = grammar
            .defined_non_terminals()
            .into_iter()
            .map(|symbol| {
                let produced = grammar
                    .reachable(&symbol)
                    .iter()
                    .flat_map(|reached| grammar.productions(reached))
                    .flat_map(|production| strategy.tracked(production))
                    .cloned()
                    .collect();
                (symbol, produced)
            })
            .collect();

        Ok(Self {
            grammar,
            strategy,
            max_inputs: max_inputs.max(1),
            rand: StdRand::with_seed(0),
            covered: BTreeSet::new(),
            costs,
            reachable_symbols,
        })
    }

    #[cfg(test)]
    pub fn covered(&self) -> &BTreeSet<Symbol> {
        &self.covered
    }

    /// Symbols the current seed still has to cover.
    pub fn uncovered(&self) -> BTreeSet<Symbol> {
        self.strategy
            .targets(&self.grammar)
            .difference(&self.covered)
            .cloned()
            .collect()
    }

    fn reset(&mut self, seed: u64) {
        self.rand = StdRand::with_seed(seed);
        self.covered.clear();
        // The start symbol is never the result of an expansion.
        self.covered.insert(Symbol::start());
    }

    fn new_symbols(&self, production: &Production) -> usize {
        self.strategy
            .tracked(production)
            .into_iter()
            .filter(|symbol| !self.covered.contains(*symbol))
            .count()
    }

    fn reaches_uncovered(&self, production: &Production) -> bool {
        production.non_terminals().any(|symbol| {
            self.reachable_symbols
                .get(symbol)
                .map_or(false, |reachable| !reachable.is_subset(&self.covered))
        })
    }

    /// Indices of the alternatives of `symbol` worth expanding next.
    fn candidates(&self, symbol: &Symbol, budget_spent: bool) -> Vec<usize> {
        let productions = self.grammar.productions(symbol);
        let indices_where = |keep: &dyn Fn(&Production) -> bool| -> Vec<usize> {
            productions
                .iter()
                .enumerate()
                .filter(|(_, production)| keep(*production))
                .map(|(index, _)| index)
                .collect()
        };

        if budget_spent {
            let cost = |production: &Production| {
                production_cost(production, &self.costs).unwrap_or(usize::MAX)
            };
            let cheapest = productions.iter().map(cost).min().unwrap_or(usize::MAX);
            return indices_where(&|production| cost(production) == cheapest);
        }

        let most_new = productions
            .iter()
            .map(|production| self.new_symbols(production))
            .max()
            .unwrap_or(0);
        if most_new > 0 {
            return indices_where(&|production| self.new_symbols(production) == most_new);
        }

        let deep = indices_where(&|production| self.reaches_uncovered(production));
        if deep.is_empty() {
            (0..productions.len()).collect()
        } else {
            deep
        }
    }

    fn choose_production(&mut self, symbol: &Symbol, budget_spent: bool) -> Production {
        let candidates = self.candidates(symbol, budget_spent);
        let picked = candidates[self.rand.below(candidates.len() as u64) as usize];
        self.grammar.productions(symbol)[picked].clone()
    }

    /// Derives one input from `<start>` and returns its terminals.
    pub fn generate_input(&mut self) -> Vec<Symbol> {
        let mut form = vec![Symbol::start()];
        let mut expansions = 0;

        while let Some(position) = form.iter().position(Symbol::is_non_terminal) {
            let symbol = form[position].clone();
            let production = self.choose_production(&symbol, expansions >= MAX_EXPANSIONS);
            expansions += 1;

            let tracked = self.strategy.tracked(&production);
            self.covered.extend(tracked.into_iter().cloned());

            let replacement: Vec<Symbol> = production
                .symbols()
                .iter()
                .filter(|symbol| !symbol.is_epsilon())
                .cloned()
                .collect();
            form.splice(position..=position, replacement);
        }

        form
    }

    /// Generates the distinct inputs of one seed: until every target
    /// symbol is covered or `max_inputs` inputs exist.
    pub fn generate_seed(&mut self, seed: u64) -> Vec<String> {
        self.reset(seed);

        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        let max_attempts = self.max_inputs * 10;

        for _ in 0..max_attempts {
            if lines.len() >= self.max_inputs {
                break;
            }
            if !lines.is_empty() && self.uncovered().is_empty() {
                break;
            }

            let terminals = self.generate_input();
            let line = terminals
                .iter()
                .map(Symbol::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            if line.is_empty() {
                continue;
            }
            if seen.insert(input_hash(&line)) {
                lines.push(line);
            }
        }

        let uncovered = self.uncovered();
        if !uncovered.is_empty() {
            log::warn!(
                "Seed {} left {} symbols uncovered after {} inputs",
                seed,
                uncovered.len(),
                lines.len()
            );
        }

        lines
    }

    /// Writes `inputs00.txt` .. `inputs<count-1>.txt` into `dir`.
    pub fn write_seeds(&mut self, dir: &Path, count: u32) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for seed in 0..count {
            let lines = self.generate_seed(u64::from(seed));
            let path = dir.join(inputs::inputs_file_name(seed));
            log::info!("Writing {} inputs for seed {} to {:?}", lines.len(), seed, path);
            inputs::write_inputs(&path, &lines)?;
            files.push(path);
        }
        Ok(files)
    }
}

fn input_hash(line: &str) -> u128 {
    let mut hasher = Hasher128::new();
    hasher.write(line.as_bytes());
    hasher.finish_ext()
}

/// Runs the built-in fuzzer over `<grammar_input_dir>/grammar.txt`.
pub fn fuzz_seed_inputs(
    grammar_input_dir: &Path,
    config: &FuzzerConfig,
    seeds: u32,
) -> Result<Vec<PathBuf>> {
    let grammar = Grammar::load(&grammar_input_dir.join(inputs::GRAMMAR_FILE))?;
    let mut fuzzer = GrammarFuzzer::new(grammar, config.strategy, config.max_inputs)?;
    fuzzer.write_seeds(grammar_input_dir, seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use strum::IntoEnumIterator;
    use tempfile::tempdir;

    const GRAMMAR: &str = r#"{
        "<start>": ["<s0>"],
        "<s0>": ["click(w1) <s1>", "longClick(w2) <s2>", "<empty>"],
        "<s1>": ["setText(w3,abc) <s0>", "tick(w4)"],
        "<s2>": ["click(w5) <s1>", "<empty>"]
    }"#;

    fn fuzzer(strategy: Strategy) -> GrammarFuzzer {
        let grammar = Grammar::from_json_str(GRAMMAR).unwrap();
        GrammarFuzzer::new(grammar, strategy, 50).unwrap()
    }

    #[test]
    fn every_strategy_reaches_full_coverage() {
        for strategy in Strategy::iter() {
            let mut fuzzer = fuzzer(strategy);
            let lines = fuzzer.generate_seed(1);
            assert!(!lines.is_empty());
            assert!(fuzzer.uncovered().is_empty(), "{} left symbols", strategy);
        }
    }

    #[test]
    fn terminal_inputs_only_contain_defined_terminals() {
        let mut fuzzer = fuzzer(Strategy::Terminal);
        let defined = Grammar::from_json_str(GRAMMAR).unwrap().defined_terminals();

        for line in fuzzer.generate_seed(3) {
            for terminal in line.split(' ') {
                assert!(defined.contains(&Symbol::new(terminal)), "{}", terminal);
            }
        }
        assert!(fuzzer.covered().contains(&Symbol::new("tick(w4)")));
    }

    #[test]
    fn same_seed_same_inputs() {
        let first = fuzzer(Strategy::Terminal).generate_seed(7);
        let second = fuzzer(Strategy::Terminal).generate_seed(7);
        assert_eq!(first, second);
    }

    #[test]
    fn inputs_of_a_seed_are_distinct() {
        let lines = fuzzer(Strategy::Terminal).generate_seed(2);
        let distinct: HashSet<&String> = lines.iter().collect();
        assert_eq!(distinct.len(), lines.len());
    }

    #[test]
    fn recursive_grammar_terminates() {
        let grammar = Grammar::from_json_str(
            r#"{
                "<start>": ["<a>"],
                "<a>": ["x <a> <a>", "y"]
            }"#,
        )
        .unwrap();
        let mut fuzzer = GrammarFuzzer::new(grammar, Strategy::Terminal, 5).unwrap();
        let input = fuzzer.generate_input();
        assert!(input.iter().all(Symbol::is_terminal));
    }

    #[test]
    fn invalid_grammar_is_refused() {
        let grammar = Grammar::from_json_str(r#"{"<start>": ["<nowhere>"]}"#).unwrap();
        assert!(GrammarFuzzer::new(grammar, Strategy::Terminal, 5).is_err());
    }

    #[test]
    fn fuzz_seed_inputs_writes_one_file_per_seed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(inputs::GRAMMAR_FILE), GRAMMAR).unwrap();

        let files = fuzz_seed_inputs(dir.path(), &FuzzerConfig::default(), 3).unwrap();

        assert_eq!(
            files,
            vec![
                dir.path().join("inputs00.txt"),
                dir.path().join("inputs01.txt"),
                dir.path().join("inputs02.txt")
            ]
        );
        for file in files {
            assert!(!inputs::read_inputs(&file).unwrap().is_empty());
        }
    }
}
