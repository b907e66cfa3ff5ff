//! Input grammar extracted from an exploration run.
//!
//! `grammar.txt` is a JSON object mapping every non-terminal to its list
//! of expansions:
//!
//! ```text
//! {
//!     "<start>": ["<s0>"],
//!     "<s0>": ["click(w1) <s1>", "<empty>"],
//!     "<s1>": ["setText(w2) longClick(w3)"]
//! }
//! ```
//!
//! Within an expansion, `<...>` tokens are non-terminals and the remaining
//! text splits on whitespace into terminals. `<empty>` is epsilon.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::Path,
    sync::OnceLock,
};

use regex::Regex;

use crate::error::{Error, IoContext, Result};

const START: &str = "<start>";
const EPSILON: &str = "<empty>";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn start() -> Self {
        Self::new(START)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_epsilon(&self) -> bool {
        self.0 == EPSILON
    }

    /// Non-terminals are written `<name>`; epsilon is neither.
    pub fn is_non_terminal(&self) -> bool {
        self.0.starts_with('<') && !self.is_epsilon()
    }

    pub fn is_terminal(&self) -> bool {
        !self.0.starts_with('<')
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One alternative of a rule: an ordered list of symbols.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Production {
    symbols: Vec<Symbol>,
}

fn non_terminal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^<>\s]+>").expect("static regex"))
}

impl Production {
    /// Tokenises an expansion string.
    pub fn parse(expansion: &str) -> Self {
        let mut symbols = Vec::new();
        let push_terminals = |text: &str, symbols: &mut Vec<Symbol>| {
            symbols.extend(text.split_whitespace().map(Symbol::new));
        };

        let mut last = 0;
        for found in non_terminal_pattern().find_iter(expansion) {
            push_terminals(&expansion[last..found.start()], &mut symbols);
            symbols.push(Symbol::new(found.as_str()));
            last = found.end();
        }
        push_terminals(&expansion[last..], &mut symbols);

        Self { symbols }
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn terminals(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|symbol| symbol.is_terminal())
    }

    pub fn non_terminals(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|symbol| symbol.is_non_terminal())
    }

    /// True for the empty production and for productions of only `<empty>`.
    pub fn is_epsilon(&self) -> bool {
        self.symbols.iter().all(Symbol::is_epsilon)
    }
}

impl fmt::Display for Production {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.symbols.iter().map(Symbol::as_str).collect();
        f.write_str(&parts.join(" "))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grammar {
    rules: BTreeMap<Symbol, Vec<Production>>,
}

impl Grammar {
    pub fn from_json_str(content: &str) -> std::result::Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(content)?;
        let rules = raw
            .into_iter()
            .map(|(key, expansions)| {
                let productions = expansions.iter().map(|e| Production::parse(e)).collect();
                (Symbol::new(key), productions)
            })
            .collect();
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).at(path)?;
        Self::from_json_str(&content).map_err(|source| Error::GrammarParse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn productions(&self, symbol: &Symbol) -> &[Production] {
        self.rules.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn defined_non_terminals(&self) -> BTreeSet<Symbol> {
        self.rules.keys().cloned().collect()
    }

    pub fn defined_terminals(&self) -> BTreeSet<Symbol> {
        self.rules
            .values()
            .flatten()
            .flat_map(Production::terminals)
            .cloned()
            .collect()
    }

    /// Non-terminals reachable from `from`, including itself.
    pub fn reachable(&self, from: &Symbol) -> BTreeSet<Symbol> {
        let mut seen = BTreeSet::new();
        let mut pending = vec![from.clone()];
        while let Some(symbol) = pending.pop() {
            if !seen.insert(symbol.clone()) {
                continue;
            }
            for production in self.productions(&symbol) {
                pending.extend(production.non_terminals().cloned());
            }
        }
        seen
    }

    /// Minimal derivation depth of every non-terminal that can derive a
    /// string of terminals.
    pub fn min_costs(&self) -> BTreeMap<Symbol, usize> {
        let mut costs: BTreeMap<Symbol, usize> = BTreeMap::new();
        loop {
            let mut changed = false;
            for (symbol, productions) in &self.rules {
                let best = productions
                    .iter()
                    .filter_map(|production| production_cost(production, &costs))
                    .min();
                if let Some(best) = best {
                    if costs.get(symbol).map_or(true, |current| best < *current) {
                        costs.insert(symbol.clone(), best);
                        changed = true;
                    }
                }
            }
            if !changed {
                return costs;
            }
        }
    }

    /// Checks the grammar can drive the fuzzer: `<start>` is defined,
    /// every referenced non-terminal is defined and has an alternative,
    /// every rule is reachable from `<start>` and can terminate.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let start = Symbol::start();

        if !self.rules.contains_key(&start) {
            problems.push(format!("{} is not defined", start));
        }

        for (symbol, productions) in &self.rules {
            if productions.is_empty() {
                problems.push(format!("{} has no productions", symbol));
            }
            for used in productions.iter().flat_map(Production::non_terminals) {
                if !self.rules.contains_key(used) {
                    problems.push(format!("{} used in {} is not defined", used, symbol));
                }
            }
        }

        let reachable = self.reachable(&start);
        for symbol in self.rules.keys().filter(|s| !reachable.contains(*s)) {
            problems.push(format!("{} is unreachable from {}", symbol, start));
        }

        let costs = self.min_costs();
        for symbol in self.rules.keys().filter(|s| !costs.contains_key(*s)) {
            problems.push(format!("{} never derives a terminal string", symbol));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidGrammar(problems.join("; ")))
        }
    }
}

/// Cost of expanding `production` given the costs known so far, `None`
/// while one of its non-terminals has no known cost.
pub fn production_cost(production: &Production, costs: &BTreeMap<Symbol, usize>) -> Option<usize> {
    production
        .non_terminals()
        .map(|symbol| costs.get(symbol).copied())
        .try_fold(0, |max, cost| cost.map(|cost| max.max(cost)))
        .map(|max| max + 1)
}
