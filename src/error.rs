//! Error type shared by the experiment runner.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to run {command}: {reason}")]
    Command { command: String, reason: String },
    #[error("ANDROID_HOME is not set and no emulator binary was configured")]
    AndroidHomeMissing,
    #[error("Invalid grammar: {0}")]
    InvalidGrammar(String),
    #[error("Failed to parse grammar file {path:?}: {source}")]
    GrammarParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to parse config file {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to parse instrumentation file {path:?}: {source}")]
    InstrumentationParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid report entry in {path:?}: {entry}")]
    Report { path: PathBuf, entry: String },
    #[error("Missing artifact: {0:?}")]
    MissingArtifact(PathBuf),
    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("No emulator port left after {0}")]
    PortsExhausted(u16),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches the offending path to an I/O error.
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
