//! Invocation of the external tools driving an experiment: the stage
//! scripts, `avdmanager` and the emulator itself.

use std::{
    ffi::OsString,
    fmt,
    fs::File,
    path::PathBuf,
};

use subprocess::{Exec, ExitStatus, Popen, Redirection};

use crate::error::{Error, IoContext, Result};

#[derive(Clone, Debug)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    /// When set, stdout and stderr are written to this file instead of
    /// being inherited.
    log_file: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn log_to(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    #[cfg(test)]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    #[cfg(test)]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    fn exec(&self) -> Result<Exec> {
        let mut exec = Exec::cmd(&self.program).args(self.args.as_slice());
        if let Some(log_file) = &self.log_file {
            let file = File::create(log_file).at(log_file)?;
            exec = exec
                .stdout(Redirection::File(file))
                .stderr(Redirection::Merge);
        }
        Ok(exec)
    }

    /// Runs the command to completion.
    ///
    /// Only a failure to launch is an error. A non-zero exit is logged and
    /// returned to the caller, which decides based on the produced
    /// artifacts.
    pub fn run(&self) -> Result<ExitStatus> {
        log::info!("Running command {}", self);
        let status = self.exec()?.join().map_err(|err| Error::Command {
            command: self.to_string(),
            reason: err.to_string(),
        })?;

        if !status.success() {
            log::warn!("Command {} finished with {:?}", self, status);
        }

        Ok(status)
    }

    /// Starts the command without waiting for it.
    pub fn spawn(&self) -> Result<Popen> {
        log::info!("Starting process {}", self);
        self.exec()?.popen().map_err(|err| Error::Command {
            command: self.to_string(),
            reason: err.to_string(),
        })
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}
