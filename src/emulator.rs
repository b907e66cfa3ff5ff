//! Emulator instance backing one experiment.
//!
//! This contains the helpers to create and delete the AVD through
//! `avdmanager` and to start and stop the headless emulator.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};

use subprocess::Popen;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::ports;
use crate::tool::ToolCommand;

const BOOT_WAIT_STEP_SECS: u64 = 10;

#[derive(Debug)]
pub struct Emulator {
    avd_name: String,
    port: u16,
    avdmanager: PathBuf,
    system_image: String,
    device: String,
    /// The headless emulator process, once started.
    process: Mutex<Option<Popen>>,
}

impl Emulator {
    pub fn new(port: u16, config: &ExperimentConfig) -> Self {
        Self {
            avd_name: ports::avd_name(port),
            port,
            avdmanager: config.avdmanager.clone(),
            system_image: config.system_image.clone(),
            device: config.device.clone(),
            process: Mutex::new(None),
        }
    }

    pub fn avd_name(&self) -> &str {
        &self.avd_name
    }

    /// The adb serial, e.g. `emulator-5554`.
    pub fn name(&self) -> String {
        ports::emulator_name(self.port)
    }

    pub fn create_avd_command(&self, logs_dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.avdmanager)
            .arg("create")
            .arg("avd")
            .arg("-n")
            .arg(&self.avd_name)
            .arg("-k")
            .arg(&self.system_image)
            .arg("-d")
            .arg(&self.device)
            .arg("--force")
            .log_to(logs_dir.join("create_avd.log"))
    }

    pub fn delete_avd_command(&self, logs_dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.avdmanager)
            .arg("delete")
            .arg("avd")
            .arg("-n")
            .arg(&self.avd_name)
            .log_to(logs_dir.join("delete_avd.log"))
    }

    pub fn start_command(&self, emulator_binary: &Path, logs_dir: &Path) -> ToolCommand {
        ToolCommand::new(emulator_binary)
            .arg("-avd")
            .arg(&self.avd_name)
            .arg("-port")
            .arg(self.port.to_string())
            .arg("-no-audio")
            .arg("-no-window")
            .arg("-no-snapshot")
            .log_to(logs_dir.join("emulator.log"))
    }

    /// Creates (or overwrites) the AVD of this emulator.
    pub fn create_avd(&self, logs_dir: &Path) -> Result<()> {
        self.create_avd_command(logs_dir).run()?;
        Ok(())
    }

    /// Deletes the AVD of this emulator.
    pub fn delete_avd(&self, logs_dir: &Path) -> Result<()> {
        log::info!("Deleting AVD {}", self.avd_name);
        self.delete_avd_command(logs_dir).run()?;
        Ok(())
    }

    /// Starts the headless emulator in the background.
    pub fn start(&self, emulator_binary: &Path, logs_dir: &Path) -> Result<()> {
        let process = self.start_command(emulator_binary, logs_dir).spawn()?;
        log::info!(
            "Started emulator {} (pid {:?})",
            self.name(),
            process.pid()
        );
        *self.lock_process() = Some(process);
        Ok(())
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.lock_process().is_some()
    }

    /// Sends SIGTERM to the emulator process, if it was started, and reaps it.
    pub fn stop(&self) {
        let Some(mut process) = self.lock_process().take() else {
            return;
        };

        log::info!(
            "Terminating emulator {} with pid {:?}",
            self.name(),
            process.pid()
        );
        if let Err(err) = process.terminate() {
            log::warn!("Failed to terminate emulator {}: {}", self.name(), err);
            return;
        }
        if let Err(err) = process.wait() {
            log::warn!("Failed to wait for emulator {}: {}", self.name(), err);
        }
    }

    /// Stops the emulator and removes its AVD.
    pub fn terminate(&self, logs_dir: &Path) -> Result<()> {
        self.stop();
        self.delete_avd(logs_dir)
    }

    fn lock_process(&self) -> std::sync::MutexGuard<'_, Option<Popen>> {
        // A poisoned lock still holds a valid handle.
        self.process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sleeps `secs` seconds, logging the remaining time every ten seconds.
pub fn wait_for_boot(secs: u64) {
    let mut remaining = secs;
    while remaining > 0 {
        log::info!("Waiting {} seconds for all emulators to start", remaining);
        let step = remaining.min(BOOT_WAIT_STEP_SECS);
        thread::sleep(Duration::from_secs(step));
        remaining -= step;
    }
    log::info!("Assuming that ALL emulators have started, proceeding");
}
