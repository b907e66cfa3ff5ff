//! Emulator console port allocation.
//!
//! Every emulator occupies a console port and the adb port right after it,
//! so consecutive instances are two ports apart.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

const PORT_STEP: u16 = 2;

#[derive(Debug)]
pub struct PortAllocator {
    /// Wider than a port so that running past 65535 is detected, not wrapped.
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(first_port: u16) -> Self {
        Self {
            next: AtomicU32::new(u32::from(first_port)),
        }
    }

    /// Hands out the current port and advances by one emulator slot.
    pub fn next(&self) -> Result<u16> {
        let port = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| {
                u16::try_from(port).ok()?;
                port.checked_add(u32::from(PORT_STEP))
            })
            .map_err(|port| {
                let last = port.saturating_sub(u32::from(PORT_STEP));
                Error::PortsExhausted(u16::try_from(last).unwrap_or(u16::MAX))
            })?;
        Ok(u16::try_from(port).unwrap_or(u16::MAX))
    }
}

/// adb serial of the emulator listening on `port`.
pub fn emulator_name(port: u16) -> String {
    format!("emulator-{}", port)
}

/// AVD name used for the emulator listening on `port`.
pub fn avd_name(port: u16) -> String {
    format!("emulator{}", port)
}
