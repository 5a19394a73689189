//! RS-485 direction-control lines.
//!
//! A half-duplex transceiver needs its driver enabled to transmit and its
//! receiver re-enabled afterwards. Two wirings exist in the field: a single
//! legacy line tying DE and /RE together, or independent DE and RE lines
//! with configurable RE polarity. Hardware absence or configuration failure
//! degrades to no direction control; the message layer keeps working.
//!
//! Line writes are fast synchronous calls and never suspension points, so
//! the transmit/receive ordering around serial writes is preserved.

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use crate::config::DirectionConfig;
use crate::tracing::prelude::*;

const CONSUMER: &str = "buslink-dir";

/// Control over the transceiver direction lines.
///
/// Failures are handled internally: a line toggle that fails is logged and
/// ignored, matching the degrade-to-no-control contract.
pub trait DirectionControl: Send {
    /// Assert the transmit direction: DE high, RE inactive.
    fn set_transmit(&mut self);

    /// Restore the receive direction: DE low, RE active.
    fn set_receive(&mut self);

    /// Drive every controlled line low, then release it.
    fn release(&mut self);
}

/// No hardware direction control (automatic-direction transceivers, or
/// fallback after a GPIO configuration failure).
pub struct NoDirection;

impl DirectionControl for NoDirection {
    fn set_transmit(&mut self) {}
    fn set_receive(&mut self) {}
    fn release(&mut self) {}
}

enum Lines {
    /// One line drives DE and /RE together: high = transmit.
    Combined { line: LineHandle },
    /// Independent driver-enable and receiver-enable lines.
    Split {
        de: LineHandle,
        re: LineHandle,
        re_active_low: bool,
    },
}

/// Direction control over GPIO character-device lines.
pub struct GpioDirection {
    lines: Option<Lines>,
}

impl GpioDirection {
    /// Request the configured lines, degrading to [`NoDirection`] when no
    /// pins are configured or the GPIO setup fails.
    pub fn configure(config: &DirectionConfig) -> Box<dyn DirectionControl> {
        match Self::request_lines(config) {
            Ok(Some(lines)) => {
                info!(chip = %config.chip, "Direction-control lines configured.");
                Box::new(GpioDirection { lines: Some(lines) })
            }
            Ok(None) => {
                debug!("No direction-control pins configured.");
                Box::new(NoDirection)
            }
            Err(e) => {
                warn!(
                    chip = %config.chip,
                    error = %e,
                    "Direction-control setup failed, continuing without hardware control."
                );
                Box::new(NoDirection)
            }
        }
    }

    fn request_lines(config: &DirectionConfig) -> Result<Option<Lines>, gpio_cdev::Error> {
        if let Some(pin) = config.legacy_pin {
            let mut chip = Chip::new(&config.chip)?;
            let line = chip
                .get_line(pin)?
                .request(LineRequestFlags::OUTPUT, 0, CONSUMER)?;
            return Ok(Some(Lines::Combined { line }));
        }

        if let (Some(de_pin), Some(re_pin)) = (config.de_pin, config.re_pin) {
            let re_active_low = config.re_active_low;
            let mut chip = Chip::new(&config.chip)?;
            let de = chip
                .get_line(de_pin)?
                .request(LineRequestFlags::OUTPUT, 0, CONSUMER)?;
            // Start in the receive direction: RE active.
            let re_active = if re_active_low { 0 } else { 1 };
            let re = chip
                .get_line(re_pin)?
                .request(LineRequestFlags::OUTPUT, re_active, CONSUMER)?;
            return Ok(Some(Lines::Split {
                de,
                re,
                re_active_low,
            }));
        }

        Ok(None)
    }
}

fn set(line: &LineHandle, value: u8, name: &str) {
    if let Err(e) = line.set_value(value) {
        warn!(line = name, value, error = %e, "Direction line write failed.");
    }
}

impl DirectionControl for GpioDirection {
    fn set_transmit(&mut self) {
        match &self.lines {
            Some(Lines::Combined { line }) => set(line, 1, "dir"),
            Some(Lines::Split {
                de,
                re,
                re_active_low,
            }) => {
                set(de, 1, "de");
                let re_inactive = if *re_active_low { 1 } else { 0 };
                set(re, re_inactive, "re");
            }
            None => {}
        }
    }

    fn set_receive(&mut self) {
        match &self.lines {
            Some(Lines::Combined { line }) => set(line, 0, "dir"),
            Some(Lines::Split {
                de,
                re,
                re_active_low,
            }) => {
                set(de, 0, "de");
                let re_active = if *re_active_low { 0 } else { 1 };
                set(re, re_active, "re");
            }
            None => {}
        }
    }

    fn release(&mut self) {
        match self.lines.take() {
            Some(Lines::Combined { line }) => set(&line, 0, "dir"),
            Some(Lines::Split { de, re, .. }) => {
                set(&de, 0, "de");
                set(&re, 0, "re");
            }
            None => {}
        }
    }
}
