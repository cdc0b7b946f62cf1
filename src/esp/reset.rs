//! Reset strategies for Espressif targets
//!
//! DTR/RTS drive the auto-reset circuit found on dev boards: RTS pulls the
//! chip-enable line, DTR pulls the boot-select pin.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, port::SerialPort};

/// Extra settle time some silicon revisions need after entering download
/// mode
const EXTRA_BOOT_DELAY: Duration = Duration::from_millis(2000);

/// Reset strategies for putting a target into download mode
pub(crate) trait ResetStrategy {
    fn reset(&self, port: &mut dyn SerialPort) -> Result<(), Error>;
}

/// Classic reset sequence driving DTR and RTS sequentially
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClassicReset {
    extra_delay: bool,
}

impl ClassicReset {
    pub(crate) fn new(extra_delay: bool) -> Self {
        Self { extra_delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, port: &mut dyn SerialPort) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy (extra delay: {})",
            self.extra_delay
        );

        port.write_data_terminal_ready(false)?;
        port.write_request_to_send(false)?;

        sleep(Duration::from_millis(50));

        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;

        port.write_data_terminal_ready(false)?; // IO0 = HIGH
        port.write_request_to_send(true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));
        if self.extra_delay {
            sleep(EXTRA_BOOT_DELAY);
        }

        port.write_data_terminal_ready(true)?; // IO0 = LOW
        port.write_request_to_send(false)?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(50));

        port.write_data_terminal_ready(false)?;
        port.write_request_to_send(false)?;

        Ok(())
    }
}

/// Reset into the user application after flashing
pub(crate) fn hard_reset(port: &mut dyn SerialPort) -> Result<(), Error> {
    debug!("Using HardReset reset strategy");

    port.write_data_terminal_ready(false)?;
    port.write_request_to_send(true)?; // EN = LOW, chip in reset

    sleep(Duration::from_millis(100));

    port.write_data_terminal_ready(false)?;
    port.write_request_to_send(false)?; // EN = HIGH, chip out of reset

    sleep(Duration::from_millis(100));

    Ok(())
}

/// The reset variants tried while connecting, cycled until sync succeeds
pub(crate) fn reset_strategy_sequence() -> Vec<Box<dyn ResetStrategy>> {
    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(ClassicReset::new(true)),
    ]
}
