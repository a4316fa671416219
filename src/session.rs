use log::{debug, info};

use crate::error::{Error, OperationContext};
use crate::progress::{ProgressCallback, ProgressState};
use crate::transport::{DfuState, UsbTransport};

/// Manufacturer string the radio reports while running its bootloader. Firmware writes are
/// refused unless this matches exactly.
pub const BOOTLOADER_MANUFACTURER: &str = "AnyRoad Technology";

/// One live session against a single physical radio. Owns the transport handle exclusively
/// for its lifetime; at most one operation may be in flight at a time.
pub struct Session<'a, T: UsbTransport> {
    pub(crate) transport: T,
    pub(crate) block_size: u32,
    pub(crate) erase_block_size: u32,
    pub(crate) progress: ProgressState<'a>,
    manufacturer: Option<String>,
}

impl<'a, T: UsbTransport> Session<'a, T> {
    /// Build a session around an already-opened transport. `block_size` and
    /// `erase_block_size` are device-reported constants for the session's lifetime, not
    /// guessed by the driver.
    pub fn new(transport: T, block_size: u32, erase_block_size: u32) -> Self {
        Self {
            transport,
            block_size,
            erase_block_size,
            progress: ProgressState::new(),
            manufacturer: None,
        }
    }

    /// Install (or clear) the progress callback for the next operation. Operations that
    /// support cancellation call [`ProgressState::set_max_progress`] internally before their
    /// first tick.
    pub fn set_progress_callback(&mut self, callback: Option<ProgressCallback<'a>>) {
        self.progress.set_callback(callback);
    }

    /// Release the transport and drop the progress callback. Consumes the session: there is
    /// nothing useful left to do with it afterward.
    pub fn close(self) {
        drop(self);
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn erase_block_size(&self) -> u32 {
        self.erase_block_size
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    /// Idempotent startup sequence invoked at the beginning of every high-level operation:
    /// select the DFU configuration, drain any latched error, read the manufacturer string,
    /// and normalize the device into `dfuIDLE`.
    pub(crate) fn init(&mut self) -> Result<(), Error> {
        self.transport
            .select_configuration(0, 0, 0)
            .map_err(|e| Error::transport("selecting DFU configuration", e))
            .op_context("init")?;

        // First GetStatus/ClrStatus pair drains whatever error the device latched from a
        // previous session; its content is not meaningful to us.
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading initial status", e))
            .op_context("init")?;
        self.transport
            .clr_status()
            .map_err(|e| Error::transport("clearing initial status", e))
            .op_context("init")?;

        let manufacturer = self
            .transport
            .get_string_descriptor(1)
            .map_err(|e| Error::transport("reading manufacturer string", e))
            .op_context("init")?;
        debug!("Manufacturer string: {manufacturer:?}");
        self.manufacturer = Some(manufacturer);

        // Normalize: alternate ClrStatus/GetStatus a handful of times, since a device can be
        // left in dfuERROR by a previous crashed session. Unlike enter_dfu_mode (§4.2), this
        // is not the general state-machine dispatch loop and does not run forever — if the
        // device hasn't settled on dfuIDLE after a few rounds, something deeper is wrong and
        // we report it rather than spin.
        const INIT_NORMALIZE_ATTEMPTS: u32 = 5;
        let mut status = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("polling status during init", e))
            .op_context("init")?;
        for _ in 0..INIT_NORMALIZE_ATTEMPTS {
            if status.state == DfuState::DfuIdle {
                break;
            }
            self.transport
                .clr_status()
                .map_err(|e| Error::transport("clearing status during init", e))
                .op_context("init")?;
            status = self
                .transport
                .get_status()
                .map_err(|e| Error::transport("polling status during init", e))
                .op_context("init")?;
        }
        if status.state != DfuState::DfuIdle {
            return Err(Error::NotIdle).op_context("init");
        }

        info!("Session initialized, device is dfuIDLE");
        Ok(())
    }
}
