//! The dispatch loop that coerces the device into `dfuIDLE` from whatever state it's
//! currently in. A lookup from state to action, run repeatedly until the action is "done" —
//! a tagged-variant match is all the dynamic dispatch this needs.

use log::{debug, info};

use crate::error::{Error, OperationContext};
use crate::transport::{DfuState, UsbTransport};
use crate::Session;

/// How many 4ms quanta make up one 100ms wait in the dispatch loop (see
/// [`ProgressState::sleep_ms`](crate::progress::ProgressState::sleep_ms) for why this is a
/// count of quanta, not milliseconds).
const WAIT_QUANTA: u32 = 25;

impl<'a, T: UsbTransport> Session<'a, T> {
    /// Drive the device into `dfuIDLE`, dispatching on its current state until it gets
    /// there. This loop is intentionally unbounded: termination relies on the device
    /// eventually settling, the same way the hardware's own bootloader expects a host to
    /// poll it. Every wait step is broken into cancellable 4ms slices so a caller's progress
    /// callback still gets to cancel even while stuck here.
    pub(crate) fn enter_dfu_mode(&mut self) -> Result<(), Error> {
        loop {
            let state = self
                .transport
                .get_state()
                .map_err(|e| Error::transport("querying state", e))
                .op_context("enter_dfu_mode")?;

            debug!("enter_dfu_mode: observed state {state:?}");

            use DfuState::*;
            match state {
                DfuIdle => {
                    info!("enter_dfu_mode: reached dfuIDLE");
                    return Ok(());
                }
                DfuWriteSync | DfuWriteIdle | DfuManifestSync | DfuManifest | DfuReadIdle => {
                    self.transport
                        .abort()
                        .map_err(|e| Error::transport("aborting to idle", e))
                        .op_context("enter_dfu_mode")?;
                }
                DfuError => {
                    self.transport
                        .clr_status()
                        .map_err(|e| Error::transport("clearing error status", e))
                        .op_context("enter_dfu_mode")?;
                }
                AppIdle => {
                    self.transport
                        .detach()
                        .map_err(|e| Error::transport("detaching", e))
                        .op_context("enter_dfu_mode")?;
                }
                AppDetach | DfuWriteBusy | DfuManifestWaitReset => {
                    self.progress
                        .sleep_ms(WAIT_QUANTA)
                        .map_err(Error::from)
                        .op_context("enter_dfu_mode")?;
                }
            }
        }
    }

    /// A simpler cousin of [`enter_dfu_mode`](Self::enter_dfu_mode): on each poll, clear
    /// status whenever the device isn't `dfuIDLE` yet, without driving the full state
    /// dispatch table. Used after a block download has already told us the device should be
    /// heading toward idle on its own.
    pub(crate) fn wait_until_ready(&mut self) -> Result<(), Error> {
        loop {
            let status = self
                .transport
                .get_status()
                .map_err(|e| Error::transport("polling status", e))
                .op_context("wait_until_ready")?;

            if status.state == DfuState::DfuIdle {
                return Ok(());
            }

            self.transport
                .clr_status()
                .map_err(|e| Error::transport("clearing status", e))
                .op_context("wait_until_ready")?;

            self.progress
                .sleep_ms(1)
                .map_err(Error::from)
                .op_context("wait_until_ready")?;
        }
    }
}
