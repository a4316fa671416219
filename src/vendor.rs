//! Vendor command layer: the 2-byte opcodes that unlock programming mode, and the scripted
//! sequences of them (with embedded delays) that precede bulk memory access.

use byteorder::{ByteOrder, LE};
use log::trace;

use crate::error::{Error, OperationContext};
use crate::transport::{DfuState, UsbTransport, CONTROL_BLOCK};
use crate::Session;

/// One step of a vendor command script: either a 2-byte opcode/argument pair to download, or
/// a pause of `arg` milliseconds that consumes no transfer.
#[derive(Copy, Clone, Debug)]
pub enum ScriptStep {
    Cmd(u8, u8),
    Sleep(u32),
}

/// Short programming-mode entry used ahead of bulk SPI flash access.
pub const SCRIPT_PROGRAMMING_MODE_SPI: &[ScriptStep] = &[ScriptStep::Cmd(0x91, 0x01)];

/// Programming-mode entry ahead of an internal-flash read.
pub const SCRIPT_PROGRAMMING_MODE_READ: &[ScriptStep] = &[
    ScriptStep::Cmd(0x91, 0x01),
    ScriptStep::Cmd(0xa2, 0x02),
    ScriptStep::Cmd(0xa2, 0x02),
    ScriptStep::Cmd(0xa2, 0x03),
    ScriptStep::Cmd(0xa2, 0x04),
    ScriptStep::Cmd(0xa2, 0x07),
];

/// Programming-mode entry ahead of an internal-flash write.
pub const SCRIPT_PROGRAMMING_MODE_WRITE: &[ScriptStep] = &[
    ScriptStep::Cmd(0x91, 0x01),
    ScriptStep::Cmd(0x91, 0x01),
    ScriptStep::Cmd(0xa2, 0x02),
    ScriptStep::Sleep(2000),
    ScriptStep::Cmd(0xa2, 0x02),
    ScriptStep::Cmd(0xa2, 0x03),
    ScriptStep::Cmd(0xa2, 0x04),
    ScriptStep::Cmd(0xa2, 0x07),
];

/// Programming-mode entry ahead of a firmware write.
pub const SCRIPT_FIRMWARE_ENTRY: &[ScriptStep] = &[
    ScriptStep::Cmd(0x91, 0x01),
    ScriptStep::Cmd(0x91, 0x31),
];

const OP_SET_ADDRESS: u8 = 0x21;
const OP_ERASE_BLOCK: u8 = 0x41;
const OP_REBOOT: u8 = 0x91;
const ARG_REBOOT: u8 = 0x05;

impl<'a, T: UsbTransport> Session<'a, T> {
    /// Run a single vendor command and verify the device lands in `dfuWRITE_IDLE`
    /// afterward, per the two-step `GetStatus` dance documented in the driver design notes:
    /// the first `GetStatus` after the download is a transition trigger whose payload is
    /// discarded, and the second retrieves the state that actually matters.
    pub(crate) fn md380_custom(&mut self, op: u8, arg: u8) -> Result<(), Error> {
        trace!("md380_custom: op={op:#04x} arg={arg:#04x}");

        self.transport
            .dnload(CONTROL_BLOCK, &[op, arg])
            .map_err(|e| Error::transport("sending vendor command", e))
            .op_context("md380_custom")?;

        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading transition status", e))
            .op_context("md380_custom")?;

        self.progress
            .sleep_ms(100)
            .map_err(Error::from)
            .op_context("md380_custom")?;

        let status = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading post-command status", e))
            .op_context("md380_custom")?;

        if status.state != DfuState::DfuWriteIdle {
            return Err(Error::UnexpectedState {
                expected: DfuState::DfuWriteIdle,
                actual: status.state,
            })
            .op_context("md380_custom");
        }

        self.enter_dfu_mode().op_context("md380_custom")
    }

    /// Run a scripted sequence of vendor commands and sleeps.
    pub(crate) fn md380_cmd(&mut self, script: &[ScriptStep]) -> Result<(), Error> {
        for step in script {
            match *step {
                ScriptStep::Cmd(op, arg) => self.md380_custom(op, arg)?,
                ScriptStep::Sleep(ms) => self
                    .progress
                    .sleep_ms(ms)
                    .map_err(Error::from)
                    .op_context("md380_cmd")?,
            }
        }
        Ok(())
    }

    /// Set the device's current address pointer, as used before both read and write loops
    /// and before each internal-flash erase.
    pub(crate) fn set_address(&mut self, addr: u32) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = OP_SET_ADDRESS;
        LE::write_u32(&mut payload[1..], addr);

        self.transport
            .dnload(CONTROL_BLOCK, &payload)
            .map_err(|e| Error::transport("downloading set_address", e))
            .op_context("set_address")?;

        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading transition status", e))
            .op_context("set_address")?;

        let status = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading post-set_address status", e))
            .op_context("set_address")?;

        if status.state != DfuState::DfuWriteIdle {
            return Err(Error::UnexpectedState {
                expected: DfuState::DfuWriteIdle,
                actual: status.state,
            })
            .op_context("set_address");
        }

        self.enter_dfu_mode().op_context("set_address")
    }

    /// Erase one block of internal flash, addressed linearly (not by block number).
    pub(crate) fn erase_block(&mut self, addr: u32) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = OP_ERASE_BLOCK;
        LE::write_u32(&mut payload[1..], addr);

        self.transport
            .dnload(CONTROL_BLOCK, &payload)
            .map_err(|e| Error::transport("downloading erase_block", e))
            .op_context("erase_block")?;

        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading transition status", e))
            .op_context("erase_block")?;

        let status = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading post-erase status", e))
            .op_context("erase_block")?;

        if status.state != DfuState::DfuWriteIdle {
            return Err(Error::UnexpectedState {
                expected: DfuState::DfuWriteIdle,
                actual: status.state,
            })
            .op_context("erase_block");
        }

        self.enter_dfu_mode().op_context("erase_block")
    }

    /// Reboot the radio. Issued after `wait_until_ready`; the final `GetStatus` is
    /// best-effort since the device has already been told to reset and may not answer.
    pub(crate) fn reboot(&mut self) -> Result<(), Error> {
        self.wait_until_ready().op_context("reboot")?;

        self.transport
            .dnload(CONTROL_BLOCK, &[OP_REBOOT, ARG_REBOOT])
            .map_err(|e| Error::transport("downloading reboot command", e))
            .op_context("reboot")?;

        // Best-effort: the device may have already reset and stopped answering.
        let _ = self.transport.get_status();

        Ok(())
    }
}
