//! An in-memory transport for exercising the driver core without real hardware, in the
//! spirit of the mock DFU devices used throughout the `dfu-core`/`dfu-buddy` family: it
//! tracks device state explicitly and reacts to the same opcodes a real radio would see,
//! rather than just recording calls.

use std::collections::HashMap;

use crate::session::BOOTLOADER_MANUFACTURER;
use crate::transport::{DfuState, DfuStatus, DfuStatusCode, TransportError, UsbTransport, CONTROL_BLOCK, SPI_BLOCK};

#[derive(Debug, Clone, Copy)]
enum PendingSpiOp {
    None,
    Read(u32),
    Identify,
}

/// A fake radio. Backs internal flash and SPI flash with plain byte buffers addressed the
/// same way the real protocol addresses them (internal flash by the already block-number-
/// adjusted transfer id; SPI flash linearly), and drives its own `DfuState` the way the real
/// bootloader would in response to the vendor opcodes this crate issues.
pub struct MockTransport {
    state: DfuState,
    status: DfuStatusCode,
    manufacturer: String,

    internal_flash: HashMap<u16, Vec<u8>>,
    spi_flash: Vec<u8>,
    spi_id: [u8; 3],
    pending_spi_op: PendingSpiOp,

    dnload_log: Vec<(u16, Vec<u8>)>,
    erase_log: Vec<u32>,
    call_count: u32,

    /// When set, the status reported immediately after the next `set_address` download is
    /// forced to something other than `DfuWriteIdle`, to exercise the state-discipline path.
    pub inject_bad_state_after_set_address: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: DfuState::DfuIdle,
            status: DfuStatusCode::OK,
            manufacturer: BOOTLOADER_MANUFACTURER.to_owned(),
            internal_flash: HashMap::new(),
            spi_flash: Vec::new(),
            spi_id: [0xef, 0x40, 0x18],
            pending_spi_op: PendingSpiOp::None,
            dnload_log: Vec::new(),
            erase_log: Vec::new(),
            call_count: 0,
            inject_bad_state_after_set_address: false,
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    /// Reserve `size` bytes of (sparse, zero-filled-on-read) internal flash. Blocks are
    /// materialized lazily on first write; this just documents the intended extent.
    pub fn seed_internal_flash(&mut self, _size: usize) {}

    /// Reserve `size` bytes of SPI flash, identified by the given 3-byte JEDEC ID.
    pub fn seed_spi_flash(&mut self, size: usize, manufacturer: u8, memory_type: u8, capacity: u8) {
        self.spi_flash = vec![0u8; size];
        self.spi_id = [manufacturer, memory_type, capacity];
    }

    /// Write `data` directly into the SPI flash backing store at `addr`, as if it had
    /// already been programmed by a previous session.
    pub fn write_spi_region(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        if self.spi_flash.len() < end {
            self.spi_flash.resize(end, 0xff);
        }
        self.spi_flash[start..end].copy_from_slice(data);
    }

    /// The sequence of block numbers passed to every `dnload` call that wasn't a control- or
    /// SPI-block vendor command, in issue order. This is what the address/block discontinuity
    /// tests inspect.
    pub fn dnload_block_sequence(&self) -> Vec<u16> {
        self.dnload_log
            .iter()
            .filter(|(block, _)| *block != CONTROL_BLOCK && *block != SPI_BLOCK)
            .map(|(block, _)| *block)
            .collect()
    }

    pub fn erase_log(&self) -> &[u32] {
        &self.erase_log
    }

    pub fn call_count(&self) -> u32 {
        self.call_count
    }

    fn status_payload(&self) -> DfuStatus {
        DfuStatus {
            status: self.status,
            poll_timeout_ms: 0,
            state: self.state,
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn dnload(&mut self, block: u16, payload: &[u8]) -> Result<(), TransportError> {
        self.call_count += 1;
        self.dnload_log.push((block, payload.to_vec()));

        if block == CONTROL_BLOCK {
            if payload.is_empty() {
                return Err(TransportError::msg("empty control download"));
            }
            match payload[0] {
                0x21 => {
                    // set_address
                    self.state = if self.inject_bad_state_after_set_address {
                        self.inject_bad_state_after_set_address = false;
                        DfuState::DfuError
                    } else {
                        DfuState::DfuWriteIdle
                    };
                }
                0x41 => {
                    // erase_block: record the address; real erase content isn't modeled since
                    // no test in this crate depends on erased-but-unwritten bytes reading as
                    // a particular value.
                    if payload.len() >= 5 {
                        let addr = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                        self.erase_log.push(addr);
                    }
                    self.state = DfuState::DfuWriteIdle;
                }
                0x91 | 0xa2 => {
                    // Vendor programming-mode / reboot commands: just acknowledge.
                    self.state = DfuState::DfuWriteIdle;
                }
                other => {
                    return Err(TransportError::msg(format!("unhandled control opcode {other:#04x}")));
                }
            }
            return Ok(());
        }

        if block == SPI_BLOCK {
            if payload.is_empty() {
                return Err(TransportError::msg("empty SPI download"));
            }
            match payload[0] {
                0x01 => {
                    let addr = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                    self.pending_spi_op = PendingSpiOp::Read(addr);
                }
                0x03 => {
                    let addr = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                    self.erase_log.push(addr);
                }
                0x04 => {
                    let addr = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                    let size = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]) as usize;
                    let data = &payload[9..9 + size];
                    let start = addr as usize;
                    let end = start + size;
                    if self.spi_flash.len() < end {
                        self.spi_flash.resize(end, 0xff);
                    }
                    self.spi_flash[start..end].copy_from_slice(data);
                }
                0x9f => {
                    self.pending_spi_op = PendingSpiOp::Identify;
                }
                other => {
                    return Err(TransportError::msg(format!("unhandled SPI opcode {other:#04x}")));
                }
            }
            return Ok(());
        }

        // Internal flash block: store the payload verbatim, keyed by the already-adjusted
        // DFU block number the driver computed.
        self.internal_flash.insert(block, payload.to_vec());
        self.state = DfuState::DfuWriteIdle;
        Ok(())
    }

    fn upload(&mut self, block: u16, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.call_count += 1;

        if block == SPI_BLOCK {
            match self.pending_spi_op {
                PendingSpiOp::Read(addr) => {
                    let start = addr as usize;
                    let end = start + buf.len();
                    if self.spi_flash.len() < end {
                        self.spi_flash.resize(end, 0xff);
                    }
                    buf.copy_from_slice(&self.spi_flash[start..end]);
                }
                PendingSpiOp::Identify => {
                    let n = buf.len().min(3);
                    buf[..n].copy_from_slice(&self.spi_id[..n]);
                }
                PendingSpiOp::None => {
                    return Err(TransportError::msg("SPI upload with no pending operation"));
                }
            }
            self.pending_spi_op = PendingSpiOp::None;
            return Ok(buf.len());
        }

        let data = self.internal_flash.get(&block).cloned().unwrap_or_else(|| vec![0u8; buf.len()]);
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn get_status(&mut self) -> Result<DfuStatus, TransportError> {
        self.call_count += 1;
        Ok(self.status_payload())
    }

    fn get_state(&mut self) -> Result<DfuState, TransportError> {
        self.call_count += 1;
        Ok(self.state)
    }

    fn clr_status(&mut self) -> Result<(), TransportError> {
        self.call_count += 1;
        self.status = DfuStatusCode::OK;
        // Forcing clear: the vendor bootloader treats CLRSTATUS as "snap back to idle"
        // regardless of which non-idle state it was issued from.
        self.state = DfuState::DfuIdle;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        self.call_count += 1;
        self.state = DfuState::DfuIdle;
        Ok(())
    }

    fn detach(&mut self) -> Result<(), TransportError> {
        self.call_count += 1;
        self.state = DfuState::AppDetach;
        Ok(())
    }

    fn select_configuration(&mut self, _cfg: u8, _iface: u8, _alt: u8) -> Result<(), TransportError> {
        self.call_count += 1;
        Ok(())
    }

    fn get_string_descriptor(&mut self, _index: u8) -> Result<String, TransportError> {
        self.call_count += 1;
        Ok(self.manufacturer.clone())
    }
}
