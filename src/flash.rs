//! Block-paced erase/read/write loops against internal flash (DFU standard block transfers)
//! and external SPI flash (vendor opcodes on an alternate "block").

use byteorder::{ByteOrder, LE};
use log::{debug, trace};
use std::io::{Read, Write};

use crate::address::{
    internal_flash_block, internal_flash_erase_address, internal_flash_range_is_collision_free,
    MAX_SAFE_BLOCK,
};
use crate::error::{Error, OperationContext};
use crate::spi_flash::SpiFlashChip;
use crate::transport::{UsbTransport, SPI_BLOCK};
use crate::vendor::{SCRIPT_PROGRAMMING_MODE_READ, SCRIPT_PROGRAMMING_MODE_SPI, SCRIPT_PROGRAMMING_MODE_WRITE};
use crate::Session;

const OP_SPI_ERASE: u8 = 0x03;
const OP_SPI_READ: u8 = 0x01;
const OP_SPI_WRITE: u8 = 0x04;
const OP_SPI_IDENTIFY: u8 = 0x9f;

/// Inflates the SPI erase-loop progress budget to account for the mandated 500ms wait after
/// every block, so progress doesn't appear to stall during a large erase.
const SPI_ERASE_PROGRESS_WEIGHT: u32 = 500;

impl<'a, T: UsbTransport> Session<'a, T> {
    fn require_alignment(&self, addr: u32, size: u32) -> Result<(), Error> {
        if addr % self.block_size != 0 || size % self.block_size != 0 {
            return Err(Error::BadAlignment {
                addr,
                size,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// Reject a block-indexed transfer whose range would straddle the reserved-window
    /// boundary `internal_flash_block` stops being injective at; see `MAX_SAFE_BLOCK`.
    fn require_safe_block_range(&self, addr: u32, size: u32) -> Result<(), Error> {
        let start_block = addr / self.block_size;
        let block_count = size / self.block_size;
        if internal_flash_range_is_collision_free(start_block, block_count) {
            Ok(())
        } else {
            Err(Error::UnsafeBlockRange {
                start_block,
                end_block: start_block + block_count,
                max_safe_block: MAX_SAFE_BLOCK,
            })
        }
    }

    /// Read `size` bytes of internal flash starting at `addr` into `writer`, block by block.
    pub(crate) fn read_flash_to(
        &mut self,
        addr: u32,
        size: u32,
        writer: &mut dyn Write,
    ) -> Result<(), Error> {
        self.require_alignment(addr, size).op_context("read_flash_to")?;
        self.require_safe_block_range(addr, size).op_context("read_flash_to")?;

        self.init().op_context("read_flash_to")?;
        self.md380_cmd(SCRIPT_PROGRAMMING_MODE_READ).op_context("read_flash_to")?;
        self.set_address(0).op_context("read_flash_to")?;

        let num_blocks = size / self.block_size;
        self.progress.set_max_progress(num_blocks.max(1));

        let mut buf = vec![0u8; self.block_size as usize];
        for i in 0..num_blocks {
            let block_num = (addr / self.block_size) + i;
            let dfu_block = internal_flash_block(block_num);

            let n = self
                .transport
                .upload(dfu_block, &mut buf)
                .map_err(|e| Error::transport("uploading flash block", e))
                .op_context("read_flash_to")?;
            if n != buf.len() {
                return Err(Error::ShortRead {
                    expected: buf.len(),
                    actual: n,
                })
                .op_context("read_flash_to");
            }

            writer.write_all(&buf).op_context("read_flash_to")?;
            self.progress.tick().map_err(Error::from).op_context("read_flash_to")?;
        }

        self.progress.final_progress().map_err(Error::from).op_context("read_flash_to")
    }

    /// Program `size` bytes of internal flash starting at `addr` from `reader`, erasing the
    /// covered region first. Short reads are padded with `0xff` to fill out the final block.
    pub(crate) fn write_flash_from(
        &mut self,
        addr: u32,
        size: u32,
        reader: &mut dyn Read,
    ) -> Result<(), Error> {
        self.require_alignment(addr, size).op_context("write_flash_from")?;
        self.require_safe_block_range(addr, size).op_context("write_flash_from")?;

        self.init().op_context("write_flash_from")?;
        self.md380_cmd(SCRIPT_PROGRAMMING_MODE_WRITE).op_context("write_flash_from")?;
        self.erase_flash_blocks(addr, size).op_context("write_flash_from")?;
        self.set_address(0).op_context("write_flash_from")?;

        let num_blocks = size / self.block_size;
        self.progress.set_max_progress(num_blocks.max(1));

        let mut buf = vec![0u8; self.block_size as usize];
        for i in 0..num_blocks {
            let block_num = (addr / self.block_size) + i;
            let dfu_block = internal_flash_block(block_num);

            fill_block_padded(reader, &mut buf)?;

            self.transport
                .dnload(dfu_block, &buf)
                .map_err(|e| Error::transport("downloading flash block", e))
                .op_context("write_flash_from")?;
            self.wait_until_ready().op_context("write_flash_from")?;

            self.progress.tick().map_err(Error::from).op_context("write_flash_from")?;
        }

        self.progress.final_progress().map_err(Error::from).op_context("write_flash_from")
    }

    /// Erase the internal-flash region `[addr, addr + size)`, one `erase_block_size`-sized
    /// unit at a time, applying the address discontinuity correction to each.
    pub(crate) fn erase_flash_blocks(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        let count = size.div_ceil(self.erase_block_size);
        self.progress.set_max_progress(count.max(1));

        for i in 0..count {
            let block_addr = addr + i * self.erase_block_size;
            let adjusted = internal_flash_erase_address(block_addr);
            self.erase_block(adjusted).op_context("erase_flash_blocks")?;
            self.progress.tick().map_err(Error::from).op_context("erase_flash_blocks")?;
        }
        Ok(())
    }

    /// Read the 3-byte SPI flash ID and look up the matching chip, retrying once (with a
    /// fresh `init`) if identification fails.
    pub(crate) fn spi_flash_id(&mut self) -> Result<SpiFlashChip, Error> {
        match self.try_spi_flash_id() {
            Ok(chip) => Ok(chip),
            Err(_) => {
                debug!("spi_flash_id: first attempt failed, re-running init and retrying once");
                self.init().op_context("spi_flash_id")?;
                self.try_spi_flash_id()
            }
        }
    }

    fn try_spi_flash_id(&mut self) -> Result<SpiFlashChip, Error> {
        self.md380_cmd(SCRIPT_PROGRAMMING_MODE_SPI).op_context("spi_flash_id")?;

        self.transport
            .dnload(SPI_BLOCK, &[OP_SPI_IDENTIFY])
            .map_err(|e| Error::transport("requesting SPI flash ID", e))
            .op_context("spi_flash_id")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI ID transition status", e))
            .op_context("spi_flash_id")?;

        let mut id_buf = [0u8; 3];
        let n = self
            .transport
            .upload(SPI_BLOCK, &mut id_buf)
            .map_err(|e| Error::transport("uploading SPI flash ID", e))
            .op_context("spi_flash_id")?;
        if n != id_buf.len() {
            return Err(Error::ShortRead {
                expected: id_buf.len(),
                actual: n,
            })
            .op_context("spi_flash_id");
        }

        let id = (id_buf[0] as u32) << 16 | (id_buf[1] as u32) << 8 | id_buf[2] as u32;
        trace!("spi_flash_id: raw id {id:#08x}");
        SpiFlashChip::identify(id).op_context("spi_flash_id")
    }

    pub(crate) fn spi_flash_size(&mut self) -> Result<u32, Error> {
        Ok(self.spi_flash_id()?.size_bytes())
    }

    /// Read `buf.len()` bytes of SPI flash starting at `addr` into `buf`.
    pub(crate) fn read_spi_flash(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = OP_SPI_READ;
        LE::write_u32(&mut payload[1..], addr);

        self.transport
            .dnload(SPI_BLOCK, &payload)
            .map_err(|e| Error::transport("downloading SPI read command", e))
            .op_context("read_spi_flash")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI read transition status", e))
            .op_context("read_spi_flash")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI read status", e))
            .op_context("read_spi_flash")?;

        let n = self
            .transport
            .upload(SPI_BLOCK, buf)
            .map_err(|e| Error::transport("uploading SPI flash data", e))
            .op_context("read_spi_flash")?;
        if n != buf.len() {
            return Err(Error::ShortRead {
                expected: buf.len(),
                actual: n,
            })
            .op_context("read_spi_flash");
        }
        Ok(())
    }

    /// Write `buf` to SPI flash starting at `addr`.
    pub(crate) fn write_spi_flash(&mut self, addr: u32, buf: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(9 + buf.len());
        payload.push(OP_SPI_WRITE);
        let mut header = [0u8; 8];
        LE::write_u32(&mut header[0..4], addr);
        LE::write_u32(&mut header[4..8], buf.len() as u32);
        payload.extend_from_slice(&header);
        payload.extend_from_slice(buf);

        self.transport
            .dnload(SPI_BLOCK, &payload)
            .map_err(|e| Error::transport("downloading SPI write command", e))
            .op_context("write_spi_flash")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI write transition status", e))
            .op_context("write_spi_flash")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI write status", e))
            .op_context("write_spi_flash")?;
        Ok(())
    }

    /// Erase one SPI flash block. Unlike internal flash, no state assertion is made
    /// afterward; the device's SPI path doesn't round-trip through `dfuWRITE_IDLE`.
    pub(crate) fn erase_spi_flash_block(&mut self, addr: u32) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = OP_SPI_ERASE;
        LE::write_u32(&mut payload[1..], addr);

        self.transport
            .dnload(SPI_BLOCK, &payload)
            .map_err(|e| Error::transport("downloading SPI erase command", e))
            .op_context("erase_spi_flash_block")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI erase transition status", e))
            .op_context("erase_spi_flash_block")?;

        self.progress
            .sleep_ms(500)
            .map_err(Error::from)
            .op_context("erase_spi_flash_block")?;

        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading SPI erase status", e))
            .op_context("erase_spi_flash_block")?;
        Ok(())
    }

    pub(crate) fn erase_spi_flash_blocks(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        let count = size.div_ceil(self.erase_block_size);
        self.progress
            .set_max_progress((count * SPI_ERASE_PROGRESS_WEIGHT).max(1));

        for i in 0..count {
            let block_addr = addr + i * self.erase_block_size;
            self.erase_spi_flash_block(block_addr).op_context("erase_spi_flash_blocks")?;
            for _ in 0..SPI_ERASE_PROGRESS_WEIGHT {
                self.progress.tick().map_err(Error::from).op_context("erase_spi_flash_blocks")?;
            }
        }
        Ok(())
    }

    /// Stream `size` bytes of SPI flash starting at `addr` to `writer`, reading one
    /// `block_size` chunk at a time. The final chunk may be short.
    pub(crate) fn read_spi_flash_bulk_to(
        &mut self,
        addr: u32,
        size: u32,
        writer: &mut dyn Write,
    ) -> Result<(), Error> {
        self.md380_cmd(SCRIPT_PROGRAMMING_MODE_SPI).op_context("read_spi_flash_bulk_to")?;

        let num_blocks = size.div_ceil(self.block_size).max(1);
        self.progress.set_max_progress(num_blocks);

        let mut remaining = size;
        let mut offset = 0u32;
        while remaining > 0 {
            let chunk = remaining.min(self.block_size);
            let mut buf = vec![0u8; chunk as usize];
            self.read_spi_flash(addr + offset, &mut buf).op_context("read_spi_flash_bulk_to")?;
            writer.write_all(&buf).op_context("read_spi_flash_bulk_to")?;

            offset += chunk;
            remaining -= chunk;
            self.progress.tick().map_err(Error::from).op_context("read_spi_flash_bulk_to")?;
        }

        self.progress.final_progress().map_err(Error::from).op_context("read_spi_flash_bulk_to")
    }

    /// Program `size` bytes of SPI flash starting at `addr` from `reader`, erasing the
    /// covered region first.
    pub(crate) fn write_spi_flash_from(
        &mut self,
        addr: u32,
        size: u32,
        reader: &mut dyn Read,
    ) -> Result<(), Error> {
        let flash_size = self.spi_flash_size().op_context("write_spi_flash_from")?;
        if addr as u64 + size as u64 > flash_size as u64 {
            return Err(Error::BadAlignment {
                addr,
                size,
                block_size: flash_size,
            })
            .op_context("write_spi_flash_from");
        }

        self.md380_cmd(SCRIPT_PROGRAMMING_MODE_SPI).op_context("write_spi_flash_from")?;
        self.erase_spi_flash_blocks(addr, size).op_context("write_spi_flash_from")?;
        self.set_address(0).op_context("write_spi_flash_from")?;
        let _ = self
            .transport
            .get_status()
            .map_err(|e| Error::transport("reading post-erase SPI status", e))
            .op_context("write_spi_flash_from")?;

        let num_blocks = size.div_ceil(self.block_size).max(1);
        self.progress.set_max_progress(num_blocks);

        let mut remaining = size;
        let mut offset = 0u32;
        let mut buf = vec![0u8; self.block_size as usize];
        while remaining > 0 {
            let chunk = remaining.min(self.block_size);
            buf.resize(chunk as usize, 0xff);
            fill_block_padded(reader, &mut buf)?;

            self.write_spi_flash(addr + offset, &buf).op_context("write_spi_flash_from")?;
            self.wait_until_ready().op_context("write_spi_flash_from")?;

            offset += chunk;
            remaining -= chunk;
            self.progress.tick().map_err(Error::from).op_context("write_spi_flash_from")?;
        }

        self.progress.final_progress().map_err(Error::from).op_context("write_spi_flash_from")
    }
}

/// Read enough bytes to fill `buf`, padding any unfilled tail with `0xff`. This is how every
/// bulk write loop in this crate handles a source stream that ends mid-block.
fn fill_block_padded(reader: &mut dyn Read, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < buf.len() {
        buf[filled..].fill(0xff);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::fill_block_padded;
    use crate::error::Error;
    use crate::testing::MockTransport;
    use crate::Session;
    use std::cell::Cell;
    use std::io::Cursor;

    #[test]
    fn short_read_pads_tail_with_0xff() {
        let mut reader = Cursor::new(vec![1u8, 2, 3]);
        let mut buf = vec![0u8; 8];
        fill_block_padded(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn full_read_is_untouched() {
        let mut reader = Cursor::new(vec![9u8; 8]);
        let mut buf = vec![0u8; 8];
        fill_block_padded(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, vec![9u8; 8]);
    }

    fn root_cause(err: &Error) -> &Error {
        match err {
            Error::WithContext { source, .. } => root_cause(source),
            other => other,
        }
    }

    #[test]
    fn unexpected_state_after_set_address_stops_before_any_block_transfer() {
        let mut transport = MockTransport::new();
        transport.seed_internal_flash(4 * 1024 * 1024);
        transport.inject_bad_state_after_set_address = true;
        let mut session = Session::new(transport, 1024, 0x10000);

        let mut reader = Cursor::new(vec![0u8; 1024 * 3]);
        let err = session.write_flash_from(0, 1024 * 3, &mut reader).unwrap_err();

        assert!(matches!(
            root_cause(&err),
            Error::UnexpectedState {
                expected: crate::transport::DfuState::DfuWriteIdle,
                ..
            }
        ));
        assert!(session.transport.dnload_block_sequence().is_empty());
    }

    #[test]
    fn block_range_straddling_the_reserved_window_boundary_is_rejected() {
        let transport = MockTransport::new();
        let mut session = Session::new(transport, 1024, 0x10000);

        // MAX_SAFE_BLOCK is 1216 blocks of 1024 bytes in; a read starting one block early and
        // spanning the boundary must be rejected rather than silently landing on a colliding
        // DFU block number.
        let addr = (crate::address::MAX_SAFE_BLOCK - 1) * 1024;
        let mut out = Vec::new();
        let err = session.read_flash_to(addr, 2 * 1024, &mut out).unwrap_err();

        assert!(matches!(
            root_cause(&err),
            Error::UnsafeBlockRange { .. }
        ));
    }

    #[test]
    fn block_range_entirely_past_total_blocks_is_accepted() {
        let mut transport = MockTransport::new();
        transport.seed_internal_flash(4 * 1024 * 1024);
        let mut session = Session::new(transport, 1024, 0x10000);

        // The UV-380 user database lives at block 2048 exactly, past the tail segment's
        // collision zone, and must not trip the new guard.
        let addr = crate::address::TOTAL_BLOCKS * 1024;
        let mut reader = Cursor::new(vec![0u8; 1024]);
        session.write_flash_from(addr, 1024, &mut reader).unwrap();
    }

    #[test]
    fn cancelling_on_first_tick_stops_before_the_second_erase() {
        // erase_flash_blocks ticks exactly once per erase, with no embedded vendor-script
        // sleeps muddying the count, so a cancel on the first tick unambiguously lands right
        // after the first erase_block call and before the second.
        let mut transport = MockTransport::new();
        transport.seed_internal_flash(4 * 1024 * 1024);
        let mut session = Session::new(transport, 1024, 0x10000);

        let ticks = Cell::new(0u32);
        session.set_progress_callback(Some(Box::new(move |_counter| {
            ticks.set(ticks.get() + 1);
            if ticks.get() == 1 {
                Err(crate::error::Cancelled)
            } else {
                Ok(())
            }
        })));

        let err = session.erase_flash_blocks(0, 3 * 0x10000).unwrap_err();

        assert!(matches!(root_cause(&err), Error::Cancelled));
        // Only the first erase made it through before cancellation fired; the second and
        // third never got issued.
        assert_eq!(session.transport.erase_log().len(), 1);
    }
}
