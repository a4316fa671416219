//! The externally visible high-level verbs built on top of the flash I/O engine: read/write
//! codeplug, read/write contact databases, and stream the whole SPI flash.

use std::io::{Cursor, Read, Write};

use crate::error::{Error, OperationContext};
use crate::transport::UsbTransport;
use crate::Session;

/// SPI-flash address of the MD-380-family contact database.
const MD380_USERDB_SPI_ADDR: u32 = 0x10_0000;

/// Internal-flash address of the UV-380-family contact database.
const UV380_USERDB_FLASH_ADDR: u32 = 0x20_0000;

const USERDB_HEADER_PROBE_LEN: usize = 1024;
const USERDB_MIN_SIZE: u64 = 40;
const USERDB_MAX_SIZE: u64 = 14 * 1024 * 1024;

impl<'a, T: UsbTransport> Session<'a, T> {
    /// Read `buf.len()` bytes of internal flash starting at address 0 into `buf`, then
    /// reboot the radio.
    pub fn read_codeplug(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.init().op_context("read_codeplug")?;
        let mut writer = Cursor::new(buf);
        self.read_flash_to(0, writer.get_ref().len() as u32, &mut writer)
            .op_context("read_codeplug")?;
        self.reboot().op_context("read_codeplug")
    }

    /// Program internal flash starting at address 0 from `buf`, then reboot the radio.
    pub fn write_codeplug(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.init().op_context("write_codeplug")?;
        let mut reader = Cursor::new(buf);
        self.write_flash_from(0, buf.len() as u32, &mut reader)
            .op_context("write_codeplug")?;
        self.reboot().op_context("write_codeplug")
    }

    /// Stream the entire SPI flash (its size auto-detected from the chip ID) to `writer`,
    /// then reboot the radio.
    pub fn read_spi_flash(&mut self, writer: &mut dyn Write) -> Result<(), Error> {
        self.init().op_context("read_spi_flash")?;
        let size = self.spi_flash_size().op_context("read_spi_flash")?;
        self.read_spi_flash_bulk_to(0, size, writer).op_context("read_spi_flash")?;
        self.reboot().op_context("read_spi_flash")
    }

    /// Read the MD-380-family contact database: the first 1024 bytes at the database's SPI
    /// address begin with a newline-terminated decimal byte count, followed immediately by
    /// that many bytes of payload. The header line and exactly `count` bytes of payload are
    /// both written to `writer`, so the output is the same `"<len>\n"`-prefixed image
    /// [`write_md380_users`](Self::write_md380_users) writes and
    /// [`write_raw_md380_users`](Self::write_raw_md380_users) can restore verbatim.
    pub fn read_md380_users(&mut self, writer: &mut dyn Write) -> Result<(), Error> {
        self.init().op_context("read_md380_users")?;
        self.md380_cmd(crate::vendor::SCRIPT_PROGRAMMING_MODE_SPI)
            .op_context("read_md380_users")?;

        let mut header = vec![0u8; USERDB_HEADER_PROBE_LEN];
        self.read_spi_flash(MD380_USERDB_SPI_ADDR, &mut header)
            .op_context("read_md380_users")?;

        let newline_pos = header
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::DbSizeOutOfRange { size: 0 })
            .op_context("read_md380_users")?;

        let count_str = std::str::from_utf8(&header[..newline_pos])
            .map_err(|_| Error::DbSizeOutOfRange { size: 0 })
            .op_context("read_md380_users")?;
        let count: u64 = count_str
            .parse()
            .map_err(|_| Error::DbSizeOutOfRange { size: 0 })
            .op_context("read_md380_users")?;

        if !(USERDB_MIN_SIZE..=USERDB_MAX_SIZE).contains(&count) {
            return Err(Error::DbSizeOutOfRange { size: count }).op_context("read_md380_users");
        }

        let payload_start = MD380_USERDB_SPI_ADDR + newline_pos as u32 + 1;

        // The header line itself (through the newline) is part of the output image.
        writer
            .write_all(&header[..=newline_pos])
            .op_context("read_md380_users")?;

        // Whatever payload already landed in our header probe can be served directly;
        // the remainder is streamed fresh.
        let already_have = (header.len() - newline_pos - 1).min(count as usize);
        writer
            .write_all(&header[newline_pos + 1..newline_pos + 1 + already_have])
            .op_context("read_md380_users")?;

        let remaining = count - already_have as u64;
        if remaining > 0 {
            self.read_spi_flash_bulk_to(
                payload_start + already_have as u32,
                remaining as u32,
                writer,
            )
            .op_context("read_md380_users")?;
        }

        self.reboot().op_context("read_md380_users")
    }

    /// Write the MD-380-family contact database as a `"<len>\n"`-prefixed text image.
    pub fn write_md380_users(&mut self, db: &[u8]) -> Result<(), Error> {
        self.init().op_context("write_md380_users")?;

        let mut image = format!("{}\n", db.len()).into_bytes();
        image.extend_from_slice(db);

        let mut reader = Cursor::new(&image);
        self.write_spi_flash_from(MD380_USERDB_SPI_ADDR, image.len() as u32, &mut reader)
            .op_context("write_md380_users")?;
        self.reboot().op_context("write_md380_users")
    }

    /// Write the MD-380-family contact database as an indexed binary image, already
    /// pre-framed by the user-database producer (no `"<len>\n"` prefix is added here).
    pub fn write_md380_indexed_users(&mut self, db: &[u8]) -> Result<(), Error> {
        self.init().op_context("write_md380_indexed_users")?;
        let mut reader = Cursor::new(db);
        self.write_spi_flash_from(MD380_USERDB_SPI_ADDR, db.len() as u32, &mut reader)
            .op_context("write_md380_indexed_users")?;
        self.reboot().op_context("write_md380_indexed_users")
    }

    /// Write a raw byte stream of exactly `size` bytes directly to the MD-380-family
    /// contact database's SPI address, with no framing applied at all.
    pub fn write_raw_md380_users(&mut self, reader: &mut dyn Read, size: u32) -> Result<(), Error> {
        self.init().op_context("write_raw_md380_users")?;
        self.write_spi_flash_from(MD380_USERDB_SPI_ADDR, size, reader)
            .op_context("write_raw_md380_users")?;
        self.reboot().op_context("write_raw_md380_users")
    }

    /// Write the UV-380-family contact database, which (unlike the MD-380 family's SPI
    /// flash residence) lives in internal flash.
    pub fn write_uv380_users(&mut self, db: &[u8]) -> Result<(), Error> {
        self.init().op_context("write_uv380_users")?;
        let mut reader = Cursor::new(db);
        self.write_flash_from(UV380_USERDB_FLASH_ADDR, db.len() as u32, &mut reader)
            .op_context("write_uv380_users")?;
        self.reboot().op_context("write_uv380_users")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn session_with(transport: MockTransport) -> Session<'static, MockTransport> {
        Session::new(transport, 1024, 0x10000)
    }

    #[test]
    fn codeplug_round_trips_through_mock_device() {
        let mut transport = MockTransport::new();
        transport.seed_internal_flash(4 * 1024 * 1024);
        let mut session = session_with(transport);

        let data = vec![0xa5u8; 1024];
        session.write_codeplug(&data).unwrap();

        let mut readback = vec![0u8; 1024];
        session.read_codeplug(&mut readback).unwrap();

        assert_eq!(readback, data);
    }

    #[test]
    fn codeplug_write_crossing_block_256_uses_discontinuous_blocks() {
        let mut transport = MockTransport::new();
        transport.seed_internal_flash(4 * 1024 * 1024);
        let mut session = session_with(transport);

        let data = vec![0u8; 1024 * 258];
        session.write_codeplug(&data).unwrap();

        let blocks = session.transport.dnload_block_sequence();
        // Blocks 0..255 use the plain n+2 mapping; block 256 (the 257th block, index 256)
        // crosses into the reserved window and jumps by 832.
        assert_eq!(blocks[0], 2);
        assert_eq!(blocks[255], 255 + 2);
        assert_eq!(blocks[256], 256 + 2 + 832);
    }

    #[test]
    fn user_db_header_and_payload_are_both_forwarded_exactly() {
        let mut transport = MockTransport::new();
        transport.seed_spi_flash(2 * 1024 * 1024, 0xef, 0x40, 0x18);

        let payload = vec![0x42u8; 123];
        let mut image = b"123\n".to_vec();
        image.extend_from_slice(&payload);
        transport.write_spi_region(MD380_USERDB_SPI_ADDR, &image);

        let mut session = session_with(transport);
        let mut out = Vec::new();
        session.read_md380_users(&mut out).unwrap();

        // Header line (4 bytes: "123\n") plus 123 bytes of payload, 127 bytes total.
        assert_eq!(out.len(), 127);
        assert_eq!(out, image);
    }

    #[test]
    fn user_db_header_below_minimum_is_rejected() {
        let mut transport = MockTransport::new();
        transport.seed_spi_flash(2 * 1024 * 1024, 0xef, 0x40, 0x18);
        transport.write_spi_region(MD380_USERDB_SPI_ADDR, b"7\n");

        let mut session = session_with(transport);
        let mut out = Vec::new();
        let err = session.read_md380_users(&mut out).unwrap_err();
        assert!(matches!(
            root_cause(&err),
            Error::DbSizeOutOfRange { size: 7 }
        ));
    }

    #[test]
    fn user_db_header_above_maximum_is_rejected() {
        let mut transport = MockTransport::new();
        transport.seed_spi_flash(20 * 1024 * 1024, 0xef, 0x40, 0x18);
        transport.write_spi_region(MD380_USERDB_SPI_ADDR, b"20000000\n");

        let mut session = session_with(transport);
        let mut out = Vec::new();
        let err = session.read_md380_users(&mut out).unwrap_err();
        assert!(matches!(
            root_cause(&err),
            Error::DbSizeOutOfRange { size: 20_000_000 }
        ));
    }

    fn root_cause(err: &Error) -> &Error {
        match err {
            Error::WithContext { source, .. } => root_cause(source),
            other => other,
        }
    }
}
