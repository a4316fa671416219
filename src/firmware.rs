//! Region-by-region erase-then-program of firmware images.

use log::info;
use std::io::Read;

use crate::error::{Error, OperationContext};
use crate::session::BOOTLOADER_MANUFACTURER;
use crate::transport::{UsbTransport, FIRMWARE_BASE_BLOCK};
use crate::vendor::SCRIPT_FIRMWARE_ENTRY;
use crate::Session;

/// A wrapped-header file format some firmware images carry; its first 14 bytes are this
/// magic string, followed by a fixed-size header that must be skipped before the real
/// payload starts.
const WRAPPED_HEADER_MAGIC: &[u8; 14] = b"OutSecurityBin";
const WRAPPED_HEADER_LEN: usize = 0x100;

/// One contiguous firmware region: a start address and a size, both in bytes.
#[derive(Copy, Clone, Debug)]
pub struct FirmwareRegion {
    pub start: u32,
    pub size: u32,
}

/// The fixed table of firmware regions this device family programs, starting at
/// `0x0800_c000`.
pub const FIRMWARE_REGIONS: &[FirmwareRegion] = &[
    FirmwareRegion { start: 0x0800_c000, size: 0x04000 },
    FirmwareRegion { start: 0x0801_0000, size: 0x10000 },
    FirmwareRegion { start: 0x0802_0000, size: 0x20000 },
    FirmwareRegion { start: 0x0804_0000, size: 0x20000 },
    FirmwareRegion { start: 0x0806_0000, size: 0x20000 },
    FirmwareRegion { start: 0x0808_0000, size: 0x20000 },
    FirmwareRegion { start: 0x080a_0000, size: 0x20000 },
    FirmwareRegion { start: 0x080c_0000, size: 0x20000 },
    FirmwareRegion { start: 0x080e_0000, size: 0x20000 },
];

impl<'a, T: UsbTransport> Session<'a, T> {
    /// Program a firmware image, region by region. The radio must be running its
    /// bootloader (identified by its manufacturer string) for this to be permitted; unlike
    /// the other high-level operations this one does not reboot the device afterward, since
    /// the device resets itself once manifestation completes.
    pub fn write_firmware(&mut self, reader: &mut dyn Read) -> Result<(), Error> {
        self.init().op_context("write_firmware")?;

        let manufacturer = self.manufacturer().unwrap_or_default().to_owned();
        if manufacturer != BOOTLOADER_MANUFACTURER {
            return Err(Error::NotBootloader { found: manufacturer }).op_context("write_firmware");
        }

        self.md380_cmd(SCRIPT_FIRMWARE_ENTRY).op_context("write_firmware")?;

        for region in FIRMWARE_REGIONS {
            info!("write_firmware: erasing region at {:#x}", region.start);
            self.erase_block(region.start).op_context("write_firmware")?;
        }

        let mut header_probe = [0u8; WRAPPED_HEADER_MAGIC.len()];
        let mut reader = PeekableReader::new(reader);
        let peeked = reader.peek(&mut header_probe)?;
        let has_wrapped_header = peeked == header_probe.len() && &header_probe == WRAPPED_HEADER_MAGIC;
        if has_wrapped_header {
            info!("write_firmware: wrapped-header image detected, skipping {WRAPPED_HEADER_LEN:#x}-byte header");
            reader.skip(WRAPPED_HEADER_LEN)?;
        }

        let total_blocks: u32 = FIRMWARE_REGIONS
            .iter()
            .map(|r| r.size.div_ceil(self.block_size))
            .sum();
        self.progress.set_max_progress(total_blocks.max(1));

        'regions: for region in FIRMWARE_REGIONS {
            self.set_address(region.start).op_context("write_firmware")?;

            let blocks_in_region = region.size.div_ceil(self.block_size);
            let mut buf = vec![0u8; self.block_size as usize];
            for block_index in 0..blocks_in_region {
                let n = reader.read_up_to(&mut buf)?;
                if n == 0 {
                    info!("write_firmware: input exhausted mid-region, stopping");
                    break 'regions;
                }
                if n < buf.len() {
                    buf[n..].fill(0xff);
                }

                let dfu_block = FIRMWARE_BASE_BLOCK + block_index as u16;
                self.transport
                    .dnload(dfu_block, &buf)
                    .map_err(|e| Error::transport("downloading firmware block", e))
                    .op_context("write_firmware")?;
                self.wait_until_ready().op_context("write_firmware")?;

                self.progress.tick().map_err(Error::from).op_context("write_firmware")?;

                if n < buf.len() {
                    break 'regions;
                }
            }
        }

        self.progress.final_progress().map_err(Error::from).op_context("write_firmware")
    }
}

/// A small adapter that lets us peek a fixed number of bytes from an arbitrary `Read`
/// without requiring the caller's stream to be seekable, then continue reading normally
/// (optionally having discarded a header first).
struct PeekableReader<'r> {
    inner: &'r mut dyn Read,
    peeked: Vec<u8>,
    peeked_pos: usize,
}

impl<'r> PeekableReader<'r> {
    fn new(inner: &'r mut dyn Read) -> Self {
        Self {
            inner,
            peeked: Vec::new(),
            peeked_pos: 0,
        }
    }

    /// Fill `buf` from the stream's start, buffering what's read so it can still be consumed
    /// by later calls to `read_up_to`/`skip`. Returns the number of bytes actually available
    /// (may be less than `buf.len()` on a short stream).
    fn peek(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.peeked = buf[..filled].to_vec();
        Ok(filled)
    }

    /// Discard `n` bytes from the front of the stream (which may already be sitting in the
    /// peek buffer).
    fn skip(&mut self, n: usize) -> std::io::Result<()> {
        let from_peek = n.min(self.peeked.len() - self.peeked_pos);
        self.peeked_pos += from_peek;
        let remaining = n - from_peek;
        if remaining > 0 {
            let mut sink = vec![0u8; remaining];
            self.inner.read_exact(&mut sink)?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes, first draining anything left in the peek buffer.
    fn read_up_to(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;

        while filled < buf.len() && self.peeked_pos < self.peeked.len() {
            buf[filled] = self.peeked[self.peeked_pos];
            filled += 1;
            self.peeked_pos += 1;
        }

        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn wrapped_header_is_skipped() {
        let mut payload = WRAPPED_HEADER_MAGIC.to_vec();
        payload.extend(std::iter::repeat(0u8).take(WRAPPED_HEADER_LEN - WRAPPED_HEADER_MAGIC.len()));
        payload.extend_from_slice(b"real firmware bytes");

        let mut cursor = Cursor::new(payload.clone());
        let mut reader = PeekableReader::new(&mut cursor);

        let mut probe = [0u8; WRAPPED_HEADER_MAGIC.len()];
        let n = reader.peek(&mut probe).unwrap();
        assert_eq!(n, WRAPPED_HEADER_MAGIC.len());
        assert_eq!(&probe, WRAPPED_HEADER_MAGIC);

        reader.skip(WRAPPED_HEADER_LEN).unwrap();

        let mut out = vec![0u8; b"real firmware bytes".len()];
        let n = reader.read_up_to(&mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(&out, b"real firmware bytes");
    }

    #[test]
    fn unwrapped_image_is_read_verbatim() {
        let mut cursor = Cursor::new(b"plain firmware".to_vec());
        let mut reader = PeekableReader::new(&mut cursor);

        let mut probe = [0u8; WRAPPED_HEADER_MAGIC.len()];
        let n = reader.peek(&mut probe).unwrap();
        assert!(n < WRAPPED_HEADER_MAGIC.len() || &probe != WRAPPED_HEADER_MAGIC);

        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = reader.read_up_to(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"plain firmware");
    }
}
