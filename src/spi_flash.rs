//! Identification of the external SPI flash chip that holds the user/contact database.

use crate::error::Error;

/// Sentinel manufacturer/device ID returned by a flaky or degraded USB stack instead of a
/// real chip ID.
const DEGRADED_USB_ID: u32 = 0x70_f1_01;

/// A SPI flash chip this driver recognizes, keyed by its 3-byte JEDEC manufacturer/device ID.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpiFlashChip {
    W25Q128FV,
    W25Q80BL,
}

impl SpiFlashChip {
    pub fn size_bytes(&self) -> u32 {
        match self {
            SpiFlashChip::W25Q128FV => 16 * 1024 * 1024,
            SpiFlashChip::W25Q80BL => 1024 * 1024,
        }
    }

    /// Map a 3-byte JEDEC ID (manufacturer, memory type, capacity) to a known chip.
    pub fn identify(id: u32) -> Result<Self, Error> {
        match id {
            0xef_40_18 => Ok(SpiFlashChip::W25Q128FV),
            0xef_40_14 => Ok(SpiFlashChip::W25Q80BL),
            DEGRADED_USB_ID => Err(Error::DegradedUsb),
            other => Err(Error::UnknownFlash { id: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn w25q128fv_is_16_mib() {
        let chip = SpiFlashChip::identify(0xef_40_18).unwrap();
        assert_eq!(chip, SpiFlashChip::W25Q128FV);
        assert_eq!(chip.size_bytes(), 16 * 1024 * 1024);
    }

    #[test]
    fn w25q80bl_is_1_mib() {
        let chip = SpiFlashChip::identify(0xef_40_14).unwrap();
        assert_eq!(chip, SpiFlashChip::W25Q80BL);
        assert_eq!(chip.size_bytes(), 1024 * 1024);
    }

    #[test]
    fn degraded_usb_sentinel_is_distinguished() {
        assert!(matches!(
            SpiFlashChip::identify(DEGRADED_USB_ID),
            Err(Error::DegradedUsb)
        ));
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(matches!(
            SpiFlashChip::identify(0x00_00_00),
            Err(Error::UnknownFlash { id: 0 })
        ));
    }
}
