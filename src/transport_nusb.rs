//! A concrete [`UsbTransport`] backend over a real USB device, built on `nusb` the way the
//! teacher crate built its transport directly on `hidapi`: this module owns no protocol
//! knowledge, only the mapping from the trait's calls to standard DFU class requests on a
//! claimed interface.

use std::time::Duration;

use futures_lite::future::block_on;
use nusb::descriptors::language_id::US_ENGLISH;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};

use crate::transport::{DfuState, DfuStatus, DfuStatusCode, TransportError, UsbTransport};

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_GETSTATE: u8 = 5;
const DFU_ABORT: u8 = 6;

const GETSTATUS_LEN: u16 = 6;
const GETSTATE_LEN: u16 = 1;

const STRING_DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Wraps an already-opened, already-claimed `nusb` interface and issues the standard USB
/// DFU 1.1 class requests (`bmRequestType = Class | Interface`) against it. Device
/// enumeration, claiming, and alternate-setting selection beyond `select_configuration`
/// are the caller's responsibility — this crate does not discover devices on its own.
pub struct NusbTransport {
    device: nusb::Device,
    interface: nusb::Interface,
}

impl NusbTransport {
    /// Build a transport around a device and one of its already-claimed interfaces.
    pub fn new(device: nusb::Device, interface: nusb::Interface) -> Self {
        Self { device, interface }
    }

    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError> {
        block_on(self.interface.control_out(ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: self.interface.interface_number() as u16,
            data,
        }))
        .into_result()
        .map(|_| ())
        .map_err(TransportError::new)
    }

    fn control_in(&mut self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        block_on(self.interface.control_in(ControlIn {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: self.interface.interface_number() as u16,
            length,
        }))
        .into_result()
        .map_err(TransportError::new)
    }
}

impl UsbTransport for NusbTransport {
    fn dnload(&mut self, block: u16, payload: &[u8]) -> Result<(), TransportError> {
        self.control_out(DFU_DNLOAD, block, payload)
    }

    fn upload(&mut self, block: u16, buf: &mut [u8]) -> Result<usize, TransportError> {
        let data = self.control_in(DFU_UPLOAD, block, buf.len() as u16)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn get_status(&mut self) -> Result<DfuStatus, TransportError> {
        let data = self.control_in(DFU_GETSTATUS, 0, GETSTATUS_LEN)?;
        if data.len() < GETSTATUS_LEN as usize {
            return Err(TransportError::msg(format!(
                "GetStatus response was {} bytes, expected {GETSTATUS_LEN}",
                data.len()
            )));
        }

        let status = DfuStatusCode::try_from(data[0])
            .map_err(|_| TransportError::msg(format!("device reported unknown bStatus {:#04x}", data[0])))?;
        let poll_timeout_ms = u32::from(data[1]) | u32::from(data[2]) << 8 | u32::from(data[3]) << 16;
        let state = DfuState::try_from(data[4])
            .map_err(|_| TransportError::msg(format!("device reported unknown bState {:#04x}", data[4])))?;

        Ok(DfuStatus { status, poll_timeout_ms, state })
    }

    fn get_state(&mut self) -> Result<DfuState, TransportError> {
        let data = self.control_in(DFU_GETSTATE, 0, GETSTATE_LEN)?;
        let byte = *data
            .first()
            .ok_or_else(|| TransportError::msg("GetState response was empty"))?;
        DfuState::try_from(byte).map_err(|_| TransportError::msg(format!("device reported unknown bState {byte:#04x}")))
    }

    fn clr_status(&mut self) -> Result<(), TransportError> {
        self.control_out(DFU_CLRSTATUS, 0, &[])
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        self.control_out(DFU_ABORT, 0, &[])
    }

    fn detach(&mut self) -> Result<(), TransportError> {
        self.control_out(DFU_DETACH, 0, &[])
    }

    fn select_configuration(&mut self, cfg: u8, _iface: u8, alt: u8) -> Result<(), TransportError> {
        self.device.set_configuration(cfg).map_err(TransportError::new)?;
        self.interface.set_alt_setting(alt).map_err(TransportError::new)
    }

    fn get_string_descriptor(&mut self, index: u8) -> Result<String, TransportError> {
        block_on(
            self.device
                .get_string_descriptor(index, US_ENGLISH, STRING_DESCRIPTOR_TIMEOUT),
        )
        .map_err(TransportError::new)
    }
}
