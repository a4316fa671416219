//! The DFU transport this driver consumes. A lower layer is expected to speak standard USB
//! DFU (plus whatever enumeration/configuration selection it needs) on a single claimed
//! interface; everything above this module is protocol overlay.

use num_enum::TryFromPrimitive;
use std::fmt;

/// States a DFU device can be in, taken from the USB DFU 1.1 specification's `bState`
/// enumeration. Names follow the upload/download-agnostic "read"/"write" vocabulary used
/// by this driver's vendor, rather than the spec's own `UPLOAD`/`DNLOAD` wording, but the
/// ordinal values are unchanged so a transport can convert with a bare `as u8`/`TryFrom<u8>`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuWriteSync = 3,
    DfuWriteBusy = 4,
    DfuWriteIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuReadIdle = 9,
    DfuError = 10,
}

/// Status codes a DFU device can report, taken from the USB DFU 1.1 specification's
/// `bStatus` enumeration. Kept for diagnostics; the driver itself only distinguishes
/// `Ok` from everything else.
#[repr(u8)]
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum DfuStatusCode {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
}

impl DfuStatusCode {
    pub fn is_ok(&self) -> bool {
        *self == DfuStatusCode::OK
    }
}

/// The decoded payload of a `GetStatus` request.
#[derive(Copy, Clone, Debug)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
}

/// Block/transfer identifiers used on the control pipe. Not a DFU concept; vendor-specific
/// to this device family.
pub const CONTROL_BLOCK: u16 = 0;
pub const SPI_BLOCK: u16 = 1;
pub const FIRMWARE_BASE_BLOCK: u16 = 2;

/// The lower-level DFU transport this driver is built on top of. An implementation owns a
/// claimed USB interface and translates these calls into USB control transfers; it does not
/// need to know anything about this device family's vendor opcodes or memory map.
pub trait UsbTransport {
    /// `DFU_DNLOAD`: send `payload` to the given block/transaction number.
    fn dnload(&mut self, block: u16, payload: &[u8]) -> Result<(), TransportError>;

    /// `DFU_UPLOAD`: fill as much of `buf` as the device returns, return the number of bytes
    /// actually written.
    fn upload(&mut self, block: u16, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// `DFU_GETSTATUS`.
    fn get_status(&mut self) -> Result<DfuStatus, TransportError>;

    /// `DFU_GETSTATE`.
    fn get_state(&mut self) -> Result<DfuState, TransportError>;

    /// `DFU_CLRSTATUS`.
    fn clr_status(&mut self) -> Result<(), TransportError>;

    /// `DFU_ABORT`.
    fn abort(&mut self) -> Result<(), TransportError>;

    /// `DFU_DETACH`.
    fn detach(&mut self) -> Result<(), TransportError>;

    /// Select configuration/interface/alternate setting, e.g. `(0, 0, 0)` during `init`.
    fn select_configuration(&mut self, cfg: u8, iface: u8, alt: u8) -> Result<(), TransportError>;

    /// Read a USB string descriptor by index.
    fn get_string_descriptor(&mut self, index: u8) -> Result<String, TransportError>;
}

/// Errors a transport implementation can raise. The driver core never inspects the
/// variants; it only propagates or wraps them.
#[derive(Debug)]
pub struct TransportError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl TransportError {
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        TransportError(Box::new(source))
    }

    pub fn msg(text: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Msg(String);
        impl fmt::Display for Msg {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl std::error::Error for Msg {}
        TransportError(Box::new(Msg(text.into())))
    }
}
