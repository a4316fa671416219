use thiserror::Error;

use crate::transport::{DfuState, TransportError};

/// All errors that can arise while driving a radio through the DFU protocol.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("{action}: USB transport error")]
    Transport {
        #[source]
        source: TransportError,
        action: &'static str,
    },

    #[error("device entered unexpected state: expected {expected:?}, got {actual:?}")]
    UnexpectedState {
        expected: DfuState,
        actual: DfuState,
    },

    #[error("device did not reach dfuIDLE after initialization")]
    NotIdle,

    #[error(
        "radio is not in bootloader mode (manufacturer string was {found:?}, expected \"AnyRoad Technology\"); \
         to enter bootloader mode, hold PTT and the button above it while powering the radio on"
    )]
    NotBootloader { found: String },

    #[error("address {addr:#x} / size {size:#x} is not a multiple of the block size ({block_size:#x})")]
    BadAlignment {
        addr: u32,
        size: u32,
        block_size: u32,
    },

    #[error(
        "internal-flash block range [{start_block}, {end_block}) crosses the reserved-window \
         boundary at block {max_safe_block}, where the block-number transform is no longer \
         injective; split the transfer so it stays entirely below {max_safe_block} or entirely \
         at or past block 2048"
    )]
    UnsafeBlockRange {
        start_block: u32,
        end_block: u32,
        max_safe_block: u32,
    },

    #[error("short write: wrote {actual} of {expected} bytes")]
    ShortWrite { expected: usize, actual: usize },

    #[error("short read: read {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("user database size header out of range: {size} bytes (must be between 40 and 14 MiB)")]
    DbSizeOutOfRange { size: u64 },

    #[error("unrecognized SPI flash ID {id:06x}")]
    UnknownFlash { id: u32 },

    #[error(
        "SPI flash reported the sentinel ID 0x70f101, which usually indicates a flaky or \
         degraded USB connection; reconnect the radio and try again"
    )]
    DegradedUsb,

    #[error("operation cancelled by progress callback")]
    Cancelled,

    #[error("I/O error on caller-supplied stream")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn transport(action: &'static str, source: TransportError) -> Self {
        Error::Transport { source, action }
    }
}

/// Attaches operation context to a failure, building the colon-separated trail described
/// in the driver's error-handling design: each layer names the operation it was performing
/// when a lower layer failed.
pub trait OperationContext<T> {
    fn op_context(self, context: &str) -> Result<T, Error>;
}

impl<T> OperationContext<T> for Result<T, Error> {
    fn op_context(self, context: &str) -> Result<T, Error> {
        self.map_err(|source| Error::WithContext {
            context: context.to_owned(),
            source: Box::new(source),
        })
    }
}

/// Raised when the caller's progress callback returns an error mid-operation. Carried
/// separately from [`Error`] so callback signatures stay small; converted at the call site.
#[derive(Debug)]
pub struct Cancelled;

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Error::Cancelled
    }
}
