//! Programmer error types

use crate::device::Signature;
use crate::SessionState;

/// Programmer errors, generic over the underlying serial error
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    /// Serial port failure (port lost, write failure)
    #[error("serial transport error: {0:?}")]
    Transport(SerialError),

    /// No (or a short) response within the response timeout
    #[error("timeout awaiting bootloader response")]
    Timeout,

    /// Response did not match the expected framing
    #[error("bootloader out of sync: {0}")]
    Desync(Desync),

    /// Device signature is not in the CPU table
    #[error("unknown device signature {0}")]
    UnknownDevice(Signature),

    /// Read-back data differs from the written page
    #[error("verification failed for page at 0x{address:05x}")]
    VerifyMismatch { address: u32 },

    /// Operation is not valid in the current session state
    #[error("operation not permitted in session state {0:?}")]
    State(SessionState),

    /// Device has already been told to leave the bootloader
    #[error("bootloader has already been left")]
    BootloaderLeft,

    /// Page I/O before `cpu_signature` has identified the device
    #[error("device geometry unknown, read the CPU signature first")]
    NoDevice,

    /// Page address or length cannot be expressed for this device
    #[error("invalid page at 0x{address:05x} ({len} bytes)")]
    Address { address: u32, len: usize },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Transport(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Frame-level failures that another attempt may clear
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Desync(_))
    }

    /// Failures after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Frame-level protocol failures
#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
pub enum Desync {
    /// STK500v1 response did not start with INSYNC
    #[error("expected INSYNC, received 0x{0:02x}")]
    NotInSync(u8),

    /// STK500v1 response did not end with OK
    #[error("expected OK, received 0x{0:02x}")]
    NotOk(u8),

    /// STK500v2 message did not start with MESSAGE_START
    #[error("expected message start, received 0x{0:02x}")]
    Start(u8),

    /// STK500v2 header did not carry TOKEN
    #[error("expected token, received 0x{0:02x}")]
    Token(u8),

    /// STK500v2 response echoed the wrong sequence number
    #[error("sequence mismatch (expected {expected}, received {actual})")]
    Sequence { expected: u8, actual: u8 },

    /// STK500v2 checksum did not match the frame contents
    #[error("checksum mismatch (expected 0x{expected:02x}, received 0x{actual:02x})")]
    Checksum { expected: u8, actual: u8 },

    /// STK500v2 answer belongs to another command
    #[error("answer to command 0x{actual:02x}, expected 0x{expected:02x}")]
    Answer { expected: u8, actual: u8 },

    /// STK500v2 answer carried a failure status
    #[error("command failed with status 0x{0:02x}")]
    Status(u8),

    /// Response body had an unexpected length
    #[error("unexpected response length (expected {expected}, received {actual})")]
    Length { expected: usize, actual: usize },
}
