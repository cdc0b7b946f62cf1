//! Library errors

use std::io;

use thiserror::Error;

use crate::esp::command::CommandType;

/// All possible errors returned by multiflash
///
/// The enum variant is the machine-readable kind; the `Display` impl is the
/// short human string.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("No firmware image was provided")]
    MissingImage,

    #[error("The firmware image could not be parsed: {0}")]
    InvalidImage(String),

    #[error("Unknown CPU '{0}'")]
    UnknownCpu(String),

    #[error("Unsupported tool '{0}'")]
    UnsupportedTool(String),

    #[error("The '{cpu}' cannot be programmed with the '{tool}' tool")]
    UnsupportedProtocol { tool: String, cpu: String },

    #[error("Device signature mismatch: expected {expected:02x?}, read {found:02x?}")]
    SignatureMismatch { expected: Vec<u8>, found: Vec<u8> },

    #[error("Device code {0:#04x} is not supported by this bootloader")]
    UnknownDeviceCode(u8),

    #[error("Verification of flash content failed at address {address:#06x}")]
    VerifyFailed { address: u32 },

    #[error("Failed to connect to the bootloader")]
    ConnectBootloaderFailed,

    #[error("No sync reply received from the ROM bootloader")]
    EspNoSync,

    #[error("The flasher stub could not be started: {0}")]
    EspStubFailed(String),

    #[error("{0}")]
    ChipDetect(String),

    #[error("The {chip} does not support {feature}")]
    UnsupportedFeature { chip: String, feature: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("The reconnect callback did not produce a port within {0:?}")]
    ReconnectTimeout(std::time::Duration),

    #[error("The reconnect callback failed: {0}")]
    ReconnectRejected(String),

    #[error("Error while communicating with the device")]
    Connection(#[from] ConnectionError),

    #[error("The bootloader returned an error")]
    RomError(#[from] RomError),

    #[error("Operation was cancelled by the caller")]
    Cancelled,
}

impl Error {
    /// Whether the error is a receive timeout, the only kind the sync retry
    /// loops are allowed to swallow.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::ReceiveTimeout(_))
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Transport-level errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to open the serial port")]
    IoOpen(#[source] io::Error),

    #[error("Failed to close the serial port")]
    IoClose(#[source] io::Error),

    #[error("Failed to read from the serial port")]
    IoRead(#[source] io::Error),

    #[error("Failed to write to the serial port")]
    IoWrite(#[source] io::Error),

    #[error("Timeout while waiting for a {0}reply")]
    ReceiveTimeout(TimedOutCommand),

    #[error("Reply did not fit in the receive buffer")]
    FramingOverflow,

    #[error("Received packet has invalid SLIP framing")]
    SlipFraming,

    #[error("Received packet too large for the decode buffer")]
    OverSizedPacket,

    #[error("Unexpected reply: {0}")]
    ProtocolMismatch(String),

    #[error("The device reported a checksum error for our request")]
    PeerChecksumError,
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::ReceiveTimeout(TimedOutCommand::default()),
            _ => ConnectionError::IoRead(err),
        }
    }
}

impl From<slip_codec::SlipError> for ConnectionError {
    fn from(err: slip_codec::SlipError) -> Self {
        use slip_codec::SlipError;

        match err {
            SlipError::FramingError => Self::SlipFraming,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::SlipFraming,
        }
    }
}

impl From<slip_codec::SlipError> for Error {
    fn from(err: slip_codec::SlipError) -> Self {
        Self::Connection(err.into())
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl std::fmt::Display for TimedOutCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from the ESP ROM or stub loader status bytes
#[derive(Clone, Copy, Debug, Default, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from the ESP bootloader, tagged with the command
/// that triggered it
#[derive(Clone, Copy, Debug, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::ReceiveTimeout(_))) => Err(Error::Connection(
                ConnectionError::ReceiveTimeout(command.into()),
            )),
            res => res,
        }
    }
}
