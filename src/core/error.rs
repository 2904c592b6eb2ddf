use thiserror::Error;

/// Errors raised by the reader subsystem.
///
/// Only `DeviceOpenFailure` and fatal transport conditions end a session.
/// Card protocol failures are reported per message through `CardResult`
/// and friends and never surface here while a session is running.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("cannot open device {device} after {attempts} attempts")]
    DeviceOpenFailure { device: String, attempts: u32 },

    #[error("error activating card after {0} attempts")]
    ActivationFailure(u32),

    #[error("card system not supported (ATR {0})")]
    UnsupportedProtocol(String),

    #[error("corrupted response from card")]
    CorruptResponse,

    #[error("card exchange failed")]
    GenericExchangeError,

    #[error("raw command not supported by card system")]
    RawCommandUnsupported,

    #[error("smartcard section too long: {len} > {max}")]
    SectionTooLong { len: usize, max: usize },

    #[error("reader initialisation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReaderError>;
