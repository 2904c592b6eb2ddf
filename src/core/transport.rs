use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::core::atr::Atr;
use crate::core::config::ReaderConfig;
use crate::core::error::Result;

/// Handshake variant used when activating a card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ActivationMode {
    #[default]
    Normal,
    /// Fallback handshake for cards that fail the normal one
    Deprecated,
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationMode::Normal => f.write_str("normal"),
            ActivationMode::Deprecated => f.write_str("deprecated"),
        }
    }
}

/// Result of a hardware reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Unrecoverable condition, abort the cycle without retrying
    Fatal,
    /// Card answered; run activation and card system resolution
    Usable(Atr),
    /// Reset failed, the card cannot be used this cycle
    HardwareError,
}

/// Byte-level access to a physical reader
pub trait Transport: Send {
    /// Open the reader device
    fn open(&mut self, config: &ReaderConfig) -> Result<()>;

    fn close(&mut self);

    /// Reset the card and collect its ATR
    fn reset(&mut self) -> ResetOutcome;

    /// Bring the card up after reset
    fn activate(&mut self, atr: &Atr, mode: ActivationMode) -> Result<()>;

    /// Query the card-detect signal
    fn card_present(&mut self) -> Result<bool>;

    /// Show a short status code on the device display, if it has one
    fn display_message(&mut self, message: &str);

    /// Write a command to the card and read its answer
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

static TRANSPORT_INIT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Initialise the global transport lock. Call once at process start.
pub fn init_locks() {
    TRANSPORT_INIT_LOCK.get_or_init(|| Mutex::new(()));
}

/// Serialises transport-layer initialisation across readers.
pub fn transport_init_lock() -> MutexGuard<'static, ()> {
    let lock = TRANSPORT_INIT_LOCK.get_or_init(|| Mutex::new(()));
    // a panic while holding the guard leaves nothing to repair
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_mode_display() {
        assert_eq!(ActivationMode::Normal.to_string(), "normal");
        assert_eq!(ActivationMode::Deprecated.to_string(), "deprecated");
        assert_eq!(ActivationMode::default(), ActivationMode::Normal);
    }

    #[test]
    fn test_init_lock_can_be_taken_repeatedly() {
        init_locks();
        {
            let _guard = transport_init_lock();
        }
        let _guard = transport_init_lock();
    }
}
