//! Card systems shipped with the crate
use std::sync::Arc;

use crate::core::cardsystem::CardSystemRegistry;

pub mod iso7816;

pub use iso7816::Iso7816System;

/// Registry used when no protocol-specific systems are plugged in.
/// The ISO 7816 pass-through accepts any well-formed ATR, so it goes last.
pub fn default_registry() -> CardSystemRegistry {
    CardSystemRegistry::new().register(Arc::new(Iso7816System))
}
