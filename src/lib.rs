/// Cardreader core - smartcard reader lifecycle for conditional-access clients
///
/// This library drives a physical reader slot from device open through card
/// detection, reset and card system resolution, and routes ECM, EMM and raw
/// commands to the protocol handler that claimed the card.
pub mod cli;
pub mod core;
pub mod systems;

// Re-export commonly used types
pub use core::{
    atr::Atr,
    cardsystem::{CardResult, CardSystem, CardSystemRegistry},
    config::{Config, ReaderConfig, ReaderType},
    error::ReaderError,
    session::{CardStatus, ReaderSession},
    transport::{ActivationMode, ResetOutcome, Transport},
    utils::{format_hex, parse_hex},
    worker::ReaderHandle,
};

// Common error type
pub type Result<T> = anyhow::Result<T>;
