//! Clock negotiation
//!
//! Readers speaking the smartreader or smargo protocol only support a fixed
//! set of clock frequencies. Requested values are floored onto that set.
//! Internal readers of some set-top boxes ignore the request entirely and run
//! at a frequency dictated by the box model.

use serde::Serialize;

use crate::core::config::{ReaderConfig, ReaderType};

/// Supported card clocks, hundredths of MHz, descending
pub const CARD_CLOCKS: [u16; 13] = [1600, 1200, 961, 800, 686, 600, 534, 480, 436, 400, 369, 343, 320];

/// Supported interface clocks, hundredths of MHz, descending.
/// 400 is not a valid floor on this channel, so [400, 436) lands on 369.
pub const INTERFACE_CLOCKS: [u16; 13] = [1600, 1200, 961, 900, 800, 686, 600, 534, 480, 436, 369, 343, 320];

/// 357 is not a smartreader setting; it is bumped up instead of floored.
const NON_NATIVE_357: u16 = 357;

/// Dreambox models whose internal reader always runs at 27 MHz
const DREAMBOX_PREFIXES: [&str; 15] = [
    "dm500hdv2", "dm800sev2", "dm7020hd", "dm500hd", "dm800se", "dm7080", "dm8000", "dm520",
    "dm525", "dm800", "dm820", "dm900", "dm920", "one", "two",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockChannel {
    /// Clock fed to the card
    Card,
    /// Clock of the reader interface
    Interface,
}

impl ClockChannel {
    fn table(self) -> &'static [u16] {
        match self {
            ClockChannel::Card => &CARD_CLOCKS,
            ClockChannel::Interface => &INTERFACE_CLOCKS,
        }
    }
}

/// Map a requested frequency onto the largest supported value not above it.
pub fn negotiate(channel: ClockChannel, requested: u16) -> u16 {
    if requested == NON_NATIVE_357 {
        return 369;
    }
    let table = channel.table();
    table
        .iter()
        .copied()
        .find(|&supported| supported <= requested)
        .unwrap_or(table[table.len() - 1])
}

/// Where the effective clocks came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClockSource {
    /// Fixed by the set-top box model
    BoxOverride,
    /// Floored onto the smartreader table
    Negotiated,
    /// Taken from configuration unchanged
    Configured,
}

/// Effective clock settings of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockSettings {
    pub cardmhz: u16,
    pub mhz: u16,
    pub source: ClockSource,
}

/// Fixed clocks of an internal reader for the given box model, if any.
pub fn box_override(boxtype: &str) -> Option<(u16, Option<u16>)> {
    if DREAMBOX_PREFIXES.iter().any(|p| boxtype.starts_with(p)) {
        return Some((2700, None));
    }
    match boxtype {
        "dm500" | "dm600pvr" => Some((3150, None)),
        "dm7025" => Some((8300, None)),
        // single speed boxes built around a TDA8024
        "ini-8000am" => Some((2700, Some(450))),
        b if b.starts_with("vu") => Some((2700, Some(450))),
        _ => None,
    }
}

/// Work out the clocks a reader will actually run at.
pub fn plan_clocks(config: &ReaderConfig, boxtype: &str) -> ClockSettings {
    if config.reader_type == ReaderType::Internal {
        if let Some((cardmhz, mhz)) = box_override(boxtype) {
            return ClockSettings {
                cardmhz,
                mhz: mhz.unwrap_or(config.mhz),
                source: ClockSource::BoxOverride,
            };
        }
    }

    // PLL readers above 20 MHz run at the configured clock, smartreaders excepted
    let pll = config.cardmhz > 2000 && config.reader_type != ReaderType::Smart;
    if config.is_smart_family() && !pll {
        ClockSettings {
            cardmhz: negotiate(ClockChannel::Card, config.cardmhz),
            mhz: negotiate(ClockChannel::Interface, config.mhz),
            source: ClockSource::Negotiated,
        }
    } else {
        ClockSettings {
            cardmhz: config.cardmhz,
            mhz: config.mhz,
            source: ClockSource::Configured,
        }
    }
}
