use crate::core::atr::Atr;
use crate::core::cardsystem::{CardResult, CardSystem};
use crate::core::dispatch::CmdPacket;
use crate::core::session::ReaderSession;
use crate::core::utils::{describe_status_word, format_hex_spaced};

/// Generic ISO 7816 pass-through.
///
/// Claims any card with a well-formed ATR and forwards raw commands
/// unchanged. It has no ECM or EMM support.
#[derive(Debug, Default)]
pub struct Iso7816System;

/// Per-card state kept in the session
#[derive(Debug, Default)]
pub struct Iso7816Data {
    pub historical: Vec<u8>,
    pub commands: u32,
}

impl CardSystem for Iso7816System {
    fn name(&self) -> &'static str {
        "iso7816"
    }

    fn card_init(&self, session: &mut ReaderSession, atr: &Atr) -> bool {
        if !atr.has_valid_ts() {
            return false;
        }
        let historical = atr.historical_bytes().unwrap_or_default().to_vec();
        session.set_system_data(Iso7816Data {
            historical,
            commands: 0,
        });
        true
    }

    fn card_info(&self, session: &mut ReaderSession) {
        let label = session.label().to_string();
        if let Some(data) = session.system_data_mut::<Iso7816Data>() {
            log::info!(
                "{label}: historical bytes: {}",
                format_hex_spaced(&data.historical)
            );
        }
    }

    fn do_rawcmd(&self, session: &mut ReaderSession, packet: &mut CmdPacket) -> Option<CardResult> {
        let response = match session.cmd2icc(&packet.command) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{}: raw command failed: {e}", session.label());
                return Some(CardResult::Error);
            }
        };
        if let Some(data) = session.system_data_mut::<Iso7816Data>() {
            data.commands += 1;
        }

        if let [.., sw1, sw2] = response[..] {
            log::debug!(
                "{}: status {sw1:02X} {sw2:02X} ({})",
                session.label(),
                describe_status_word(sw1, sw2)
            );
        }
        packet.response = response;
        Some(CardResult::Ok)
    }
}
