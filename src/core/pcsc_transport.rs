use std::ffi::CString;
use std::time::Duration;

use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE};
use serde::{Deserialize, Serialize};

use crate::core::atr::Atr;
use crate::core::config::ReaderConfig;
use crate::core::error::{ReaderError, Result};
use crate::core::transport::{transport_init_lock, ActivationMode, ResetOutcome, Transport};
use crate::core::utils::format_hex;

/// Information about a PCSC reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub name: String,
    pub card_present: bool,
    pub atr: Option<Vec<u8>>,
}

/// List all PCSC readers with card presence and ATR
pub fn list_readers() -> Result<Vec<ReaderInfo>> {
    let context = {
        let _guard = transport_init_lock();
        Context::establish(Scope::User)?
    };

    let mut infos = Vec::new();
    for name in context.list_readers_owned()? {
        let (card_present, atr) = match context.connect(&name, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => match card.status2_owned() {
                Ok(status) => (true, Some(status.atr().to_vec())),
                Err(_) => (true, None),
            },
            Err(_) => (false, None),
        };
        infos.push(ReaderInfo {
            name: name.to_string_lossy().to_string(),
            card_present,
            atr,
        });
    }
    Ok(infos)
}

/// Transport backed by a PC/SC reader.
///
/// PC/SC activates the card on connect, so `activate` only confirms the card
/// is still answering. Readers have no display; messages go to the log.
pub struct PcscTransport {
    context: Option<Context>,
    reader_name: Option<CString>,
    card: Option<Card>,
}

impl PcscTransport {
    pub fn new() -> Self {
        Self {
            context: None,
            reader_name: None,
            card: None,
        }
    }

    fn context(&self) -> Result<&Context> {
        self.context
            .as_ref()
            .ok_or_else(|| ReaderError::Transport("device not open".to_string()))
    }

    fn reader_name(&self) -> Result<&CString> {
        self.reader_name
            .as_ref()
            .ok_or_else(|| ReaderError::Transport("device not open".to_string()))
    }

    fn reset_card(&mut self) -> Result<Vec<u8>> {
        if let Some(card) = self.card.as_mut() {
            card.reconnect(ShareMode::Shared, Protocols::ANY, Disposition::ResetCard)?;
        } else {
            let card = self
                .context()?
                .connect(self.reader_name()?, ShareMode::Shared, Protocols::ANY)?;
            self.card = Some(card);
        }

        let card = self
            .card
            .as_ref()
            .ok_or_else(|| ReaderError::Transport("no card handle".to_string()))?;
        let status = card.status2_owned()?;
        Ok(status.atr().to_vec())
    }
}

impl Default for PcscTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for PcscTransport {
    fn open(&mut self, config: &ReaderConfig) -> Result<()> {
        log::info!("Opening PCSC reader: {}", config.device);

        let context = {
            let _guard = transport_init_lock();
            Context::establish(Scope::User)?
        };
        let wanted = CString::new(config.device.as_str())
            .map_err(|_| ReaderError::Config(format!("invalid device name: {}", config.device)))?;

        let found = context.list_readers_owned()?.into_iter().any(|r| r == wanted);
        if !found {
            return Err(ReaderError::Transport(format!(
                "reader not found: {}",
                config.device
            )));
        }

        self.context = Some(context);
        self.reader_name = Some(wanted);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(card) = self.card.take() {
            let _ = card
                .disconnect(Disposition::LeaveCard)
                .map_err(|_e| log::warn!("Failed to disconnect cleanly from card"));
        }
        self.reader_name = None;
        self.context = None;
    }

    fn reset(&mut self) -> ResetOutcome {
        match self.reset_card() {
            Ok(atr) => {
                log::debug!("PCSC reset, ATR: {}", format_hex(&atr));
                ResetOutcome::Usable(Atr::new(atr))
            }
            Err(ReaderError::Pcsc(
                pcsc::Error::NoService | pcsc::Error::ReaderUnavailable | pcsc::Error::UnknownReader,
            )) => {
                self.card = None;
                ResetOutcome::Fatal
            }
            Err(e) => {
                log::warn!("PCSC reset failed: {e}");
                self.card = None;
                ResetOutcome::HardwareError
            }
        }
    }

    fn activate(&mut self, _atr: &Atr, mode: ActivationMode) -> Result<()> {
        log::debug!("PCSC activation ({mode} mode)");
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| ReaderError::Transport("card not connected".to_string()))?;
        card.status2_owned()?;
        Ok(())
    }

    fn card_present(&mut self) -> Result<bool> {
        let name = self.reader_name()?.clone();
        let mut states = [ReaderState::new(name, State::UNAWARE)];
        self.context()?
            .get_status_change(Duration::ZERO, &mut states)?;
        Ok(states[0].event_state().contains(State::PRESENT))
    }

    fn display_message(&mut self, message: &str) {
        log::debug!("PCSC display: {message}");
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| ReaderError::Transport("card not connected".to_string()))?;
        let mut response_buf = [0; MAX_BUFFER_SIZE];
        let response = card.transmit(command, &mut response_buf)?;
        Ok(response.to_vec())
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopened_transport_reports_errors() {
        let mut transport = PcscTransport::new();
        assert!(transport.card_present().is_err());
        assert!(transport.transmit(&[0x00, 0xA4, 0x04, 0x00]).is_err());
        assert!(transport
            .activate(&Atr::default(), ActivationMode::Normal)
            .is_err());
        // closing twice is harmless
        transport.close();
        transport.close();
    }
}
