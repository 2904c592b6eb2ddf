//! Routing of ECM, EMM and raw commands to the committed card system

use std::fs;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::cardsystem::CardResult;
use crate::core::config::ReaderType;
use crate::core::ecm::{EcmAnswer, EcmRequest};
use crate::core::error::{ReaderError, Result};
use crate::core::session::ReaderSession;
use crate::core::utils::check_sct_len;

/// Largest offline EMM file accepted
const MAX_EMM_FILE_SIZE: usize = 64 * 1024;

/// Entitlement management message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmmPacket {
    pub emm: Vec<u8>,
    pub caid: u16,
    pub provid: u32,
}

impl EmmPacket {
    pub fn new(emm: Vec<u8>) -> Self {
        Self {
            emm,
            caid: 0,
            provid: 0,
        }
    }

    /// EMM subtype used for nano filtering: low 7 bits of the first byte
    pub fn nano(&self) -> Option<u8> {
        self.emm.first().map(|b| b % 0x80)
    }
}

/// Raw command for the card and the card's answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdPacket {
    pub command: Vec<u8>,
    pub response: Vec<u8>,
}

impl CmdPacket {
    pub fn new(command: Vec<u8>) -> Self {
        Self {
            command,
            response: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmmResult {
    Written,
    /// Not written: no card, no card system, or the card refused it
    Failed,
    /// Suppressed by the nano mask before reaching the card
    Filtered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawCmdResult {
    /// The card system has no dedicated raw command support
    NoDedicatedSupport,
    Done(CardResult),
}

impl RawCmdResult {
    pub fn check(self) -> Result<()> {
        match self {
            RawCmdResult::NoDedicatedSupport => Err(ReaderError::RawCommandUnsupported),
            RawCmdResult::Done(rc) => rc.check(),
        }
    }
}

impl ReaderSession {
    /// Smartreaders are assumed healthy; everything else is checked first.
    fn dispatch_ready(&mut self) -> bool {
        if self.config.reader_type == ReaderType::Smart {
            return true;
        }
        self.check_health()
    }

    /// Dispatch an ECM. Without a card system the result is `Error`.
    pub fn do_ecm(&mut self, request: &EcmRequest, answer: &mut EcmAnswer) -> CardResult {
        let Some(system) = self.active_system() else {
            return CardResult::Error;
        };
        if !self.dispatch_ready() {
            return CardResult::Error;
        }

        self.traffic.last_srvid = request.srvid;
        self.traffic.last_caid = request.caid;
        self.traffic.last_provid = request.prid;
        self.traffic.last = Some(Utc::now());

        let rc = system
            .do_ecm(self, request, answer)
            .unwrap_or(CardResult::Error);
        log::debug!("{}: do_ecm rc={rc:?}", self.label());
        rc
    }

    pub fn is_nano_filtered(&self, packet: &EmmPacket) -> bool {
        packet
            .nano()
            .is_some_and(|nano| self.nano_mask & (1u128 << nano) != 0)
    }

    /// Dispatch an EMM, unless its subtype is suppressed
    pub fn do_emm(&mut self, packet: &EmmPacket) -> EmmResult {
        let Some(system) = self.active_system() else {
            return EmmResult::Failed;
        };
        if !self.dispatch_ready() {
            return EmmResult::Failed;
        }
        if self.is_nano_filtered(packet) {
            return EmmResult::Filtered;
        }

        match system.do_emm(self, packet) {
            Some(CardResult::Ok) => {
                self.emm_last = Some(Utc::now());
                EmmResult::Written
            }
            _ => EmmResult::Failed,
        }
    }

    pub fn do_rawcmd(&mut self, packet: &mut CmdPacket) -> RawCmdResult {
        let Some(system) = self.active_system() else {
            return RawCmdResult::NoDedicatedSupport;
        };
        if !self.dispatch_ready() {
            return RawCmdResult::Done(CardResult::Error);
        }
        match system.do_rawcmd(self, packet) {
            Some(rc) => RawCmdResult::Done(rc),
            None => RawCmdResult::NoDedicatedSupport,
        }
    }

    /// Feed the configured offline EMM file to the card, one section at a time.
    pub(crate) fn load_emm_file(&mut self) {
        let Some(path) = self.config.emm_file.clone() else {
            return;
        };
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("{}: cannot read EMM file {}: {e}", self.label(), path.display());
                return;
            }
        };
        if data.len() > MAX_EMM_FILE_SIZE {
            log::warn!("{}: EMM file {} too large", self.label(), path.display());
            return;
        }

        let mut offset = 0;
        let mut written = 0;
        while offset < data.len() {
            let len = match check_sct_len(&data[offset..], offset, data.len()) {
                Ok(len) => len,
                Err(e) => {
                    log::warn!("{}: EMM file {}: {e}", self.label(), path.display());
                    break;
                }
            };
            let packet = EmmPacket {
                emm: data[offset..offset + len].to_vec(),
                caid: self.identity.caid,
                provid: 0,
            };
            if self.do_emm(&packet) == EmmResult::Written {
                written += 1;
            }
            offset += len;
        }
        log::info!(
            "{}: {written} EMM(s) written from {}",
            self.label(),
            path.display()
        );
    }
}
