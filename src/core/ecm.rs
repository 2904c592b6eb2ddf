//! ECM exchange: dispatch, result interpretation and answer delivery

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::cardsystem::CardResult;
use crate::core::session::ReaderSession;
use crate::core::utils::format_hex;

/// Diagnostic attached to answers for corrupted card responses
pub const CORRUPT_ECM_MESSAGE: &str = "Invalid ecm type for card";

/// Display code for a failed ECM
pub const DISPLAY_ECM_ERROR: &str = "Eer";

/// Entitlement control message request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcmRequest {
    pub caid: u16,
    pub prid: u32,
    pub srvid: u16,
    /// Hash of the message, identifies it in caches and logs
    pub ecmd5: [u8; 16],
    pub ecm: Vec<u8>,
}

impl EcmRequest {
    pub fn new(caid: u16, prid: u32, srvid: u16, ecm: Vec<u8>) -> Self {
        Self {
            caid,
            prid,
            srvid,
            ecmd5: [0; 16],
            ecm,
        }
    }

    pub fn with_hash(mut self, ecmd5: [u8; 16]) -> Self {
        self.ecmd5 = ecmd5;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerCode {
    Found,
    NotFound,
}

/// Extended reason attached to a not-found answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerFlag {
    WrongChecksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CwAlgo {
    #[default]
    Csa,
    Des,
    Aes128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CwAlgoMode {
    Ecb,
    #[default]
    Cbc,
}

/// Extended control word block for non-CSA scrambling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedCw {
    pub algo: CwAlgo,
    pub algo_mode: CwAlgoMode,
    pub session_word: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcmAnswer {
    pub rc: AnswerCode,
    pub rc_ex: Option<AnswerFlag>,
    pub cw: [u8; 16],
    pub msglog: String,
    pub tier: u16,
    pub cw_ex: Option<ExtendedCw>,
}

impl EcmAnswer {
    pub fn new(extended_cw: bool) -> Self {
        Self {
            rc: AnswerCode::NotFound,
            rc_ex: None,
            cw: [0; 16],
            msglog: String::new(),
            tier: 0,
            cw_ex: extended_cw.then(ExtendedCw::default),
        }
    }
}

/// Receives finished ECM answers
pub trait AnswerSink: Send {
    fn write_ecm_answer(
        &mut self,
        reader: &str,
        request: &EcmRequest,
        answer: &EcmAnswer,
        elapsed: Duration,
    );
}

impl ReaderSession {
    /// Run one ECM exchange and hand the answer to `sink`.
    pub fn process_ecm(&mut self, request: &EcmRequest, sink: &mut dyn AnswerSink) -> EcmAnswer {
        let mut answer = EcmAnswer::new(self.config.extended_cw);

        let start = Instant::now();
        let rc = self.do_ecm(request, &mut answer);
        let elapsed = start.elapsed();

        answer.rc = AnswerCode::Found;
        answer.rc_ex = None;
        match rc {
            CardResult::Ok => {}
            CardResult::Error => {
                log::debug!(
                    "{}: Error processing ecm for caid {:04X}, provid {:06X}, srvid {:04X}",
                    self.label(),
                    request.caid,
                    request.prid,
                    request.srvid
                );
                answer.rc = AnswerCode::NotFound;
                self.transport.display_message(DISPLAY_ECM_ERROR);
            }
            CardResult::Corrupt => {
                log::debug!(
                    "{}: Corrupt answer processing ecm for caid {:04X}, provid {:06X}, srvid {:04X}",
                    self.label(),
                    request.caid,
                    request.prid,
                    request.srvid
                );
                answer.rc = AnswerCode::NotFound;
                answer.rc_ex = Some(AnswerFlag::WrongChecksum);
                answer.msglog = CORRUPT_ECM_MESSAGE.to_string();
            }
        }

        sink.write_ecm_answer(self.label(), request, &answer, elapsed);
        self.traffic.last_ecm = Some(Utc::now());
        log::debug!(
            "{}: ecm hash: {} real time: {} ms",
            self.label(),
            format_hex(&request.ecmd5),
            elapsed.as_millis()
        );

        self.post_process();
        answer
    }

    /// Card system cleanup after an answer has been delivered
    pub fn post_process(&mut self) {
        if let Some(system) = self.active_system() {
            system.post_process(self);
        }
    }
}
