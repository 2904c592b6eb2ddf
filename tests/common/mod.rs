//! Test doubles shared by the integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cardreader_core::core::{
    atr::Atr,
    cardsystem::{CardResult, CardSystem, CardSystemRegistry},
    config::{CardDetect, ReaderConfig, ReaderType},
    dispatch::{CmdPacket, EmmPacket},
    ecm::{AnswerSink, EcmAnswer, EcmRequest},
    error::{ReaderError, Result},
    retry::Sleeper,
    session::{ReaderSession, StatusEvent, StatusSink},
    transport::{ActivationMode, ResetOutcome, Transport},
};

pub const TEST_ATR: [u8; 6] = [0x3B, 0x02, 0x14, 0x50, 0x90, 0x00];

/// Everything the fake transport has been asked to do
#[derive(Debug)]
pub struct FakeState {
    pub open_failures: u32,
    pub open_calls: u32,
    pub close_calls: u32,
    pub reset_outcome: ResetOutcome,
    pub reset_calls: u32,
    pub fail_normal: bool,
    pub fail_deprecated: bool,
    pub activations: Vec<ActivationMode>,
    pub card_present: bool,
    pub presence_calls: u32,
    pub messages: Vec<String>,
    pub transmitted: Vec<Vec<u8>>,
    pub response: Vec<u8>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            open_failures: 0,
            open_calls: 0,
            close_calls: 0,
            reset_outcome: ResetOutcome::Usable(Atr::new(TEST_ATR.to_vec())),
            reset_calls: 0,
            fail_normal: false,
            fail_deprecated: false,
            activations: Vec::new(),
            card_present: true,
            presence_calls: 0,
            messages: Vec::new(),
            transmitted: Vec::new(),
            response: vec![0x90, 0x00],
        }
    }
}

impl FakeState {
    /// Calls that reach the card or the detect line
    pub fn io_calls(&self) -> u32 {
        self.reset_calls + self.activations.len() as u32 + self.presence_calls + self.transmitted.len() as u32
    }
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> (Self, Arc<Mutex<FakeState>>) {
        let transport = Self::default();
        let state = Arc::clone(&transport.state);
        (transport, state)
    }
}

impl Transport for FakeTransport {
    fn open(&mut self, _config: &ReaderConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.open_calls += 1;
        if state.open_calls <= state.open_failures {
            return Err(ReaderError::Transport("no such device".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().close_calls += 1;
    }

    fn reset(&mut self) -> ResetOutcome {
        let mut state = self.state.lock().unwrap();
        state.reset_calls += 1;
        state.reset_outcome.clone()
    }

    fn activate(&mut self, _atr: &Atr, mode: ActivationMode) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.activations.push(mode);
        let fail = match mode {
            ActivationMode::Normal => state.fail_normal,
            ActivationMode::Deprecated => state.fail_deprecated,
        };
        if fail {
            return Err(ReaderError::Transport("card not answering".to_string()));
        }
        Ok(())
    }

    fn card_present(&mut self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.presence_calls += 1;
        Ok(state.card_present)
    }

    fn display_message(&mut self, message: &str) {
        self.state.lock().unwrap().messages.push(message.to_string());
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.transmitted.push(command.to_vec());
        Ok(state.response.clone())
    }
}

/// Records delays instead of sleeping
#[derive(Clone, Default)]
pub struct FakeSleeper(pub Arc<Mutex<Vec<Duration>>>);

impl Sleeper for FakeSleeper {
    fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}

#[derive(Clone, Default)]
pub struct RecordingStatusSink(pub Arc<Mutex<Vec<StatusEvent>>>);

impl RecordingStatusSink {
    pub fn count(&self, event: StatusEvent) -> usize {
        self.0.lock().unwrap().iter().filter(|&&e| e == event).count()
    }
}

impl StatusSink for RecordingStatusSink {
    fn event(&mut self, _reader: &str, event: StatusEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[derive(Clone, Default)]
pub struct RecordingAnswerSink(pub Arc<Mutex<Vec<EcmAnswer>>>);

impl AnswerSink for RecordingAnswerSink {
    fn write_ecm_answer(
        &mut self,
        _reader: &str,
        _request: &EcmRequest,
        answer: &EcmAnswer,
        _elapsed: Duration,
    ) {
        self.0.lock().unwrap().push(answer.clone());
    }
}

/// Scratch data stored by `TestSystem` while it considers a card
#[derive(Debug, PartialEq, Eq)]
pub struct TrialData(pub &'static str);

/// Card system with scripted answers that logs every call it receives
pub struct TestSystem {
    pub name: &'static str,
    pub accepts: bool,
    pub ecm: Option<CardResult>,
    pub emm: Option<CardResult>,
    pub raw: Option<CardResult>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl TestSystem {
    pub fn new(name: &'static str, accepts: bool, calls: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name,
            accepts,
            ecm: Some(CardResult::Ok),
            emm: Some(CardResult::Ok),
            raw: None,
            calls: Arc::clone(calls),
        }
    }

    fn log(&self, call: &str) {
        self.calls.lock().unwrap().push(format!("{}:{call}", self.name));
    }
}

impl CardSystem for TestSystem {
    fn name(&self) -> &'static str {
        self.name
    }

    fn card_init(&self, session: &mut ReaderSession, _atr: &Atr) -> bool {
        self.log(&format!("init:{}", session.has_system_data()));
        session.set_system_data(TrialData(self.name));
        if self.accepts {
            session.identity.caid = 0x0500;
            session.identity.hexserial = [0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78];
            session.identity.prid[0] = [0x00, 0x02, 0x38, 0x00];
            session.identity.nprov = 1;
        }
        self.accepts
    }

    fn card_done(&self, session: &mut ReaderSession) {
        let still_mine = session
            .system_data_mut::<TrialData>()
            .is_some_and(|data| data.0 == self.name);
        self.log(&format!("done:{still_mine}"));
    }

    fn card_info(&self, _session: &mut ReaderSession) {
        self.log("info");
    }

    fn poll_status(&self, _session: &mut ReaderSession) {
        self.log("poll");
    }

    fn do_ecm(
        &self,
        _session: &mut ReaderSession,
        _request: &EcmRequest,
        answer: &mut EcmAnswer,
    ) -> Option<CardResult> {
        self.log("ecm");
        if self.ecm == Some(CardResult::Ok) {
            answer.cw = [0x11; 16];
            answer.tier = 7;
        }
        self.ecm
    }

    fn do_emm(&self, _session: &mut ReaderSession, _packet: &EmmPacket) -> Option<CardResult> {
        self.log("emm");
        self.emm
    }

    fn do_rawcmd(&self, session: &mut ReaderSession, packet: &mut CmdPacket) -> Option<CardResult> {
        self.log("raw");
        let rc = self.raw?;
        packet.response = session.cmd2icc(&packet.command).ok()?;
        Some(rc)
    }

    fn post_process(&self, _session: &mut ReaderSession) {
        self.log("post");
    }
}

pub fn reader_config() -> ReaderConfig {
    ReaderConfig {
        label: "sci0".to_string(),
        device: "/dev/sci0".to_string(),
        reader_type: ReaderType::Mouse,
        detect: CardDetect(0),
        ..Default::default()
    }
}

/// Session wired to fakes, plus handles on what they record
pub struct Harness {
    pub session: ReaderSession,
    pub state: Arc<Mutex<FakeState>>,
    pub sleeps: FakeSleeper,
    pub events: RecordingStatusSink,
}

pub fn harness(config: ReaderConfig, registry: CardSystemRegistry) -> Harness {
    let (transport, state) = FakeTransport::new();
    let sleeps = FakeSleeper::default();
    let events = RecordingStatusSink::default();
    let session = ReaderSession::new(config, Box::new(transport), Arc::new(registry))
        .with_sleeper(Box::new(sleeps.clone()))
        .with_status_sink(Box::new(events.clone()));
    Harness {
        session,
        state,
        sleeps,
        events,
    }
}

/// Bring a harness session to `Inserted` through health check and reset
pub fn insert_card(h: &mut Harness) {
    h.session.init().unwrap();
    h.session.check_health();
    h.session.do_reset().unwrap();
}
