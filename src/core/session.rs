//! Reader session: the long-lived state of one physical reader slot

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;

use crate::core::cardsystem::{CardSystem, CardSystemRegistry};
use crate::core::clock::{plan_clocks, ClockSettings, ClockSource};
use crate::core::config::ReaderConfig;
use crate::core::error::{ReaderError, Result};
use crate::core::retry::{RetryOutcome, RetryPolicy, Sleeper, ThreadSleeper};
use crate::core::transport::{ActivationMode, ResetOutcome, Transport};
use crate::core::utils::{format_hex, format_hex_spaced};
use crate::core::worker::Job;

/// Maximum number of providers tracked per card
pub const MAX_PROV: usize = 16;

/// Command header length of a card write
pub const CMD_LEN: usize = 5;

/// Largest payload carried by a single card write
pub const MAX_ECM_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardStatus {
    Unknown,
    NoCard,
    /// Card seen, reset pending
    NeedInit,
    Inserted,
    Failure,
    DeviceError,
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CardStatus::Unknown => "unknown",
            CardStatus::NoCard => "no card",
            CardStatus::NeedInit => "need init",
            CardStatus::Inserted => "inserted",
            CardStatus::Failure => "failure",
            CardStatus::DeviceError => "device error",
        };
        f.write_str(name)
    }
}

/// Status indications and announcements emitted by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    CardDetected,
    CardEjected,
    ActivationError,
    /// Normal mode failed, retrying in deprecated mode
    DeprecatedFallback,
    FoundCardSystem,
    UnsupportedCardSystem,
    /// Local card available to peer sharing
    LocalCardUp(u16),
    LocalCardEjected(u16),
}

/// Side-effect sink for status events (LEDs, peer announcements)
pub trait StatusSink: Send {
    fn event(&mut self, reader: &str, event: StatusEvent);
}

/// Default sink, logs events at debug level
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn event(&mut self, reader: &str, event: StatusEvent) {
        log::debug!("{reader}: status {event:?}");
    }
}

/// One entitlement reported by the card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub caid: u16,
    pub provid: u32,
    pub id: u64,
    pub class: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Identifiers cached from the card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardIdentity {
    pub hexserial: [u8; 8],
    pub prid: [[u8; 4]; MAX_PROV],
    pub nprov: usize,
    pub caid: u16,
    pub entitlements: Vec<Entitlement>,
}

impl CardIdentity {
    /// Sentinel values: zero serial, all-ones providers
    pub fn cleared(caid: u16) -> Self {
        Self {
            hexserial: [0; 8],
            prid: [[0xFF; 4]; MAX_PROV],
            nprov: 0,
            caid,
            entitlements: Vec::new(),
        }
    }
}

impl Default for CardIdentity {
    fn default() -> Self {
        Self::cleared(0)
    }
}

/// Traffic bookkeeping of the client owning the reader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub last: Option<DateTime<Utc>>,
    pub last_srvid: u16,
    pub last_caid: u16,
    pub last_provid: u32,
    pub last_ecm: Option<DateTime<Utc>>,
    pub last_emm: Option<DateTime<Utc>>,
}

/// Runtime state of one reader slot.
///
/// Owned by a single worker; every operation runs to completion before the
/// next one starts.
pub struct ReaderSession {
    pub(crate) config: ReaderConfig,
    boxtype: String,
    clocks: Option<ClockSettings>,
    pub(crate) transport: Box<dyn Transport>,
    registry: Arc<CardSystemRegistry>,
    pub(crate) sleeper: Box<dyn Sleeper>,
    pub(crate) status_sink: Box<dyn StatusSink>,
    jobs: Option<Sender<Job>>,
    enabled: Arc<AtomicBool>,
    pub(crate) card_status: CardStatus,
    csystem: Option<Arc<dyn CardSystem>>,
    csystem_data: Option<Box<dyn Any + Send>>,
    pub identity: CardIdentity,
    pub(crate) nano_mask: u128,
    pub(crate) activation_mode: ActivationMode,
    pub(crate) reset_always: bool,
    pub traffic: TrafficStats,
    pub(crate) emm_last: Option<DateTime<Utc>>,
}

impl ReaderSession {
    pub fn new(
        config: ReaderConfig,
        transport: Box<dyn Transport>,
        registry: Arc<CardSystemRegistry>,
    ) -> Self {
        let enabled = Arc::new(AtomicBool::new(config.enabled));
        let nano_mask = config.nano_bitmap();
        let identity = CardIdentity::cleared(config.caid);
        Self {
            config,
            boxtype: String::new(),
            clocks: None,
            transport,
            registry,
            sleeper: Box::new(ThreadSleeper),
            status_sink: Box::new(LogStatusSink),
            jobs: None,
            enabled,
            card_status: CardStatus::Unknown,
            csystem: None,
            csystem_data: None,
            identity,
            nano_mask,
            activation_mode: ActivationMode::Normal,
            reset_always: false,
            traffic: TrafficStats::default(),
            emm_last: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_status_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.status_sink = sink;
        self
    }

    pub fn with_boxtype(mut self, boxtype: impl Into<String>) -> Self {
        self.boxtype = boxtype.into();
        self
    }

    /// Queue used to schedule follow-up work (resets) for this session
    pub fn attach_queue(&mut self, jobs: Sender<Job>) {
        self.jobs = Some(jobs);
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn card_status(&self) -> CardStatus {
        self.card_status
    }

    pub fn registry(&self) -> &Arc<CardSystemRegistry> {
        &self.registry
    }

    pub fn clocks(&self) -> Option<ClockSettings> {
        self.clocks
    }

    /// Shared enabled flag, cleared when the device is given up on
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.enabled.load(Ordering::SeqCst)
    }

    /// Handshake mode the card was last resolved with
    pub fn activation_mode(&self) -> ActivationMode {
        self.activation_mode
    }

    /// Every card command is preceded by a hardware reset
    pub fn reset_always(&self) -> bool {
        self.reset_always
    }

    pub fn emm_last(&self) -> Option<DateTime<Utc>> {
        self.emm_last
    }

    pub fn nano_mask(&self) -> u128 {
        self.nano_mask
    }

    pub fn csystem_active(&self) -> bool {
        self.csystem.is_some()
    }

    /// Committed card system, if any
    pub fn card_system(&self) -> Option<&Arc<dyn CardSystem>> {
        self.csystem.as_ref()
    }

    pub(crate) fn active_system(&self) -> Option<Arc<dyn CardSystem>> {
        self.csystem.clone()
    }

    /// Store protocol state for the card system being initialised
    pub fn set_system_data<T: Any + Send>(&mut self, data: T) {
        self.csystem_data = Some(Box::new(data));
    }

    pub fn system_data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.csystem_data.as_mut()?.downcast_mut::<T>()
    }

    pub fn has_system_data(&self) -> bool {
        self.csystem_data.is_some()
    }

    pub(crate) fn drop_system_data(&mut self) {
        self.csystem_data = None;
    }

    pub(crate) fn commit_system(&mut self, system: Arc<dyn CardSystem>) {
        self.csystem = Some(system);
    }

    /// Un-commit the card system, running its release hook first
    pub(crate) fn release_card_system(&mut self) {
        if let Some(system) = self.csystem.take() {
            system.card_done(self);
        }
        self.drop_system_data();
    }

    pub(crate) fn indicate(&mut self, event: StatusEvent) {
        self.status_sink.event(&self.config.label, event);
    }

    /// Enqueue a job on this session's own worker
    pub(crate) fn schedule(&mut self, job: Job) {
        match &self.jobs {
            Some(jobs) => {
                if jobs.send(job).is_err() {
                    log::warn!("{}: worker queue closed", self.config.label);
                }
            }
            None => log::debug!("{}: no worker queue, {job:?} dropped", self.config.label),
        }
    }

    /// Forget everything known about the card.
    ///
    /// The CAID survives only while re-initialising with
    /// `keep_caid_on_reinit` set.
    pub fn nullify_card(&mut self) {
        self.release_card_system();
        let keep_caid = self.config.keep_caid_on_reinit && self.card_status == CardStatus::NeedInit;
        let caid = if keep_caid { self.identity.caid } else { 0 };
        self.identity = CardIdentity::cleared(caid);
    }

    /// Mark the card for re-initialisation; the next reset will run the
    /// full activation sequence.
    pub fn request_reinit(&mut self) {
        if self.card_status != CardStatus::DeviceError {
            self.card_status = CardStatus::NeedInit;
        }
    }

    /// Open the device, retrying while the reader stays enabled, then settle
    /// the clocks.
    pub fn init(&mut self) -> Result<ClockSettings> {
        let label = self.config.label.clone();
        let enabled = Arc::clone(&self.enabled);
        let outcome = RetryPolicy::DEVICE_OPEN.run(
            self.sleeper.as_ref(),
            || enabled.load(Ordering::SeqCst),
            |_, e| log::info!("{label}: Cannot open device: {} ({e})", self.config.device),
            |_| self.transport.open(&self.config),
        );

        match outcome {
            RetryOutcome::Done { .. } => {}
            RetryOutcome::Cancelled { .. } => return Err(ReaderError::Cancelled),
            RetryOutcome::Exhausted { attempts, .. } => {
                log::error!("{label}: giving up on device {}", self.config.device);
                self.card_status = CardStatus::DeviceError;
                self.transport.close();
                self.config.enabled = false;
                self.enabled.store(false, Ordering::SeqCst);
                return Err(ReaderError::DeviceOpenFailure {
                    device: self.config.device.clone(),
                    attempts,
                });
            }
        }

        let clocks = plan_clocks(&self.config, &self.boxtype);
        self.config.cardmhz = clocks.cardmhz;
        self.config.mhz = clocks.mhz;
        self.clocks = Some(clocks);
        self.log_initialised(clocks);
        Ok(clocks)
    }

    fn log_initialised(&self, clocks: ClockSettings) {
        let cfg = &self.config;
        match clocks.source {
            ClockSource::BoxOverride => log::info!(
                "{}: {} found, internal card clock set to {:.2} MHz",
                cfg.label,
                self.boxtype,
                clocks.cardmhz as f32 / 100.0
            ),
            ClockSource::Configured if clocks.cardmhz > 2000 => log::info!(
                "{}: Reader initialized (device={}, detect={}, pll max={:.2} MHz, wanted mhz={:.2} MHz)",
                cfg.label,
                cfg.device,
                cfg.detect,
                clocks.cardmhz as f32 / 100.0,
                clocks.mhz as f32 / 100.0
            ),
            ClockSource::Negotiated if cfg.autospeed => log::info!(
                "{}: Reader initialized (device={}, detect={}, mhz= AUTO, cardmhz={})",
                cfg.label,
                cfg.device,
                cfg.detect,
                clocks.cardmhz
            ),
            _ => log::info!(
                "{}: Reader initialized (device={}, detect={}, mhz={}, cardmhz={})",
                cfg.label,
                cfg.device,
                cfg.detect,
                clocks.mhz,
                clocks.cardmhz
            ),
        }
    }

    pub fn close(&mut self) {
        self.release_card_system();
        self.transport.close();
    }

    /// Refresh card information; only while the card is being set up or in use
    pub fn card_info(&mut self) {
        if !matches!(self.card_status, CardStatus::NeedInit | CardStatus::Inserted) {
            return;
        }
        self.traffic.last = Some(Utc::now());
        if let Some(system) = self.active_system() {
            system.card_info(self);
        }
        log::debug!(
            "{}: serial {}, caid {:04X}, {} provider(s)",
            self.config.label,
            format_hex(&self.identity.hexserial),
            self.identity.caid,
            self.identity.nprov
        );
    }

    pub fn poll_status(&mut self) {
        if self.card_status != CardStatus::Inserted {
            return;
        }
        if let Some(system) = self.active_system() {
            system.poll_status(self);
        }
    }

    /// Send a raw command to the card
    pub fn cmd2icc(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        log::debug!(
            "{}: write to cardreader {}",
            self.config.label,
            format_hex_spaced(command)
        );
        if self.reset_always {
            match self.transport.reset() {
                ResetOutcome::Usable(atr) => self.transport.activate(&atr, self.activation_mode)?,
                other => {
                    return Err(ReaderError::Transport(format!(
                        "reset before command failed: {other:?}"
                    )))
                }
            }
        }
        self.transport.transmit(command)
    }

    /// Write a command header plus optional payload.
    ///
    /// The payload length comes from the header's P3 byte, or the whole
    /// payload up to `MAX_ECM_SIZE` when P3 is zero.
    pub fn card_write(&mut self, cmd: &[u8; CMD_LEN], data: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CMD_LEN + MAX_ECM_SIZE);
        buf.extend_from_slice(cmd);
        if let Some(data) = data {
            let wanted = if cmd[4] != 0 { cmd[4] as usize } else { MAX_ECM_SIZE };
            let len = wanted.min(data.len());
            buf.extend_from_slice(&data[..len]);
        }
        self.cmd2icc(&buf)
    }
}

impl fmt::Debug for ReaderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSession")
            .field("label", &self.config.label)
            .field("card_status", &self.card_status)
            .field("csystem", &self.csystem.as_ref().map(|s| s.name()))
            .field("activation_mode", &self.activation_mode)
            .field("reset_always", &self.reset_always)
            .finish()
    }
}
