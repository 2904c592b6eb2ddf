//! Per-reader worker thread
//!
//! Each session is owned by one thread that executes queued jobs in order,
//! so health checks, resets and dispatches never overlap for a reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::core::cardsystem::CardResult;
use crate::core::dispatch::{CmdPacket, EmmPacket, EmmResult, RawCmdResult};
use crate::core::ecm::{AnswerCode, AnswerSink, EcmRequest};
use crate::core::error::{ReaderError, Result};
use crate::core::history::{DispatchHistory, DispatchKind, DispatchRecord};
use crate::core::session::{CardStatus, ReaderSession};

/// Unit of work for a reader worker
#[derive(Debug)]
pub enum Job {
    CheckHealth,
    Reset,
    CardInfo,
    PollStatus,
    Ecm(EcmRequest),
    Emm(EmmPacket, Option<Sender<EmmResult>>),
    RawCmd(CmdPacket, Sender<(RawCmdResult, CmdPacket)>),
    Status(Sender<CardStatus>),
    Shutdown,
}

/// Caller side of a reader worker
pub struct ReaderHandle {
    label: String,
    jobs: Sender<Job>,
    enabled: Arc<AtomicBool>,
    thread: Option<JoinHandle<DispatchHistory>>,
}

impl ReaderHandle {
    /// Start the worker thread. The device is opened on the worker before
    /// any queued job runs.
    pub fn spawn(mut session: ReaderSession, sink: Box<dyn AnswerSink>) -> Result<Self> {
        let (tx, rx) = unbounded();
        session.attach_queue(tx.clone());
        let label = session.label().to_string();
        let enabled = session.enabled_flag();

        let thread = thread::Builder::new()
            .name(format!("reader-{label}"))
            .spawn(move || run_worker(session, sink, rx))?;

        Ok(Self {
            label,
            jobs: tx,
            enabled,
            thread: Some(thread),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop device-open retries and further health checks
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn send(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| ReaderError::Transport(format!("{}: worker stopped", self.label)))
    }

    /// Queue a health check, only while the reader is enabled
    pub fn check_health(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.send(Job::CheckHealth)
    }

    pub fn reset(&self) -> Result<()> {
        self.send(Job::Reset)
    }

    pub fn card_info(&self) -> Result<()> {
        self.send(Job::CardInfo)
    }

    pub fn poll_status(&self) -> Result<()> {
        self.send(Job::PollStatus)
    }

    /// Queue an ECM; the answer goes to the worker's answer sink
    pub fn ecm(&self, request: EcmRequest) -> Result<()> {
        self.send(Job::Ecm(request))
    }

    pub fn emm(&self, packet: EmmPacket) -> Result<EmmResult> {
        let (tx, rx) = unbounded();
        self.send(Job::Emm(packet, Some(tx)))?;
        self.wait(rx)
    }

    pub fn rawcmd(&self, packet: CmdPacket) -> Result<(RawCmdResult, CmdPacket)> {
        let (tx, rx) = unbounded();
        self.send(Job::RawCmd(packet, tx))?;
        self.wait(rx)
    }

    /// Card status once every previously queued job has run
    pub fn status(&self) -> Result<CardStatus> {
        let (tx, rx) = unbounded();
        self.send(Job::Status(tx))?;
        self.wait(rx)
    }

    fn wait<T>(&self, rx: Receiver<T>) -> Result<T> {
        rx.recv()
            .map_err(|_| ReaderError::Transport(format!("{}: worker stopped", self.label)))
    }

    /// Stop the worker and collect what it dispatched
    pub fn shutdown(mut self) -> DispatchHistory {
        self.stop()
    }

    fn stop(&mut self) -> DispatchHistory {
        let _ = self.jobs.send(Job::Shutdown);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(history)) => history,
            Some(Err(_)) => {
                log::error!("{}: worker panicked", self.label);
                DispatchHistory::new()
            }
            None => DispatchHistory::new(),
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn run_worker(
    mut session: ReaderSession,
    mut sink: Box<dyn AnswerSink>,
    jobs: Receiver<Job>,
) -> DispatchHistory {
    let mut history = DispatchHistory::new();

    if let Err(e) = session.init() {
        log::error!("{}: reader not started: {e}", session.label());
        return history;
    }

    while let Ok(job) = jobs.recv() {
        match job {
            Job::CheckHealth => {
                if session.is_enabled() {
                    session.check_health();
                }
            }
            Job::Reset => {
                if let Err(e) = session.do_reset() {
                    log::warn!("{}: reset failed: {e}", session.label());
                }
            }
            Job::CardInfo => session.card_info(),
            Job::PollStatus => session.poll_status(),
            Job::Ecm(request) => {
                let start = Instant::now();
                let answer = session.process_ecm(&request, sink.as_mut());
                let found = answer.rc == AnswerCode::Found;
                history.record(DispatchRecord {
                    timestamp: Utc::now(),
                    reader: session.label().to_string(),
                    kind: DispatchKind::Ecm {
                        caid: request.caid,
                        provid: request.prid,
                        srvid: request.srvid,
                    },
                    input: request.ecm,
                    output: if found { answer.cw.to_vec() } else { Vec::new() },
                    outcome: format!("{:?}", answer.rc),
                    success: found,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            Job::Emm(packet, reply) => {
                let start = Instant::now();
                let result = session.do_emm(&packet);
                history.record(DispatchRecord {
                    timestamp: Utc::now(),
                    reader: session.label().to_string(),
                    kind: DispatchKind::Emm,
                    input: packet.emm,
                    output: Vec::new(),
                    outcome: format!("{result:?}"),
                    success: result == EmmResult::Written,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Job::RawCmd(mut packet, reply) => {
                let start = Instant::now();
                let result = session.do_rawcmd(&mut packet);
                history.record(DispatchRecord {
                    timestamp: Utc::now(),
                    reader: session.label().to_string(),
                    kind: DispatchKind::RawCmd,
                    input: packet.command.clone(),
                    output: packet.response.clone(),
                    outcome: format!("{result:?}"),
                    success: result == RawCmdResult::Done(CardResult::Ok),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
                let _ = reply.send((result, packet));
            }
            Job::Status(reply) => {
                let _ = reply.send(session.card_status());
            }
            Job::Shutdown => break,
        }
    }

    session.close();
    history
}
