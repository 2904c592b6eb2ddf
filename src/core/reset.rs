//! Reset, activation and card system resolution
//!
//! A reset cycle nullifies the card, resets the hardware, then activates and
//! resolves the card, first in the configured mode, then in deprecated mode,
//! and finally with a reset before every command.

use std::time::Duration;

use crate::core::atr::Atr;
use crate::core::error::{ReaderError, Result};
use crate::core::retry::{RetryOutcome, RetryPolicy};
use crate::core::session::{CardStatus, ReaderSession, StatusEvent};
use crate::core::transport::{ActivationMode, ResetOutcome};

/// Settle time after a successful activation
pub const ACTIVATION_SETTLE: Duration = Duration::from_secs(1);

/// Short codes shown on readers with a display
pub const DISPLAY_OK: &str = "AOK";
pub const DISPLAY_ERROR: &str = "AER";

impl ReaderSession {
    fn configured_mode(&self) -> ActivationMode {
        if self.config.deprecated {
            ActivationMode::Deprecated
        } else {
            ActivationMode::Normal
        }
    }

    /// Activate the card, up to three attempts. Only runs while the card
    /// is waiting for initialisation.
    pub(crate) fn activate_card(&mut self, atr: &Atr, mode: ActivationMode) -> bool {
        if self.card_status != CardStatus::NeedInit {
            return false;
        }

        let label = self.config.label.clone();
        let status_sink = &mut self.status_sink;
        let transport = &mut self.transport;
        let outcome = RetryPolicy::ACTIVATION.run(
            self.sleeper.as_ref(),
            || true,
            |_, e| {
                log::info!("{label}: Error activating card: {e}");
                status_sink.event(&label, StatusEvent::ActivationError);
            },
            |_| transport.activate(atr, mode),
        );

        match outcome {
            RetryOutcome::Done { .. } => {
                log::debug!("{label}: card activated ({mode} mode), ATR: {atr}");
                self.sleeper.sleep(ACTIVATION_SETTLE);
                true
            }
            _ => false,
        }
    }

    /// Try the configured mode, falling back once to deprecated mode.
    fn activate_and_resolve(&mut self, atr: &Atr) -> std::result::Result<ActivationMode, ReaderError> {
        let modes: &[ActivationMode] = match self.configured_mode() {
            ActivationMode::Normal => &[ActivationMode::Normal, ActivationMode::Deprecated],
            ActivationMode::Deprecated => &[ActivationMode::Deprecated],
        };

        let mut error = ReaderError::ActivationFailure(RetryPolicy::ACTIVATION.max_attempts);
        for &mode in modes {
            if self.activate_card(atr, mode) {
                if self.resolve_card_system(atr) {
                    return Ok(mode);
                }
                error = ReaderError::UnsupportedProtocol(atr.to_string());
            }
            if mode == ActivationMode::Normal {
                log::info!("{}: Normal mode failed, reverting to Deprecated Mode", self.label());
                self.indicate(StatusEvent::DeprecatedFallback);
            }
        }
        Err(error)
    }

    /// Run a full reset cycle.
    ///
    /// A card already in use, or one that failed before, is taken back to
    /// `NeedInit` first, so re-running a reset re-initialises it. A fatal
    /// reset then aborts immediately. Otherwise the session ends up
    /// `Inserted` or `Failure`.
    pub fn do_reset(&mut self) -> Result<()> {
        if matches!(self.card_status, CardStatus::Inserted | CardStatus::Failure) {
            log::debug!("{}: re-initialising card", self.label());
            self.card_status = CardStatus::NeedInit;
        }
        self.nullify_card();

        let atr = match self.transport.reset() {
            ResetOutcome::Fatal => {
                log::error!("{}: fatal error resetting card", self.label());
                return Err(ReaderError::Transport("fatal reset".to_string()));
            }
            ResetOutcome::HardwareError => None,
            ResetOutcome::Usable(atr) => Some(atr),
        };

        let result = match atr {
            None => Err(ReaderError::Transport("card reset failed".to_string())),
            Some(atr) => {
                self.reset_always = false;
                match self.activate_and_resolve(&atr) {
                    Ok(mode) => Ok(mode),
                    Err(_) => {
                        log::info!("{}: Try reset reader before each command", self.label());
                        self.reset_always = true;
                        let mode = self.configured_mode();
                        if !self.activate_card(&atr, mode) {
                            Err(ReaderError::ActivationFailure(RetryPolicy::ACTIVATION.max_attempts))
                        } else if self.resolve_card_system(&atr) {
                            Ok(mode)
                        } else {
                            Err(ReaderError::UnsupportedProtocol(atr.to_string()))
                        }
                    }
                }
            }
        };

        match result {
            Ok(mode) => {
                self.activation_mode = mode;
                self.card_ready();
                Ok(())
            }
            Err(e) => {
                self.card_status = CardStatus::Failure;
                log::info!("{}: card initializing error: {e}", self.label());
                self.transport.display_message(DISPLAY_ERROR);
                self.indicate(StatusEvent::ActivationError);
                Err(e)
            }
        }
    }

    fn card_ready(&mut self) {
        self.card_info();
        self.card_status = CardStatus::Inserted;
        log::info!(
            "{}: card initialised ({} mode{})",
            self.label(),
            self.activation_mode,
            if self.reset_always { ", reset before each command" } else { "" }
        );
        self.load_emm_file();
        self.transport.display_message(DISPLAY_OK);
        if self.config.announce_local_card {
            let caid = self.identity.caid;
            self.indicate(StatusEvent::LocalCardUp(caid));
        }
    }
}
