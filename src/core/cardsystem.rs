//! Card systems and their resolution against an ATR
//!
//! A card system is the protocol handler for one conditional-access family.
//! The registry holds them in priority order; resolution commits the first
//! one that claims the card.

use std::fmt;
use std::sync::Arc;

use crate::core::atr::Atr;
use crate::core::dispatch::{CmdPacket, EmmPacket};
use crate::core::ecm::{EcmAnswer, EcmRequest};
use crate::core::error::{ReaderError, Result};
use crate::core::session::{ReaderSession, StatusEvent};

/// Outcome of a single card exchange reported by a card system
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CardResult {
    Ok,
    /// Exchange failed
    Error,
    /// Card answered with a malformed or corrupted response
    Corrupt,
}

impl CardResult {
    /// Turn a failed exchange into its error kind
    pub fn check(self) -> Result<()> {
        match self {
            CardResult::Ok => Ok(()),
            CardResult::Error => Err(ReaderError::GenericExchangeError),
            CardResult::Corrupt => Err(ReaderError::CorruptResponse),
        }
    }
}

/// Capability set of one card protocol.
///
/// Capability methods return `None` when the protocol does not implement
/// them. Protocol state belongs in the session's system data slot, set from
/// `card_init` via [`ReaderSession::set_system_data`].
pub trait CardSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Try to claim the card. Returning false hands it to the next system.
    fn card_init(&self, session: &mut ReaderSession, atr: &Atr) -> bool;

    /// Release hook, run before the system data is dropped
    fn card_done(&self, _session: &mut ReaderSession) {}

    fn card_info(&self, _session: &mut ReaderSession) {}

    fn poll_status(&self, _session: &mut ReaderSession) {}

    fn do_ecm(
        &self,
        _session: &mut ReaderSession,
        _request: &EcmRequest,
        _answer: &mut EcmAnswer,
    ) -> Option<CardResult> {
        None
    }

    fn do_emm(&self, _session: &mut ReaderSession, _packet: &EmmPacket) -> Option<CardResult> {
        None
    }

    fn do_rawcmd(&self, _session: &mut ReaderSession, _packet: &mut CmdPacket) -> Option<CardResult> {
        None
    }

    /// Runs after every ECM answer has been written, whatever its outcome
    fn post_process(&self, _session: &mut ReaderSession) {}
}

/// Card systems in the order they are tried
#[derive(Clone, Default)]
pub struct CardSystemRegistry {
    systems: Vec<Arc<dyn CardSystem>>,
}

impl CardSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a system at the lowest priority
    pub fn register(mut self, system: Arc<dyn CardSystem>) -> Self {
        self.systems.push(system);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CardSystem>> {
        self.systems.iter()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.systems.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for CardSystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ReaderSession {
    /// Find the card system for `atr` and commit it to the session.
    ///
    /// Each candidate starts from an empty data slot. A candidate that
    /// declines gets its release hook and loses whatever data and
    /// identifiers it stored.
    pub fn resolve_card_system(&mut self, atr: &Atr) -> bool {
        let registry = Arc::clone(self.registry());
        let baseline = self.identity.clone();
        for system in registry.iter() {
            self.drop_system_data();
            if system.card_init(self, atr) {
                log::info!("{}: found card system {}", self.label(), system.name());
                self.commit_system(Arc::clone(system));
                self.indicate(StatusEvent::FoundCardSystem);
                return true;
            }
            system.card_done(self);
            self.drop_system_data();
            self.identity = baseline.clone();
        }

        log::info!("{}: card system not supported", self.label());
        self.indicate(StatusEvent::UnsupportedCardSystem);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl CardSystem for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn card_init(&self, _session: &mut ReaderSession, _atr: &Atr) -> bool {
            false
        }
    }

    #[test]
    fn test_card_result_check() {
        assert!(CardResult::Ok.check().is_ok());
        assert!(matches!(
            CardResult::Error.check(),
            Err(ReaderError::GenericExchangeError)
        ));
        assert!(matches!(
            CardResult::Corrupt.check(),
            Err(ReaderError::CorruptResponse)
        ));
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let registry = CardSystemRegistry::new()
            .register(Arc::new(Named("viaccess")))
            .register(Arc::new(Named("irdeto")))
            .register(Arc::new(Named("iso7816")));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["viaccess", "irdeto", "iso7816"]);
        assert_eq!(format!("{registry:?}"), r#"["viaccess", "irdeto", "iso7816"]"#);
        assert!(CardSystemRegistry::new().is_empty());
    }
}
