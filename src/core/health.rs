use crate::core::session::{CardStatus, ReaderSession, StatusEvent};
use crate::core::worker::Job;

impl ReaderSession {
    /// Card-detect signal. Readers without a usable detect line always
    /// report a card and are never queried.
    pub fn card_inserted(&mut self) -> bool {
        if self.config.detect.always_present(self.config.use_gpio) {
            return true;
        }
        match self.transport.card_present() {
            Ok(present) => present,
            Err(e) => {
                log::info!("{}: Error getting card status: {e}", self.label());
                false
            }
        }
    }

    /// Track card insertion and removal.
    ///
    /// A newly seen card moves to `NeedInit` and a reset is queued; the call
    /// does not wait for it. Returns true when the card is usable now.
    pub fn check_health(&mut self) -> bool {
        if self.card_status == CardStatus::DeviceError {
            return false;
        }

        if self.card_inserted() {
            if matches!(self.card_status, CardStatus::NoCard | CardStatus::Unknown) {
                log::info!("{}: card detected", self.label());
                self.indicate(StatusEvent::CardDetected);
                self.card_status = CardStatus::NeedInit;
                self.schedule(Job::Reset);
            }
        } else {
            log::debug!("{}: no card inserted", self.label());
            if matches!(self.card_status, CardStatus::Inserted | CardStatus::NeedInit) {
                log::info!("{}: card ejected", self.label());
                let caid = self.identity.caid;
                self.nullify_card();
                self.traffic.last_emm = None;
                self.traffic.last_ecm = None;
                self.indicate(StatusEvent::CardEjected);
                if self.config.announce_local_card {
                    self.indicate(StatusEvent::LocalCardEjected(caid));
                }
            }
            self.card_status = CardStatus::NoCard;
        }

        log::debug!(
            "{}: card_status = {}, usable = {}",
            self.label(),
            self.card_status,
            self.card_status == CardStatus::Inserted
        );
        self.card_status == CardStatus::Inserted
    }
}
