pub mod atr;
pub mod cardsystem;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod ecm;
pub mod error;
pub mod health;
pub mod history;
pub mod pcsc_transport;
pub mod reset;
pub mod retry;
pub mod session;
pub mod transport;
pub mod utils;
pub mod worker;
