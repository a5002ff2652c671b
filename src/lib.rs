pub mod api;
pub mod channel;
pub mod chat;
pub mod command;
pub mod config;
pub mod error;
pub mod notify;
pub mod processor;
pub mod store;
pub mod transfer;

pub use channel::{ChannelAddress, InboundMessage};
pub use chat::ChatRelay;
pub use command::Command;
pub use error::RelayError;
pub use notify::{ChannelNotifier, Notifier};
pub use processor::{Processor, ProcessorClient};
pub use store::{Charge, ChargeStatus, Store, User};
pub use transfer::{Orchestrator, TransferJob, TransferWorker};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
