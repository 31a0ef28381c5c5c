pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod service;

pub use connection::{connect_and_migrate, connect_with_settings, ConnectError, DbPool};
pub use fixtures::{ChainSeedInfo, DefaultChainSeed, SeedError, SeedResult, VerificationResult};
pub use service::{ApprovalService, ChannelNotificationDispatcher};
