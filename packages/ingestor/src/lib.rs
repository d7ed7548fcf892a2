//! PixWatch Ingestor Library
//!
//! This crate ingests PIX payment notifications from a bank API through two
//! redundant channels, a webhook push and a periodic poll, normalizes them into
//! one canonical record, stores each record once, and fans new records out to
//! live dashboard subscribers.

pub mod config;
pub mod credentials;
pub mod fanout;
pub mod http;
pub mod normalizer;
pub mod pipeline;
pub mod publisher;
pub mod store;
pub mod transaction;
pub mod upstream;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use credentials::{AccessToken, CredentialError, CredentialManager, TokenProvider};
pub use fanout::{FanOut, SubscriberId};
pub use normalizer::normalize;
pub use pipeline::{IngestionPipeline, ItemReport, ItemStatus, PollError, PollSummary, PushError, PushReport};
pub use publisher::{PublishError, Publisher, RealtimeMessage};
pub use store::{InsertOutcome, SqliteStore, StoreError, TransactionStore};
pub use transaction::{NewTransaction, Source, Transaction};
pub use upstream::{BankClient, PixSource, TimeWindow, UpstreamQueryError};
