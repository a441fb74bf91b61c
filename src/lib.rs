//! Ledger transaction client
//!
//! Allocates nonces per (account, API key), delegates signing to a pluggable
//! engine, submits over a streaming or request/response transport and tracks
//! confirmation until the ledger reaches a terminal state.

pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod signer;
pub mod stream;
pub mod tx;

pub use client::{BatchEntryOutcome, BatchOperation, OrderClient, Outcome, SubmissionResult};
pub use config::Settings;
pub use error::{ClientError, ClientResult};
