//! Incremental per-contact engagement tracking for a Gmail mailbox.
//!
//! [`scan::ScanOrchestrator`] walks a [`source::ThreadSource`], aggregates
//! senders into [`types::ContactAggregate`]s, merges them into the persisted
//! [`types::ScanState`], and optionally enriches contacts through a
//! [`oracle::ClassificationOracle`].

pub mod aggregate;
pub mod config;
pub mod drafts;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod google_api;
pub mod merge;
mod migrations;
pub mod oracle;
mod pty;
pub mod scan;
pub mod source;
pub mod store;
pub mod types;
pub mod util;
pub mod views;
