//! Offline document storage on redb.
//!
//! Documents, their commands, pending edit queues, comments, entities,
//! impressions and sync statistics live in one versioned database. Records
//! are turned into operations, and capabilities apply the operations through
//! transactional object stores.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod adapter;
pub mod capability;
pub mod command_queue;
pub mod config;
pub mod connection;
pub mod database;
pub mod db_util;
mod error;
pub mod file_sync;
pub mod operation;
pub mod pending_queue;
pub mod reader_writer;
pub mod record;
pub mod request;
pub mod schema;
pub mod transaction;
pub mod writer_proxy;

pub use adapter::{CapabilityRegistry, OBJECT_STORE_NAMES, SCHEMA_VERSION, V3StorageAdapter};
pub use config::StoreConfig;
pub use connection::{Connection, DatabaseEvent, DatabaseFactory, UpgradeTransaction};
pub use database::DocsDatabase;
pub use file_sync::{FileSyncResult, FileSyncTask};
pub use record::{Record, RecordType};
pub use transaction::{Transaction, TransactionOptions};
pub use writer_proxy::{CommandBasedDocumentWriterProxy, DocumentAdapter, DocumentAdapterRegistry, ProxyState};

// vim: ts=4
