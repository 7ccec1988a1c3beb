//! Shared types, collaborator traits, and keys for the offline document localstore.
//!
//! This crate holds what the storage core and its adapters agree on: the
//! error type, compound keys, document kinds, and the narrow interfaces the
//! core uses to talk to the rest of the editor (error reporting, local file
//! storage, snapshot scheduling).

pub mod error;
pub mod error_reporter;
pub mod file_storage_adapter;
pub mod key;
pub mod prelude;
pub mod types;

// vim: ts=4
