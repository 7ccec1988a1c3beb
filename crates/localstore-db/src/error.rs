use localstore::error::Error;
use std::fmt;

/// Helper to convert redb errors
pub fn from_redb_error<E: fmt::Display>(err: E) -> Error {
	Error::DbError(err.to_string())
}

// vim: ts=4
