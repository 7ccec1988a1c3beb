//! Error type shared by the localstore crates.
//!
//! Errors fall into two families. Programmer-misuse errors (double callback
//! registration, use before initialization, unsupported operations) are
//! returned immediately from the offending call. Storage errors travel
//! through the request/transaction error channel and carry the debug
//! description of the request that produced them.

use std::fmt;

pub type LsResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	// programmer misuse
	AlreadyInitialized,
	ConnectionAlreadyOwned,
	NotInitialized,
	CallbackAlreadySet(&'static str),
	UnsupportedOperation(String),
	UnknownQueueOperation(String),
	MissingDocumentAdapter(String),
	MissingCapability(String),
	InvalidState(String),
	InvalidVersion { current: u64, requested: u64 },
	InvalidModification(String),
	InvalidKey(String),

	// storage / backend
	NotFound(String),
	ConstraintError(String),
	DbError(String),
	ConnectionClosed,
	VersionChange { old_version: u64, new_version: u64 },
	Aborted,
	Timeout(String),
	ReadOnly(String),
	Request { description: Box<str>, source: Box<Error> },
	Serialization(String),

	// externals
	Io(std::io::Error),
	Unknown(String),
}

impl Error {
	/// Attaches the debug description of a request to a storage error.
	pub fn with_description(self, description: &str) -> Self {
		match self {
			Error::Request { .. } | Error::Aborted => self,
			other => Error::Request { description: description.into(), source: Box::new(other) },
		}
	}

	/// Strips request annotations, returning the innermost error.
	pub fn root(&self) -> &Error {
		match self {
			Error::Request { source, .. } => source.root(),
			other => other,
		}
	}

	/// True for errors that result from a transaction being torn down on purpose.
	pub fn is_abort(&self) -> bool {
		matches!(self.root(), Error::Aborted)
	}

	/// True for programmer-misuse errors, which are never retried.
	pub fn is_misuse(&self) -> bool {
		matches!(
			self.root(),
			Error::AlreadyInitialized
				| Error::ConnectionAlreadyOwned
				| Error::NotInitialized
				| Error::CallbackAlreadySet(_)
				| Error::UnsupportedOperation(_)
				| Error::UnknownQueueOperation(_)
				| Error::MissingDocumentAdapter(_)
				| Error::MissingCapability(_)
				| Error::InvalidState(_)
				| Error::InvalidVersion { .. }
				| Error::InvalidModification(_)
				| Error::InvalidKey(_)
		)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::AlreadyInitialized => write!(f, "database is already initialized"),
			Error::ConnectionAlreadyOwned => {
				write!(f, "connection is already managed by another database owner")
			}
			Error::NotInitialized => write!(f, "database is not initialized"),
			Error::CallbackAlreadySet(which) => write!(f, "{} callback is already set", which),
			Error::UnsupportedOperation(msg) => write!(f, "unsupported operation: {}", msg),
			Error::UnknownQueueOperation(msg) => {
				write!(f, "unknown pending queue operation: {}", msg)
			}
			Error::MissingDocumentAdapter(doc_type) => {
				write!(f, "no document adapter registered for type {}", doc_type)
			}
			Error::MissingCapability(msg) => write!(f, "no capability for {}", msg),
			Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
			Error::InvalidVersion { current, requested } => write!(
				f,
				"new version {} must be greater than current version {}",
				requested, current
			),
			Error::InvalidModification(msg) => write!(f, "invalid modification: {}", msg),
			Error::InvalidKey(msg) => write!(f, "invalid key: {}", msg),
			Error::NotFound(msg) => write!(f, "not found: {}", msg),
			Error::ConstraintError(msg) => write!(f, "constraint error: {}", msg),
			Error::DbError(msg) => write!(f, "database error: {}", msg),
			Error::ConnectionClosed => write!(f, "database connection is closed"),
			Error::VersionChange { old_version, new_version } => write!(
				f,
				"database version changed from {} to {}",
				old_version, new_version
			),
			Error::Aborted => write!(f, "transaction aborted"),
			Error::Timeout(msg) => write!(f, "request timed out: {}", msg),
			Error::ReadOnly(msg) => write!(f, "write in read-only transaction: {}", msg),
			Error::Request { description, source } => write!(f, "{} [{}]", source, description),
			Error::Serialization(msg) => write!(f, "serialization error: {}", msg),
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Unknown(msg) => write!(f, "unknown error: {}", msg),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Request { source, .. } => Some(source.as_ref()),
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Serialization(err.to_string())
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(err: tokio::task::JoinError) -> Self {
		Self::Unknown(err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_description_wraps_once() {
		let err = Error::NotFound("row".into()).with_description("get Documents");
		let err = err.with_description("outer");
		match &err {
			Error::Request { description, .. } => assert_eq!(description.as_ref(), "get Documents"),
			other => panic!("unexpected {:?}", other),
		}
		assert!(matches!(err.root(), Error::NotFound(_)));
	}

	#[test]
	fn test_abort_is_never_annotated() {
		let err = Error::Aborted.with_description("put Comments");
		assert!(err.is_abort());
		assert!(matches!(err, Error::Aborted));
	}
}

// vim: ts=4
