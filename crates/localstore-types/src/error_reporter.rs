//! Error reporting collaborator.
//!
//! The storage core never decides how errors reach the user; it hands them to
//! an `ErrorReporter`. `log` and `info` must never fail.

use std::fmt::Debug;

use crate::prelude::*;

pub trait ErrorReporter: Debug + Send + Sync {
	/// Reports an error.
	fn log(&self, err: &Error);

	/// Reports an informational error together with some context.
	fn info(&self, err: &Error, context: &str);

	/// Reports `err` through `log` when `condition` is false. Returns `condition`.
	fn assert(&self, condition: bool, err: Error) -> bool {
		if !condition {
			self.log(&err);
		}
		condition
	}
}

/// Runs `f`, reporting any error it returns. With `rethrow` the error is
/// propagated after being reported, otherwise it is swallowed and `None` is
/// returned.
pub fn protect<T, F>(reporter: &dyn ErrorReporter, f: F, rethrow: bool) -> LsResult<Option<T>>
where
	F: FnOnce() -> LsResult<T>,
{
	match f() {
		Ok(value) => Ok(Some(value)),
		Err(err) => {
			reporter.log(&err);
			if rethrow { Err(err) } else { Ok(None) }
		}
	}
}

/// Reporter that forwards everything to `tracing`.
#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
	fn log(&self, err: &Error) {
		error!("localstore error: {}", err);
	}

	fn info(&self, err: &Error, context: &str) {
		info!("localstore info: {} ({})", err, context);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[derive(Debug, Default)]
	struct CollectingReporter {
		logged: Mutex<Vec<String>>,
	}

	impl ErrorReporter for CollectingReporter {
		fn log(&self, err: &Error) {
			if let Ok(mut logged) = self.logged.lock() {
				logged.push(err.to_string());
			}
		}

		fn info(&self, _err: &Error, _context: &str) {}
	}

	#[test]
	fn test_assert_logs_on_failure_only() {
		let reporter = CollectingReporter::default();
		assert!(reporter.assert(true, Error::InvalidState("ok".into())));
		assert!(!reporter.assert(false, Error::InvalidState("broken".into())));
		let logged = reporter.logged.lock().unwrap();
		assert_eq!(logged.len(), 1);
		assert!(logged[0].contains("broken"));
	}

	#[test]
	fn test_protect_swallow_and_rethrow() {
		let reporter = CollectingReporter::default();
		let swallowed: LsResult<Option<()>> =
			protect(&reporter, || Err(Error::Unknown("x".into())), false);
		assert!(matches!(swallowed, Ok(None)));

		let rethrown: LsResult<Option<()>> =
			protect(&reporter, || Err(Error::Unknown("y".into())), true);
		assert!(rethrown.is_err());

		let value = protect(&reporter, || Ok(7), true).unwrap();
		assert_eq!(value, Some(7));
		assert_eq!(reporter.logged.lock().unwrap().len(), 2);
	}
}

// vim: ts=4
