//! A single asynchronous storage request.
//!
//! Every request ends in exactly one of `Success`, `Error` or `Timeout`, and
//! at most one of the matching callbacks runs. Requests share the abort token
//! of their transaction: once it is cancelled, success and error delivery is
//! suppressed. Results are always delivered after a scheduler yield, never
//! from inside the call that issued the request.

use localstore::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub type SuccessCallback<T> = Box<dyn FnOnce(T) + Send>;
pub type RequestErrorCallback = Box<dyn FnOnce(&Error) + Send>;
pub type RequestTimeoutCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
	Pending,
	Success,
	Error,
	Timeout,
	/// Finished after its transaction was aborted; no callback was delivered
	Aborted,
}

/// Latency instrumentation for one request
#[derive(Debug)]
struct LatencyTracker {
	label: &'static str,
	started: Instant,
}

impl LatencyTracker {
	fn complete(self) {
		debug!(
			label = self.label,
			elapsed_ms = self.started.elapsed().as_millis() as u64,
			"request latency"
		);
	}
}

enum Outcome<T> {
	Done(LsResult<T>),
	TimedOut,
	Aborted,
}

pub struct Request<T> {
	description: Box<str>,
	state: RequestState,
	on_success: Option<SuccessCallback<T>>,
	on_error: Option<RequestErrorCallback>,
	on_timeout: Option<RequestTimeoutCallback>,
	timeout: Option<Duration>,
	abort: CancellationToken,
	latency_label: Option<&'static str>,
	composing: Option<Arc<AtomicBool>>,
}

impl<T> Request<T> {
	pub fn new(description: impl Into<Box<str>>, abort: CancellationToken) -> Self {
		Self {
			description: description.into(),
			state: RequestState::Pending,
			on_success: None,
			on_error: None,
			on_timeout: None,
			timeout: None,
			abort,
			latency_label: None,
			composing: None,
		}
	}

	/// Zero or no duration disables the timeout
	pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.timeout = timeout.filter(|t| !t.is_zero());
		self
	}

	pub fn with_latency_label(mut self, label: Option<&'static str>) -> Self {
		self.latency_label = label;
		self
	}

	pub fn with_composing_state(mut self, composing: Arc<AtomicBool>) -> Self {
		self.composing = Some(composing);
		self
	}

	/// Installs the error callback on a request that has none yet
	pub fn with_error_callback(mut self, f: impl FnOnce(&Error) + Send + 'static) -> Self {
		self.on_error = Some(Box::new(f));
		self
	}

	pub fn with_timeout_callback(mut self, f: impl FnOnce() + Send + 'static) -> Self {
		self.on_timeout = Some(Box::new(f));
		self
	}

	pub fn description(&self) -> &str {
		&self.description
	}

	pub fn state(&self) -> RequestState {
		self.state
	}

	pub fn set_success_callback(&mut self, f: impl FnOnce(T) + Send + 'static) -> LsResult<()> {
		if self.on_success.is_some() {
			return Err(Error::CallbackAlreadySet("success"));
		}
		self.on_success = Some(Box::new(f));
		Ok(())
	}

	pub fn set_error_callback(&mut self, f: impl FnOnce(&Error) + Send + 'static) -> LsResult<()> {
		if self.on_error.is_some() {
			return Err(Error::CallbackAlreadySet("error"));
		}
		self.on_error = Some(Box::new(f));
		Ok(())
	}

	pub fn set_timeout_callback(&mut self, f: impl FnOnce() + Send + 'static) -> LsResult<()> {
		if self.on_timeout.is_some() {
			return Err(Error::CallbackAlreadySet("timeout"));
		}
		self.on_timeout = Some(Box::new(f));
		Ok(())
	}

	/// Drives `fut` to completion and returns its value. The error and
	/// timeout callbacks fire here; the success value is returned instead of
	/// passed to the success callback.
	pub async fn run<F>(&mut self, fut: F) -> LsResult<T>
	where
		F: Future<Output = LsResult<T>>,
	{
		if self.state != RequestState::Pending {
			return Err(Error::InvalidState(format!("request {} already finished", self.description)));
		}
		if self.abort.is_cancelled() {
			self.finish_aborted();
			return Err(Error::Aborted);
		}

		let started = Instant::now();
		let latency = self.latency_label.map(|label| LatencyTracker { label, started });
		let timeout = self.timeout;

		let outcome = tokio::select! {
			biased;
			() = self.abort.cancelled() => Outcome::Aborted,
			res = async move {
				match timeout {
					Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
					None => Some(fut.await),
				}
			} => match res {
				Some(res) => Outcome::Done(res),
				None => Outcome::TimedOut,
			},
		};

		// Completion is observed on a later turn than the one that issued the request
		tokio::task::yield_now().await;

		match outcome {
			Outcome::Done(Ok(value)) => {
				if let Some(latency) = latency {
					latency.complete();
				}
				if self.abort.is_cancelled() {
					self.finish_aborted();
					return Err(Error::Aborted);
				}
				self.state = RequestState::Success;
				Ok(value)
			}
			Outcome::Done(Err(err)) => {
				let err = err.with_description(&self.description);
				if self.abort.is_cancelled() || err.is_abort() {
					self.finish_aborted();
					return Err(err);
				}
				self.state = RequestState::Error;
				self.on_success = None;
				self.on_timeout = None;
				if let Some(on_error) = self.on_error.take() {
					on_error(&err);
				}
				Err(err)
			}
			Outcome::TimedOut => {
				let composing = self.composing.as_ref().is_some_and(|c| c.load(Ordering::Acquire));
				warn!(
					description = %self.description,
					elapsed_ms = started.elapsed().as_millis() as u64,
					composing,
					"request timed out"
				);
				self.state = RequestState::Timeout;
				self.on_success = None;
				self.on_error = None;
				// A timed out request takes its transaction down with it
				self.abort.cancel();
				if let Some(on_timeout) = self.on_timeout.take() {
					on_timeout();
				}
				Err(Error::Timeout(self.description.to_string()))
			}
			Outcome::Aborted => {
				self.finish_aborted();
				Err(Error::Aborted)
			}
		}
	}

	/// Callback flavour of [`Request::run`]: exactly one of the registered
	/// callbacks fires (none if the transaction was aborted).
	pub async fn execute<F>(mut self, fut: F) -> RequestState
	where
		F: Future<Output = LsResult<T>>,
	{
		if let Ok(value) = self.run(fut).await {
			if let Some(on_success) = self.on_success.take() {
				on_success(value);
			}
		}
		self.state
	}

	/// Runs an already computed result through the state machine
	pub(crate) async fn run_once(mut self, result: LsResult<T>) -> LsResult<T> {
		self.run(std::future::ready(result)).await
	}

	fn finish_aborted(&mut self) {
		self.state = RequestState::Aborted;
		self.on_success = None;
		self.on_error = None;
		self.on_timeout = None;
	}
}

impl<T> std::fmt::Debug for Request<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Request")
			.field("description", &self.description)
			.field("state", &self.state)
			.field("timeout", &self.timeout)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
		(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
	}

	fn wired(
		abort: CancellationToken,
		ok: &Arc<AtomicUsize>,
		err: &Arc<AtomicUsize>,
		to: &Arc<AtomicUsize>,
	) -> Request<u32> {
		let mut req = Request::new("test request", abort);
		let (ok, err, to) = (Arc::clone(ok), Arc::clone(err), Arc::clone(to));
		req.set_success_callback(move |_| {
			ok.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();
		req.set_error_callback(move |_| {
			err.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();
		req.set_timeout_callback(move || {
			to.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();
		req
	}

	#[tokio::test]
	async fn test_success_fires_once() {
		let (ok, err, to) = counters();
		let req = wired(CancellationToken::new(), &ok, &err, &to);
		let state = req.execute(async { Ok(5) }).await;
		assert_eq!(state, RequestState::Success);
		assert_eq!(ok.load(Ordering::SeqCst), 1);
		assert_eq!(err.load(Ordering::SeqCst) + to.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_error_fires_once_with_description() {
		let (ok, err, to) = counters();
		let mut req = wired(CancellationToken::new(), &ok, &err, &to);
		let res = req.run(async { Err(Error::NotFound("row".into())) }).await;
		assert!(matches!(&res, Err(Error::Request { description, .. }) if description.as_ref() == "test request"));
		assert_eq!(req.state(), RequestState::Error);
		assert_eq!(err.load(Ordering::SeqCst), 1);
		assert_eq!(ok.load(Ordering::SeqCst) + to.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_timeout_cancels_transaction() {
		let (ok, err, to) = counters();
		let abort = CancellationToken::new();
		let req = wired(abort.clone(), &ok, &err, &to).with_timeout(Some(Duration::from_millis(10)));
		let state = req
			.execute(async {
				tokio::time::sleep(Duration::from_millis(200)).await;
				Ok(1)
			})
			.await;
		assert_eq!(state, RequestState::Timeout);
		assert_eq!(to.load(Ordering::SeqCst), 1);
		assert_eq!(ok.load(Ordering::SeqCst) + err.load(Ordering::SeqCst), 0);
		assert!(abort.is_cancelled());
	}

	#[tokio::test]
	async fn test_abort_suppresses_all_callbacks() {
		let (ok, err, to) = counters();
		let abort = CancellationToken::new();
		abort.cancel();
		let state = wired(abort.clone(), &ok, &err, &to).execute(async { Ok(1) }).await;
		assert_eq!(state, RequestState::Aborted);

		let state = wired(abort, &ok, &err, &to)
			.execute(async { Err(Error::DbError("boom".into())) })
			.await;
		assert_eq!(state, RequestState::Aborted);
		assert_eq!(ok.load(Ordering::SeqCst) + err.load(Ordering::SeqCst) + to.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_abort_class_error_is_swallowed() {
		let (ok, err, to) = counters();
		let state = wired(CancellationToken::new(), &ok, &err, &to)
			.execute(async { Err(Error::Aborted) })
			.await;
		assert_eq!(state, RequestState::Aborted);
		assert_eq!(err.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_builder_callbacks_fire_and_stay_single_assignment() {
		let (_, err, to) = counters();
		let (err_cb, to_cb) = (Arc::clone(&err), Arc::clone(&to));
		let mut req: Request<u32> = Request::new("built", CancellationToken::new())
			.with_error_callback(move |_| {
				err_cb.fetch_add(1, Ordering::SeqCst);
			})
			.with_timeout_callback(move || {
				to_cb.fetch_add(1, Ordering::SeqCst);
			});
		assert!(matches!(req.set_error_callback(|_| {}), Err(Error::CallbackAlreadySet("error"))));
		assert!(matches!(req.set_timeout_callback(|| {}), Err(Error::CallbackAlreadySet("timeout"))));

		let state = req.execute(async { Err(Error::DbError("boom".into())) }).await;
		assert_eq!(state, RequestState::Error);
		assert_eq!((err.load(Ordering::SeqCst), to.load(Ordering::SeqCst)), (1, 0));
	}

	#[test]
	fn test_callbacks_are_single_assignment() {
		let mut req: Request<()> = Request::new("twice", CancellationToken::new());
		req.set_success_callback(|()| {}).unwrap();
		assert!(matches!(req.set_success_callback(|()| {}), Err(Error::CallbackAlreadySet("success"))));
		req.set_error_callback(|_| {}).unwrap();
		assert!(matches!(req.set_error_callback(|_| {}), Err(Error::CallbackAlreadySet("error"))));
		req.set_timeout_callback(|| {}).unwrap();
		assert!(matches!(req.set_timeout_callback(|| {}), Err(Error::CallbackAlreadySet("timeout"))));
	}
}

// vim: ts=4
