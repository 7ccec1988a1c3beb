//! Transient command buffer used before a document reaches local storage.

use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pending_queue::PendingQueue;

/// Commands the editor produced together
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBatch {
	pub version: i64,
	pub chunk_index: i64,
	#[serde(default)]
	pub user_name: Option<Box<str>>,
	pub timestamp: Timestamp,
	pub commands: Vec<Value>,
}

impl CommandBatch {
	pub fn new(version: i64, commands: Vec<Value>) -> Self {
		Self { version, chunk_index: 0, user_name: None, timestamp: Timestamp::now(), commands }
	}
}

#[derive(Clone, Debug)]
pub struct CommandQueue {
	doc_id: Box<str>,
	batches: Vec<CommandBatch>,
	/// Set once `replace` dropped earlier content
	replaced: bool,
	disposed: bool,
}

impl CommandQueue {
	pub fn new(doc_id: &str) -> Self {
		Self { doc_id: doc_id.into(), batches: Vec::new(), replaced: false, disposed: false }
	}

	pub fn doc_id(&self) -> &str {
		&self.doc_id
	}

	fn check_live(&self) -> LsResult<()> {
		if self.disposed {
			return Err(Error::InvalidState(format!("command queue of {} is disposed", self.doc_id)));
		}
		Ok(())
	}

	pub fn append(&mut self, batch: CommandBatch) -> LsResult<()> {
		self.check_live()?;
		self.batches.push(batch);
		Ok(())
	}

	/// Drops every buffered batch in favor of `batches`
	pub fn replace(&mut self, batches: Vec<CommandBatch>) -> LsResult<()> {
		self.check_live()?;
		self.batches = batches;
		self.replaced = true;
		Ok(())
	}

	pub fn batches(&self) -> &[CommandBatch] {
		&self.batches
	}

	pub fn command_count(&self) -> usize {
		self.batches.iter().map(|b| b.commands.len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.batches.iter().all(|b| b.commands.is_empty())
	}

	pub fn is_replaced(&self) -> bool {
		self.replaced
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed
	}

	/// Transfers the buffered commands, oldest first, into `queue`. A
	/// replaced buffer replaces the whole content of `queue`.
	pub fn move_commands_to(&mut self, queue: &mut PendingQueue) -> LsResult<()> {
		self.check_live()?;
		let commands: Vec<Value> = self.batches.drain(..).flat_map(|b| b.commands).collect();
		debug!("Moving {} buffered commands of {} to its pending queue", commands.len(), self.doc_id);
		if std::mem::take(&mut self.replaced) {
			queue.replace(Vec::new(), commands)
		} else if commands.is_empty() {
			Ok(())
		} else {
			queue.append_commands(commands)
		}
	}

	/// Releases the buffer. Every later mutation fails.
	pub fn dispose(&mut self) {
		self.batches.clear();
		self.disposed = true;
	}
}


// vim: ts=4
