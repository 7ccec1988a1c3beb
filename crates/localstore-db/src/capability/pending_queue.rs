//! Stored pending queues: one header row per document plus one row per
//! command slot.

use async_trait::async_trait;
use localstore::key;
use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{StorageCapability, apply_update, parse_row, unsupported};
use crate::operation::Operation;
use crate::pending_queue::{PendingQueue, PendingQueueRow, SentBundle, SentBundleInfo};
use crate::reader_writer;
use crate::record::RecordType;
use crate::transaction::Transaction;

pub const PENDING_QUEUES_STORE: &str = "PendingQueues";
pub const PENDING_QUEUE_COMMANDS_STORE: &str = "PendingQueueCommands";

/// One occupied command slot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueCommandRow {
	doc_id: Box<str>,
	entry_index: i64,
	command: Value,
}

fn slot_range(doc_id: &str, from_index: i64, to_index: i64) -> KeyRange {
	KeyRange::bound(key![doc_id, from_index], key![doc_id, to_index], false, false)
}

#[derive(Debug, Default)]
pub struct PendingQueueCapability;

impl PendingQueueCapability {
	/// Rebuilds a document's queue from its header and command slots
	pub async fn read_pending_queue(&self, tx: &mut Transaction, doc_id: &str) -> LsResult<Option<PendingQueue>> {
		let Some(row) = tx.get(PENDING_QUEUES_STORE, &Key::from(doc_id)).await? else {
			return Ok(None);
		};
		let row: PendingQueueRow = parse_row(PENDING_QUEUES_STORE, row)?;

		let slots: Vec<QueueCommandRow> = if row.last_entry_index >= row.first_entry_index {
			tx.get_all(
				PENDING_QUEUE_COMMANDS_STORE,
				&slot_range(doc_id, row.first_entry_index, row.last_entry_index),
				None,
			)
			.await?
			.into_iter()
			.map(|slot| parse_row(PENDING_QUEUE_COMMANDS_STORE, slot))
			.collect::<LsResult<_>>()?
		} else {
			Vec::new()
		};
		let commands_in = |from: i64, to: i64| -> Vec<Value> {
			slots
				.iter()
				.filter(|slot| slot.entry_index >= from && slot.entry_index < to)
				.map(|slot| slot.command.clone())
				.collect()
		};

		let mut unsent_from = row.first_entry_index;
		let sent_bundles: Vec<SentBundle> = row
			.sent_bundles
			.iter()
			.map(|info| {
				unsent_from = unsent_from.max(info.first_index + info.count);
				SentBundle {
					request_id: info.request_id.clone(),
					commands: commands_in(info.first_index, info.first_index + info.count),
				}
			})
			.collect();
		let unsent = commands_in(unsent_from, row.last_entry_index + 1);

		Ok(Some(PendingQueue::from_stored(row, sent_bundles, unsent)))
	}

	/// Ids of all documents with a stored pending queue
	pub async fn read_pending_queue_doc_ids(&self, tx: &mut Transaction) -> LsResult<Vec<Box<str>>> {
		let entries = tx.get_all_entries(PENDING_QUEUES_STORE, &KeyRange::All, None).await?;
		Ok(entries.into_iter().filter_map(|(key, _)| key.as_str().map(Into::into)).collect())
	}

	async fn read_row(&self, tx: &mut Transaction, doc_id: &str) -> LsResult<PendingQueueRow> {
		match tx.get(PENDING_QUEUES_STORE, &Key::from(doc_id)).await? {
			Some(row) => parse_row(PENDING_QUEUES_STORE, row),
			None => Err(Error::NotFound(format!("pending queue {}", doc_id))),
		}
	}

	async fn patch(&self, tx: &mut Transaction, doc_id: &str, modifications: Map<String, Value>) -> LsResult<()> {
		reader_writer::save_modifications(tx, PENDING_QUEUES_STORE, &Key::from(doc_id), &modifications, &[]).await
	}

	async fn write_commands(&self, tx: &mut Transaction, doc_id: &str, start_index: i64, commands: &[Value]) -> LsResult<()> {
		let row = self.read_row(tx, doc_id).await?;
		let mut entry_index = start_index;
		for command in commands {
			let slot = QueueCommandRow { doc_id: doc_id.into(), entry_index, command: command.clone() };
			tx.put(PENDING_QUEUE_COMMANDS_STORE, &key![doc_id, entry_index], &serde_json::to_value(&slot)?)
				.await?;
			entry_index += 1;
		}

		let last_entry_index = row.last_entry_index.max(entry_index - 1);
		if last_entry_index != row.last_entry_index {
			let mut modifications = Map::new();
			modifications.insert("lastEntryIndex".into(), Value::from(last_entry_index));
			self.patch(tx, doc_id, modifications).await?;
		}
		Ok(())
	}

	async fn mark_sent_bundle(
		&self,
		tx: &mut Transaction,
		doc_id: &str,
		first_entry_index: i64,
		bundles: &[SentBundleInfo],
		waiting_for_ack: bool,
	) -> LsResult<()> {
		let mut modifications = Map::new();
		modifications.insert("firstEntryIndex".into(), Value::from(first_entry_index));
		modifications.insert("sentBundles".into(), serde_json::to_value(bundles)?);
		modifications.insert("waitingForAck".into(), Value::Bool(waiting_for_ack));
		self.patch(tx, doc_id, modifications).await
	}

	/// Removes the slots of the oldest `bundles` sent bundles (all when None)
	async fn clear_sent(&self, tx: &mut Transaction, doc_id: &str, bundles: Option<usize>) -> LsResult<()> {
		let row = self.read_row(tx, doc_id).await?;
		let take = bundles.unwrap_or(row.sent_bundles.len()).min(row.sent_bundles.len());
		let (cleared, kept) = row.sent_bundles.split_at(take);

		let mut first_entry_index = row.first_entry_index;
		for bundle in cleared {
			if bundle.count > 0 {
				let range = slot_range(doc_id, bundle.first_index, bundle.first_index + bundle.count - 1);
				tx.delete_range(PENDING_QUEUE_COMMANDS_STORE, &range).await?;
			}
			first_entry_index = first_entry_index.max(bundle.first_index + bundle.count);
		}

		let mut modifications = Map::new();
		modifications.insert("firstEntryIndex".into(), Value::from(first_entry_index));
		modifications.insert("sentBundles".into(), serde_json::to_value(kept)?);
		modifications.insert("waitingForAck".into(), Value::Bool(false));
		self.patch(tx, doc_id, modifications).await
	}

	async fn clear(&self, tx: &mut Transaction, doc_id: &str) -> LsResult<()> {
		let row = self.read_row(tx, doc_id).await?;
		tx.delete_range(PENDING_QUEUE_COMMANDS_STORE, &KeyRange::prefix(vec![Key::from(doc_id)])).await?;

		let mut modifications = Map::new();
		modifications.insert("firstEntryIndex".into(), Value::from(row.last_entry_index + 1));
		modifications.insert("sentBundles".into(), Value::Array(Vec::new()));
		modifications.insert("waitingForAck".into(), Value::Bool(false));
		self.patch(tx, doc_id, modifications).await
	}
}

#[async_trait]
impl StorageCapability for PendingQueueCapability {
	fn name(&self) -> &'static str {
		"PendingQueueCapability"
	}

	fn supported_record_types(&self) -> &'static [RecordType] {
		&[RecordType::PendingQueue]
	}

	fn object_store_names(&self) -> &'static [&'static str] {
		&[PENDING_QUEUES_STORE, PENDING_QUEUE_COMMANDS_STORE]
	}

	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()> {
		match op {
			Operation::UpdateRecord { store, key, modifications, is_new, nullable, .. } => {
				apply_update(tx, store, key, modifications, *is_new, nullable).await
			}
			Operation::PendingQueueWriteCommands { doc_id, start_index, commands } => {
				self.write_commands(tx, doc_id, *start_index, commands).await
			}
			Operation::PendingQueueMarkSentBundle { doc_id, first_entry_index, bundles, waiting_for_ack } => {
				self.mark_sent_bundle(tx, doc_id, *first_entry_index, bundles, *waiting_for_ack).await
			}
			Operation::PendingQueueDeleteCommands { doc_id, from_index, to_index } => {
				if from_index <= to_index {
					tx.delete_range(PENDING_QUEUE_COMMANDS_STORE, &slot_range(doc_id, *from_index, *to_index))
						.await?;
				}
				Ok(())
			}
			Operation::PendingQueueClear { doc_id } => self.clear(tx, doc_id).await,
			Operation::PendingQueueClearSent { doc_id } => self.clear_sent(tx, doc_id, None).await,
			Operation::PendingQueueClearSentBundle { doc_id } => self.clear_sent(tx, doc_id, Some(1)).await,
			// Pending queues are never deleted directly
			other => Err(unsupported(self.name(), other)),
		}
	}
}

// vim: ts=4
