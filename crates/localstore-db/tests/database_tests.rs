use localstore::error_reporter::TracingErrorReporter;
use localstore::key;
use localstore::prelude::*;
use localstore_db::db_util::CursorDirection;
use localstore_db::{DatabaseEvent, DatabaseFactory, DocsDatabase, TransactionOptions, reader_writer};
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const ITEMS: &str = "Items";

async fn create_test_factory() -> (Arc<DatabaseFactory>, TempDir) {
	let temp_dir = TempDir::new().expect("Failed to create temp directory");
	let factory = DatabaseFactory::new(temp_dir.path()).await.expect("Failed to create factory");
	(Arc::new(factory), temp_dir)
}

/// Database at version 1 with a single `Items` store
async fn create_test_database(factory: &Arc<DatabaseFactory>) -> DocsDatabase {
	let mut db = DocsDatabase::new(Arc::clone(factory), "test", Arc::new(TracingErrorReporter));
	db.open().await.expect("Failed to open database");
	db.set_version(1, |up| up.create_object_store(ITEMS)).await.expect("Failed to upgrade");
	db
}

#[tokio::test]
async fn test_fresh_database_is_empty() {
	let (factory, _temp) = create_test_factory().await;
	let mut db = DocsDatabase::new(factory, "fresh", Arc::new(TracingErrorReporter));
	assert!(!db.is_initialized());
	assert!(matches!(
		db.open_transaction(&[], TransactionOptions::new("early")).await,
		Err(Error::NotInitialized)
	));

	db.open().await.unwrap();
	assert_eq!(db.version(), 0);
	assert!(db.object_store_names().is_empty());
	assert!(matches!(db.open().await, Err(Error::AlreadyInitialized)));
}

#[tokio::test]
async fn test_set_version_requires_a_higher_version() {
	let (factory, _temp) = create_test_factory().await;
	let mut db = create_test_database(&factory).await;

	let called = AtomicUsize::new(0);
	let err = db
		.set_version(1, |_| {
			called.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
		.await
		.unwrap_err();
	assert!(matches!(err, Error::InvalidVersion { current: 1, requested: 1 }));
	assert_eq!(called.load(Ordering::SeqCst), 0);
	// The connection was left alone
	assert!(!db.is_closed());
	assert_eq!(db.version(), 1);
}

#[tokio::test]
async fn test_failed_upgrade_keeps_previous_version() {
	let (factory, _temp) = create_test_factory().await;
	let mut db = create_test_database(&factory).await;

	let err = db
		.set_version(2, |up| {
			up.create_object_store("Other")?;
			up.create_object_store(ITEMS)
		})
		.await
		.unwrap_err();
	assert!(matches!(err, Error::ConstraintError(_)));
	assert_eq!(db.version(), 1);
	assert_eq!(db.object_store_names(), vec![ITEMS.to_string()]);
}

#[tokio::test]
async fn test_connection_has_a_single_owner() {
	let (factory, _temp) = create_test_factory().await;
	let connection = factory.open("shared").await.unwrap();

	let mut first = DocsDatabase::new(Arc::clone(&factory), "shared", Arc::new(TracingErrorReporter));
	first.initialize(Arc::clone(&connection)).unwrap();

	let mut second = DocsDatabase::new(Arc::clone(&factory), "shared", Arc::new(TracingErrorReporter));
	assert!(matches!(second.initialize(Arc::clone(&connection)), Err(Error::ConnectionAlreadyOwned)));

	// Closing hands the connection back
	first.close();
	first.close();
	assert!(first.is_closed());
	assert!(!connection.is_instrumented());
}

#[tokio::test]
async fn test_upgrade_by_another_owner_closes_the_connection() {
	let (factory, _temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;
	let mut events = db.subscribe().unwrap();

	let mut other = DocsDatabase::new(Arc::clone(&factory), "test", Arc::new(TracingErrorReporter));
	other.open().await.unwrap();
	other.set_version(2, |up| up.create_object_store("Other")).await.unwrap();

	let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
	assert_eq!(event, DatabaseEvent::VersionChange { old_version: 1, new_version: 2 });
	assert!(db.is_closed());
	assert!(matches!(
		db.open_transaction(&[ITEMS], TransactionOptions::new("stale")).await,
		Err(Error::ConnectionClosed)
	));
	assert_eq!(other.object_store_names(), vec!["Items".to_string(), "Other".to_string()]);
}

#[tokio::test]
async fn test_version_change_handler_sees_upgrade() {
	let (factory, _temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	let handle = db
		.on_version_change(move |event| {
			let _ = tx.send(event);
		})
		.unwrap();

	let mut other = DocsDatabase::new(Arc::clone(&factory), "test", Arc::new(TracingErrorReporter));
	other.open().await.unwrap();
	other.set_version(3, |up| up.create_object_store("Other")).await.unwrap();

	let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
	assert_eq!(event, DatabaseEvent::VersionChange { old_version: 1, new_version: 3 });
	assert!(db.is_closed());

	// The listener ends with its connection
	drop(db);
	tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_version_change_handler_requires_open_database() {
	let (factory, _temp) = create_test_factory().await;
	let db = DocsDatabase::new(factory, "unopened", Arc::new(TracingErrorReporter));
	assert!(matches!(db.on_version_change(|_| {}), Err(Error::NotInitialized)));
}

#[tokio::test]
async fn test_delete_database_closes_connections() {
	let (factory, temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	db.on_version_change(move |event| {
		let _ = tx.send(event);
	})
	.unwrap();

	factory.delete_database("test").await.unwrap();
	let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
	assert_eq!(event, DatabaseEvent::Closed);
	assert!(db.is_closed());
	assert!(matches!(
		db.open_transaction(&[ITEMS], TransactionOptions::new("deleted")).await,
		Err(Error::ConnectionClosed)
	));
	assert!(!temp.path().join("test.redb").exists());

	// Deleting again is fine, and the name starts over from scratch
	factory.delete_database("test").await.unwrap();
	let mut fresh = DocsDatabase::new(Arc::clone(&factory), "test", Arc::new(TracingErrorReporter));
	fresh.open().await.unwrap();
	assert_eq!(fresh.version(), 0);
	assert!(fresh.object_store_names().is_empty());
}

#[tokio::test]
async fn test_document_id_list_round_trip() {
	let (factory, _temp) = create_test_factory().await;
	let mut db = DocsDatabase::new(Arc::clone(&factory), "profile", Arc::new(TracingErrorReporter));
	db.open().await.unwrap();
	db.set_version(1, |up| up.create_object_store(reader_writer::PROFILE_DATA_STORE)).await.unwrap();
	let stores = [reader_writer::PROFILE_DATA_STORE];

	let mut tx = db.open_transaction(&stores, TransactionOptions::new("read")).await.unwrap();
	let list = reader_writer::read_document_id_list(&mut tx, "offlineDocs").await.unwrap();
	assert_eq!(list.data_type.as_ref(), "offlineDocs");
	assert!(list.document_ids.is_empty());
	drop(tx);

	let list = reader_writer::DocumentIdList {
		data_type: "offlineDocs".into(),
		document_ids: vec!["d2".into(), "d1".into()],
	};
	let mut tx = db.open_transaction(&stores, TransactionOptions::new("write").writable()).await.unwrap();
	reader_writer::write_document_id_list(&mut tx, &list).await.unwrap();
	tx.commit().await.unwrap();

	let mut tx = db.open_transaction(&stores, TransactionOptions::new("read")).await.unwrap();
	assert_eq!(reader_writer::read_document_id_list(&mut tx, "offlineDocs").await.unwrap(), list);
	// Lists are kept apart by data type
	assert!(reader_writer::read_document_id_list(&mut tx, "pinnedDocs").await.unwrap().document_ids.is_empty());
}

#[tokio::test]
async fn test_put_get_and_ranges() {
	let (factory, _temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;

	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("write").writable()).await.unwrap();
	for (doc, idx) in [("a", 1), ("a", 2), ("a", 10), ("b", 1)] {
		tx.put(ITEMS, &key![doc, idx], &json!({ "doc": doc, "idx": idx })).await.unwrap();
	}
	let err = tx.add(ITEMS, &key!["a", 1], &json!({})).await.unwrap_err();
	assert!(matches!(err.root(), Error::ConstraintError(_)));
	tx.commit().await.unwrap();

	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("read")).await.unwrap();
	assert_eq!(tx.get(ITEMS, &key!["a", 2]).await.unwrap(), Some(json!({ "doc": "a", "idx": 2 })));
	assert_eq!(tx.get(ITEMS, &key!["c", 1]).await.unwrap(), None);

	let a_rows = tx.get_all(ITEMS, &KeyRange::prefix(vec![Key::from("a")]), None).await.unwrap();
	let idx: Vec<i64> = a_rows.iter().map(|r| r["idx"].as_i64().unwrap()).collect();
	assert_eq!(idx, vec![1, 2, 10]);

	assert_eq!(tx.count(ITEMS, &KeyRange::All).await.unwrap(), 4);
	assert_eq!(tx.get_all(ITEMS, &KeyRange::All, Some(2)).await.unwrap().len(), 2);

	let range = KeyRange::bound(key!["a", 2], key!["a", 10], false, true);
	assert_eq!(tx.count(ITEMS, &range).await.unwrap(), 1);

	let mut cursor = tx.open_cursor(ITEMS, &KeyRange::All, CursorDirection::Prev).await.unwrap();
	assert_eq!(cursor.key(), Some(&key!["b", 1]));
	cursor.advance(2);
	assert_eq!(cursor.key(), Some(&key!["a", 2]));

	let err = tx.put(ITEMS, &key!["z"], &json!({})).await.unwrap_err();
	assert!(matches!(err.root(), Error::ReadOnly(_)));
	tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_abort_rolls_back() {
	let (factory, _temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;

	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("write").writable()).await.unwrap();
	tx.put(ITEMS, &key!["x"], &json!({ "v": 1 })).await.unwrap();
	tx.abort().unwrap();

	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("write").writable()).await.unwrap();
	assert_eq!(tx.get(ITEMS, &key!["x"]).await.unwrap(), None);
	tx.put(ITEMS, &key!["y"], &json!({ "v": 2 })).await.unwrap();
	// Abandoning keeps what was written but reports nothing further
	tx.abandon().unwrap();

	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("read")).await.unwrap();
	assert_eq!(tx.get(ITEMS, &key!["y"]).await.unwrap(), Some(json!({ "v": 2 })));
}

#[tokio::test]
async fn test_writers_queue_behind_each_other() {
	let (factory, _temp) = create_test_factory().await;
	let db = Arc::new(create_test_database(&factory).await);

	let first = db.open_transaction(&[ITEMS], TransactionOptions::new("first").writable()).await.unwrap();
	let db2 = Arc::clone(&db);
	let second = tokio::spawn(async move {
		let mut tx = db2.open_transaction(&[ITEMS], TransactionOptions::new("second").writable()).await?;
		tx.put(ITEMS, &key!["after"], &json!({})).await?;
		tx.commit().await
	});

	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(!second.is_finished());
	first.commit().await.unwrap();
	second.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_expired_transaction_times_out() {
	let (factory, _temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;

	let timeouts = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&timeouts);
	let options = TransactionOptions::new("slow")
		.timeout(Duration::from_millis(5))
		.on_timeout(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
	let mut tx = db.open_transaction(&[ITEMS], options).await.unwrap();
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert!(matches!(tx.get(ITEMS, &key!["a"]).await, Err(Error::Timeout(_))));
	assert_eq!(timeouts.load(Ordering::SeqCst), 1);
	// The timeout aborted the transaction
	assert!(tx.is_aborted());
	assert!(matches!(tx.get(ITEMS, &key!["a"]).await, Err(Error::Aborted)));
}

#[tokio::test]
async fn test_save_modifications_touches_listed_properties_only() {
	let (factory, _temp) = create_test_factory().await;
	let db = create_test_database(&factory).await;

	let original = json!({ "id": "d1", "title": "Draft", "lastModifiedServer": 7, "tags": ["a"] });
	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("write").writable()).await.unwrap();
	tx.put(ITEMS, &key!["d1"], &original).await.unwrap();

	let mut mods = Map::new();
	mods.insert("title".into(), json!("Final"));
	reader_writer::save_modifications(&mut tx, ITEMS, &key!["d1"], &mods, &[]).await.unwrap();

	let err = reader_writer::save_modifications(&mut tx, ITEMS, &key!["missing"], &mods, &[]).await.unwrap_err();
	assert!(matches!(err, Error::NotFound(_)));
	tx.commit().await.unwrap();

	let mut tx = db.open_transaction(&[ITEMS], TransactionOptions::new("read")).await.unwrap();
	let stored = tx.get(ITEMS, &key!["d1"]).await.unwrap().unwrap();
	let mut expected = original;
	expected["title"] = json!("Final");
	assert_eq!(stored, expected);
}

// vim: ts=4
