use super::*;

use std::ops::ControlFlow;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::btree::Direction;
use crate::error::ChunkDbError;
use crate::key::{ColumnType, IndexKey, Value};
use crate::store::{MemoryChunkStore, MemoryPayloadStore, Registry};

fn contact_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec {
            name: "id".to_string(),
            primary: true,
            column_type: ColumnType::Integer,
            index_kind: IndexKind::OrderedTree,
        },
        ColumnSpec {
            name: "email".to_string(),
            primary: false,
            column_type: ColumnType::String,
            index_kind: IndexKind::HashTrie,
        },
        ColumnSpec {
            name: "age".to_string(),
            primary: false,
            column_type: ColumnType::Integer,
            index_kind: IndexKind::OrderedTree,
        },
    ]
}

fn contact(id: i64, email: &str, age: i64) -> Row {
    let mut row = Row::new();
    row.set("id", Value::Integer(id));
    row.set("email", Value::Text(email.to_string()));
    row.set("age", Value::Integer(age));
    row
}

fn decode_int(key: &IndexKey) -> i64 {
    let raw = u64::from_be_bytes(key.as_bytes()[24..32].try_into().expect("eight bytes"));
    (raw ^ (1 << 63)) as i64
}

async fn memory_db(registry_dir: &str) -> ChunkDb {
    let store = Arc::new(MemoryChunkStore::new());
    let payloads = Arc::new(MemoryPayloadStore::new());
    let registry = Arc::new(Registry::open(registry_dir).await.expect("opens registry"));
    ChunkDb::with_stores(store, payloads, registry)
}

#[tokio::test]
async fn it_creates_and_reopens_tables() {
    let db = memory_db("table_create.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 1.5, 3, 0)
        .await
        .expect("creates table");
    let root = db.registry().get_root("contacts").await.expect("registered");
    assert!(!root.is_zero());

    db.close_table("admin", "contacts").await;
    let table = db.open_table("admin", "contacts").await.expect("reopens");
    assert_eq!("contacts", table.name());
    assert_eq!("admin", table.owner());
    let info = table.table_info().await;
    assert_eq!(contact_columns(), info);

    std::fs::remove_dir_all("table_create.registry").expect("cleanup");
}

#[tokio::test]
async fn it_rejects_invalid_schemas_before_writing() {
    let db = memory_db("table_schema.registry").await;

    let no_primary: Vec<ColumnSpec> = contact_columns()
        .into_iter()
        .map(|mut column| {
            column.primary = false;
            column
        })
        .collect();
    let err = db
        .create_table("admin", "contacts", &no_primary, 0.0, 1, 0)
        .await
        .expect_err("must reject");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::NoPrimaryColumn)
    ));
    // Nothing was published for the rejected table.
    let err = db.registry().get_root("contacts").await.expect_err("no root");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::RootNotFound(_))
    ));

    let err = db
        .create_table("admin", "", &contact_columns(), 0.0, 1, 0)
        .await
        .expect_err("must reject");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::InvalidTableName(_))
    ));

    std::fs::remove_dir_all("table_schema.registry").expect("cleanup");
}

#[tokio::test]
async fn it_opens_unknown_tables_with_not_found() {
    let db = memory_db("table_unknown.registry").await;
    let err = db.open_table("admin", "missing").await.expect_err("must miss");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::RootNotFound(_))
    ));
    std::fs::remove_dir_all("table_unknown.registry").expect("cleanup");
}

#[tokio::test]
async fn it_puts_and_gets_rows() {
    let db = memory_db("table_put_get.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    let row = contact(7, "alice@example.com", 34);
    db.put("admin", "contacts", &row).await.expect("puts");

    let loaded = db
        .get("admin", "contacts", &Value::Integer(7))
        .await
        .expect("gets")
        .expect("row exists");
    assert_eq!(row, loaded);
    assert_eq!(
        None,
        db.get("admin", "contacts", &Value::Integer(8)).await.expect("gets")
    );

    std::fs::remove_dir_all("table_put_get.registry").expect("cleanup");
}

#[tokio::test]
async fn it_replaces_rows_on_put() {
    let db = memory_db("table_replace.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    db.put("admin", "contacts", &contact(7, "alice@example.com", 34))
        .await
        .expect("puts");
    db.put("admin", "contacts", &contact(7, "alice@elsewhere.org", 35))
        .await
        .expect("replaces");

    let loaded = db
        .get("admin", "contacts", &Value::Integer(7))
        .await
        .expect("gets")
        .expect("row exists");
    assert_eq!(
        Some(&Value::Text("alice@elsewhere.org".to_string())),
        loaded.get("email")
    );

    std::fs::remove_dir_all("table_replace.registry").expect("cleanup");
}

#[tokio::test]
async fn it_rejects_duplicate_strict_inserts() {
    let db = memory_db("table_insert.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    db.insert("admin", "contacts", &contact(7, "alice@example.com", 34))
        .await
        .expect("inserts");
    let err = db
        .insert("admin", "contacts", &contact(7, "other@example.com", 40))
        .await
        .expect_err("must reject");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::DuplicateKey(_))
    ));

    std::fs::remove_dir_all("table_insert.registry").expect("cleanup");
}

#[tokio::test]
async fn it_reports_missing_primary_values() {
    let db = memory_db("table_missing_primary.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    let mut row = Row::new();
    row.set("email", Value::Text("alice@example.com".to_string()));
    let err = db.put("admin", "contacts", &row).await.expect_err("must reject");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::MissingPrimaryValue(_))
    ));

    std::fs::remove_dir_all("table_missing_primary.registry").expect("cleanup");
}

#[tokio::test]
async fn it_deletes_rows_and_their_secondary_entries() {
    let db = memory_db("table_delete.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    db.put("admin", "contacts", &contact(7, "alice@example.com", 34))
        .await
        .expect("puts");
    db.put("admin", "contacts", &contact(8, "bob@example.com", 51))
        .await
        .expect("puts");

    assert!(db
        .delete("admin", "contacts", &Value::Integer(7))
        .await
        .expect("deletes"));
    assert!(!db
        .delete("admin", "contacts", &Value::Integer(7))
        .await
        .expect("deletes again"));
    assert_eq!(
        None,
        db.get("admin", "contacts", &Value::Integer(7)).await.expect("gets")
    );

    // The secondary age index no longer carries the deleted row.
    let mut ages = Vec::new();
    db.scan("admin", "contacts", "age", Direction::Ascending, |key, _| {
        ages.push(decode_int(key));
        ControlFlow::Continue(())
    })
    .await
    .expect("scans");
    assert_eq!(vec![51], ages);

    std::fs::remove_dir_all("table_delete.registry").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_scans_the_primary_column_in_order() {
    let db = memory_db("table_scan.registry").await;
    let table = db
        .create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");
    let created_root = db.registry().get_root("contacts").await.expect("registered");

    table.start_buffer().await.expect("buffers");
    let mut ids: Vec<i64> = (0..300).collect();
    ids.shuffle(&mut rand::thread_rng());
    for id in &ids {
        table
            .put(&contact(*id, &format!("user{id}@example.com"), id % 90))
            .await
            .expect("puts");
    }
    table.flush_buffer().await.expect("commits");

    let mut visited = Vec::new();
    table
        .scan("id", Direction::Ascending, |key, _| {
            visited.push(decode_int(key));
            ControlFlow::Continue(())
        })
        .await
        .expect("scans");
    assert_eq!((0..300).collect::<Vec<_>>(), visited);

    // The commit moved the registry entry off the empty descriptor.
    let committed_root = db.registry().get_root("contacts").await.expect("registered");
    assert_ne!(created_root, committed_root);

    std::fs::remove_dir_all("table_scan.registry").expect("cleanup");
}

#[tokio::test]
async fn it_refuses_scans_on_hash_columns() {
    let db = memory_db("table_scan_hash.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    let err = db
        .scan(
            "admin",
            "contacts",
            "email",
            Direction::Ascending,
            |_, _| ControlFlow::Continue(()),
        )
        .await
        .expect_err("must refuse");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::NotOrdered(_))
    ));

    let err = db
        .scan(
            "admin",
            "contacts",
            "shoe_size",
            Direction::Ascending,
            |_, _| ControlFlow::Continue(()),
        )
        .await
        .expect_err("must refuse");
    assert!(matches!(
        err.downcast_ref::<ChunkDbError>(),
        Some(ChunkDbError::NoSuchColumn(_))
    ));

    std::fs::remove_dir_all("table_scan_hash.registry").expect("cleanup");
}

#[tokio::test]
async fn it_defers_commits_while_buffering() {
    let db = memory_db("table_buffer.registry").await;
    let table = db
        .create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");
    let initial_root = db.registry().get_root("contacts").await.expect("registered");

    table.start_buffer().await.expect("buffers");
    for id in 0..20 {
        table
            .put(&contact(id, &format!("user{id}@example.com"), 20 + id))
            .await
            .expect("puts");
    }
    // Buffered writes are invisible to the registry until the flush.
    assert_eq!(
        initial_root,
        db.registry().get_root("contacts").await.expect("registered")
    );

    table.flush_buffer().await.expect("commits");
    assert_ne!(
        initial_root,
        db.registry().get_root("contacts").await.expect("registered")
    );

    std::fs::remove_dir_all("table_buffer.registry").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_recovers_rows_after_reopening_from_the_registry() {
    let db = memory_db("table_recover.registry").await;
    let table = db
        .create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    table.start_buffer().await.expect("buffers");
    for id in 0..100 {
        table
            .put(&contact(id, &format!("user{id}@example.com"), id % 80))
            .await
            .expect("puts");
    }
    table.flush_buffer().await.expect("commits");
    drop(table);

    // Drop the in-memory table and come back through the registry.
    db.close_table("admin", "contacts").await;
    for id in 0..100 {
        let row = db
            .get("admin", "contacts", &Value::Integer(id))
            .await
            .expect("gets")
            .expect("row survives reopen");
        assert_eq!(Some(&Value::Integer(id)), row.get("id"));
        assert_eq!(
            Some(&Value::Text(format!("user{id}@example.com"))),
            row.get("email")
        );
    }

    std::fs::remove_dir_all("table_recover.registry").expect("cleanup");
}

#[tokio::test]
async fn it_keeps_unbuffered_writes_durable_per_put() {
    let db = memory_db("table_durable.registry").await;
    db.create_table("admin", "contacts", &contact_columns(), 0.0, 1, 0)
        .await
        .expect("creates table");

    db.put("admin", "contacts", &contact(1, "a@example.com", 30))
        .await
        .expect("puts");
    let after_first = db.registry().get_root("contacts").await.expect("registered");
    db.put("admin", "contacts", &contact(2, "b@example.com", 31))
        .await
        .expect("puts");
    let after_second = db.registry().get_root("contacts").await.expect("registered");
    assert_ne!(after_first, after_second);

    // Reopening the table through the registry sees both rows.
    db.close_table("admin", "contacts").await;
    for id in [1, 2] {
        assert!(db
            .get("admin", "contacts", &Value::Integer(id))
            .await
            .expect("gets")
            .is_some());
    }

    std::fs::remove_dir_all("table_durable.registry").expect("cleanup");
}
