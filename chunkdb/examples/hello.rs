use anyhow::Result;

use chunkdb::key::{ColumnType, Value};
use chunkdb::table::{ChunkDb, ColumnSpec, IndexKind, Row};

#[tokio::main]
async fn main() -> Result<()> {
    // Open (and create) a database directory.
    let db = ChunkDb::open("hello-db").await?;

    // One integer primary column over an ordered tree, one string
    // secondary column over a hash trie.
    let columns = vec![
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
    ];
    db.create_table("admin", "contacts", &columns, 0.0, 1, 0).await?;

    // Write a row and read it back through the primary key.
    let mut row = Row::new();
    row.set("id", Value::Integer(3));
    row.set("email", Value::Text("someone@example.com".to_string()));
    db.put("admin", "contacts", &row).await?;

    let found = db.get("admin", "contacts", &Value::Integer(3)).await?;
    assert_eq!(Some(row), found);

    // Remove it again.
    assert!(db.delete("admin", "contacts", &Value::Integer(3)).await?);
    assert_eq!(None, db.get("admin", "contacts", &Value::Integer(3)).await?);

    std::fs::remove_dir_all("hello-db")?;
    Ok(())
}
