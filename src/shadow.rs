//! Shadow table management for vss0 virtual tables
//!
//! Each virtual table keeps its durable state in three ordinary tables:
//! - {table}_rowids: the row ledger, one row per live row id
//! - {table}_index: one serialized index blob per vector column
//! - {table}_meta: format version, commit generation and next auto row id
//!
//! All writes run on the host connection inside the host transaction, so
//! SQLite's journal makes a commit atomic.

use crate::error::{Error, Result};
use crate::schema::quote_identifier;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;

/// Layout version stored under `format_version`
pub const SHADOW_FORMAT_VERSION: i64 = 1;

pub const META_FORMAT_VERSION: &str = "format_version";
pub const META_GENERATION: &str = "generation";
pub const META_NEXT_ROWID: &str = "next_rowid";

/// Shadow table suffixes
pub const SHADOW_SUFFIXES: [&str; 3] = ["_rowids", "_index", "_meta"];

/// Contents of the `_meta` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMeta {
    pub format_version: i64,
    pub generation: i64,
    pub next_rowid: i64,
}

/// A stored index blob
#[derive(Debug, Clone)]
pub struct StoredIndex {
    pub position: usize,
    pub column_name: String,
    pub blob: Vec<u8>,
}

fn shadow_name(schema: &str, table_name: &str, suffix: &str) -> String {
    format!(
        "{}.{}",
        quote_identifier(schema),
        quote_identifier(&format!("{}{}", table_name, suffix))
    )
}

/// Create the shadow tables and seed the metadata
pub fn create_shadow_tables(db: &Connection, schema: &str, table_name: &str) -> Result<()> {
    let rowids = shadow_name(schema, table_name, "_rowids");
    let index = shadow_name(schema, table_name, "_index");
    let meta = shadow_name(schema, table_name, "_meta");

    db.execute_batch(&format!(
        "CREATE TABLE {rowids} (rowid INTEGER PRIMARY KEY);\
         CREATE TABLE {index} (rowid INTEGER PRIMARY KEY, column_name TEXT NOT NULL, idx BLOB NOT NULL);\
         CREATE TABLE {meta} (key TEXT PRIMARY KEY, value);"
    ))
    .map_err(Error::Sqlite)?;

    let insert_meta = format!("INSERT INTO {} (key, value) VALUES (?1, ?2)", meta);
    db.execute(
        &insert_meta,
        params![META_FORMAT_VERSION, SHADOW_FORMAT_VERSION],
    )?;
    db.execute(&insert_meta, params![META_GENERATION, 0i64])?;
    db.execute(&insert_meta, params![META_NEXT_ROWID, 1i64])?;

    tracing::info!(schema, table = table_name, "created shadow tables");
    Ok(())
}

/// Drop all shadow tables
pub fn drop_shadow_tables(db: &Connection, schema: &str, table_name: &str) -> Result<()> {
    for suffix in SHADOW_SUFFIXES {
        db.execute(
            &format!(
                "DROP TABLE IF EXISTS {}",
                shadow_name(schema, table_name, suffix)
            ),
            [],
        )
        .map_err(Error::Sqlite)?;
    }
    tracing::info!(schema, table = table_name, "dropped shadow tables");
    Ok(())
}

fn read_meta_value(db: &Connection, schema: &str, table_name: &str, key: &str) -> Result<i64> {
    let query = format!(
        "SELECT value FROM {} WHERE key = ?1",
        shadow_name(schema, table_name, "_meta")
    );
    db.query_row(&query, [key], |row| row.get::<_, i64>(0))
        .optional()?
        .ok_or_else(|| Error::Corrupt(format!("Missing '{}' in {}_meta", key, table_name)))
}

pub fn read_meta(db: &Connection, schema: &str, table_name: &str) -> Result<ShadowMeta> {
    let meta = ShadowMeta {
        format_version: read_meta_value(db, schema, table_name, META_FORMAT_VERSION)?,
        generation: read_meta_value(db, schema, table_name, META_GENERATION)?,
        next_rowid: read_meta_value(db, schema, table_name, META_NEXT_ROWID)?,
    };
    if meta.format_version != SHADOW_FORMAT_VERSION {
        return Err(Error::Corrupt(format!(
            "Unsupported shadow format version {}",
            meta.format_version
        )));
    }
    Ok(meta)
}

/// Generation of the last durable commit
pub fn read_generation(db: &Connection, schema: &str, table_name: &str) -> Result<i64> {
    read_meta_value(db, schema, table_name, META_GENERATION)
}

pub fn write_meta(
    db: &Connection,
    schema: &str,
    table_name: &str,
    generation: i64,
    next_rowid: i64,
) -> Result<()> {
    let update = format!(
        "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
        shadow_name(schema, table_name, "_meta")
    );
    db.execute(&update, params![META_GENERATION, generation])?;
    db.execute(&update, params![META_NEXT_ROWID, next_rowid])?;
    Ok(())
}

/// All live row ids, ascending
pub fn get_all_rowids(db: &Connection, schema: &str, table_name: &str) -> Result<Vec<i64>> {
    let query = format!(
        "SELECT rowid FROM {} ORDER BY rowid",
        shadow_name(schema, table_name, "_rowids")
    );

    let mut stmt = db.prepare(&query).map_err(Error::Sqlite)?;
    let rowids = stmt
        .query_map([], |row| row.get(0))
        .map_err(Error::Sqlite)?
        .collect::<std::result::Result<Vec<i64>, _>>()
        .map_err(Error::Sqlite)?;

    Ok(rowids)
}

/// Apply a ledger delta: removals first, then additions
pub fn update_rowids(
    db: &Connection,
    schema: &str,
    table_name: &str,
    removed: &BTreeSet<i64>,
    added: &BTreeSet<i64>,
) -> Result<()> {
    let table = shadow_name(schema, table_name, "_rowids");

    let mut delete = db
        .prepare(&format!("DELETE FROM {} WHERE rowid = ?1", table))
        .map_err(Error::Sqlite)?;
    for rowid in removed {
        delete.execute([rowid])?;
    }

    let mut insert = db
        .prepare(&format!(
            "INSERT OR REPLACE INTO {} (rowid) VALUES (?1)",
            table
        ))
        .map_err(Error::Sqlite)?;
    for rowid in added {
        insert.execute([rowid])?;
    }
    Ok(())
}

/// Stored index blobs ordered by column position
pub fn read_index_blobs(
    db: &Connection,
    schema: &str,
    table_name: &str,
) -> Result<Vec<StoredIndex>> {
    let query = format!(
        "SELECT rowid, column_name, idx FROM {} ORDER BY rowid",
        shadow_name(schema, table_name, "_index")
    );
    let mut stmt = db.prepare(&query).map_err(Error::Sqlite)?;
    let blobs = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })
        .map_err(Error::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Sqlite)?;

    blobs
        .into_iter()
        .map(|(position, column_name, blob)| {
            let position = usize::try_from(position)
                .map_err(|_| Error::Corrupt(format!("Invalid index position {}", position)))?;
            Ok(StoredIndex {
                position,
                column_name,
                blob,
            })
        })
        .collect()
}

/// Overwrite the blob of one column
pub fn write_index_blob(
    db: &Connection,
    schema: &str,
    table_name: &str,
    position: usize,
    column_name: &str,
    blob: &[u8],
) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} (rowid, column_name, idx) VALUES (?1, ?2, ?3)",
        shadow_name(schema, table_name, "_index")
    );
    db.execute(&sql, params![position as i64, column_name, blob])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        create_shadow_tables(&db, "main", "items").unwrap();
        db
    }

    #[test]
    fn test_create_shadow_tables_basic() {
        let db = setup();

        let tables: Vec<String> = db
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tables, vec!["items_index", "items_meta", "items_rowids"]);

        let meta = read_meta(&db, "main", "items").unwrap();
        assert_eq!(
            meta,
            ShadowMeta {
                format_version: SHADOW_FORMAT_VERSION,
                generation: 0,
                next_rowid: 1
            }
        );
    }

    #[test]
    fn test_rowid_delta() {
        let db = setup();
        update_rowids(
            &db,
            "main",
            "items",
            &BTreeSet::new(),
            &[3, 1, 2].into_iter().collect(),
        )
        .unwrap();
        update_rowids(
            &db,
            "main",
            "items",
            &[2].into_iter().collect(),
            &[7].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(get_all_rowids(&db, "main", "items").unwrap(), vec![1, 3, 7]);
    }

    #[test]
    fn test_index_blob_overwrite() {
        let db = setup();
        write_index_blob(&db, "main", "items", 0, "a", b"first").unwrap();
        write_index_blob(&db, "main", "items", 1, "b", b"other").unwrap();
        write_index_blob(&db, "main", "items", 0, "a", b"second").unwrap();

        let blobs = read_index_blobs(&db, "main", "items").unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].column_name, "a");
        assert_eq!(blobs[0].blob, b"second");
        assert_eq!(blobs[1].column_name, "b");
        assert_eq!(blobs[1].blob, b"other");
    }

    #[test]
    fn test_meta_update() {
        let db = setup();
        write_meta(&db, "main", "items", 4, 11).unwrap();
        assert_eq!(read_generation(&db, "main", "items").unwrap(), 4);
        assert_eq!(read_meta(&db, "main", "items").unwrap().next_rowid, 11);
    }

    #[test]
    fn test_drop_shadow_tables() {
        let db = setup();
        drop_shadow_tables(&db, "main", "items").unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_quoted_table_names() {
        let db = Connection::open_in_memory().unwrap();
        create_shadow_tables(&db, "main", "odd \"name\"").unwrap();
        write_index_blob(&db, "main", "odd \"name\"", 0, "v", b"x").unwrap();
        assert_eq!(
            read_index_blobs(&db, "main", "odd \"name\"").unwrap().len(),
            1
        );
    }
}
