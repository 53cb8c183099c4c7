//! Transaction behavior: staging, rollback and cross-connection visibility

mod common;

use common::{knn, row_count, setup_db};
use rusqlite::Connection;
use tempfile::TempDir;

fn index_blob(db: &Connection, table: &str) -> Vec<u8> {
    db.query_row(
        &format!("SELECT idx FROM \"{}_index\" WHERE rowid = 0", table),
        [],
        |row| row.get(0),
    )
    .unwrap()
}

fn generation(db: &Connection, table: &str) -> i64 {
    db.query_row(
        &format!(
            "SELECT value FROM \"{}_meta\" WHERE key = 'generation'",
            table
        ),
        [],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn test_rollback_leaves_index_untouched() {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE t USING vss0(a(2));
         INSERT INTO t(rowid, a) VALUES (1, '[0, 0]');
         INSERT INTO t(rowid, a) VALUES (2, '[1, 1]');",
    )
    .unwrap();
    let blob_before = index_blob(&db, "t");
    let generation_before = generation(&db, "t");

    db.execute_batch(
        "BEGIN;
         INSERT INTO t(rowid, a) VALUES (3, '[2, 2]');
         DELETE FROM t WHERE rowid = 1;
         ROLLBACK;",
    )
    .unwrap();

    assert_eq!(index_blob(&db, "t"), blob_before);
    assert_eq!(generation(&db, "t"), generation_before);
    assert_eq!(row_count(&db, "t"), 2);
    let ids: Vec<i64> = knn(&db, "t", "a", &[2.0, 2.0], 5)
        .iter()
        .map(|r| r.0)
        .collect();
    assert_eq!(ids, vec![2, 1]);
}

#[test]
fn test_staged_rows_visible_to_writer_before_commit() {
    let db = setup_db();
    db.execute("CREATE VIRTUAL TABLE t USING vss0(a(2))", [])
        .unwrap();

    db.execute_batch("BEGIN").unwrap();
    db.execute("INSERT INTO t(rowid, a) VALUES (1, '[0, 0]')", [])
        .unwrap();
    db.execute("INSERT INTO t(rowid, a) VALUES (2, '[1, 0]')", [])
        .unwrap();
    // Scans and point lookups see the staged rows
    assert_eq!(row_count(&db, "t"), 2);
    let a: Vec<u8> = db
        .query_row("SELECT a FROM t WHERE rowid = 2", [], |row| row.get(0))
        .unwrap();
    assert_eq!(a.len(), 8);
    // Searches read the committed indexes
    assert!(knn(&db, "t", "a", &[1.0, 0.0], 1).is_empty());
    db.execute_batch("COMMIT").unwrap();

    assert_eq!(row_count(&db, "t"), 2);
    assert_eq!(knn(&db, "t", "a", &[1.0, 0.0], 1), vec![(2, 0.0)]);
}

#[test]
fn test_delete_of_staged_insert_cancels_it() {
    let db = setup_db();
    db.execute("CREATE VIRTUAL TABLE t USING vss0(a(2))", [])
        .unwrap();

    db.execute_batch("BEGIN").unwrap();
    db.execute("INSERT INTO t(rowid, a) VALUES (5, '[1, 1]')", [])
        .unwrap();
    let deleted = db.execute("DELETE FROM t WHERE rowid = 5", []).unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(row_count(&db, "t"), 0);
    db.execute_batch("COMMIT").unwrap();

    assert_eq!(row_count(&db, "t"), 0);
    assert!(knn(&db, "t", "a", &[1.0, 1.0], 1).is_empty());
}

#[test]
fn test_full_delete_inside_transaction_covers_staged_rows() {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE t USING vss0(a(2));
         INSERT INTO t(rowid, a) VALUES (1, '[0, 0]');
         BEGIN;
         INSERT INTO t(rowid, a) VALUES (2, '[1, 1]');
         INSERT INTO t(rowid, a) VALUES (3, '[2, 2]');",
    )
    .unwrap();
    assert_eq!(db.execute("DELETE FROM t", []).unwrap(), 3);
    db.execute("INSERT INTO t(rowid, a) VALUES (3, '[3, 3]')", [])
        .unwrap();
    db.execute_batch("COMMIT").unwrap();

    assert_eq!(row_count(&db, "t"), 1);
    assert_eq!(knn(&db, "t", "a", &[3.0, 3.0], 5), vec![(3, 0.0)]);
}

#[test]
fn test_each_commit_bumps_generation() {
    let db = setup_db();
    db.execute("CREATE VIRTUAL TABLE t USING vss0(a(2))", [])
        .unwrap();
    assert_eq!(generation(&db, "t"), 0);

    db.execute("INSERT INTO t(rowid, a) VALUES (1, '[0, 0]')", [])
        .unwrap();
    assert_eq!(generation(&db, "t"), 1);

    db.execute_batch(
        "BEGIN;
         INSERT INTO t(rowid, a) VALUES (2, '[0, 1]');
         INSERT INTO t(rowid, a) VALUES (3, '[0, 2]');
         COMMIT;",
    )
    .unwrap();
    assert_eq!(generation(&db, "t"), 2);
}

#[test]
fn test_failed_statement_discards_staged_rows() {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE t USING vss0(a(2));
         INSERT INTO t(rowid, a) VALUES (1, '[0, 0]');",
    )
    .unwrap();

    // Second row has the wrong dimension; the whole statement fails
    let err = db
        .execute(
            "INSERT INTO t(rowid, a) VALUES (2, '[1, 1]'), (3, '[1, 1, 1]')",
            [],
        )
        .unwrap_err();
    assert!(
        err.to_string().contains("Dimension mismatch"),
        "got: {}",
        err
    );

    assert_eq!(row_count(&db, "t"), 1);
    db.execute("INSERT INTO t(rowid, a) VALUES (2, '[1, 1]')", [])
        .unwrap();
    assert_eq!(row_count(&db, "t"), 2);
}

#[test]
fn test_delete_and_reinsert_same_rowid_in_transaction() {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE t USING vss0(a(2));
         INSERT INTO t(rowid, a) VALUES (1, '[0, 0]');
         BEGIN;
         DELETE FROM t WHERE rowid = 1;
         INSERT INTO t(rowid, a) VALUES (1, '[9, 9]');
         COMMIT;",
    )
    .unwrap();

    assert_eq!(row_count(&db, "t"), 1);
    assert_eq!(knn(&db, "t", "a", &[9.0, 9.0], 1), vec![(1, 0.0)]);
}

#[test]
fn test_other_connection_sees_commits() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("shared.db");

    let writer = Connection::open(&path).unwrap();
    sqlite_vss::init(&writer).unwrap();
    writer
        .execute("CREATE VIRTUAL TABLE t USING vss0(a(2))", [])
        .unwrap();

    let reader = Connection::open(&path).unwrap();
    sqlite_vss::init(&reader).unwrap();
    assert_eq!(row_count(&reader, "t"), 0);

    writer
        .execute("INSERT INTO t(rowid, a) VALUES (7, '[3, 4]')", [])
        .unwrap();

    // Reader reloads on the next scan because the generation moved
    assert_eq!(row_count(&reader, "t"), 1);
    assert_eq!(knn(&reader, "t", "a", &[0.0, 0.0], 1), vec![(7, 5.0)]);

    // And can write on top of the reloaded state
    reader
        .execute("INSERT INTO t(a) VALUES ('[1, 1]')", [])
        .unwrap();
    assert_eq!(reader.last_insert_rowid(), 8);
    assert_eq!(row_count(&writer, "t"), 2);
}
