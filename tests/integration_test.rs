//! Integration tests for vss0 tables through SQL

mod common;

use common::{json, knn, row_count, setup_db};
use rusqlite::params;

fn three_points() -> rusqlite::Connection {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE points USING vss0(a(2));
         INSERT INTO points(rowid, a) VALUES (1, '[0, 0]');
         INSERT INTO points(rowid, a) VALUES (2, '[1, 0]');
         INSERT INTO points(rowid, a) VALUES (3, '[5, 5]');",
    )
    .unwrap();
    db
}

#[test]
fn test_create_table() {
    let db = setup_db();
    db.execute(
        "CREATE VIRTUAL TABLE vss_simple USING vss0(embedding float[8])",
        [],
    )
    .unwrap();

    let count: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='vss_simple'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(row_count(&db, "vss_simple"), 0);
}

#[test]
fn test_knn_returns_nearest_in_order() {
    let db = three_points();

    let rows = knn(&db, "points", "a", &[0.9, 0.1], 2);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, 2);
    assert_eq!(rows[1].0, 1);
    assert!((rows[0].1 - (0.01f64 + 0.01).sqrt()).abs() < 1e-4);
    assert!((rows[1].1 - (0.81f64 + 0.01).sqrt()).abs() < 1e-4);
}

#[test]
fn test_knn_k_larger_than_table() {
    let db = three_points();
    let rows = knn(&db, "points", "a", &[0.0, 0.0], 50);
    let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn test_knn_with_order_by_distance() {
    let db = three_points();
    let mut stmt = db
        .prepare("SELECT rowid FROM points WHERE a MATCH '[4, 4]' AND k = 3 ORDER BY distance")
        .unwrap();
    let ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[test]
fn test_range_search() {
    let db = three_points();
    let mut stmt = db
        .prepare("SELECT rowid, distance FROM points WHERE a MATCH '[0, 0]' AND radius = 1.5")
        .unwrap();
    let rows: Vec<(i64, f64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], (1, 0.0));
    assert_eq!(rows[1].0, 2);
    assert!((rows[1].1 - 1.0).abs() < 1e-6);
}

#[test]
fn test_search_on_empty_table() {
    let db = setup_db();
    db.execute("CREATE VIRTUAL TABLE empty USING vss0(a(3))", [])
        .unwrap();
    assert!(knn(&db, "empty", "a", &[1.0, 2.0, 3.0], 5).is_empty());
}

#[test]
fn test_full_scan_and_point_lookup() {
    let db = three_points();
    assert_eq!(row_count(&db, "points"), 3);

    let mut stmt = db.prepare("SELECT rowid FROM points").unwrap();
    let ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(ids, vec![1, 2, 3]);

    let blob: Vec<u8> = db
        .query_row("SELECT a FROM points WHERE rowid = 2", [], |row| row.get(0))
        .unwrap();
    assert_eq!(blob, sqlite_vss::vector::to_blob(&[1.0, 0.0]));

    let json_text: String = db
        .query_row(
            "SELECT vss_to_json(a) FROM points WHERE rowid = 3",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(json_text, "[5.0,5.0]");

    let missing: rusqlite::Result<i64> =
        db.query_row("SELECT rowid FROM points WHERE rowid = 42", [], |row| {
            row.get(0)
        });
    assert!(matches!(missing, Err(rusqlite::Error::QueryReturnedNoRows)));
}

#[test]
fn test_distance_is_null_outside_search() {
    let db = three_points();
    let distance: Option<f64> = db
        .query_row("SELECT distance FROM points WHERE rowid = 1", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(distance, None);
}

#[test]
fn test_blob_and_json_inputs_are_equivalent() {
    let db = setup_db();
    db.execute("CREATE VIRTUAL TABLE v USING vss0(a(3))", [])
        .unwrap();
    db.execute(
        "INSERT INTO v(rowid, a) VALUES (1, vss_f32('[1, 2, 3]'))",
        [],
    )
    .unwrap();
    db.execute(
        "INSERT INTO v(rowid, a) VALUES (2, ?1)",
        params![sqlite_vss::vector::to_blob(&[1.0, 2.0, 3.0])],
    )
    .unwrap();

    let rows = knn(&db, "v", "a", &[1.0, 2.0, 3.0], 2);
    assert_eq!(rows, vec![(1, 0.0), (2, 0.0)]);
}

#[test]
fn test_auto_rowid() {
    let db = three_points();
    db.execute("INSERT INTO points(a) VALUES ('[2, 2]')", [])
        .unwrap();
    assert_eq!(db.last_insert_rowid(), 4);

    db.execute("DELETE FROM points WHERE rowid = 4", [])
        .unwrap();
    db.execute("INSERT INTO points(a) VALUES ('[3, 3]')", [])
        .unwrap();
    // Auto ids are never reused
    assert_eq!(db.last_insert_rowid(), 5);
}

#[test]
fn test_delete_removes_from_search() {
    let db = three_points();
    db.execute("DELETE FROM points WHERE rowid = 2", [])
        .unwrap();

    assert_eq!(row_count(&db, "points"), 2);
    let rows = knn(&db, "points", "a", &[1.0, 0.0], 3);
    let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![1, 3]);

    // Deleting an absent row is a no-op
    let changed = db
        .execute("DELETE FROM points WHERE rowid = 99", [])
        .unwrap();
    assert_eq!(changed, 0);
}

#[test]
fn test_update_replaces_vector() {
    let db = three_points();
    db.execute("UPDATE points SET a = '[10, 10]' WHERE rowid = 1", [])
        .unwrap();

    let rows = knn(&db, "points", "a", &[10.0, 10.0], 1);
    assert_eq!(rows, vec![(1, 0.0)]);
    assert_eq!(row_count(&db, "points"), 3);
}

#[test]
fn test_update_rowid() {
    let db = three_points();
    db.execute("UPDATE points SET rowid = 30 WHERE rowid = 3", [])
        .unwrap();
    let rows = knn(&db, "points", "a", &[5.0, 5.0], 1);
    assert_eq!(rows, vec![(30, 0.0)]);

    let err = db
        .execute("UPDATE points SET rowid = 1 WHERE rowid = 2", [])
        .unwrap_err();
    assert!(err.to_string().contains("Duplicate id"), "got: {}", err);
}

#[test]
fn test_multiple_vector_columns() {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE docs USING vss0(title(2), body(3) metric=cosine);
         INSERT INTO docs(rowid, title, body) VALUES (1, '[0, 1]', '[1, 0, 0]');
         INSERT INTO docs(rowid, title, body) VALUES (2, '[1, 0]', '[0, 1, 0]');
         INSERT INTO docs(rowid, title) VALUES (3, '[1, 1]');",
    )
    .unwrap();

    let title_hits = knn(&db, "docs", "title", &[1.0, 0.0], 1);
    assert_eq!(title_hits[0].0, 2);

    // Row 3 has no body vector
    let body_hits = knn(&db, "docs", "body", &[1.0, 0.1, 0.0], 5);
    let ids: Vec<i64> = body_hits.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(body_hits[0].1 < 0.01);

    let body: Option<Vec<u8>> = db
        .query_row("SELECT body FROM docs WHERE rowid = 3", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(body, None);
}

#[test]
fn test_metric_option() {
    let db = setup_db();
    db.execute_batch(
        "CREATE VIRTUAL TABLE m USING vss0(a(2) metric=l1);
         INSERT INTO m(rowid, a) VALUES (1, '[3, 4]');",
    )
    .unwrap();
    let rows = knn(&db, "m", "a", &[0.0, 0.0], 1);
    assert!((rows[0].1 - 7.0).abs() < 1e-6);
}

#[test]
fn test_join_with_metadata_table() {
    let db = three_points();
    db.execute_batch(
        "CREATE TABLE labels(id INTEGER PRIMARY KEY, label TEXT);
         INSERT INTO labels VALUES (1, 'origin'), (2, 'east'), (3, 'far');",
    )
    .unwrap();

    let label: String = db
        .query_row(
            &format!(
                "SELECT labels.label FROM points JOIN labels ON labels.id = points.rowid
                 WHERE points.a MATCH '{}' AND k = 1",
                json(&[4.0, 6.0])
            ),
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(label, "far");
}

#[test]
fn test_join_against_queries_table() {
    let db = three_points();
    db.execute_batch(
        "CREATE TABLE queries(id INTEGER PRIMARY KEY, v TEXT, k INTEGER);
         INSERT INTO queries VALUES (1, '[0.1, 0]', 1), (2, '[5, 4]', 1), (3, '[1, 0]', 2);",
    )
    .unwrap();

    let mut stmt = db
        .prepare(
            "SELECT q.id, points.rowid FROM queries q
             JOIN points ON points.a MATCH q.v AND points.k = q.k
             ORDER BY q.id, points.distance",
        )
        .unwrap();
    let rows: Vec<(i64, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(rows, vec![(1, 1), (2, 3), (3, 2), (3, 1)]);
}

#[test]
fn test_join_with_literal_k_and_bound_vector() {
    let db = three_points();
    db.execute_batch(
        "CREATE TABLE queries(id INTEGER PRIMARY KEY, v TEXT);
         INSERT INTO queries VALUES (1, '[4, 6]');",
    )
    .unwrap();

    let nearest: i64 = db
        .query_row(
            "SELECT points.rowid FROM points, queries
             WHERE points.a MATCH queries.v AND points.k = 1",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(nearest, 3);
}
