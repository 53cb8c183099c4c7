//! Shared helpers for integration tests
#![allow(dead_code)]

use rusqlite::Connection;

/// In-memory database with the extension registered
pub fn setup_db() -> Connection {
    let db = Connection::open_in_memory().expect("Failed to create database");
    sqlite_vss::init(&db).expect("Failed to init extension");
    db
}

/// JSON text for a vector
pub fn json(vector: &[f32]) -> String {
    format!(
        "[{}]",
        vector
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Deterministic pseudo-random vectors in [-1, 1)
pub fn random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        ((state >> 11) as f64 / (1u64 << 53) as f64) as f32 * 2.0 - 1.0
    };
    (0..count)
        .map(|_| (0..dim).map(|_| next()).collect())
        .collect()
}

/// (rowid, distance) rows of a KNN query on column `column`
pub fn knn(db: &Connection, table: &str, column: &str, query: &[f32], k: i64) -> Vec<(i64, f64)> {
    let sql = format!(
        "SELECT rowid, distance FROM {} WHERE {} MATCH ?1 AND k = ?2",
        table, column
    );
    let mut stmt = db.prepare(&sql).unwrap();
    stmt.query_map(rusqlite::params![json(query), k], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })
    .unwrap()
    .collect::<rusqlite::Result<Vec<_>>>()
    .unwrap()
}

pub fn row_count(db: &Connection, table: &str) -> i64 {
    db.query_row(&format!("SELECT count(*) FROM {}", table), [], |row| {
        row.get(0)
    })
    .unwrap()
}
