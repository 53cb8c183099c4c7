//! sqlite-vss: SQLite virtual table for vector similarity search
//!
//! `vss0` tables keep one ANN index per vector column (Flat, IVF-Flat or
//! HNSW), persisted as blobs in shadow tables and kept transactional
//! through SQLite's virtual table transaction hooks.

pub mod distance;
pub mod error;
pub mod hnsw;
pub mod index;
pub mod query;
pub mod schema;
pub mod shadow;
pub mod sql_functions;
pub mod staging;
pub mod table;
pub mod vector;
pub mod vtab;

pub use distance::DistanceMetric;
pub use error::{Error, ErrorKind, Result};
pub use index::factory::IndexFactory;

use rusqlite::Connection;

/// Initialize the sqlite-vss extension
///
/// This function registers all SQL functions and the `vss0` module.
pub fn init(db: &Connection) -> Result<()> {
    sql_functions::register_all(db)?;
    vtab::register_vss0_module(db)?;
    tracing::debug!("sqlite-vss registered");
    Ok(())
}

/// Extension entry point for SQLite to load this as a shared library
///
/// # Safety
///
/// This function is called by SQLite's extension loading mechanism with a
/// valid database handle and API routine table.
#[cfg(feature = "loadable_extension")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sqlite3_sqlitevss_init(
    db: *mut rusqlite::ffi::sqlite3,
    err_msg: *mut *mut std::os::raw::c_char,
    api: *mut rusqlite::ffi::sqlite3_api_routines,
) -> std::os::raw::c_int {
    unsafe { Connection::extension_init2(db, err_msg, api, extension_init) }
}

#[cfg(feature = "loadable_extension")]
fn extension_init(db: Connection) -> rusqlite::Result<bool> {
    init(&db)?;
    Ok(false)
}
