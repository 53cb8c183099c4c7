//! SQL scalar function implementations

use crate::distance::{DistanceMetric, checked_distance};
use crate::error::{Error, Result};
use crate::index::factory::IndexFactory;
use crate::vector;
use rusqlite::Connection;
use rusqlite::functions::{Context, FunctionFlags};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register all SQL functions with the database
pub fn register_all(db: &Connection) -> Result<()> {
    register_vss_version(db)?;

    // Vector helpers
    register_vss_f32(db)?;
    register_vss_to_json(db)?;
    register_vss_length(db)?;

    // Distance functions
    register_vss_distance(db, "vss_distance_l2", DistanceMetric::L2)?;
    register_vss_distance(db, "vss_distance_l1", DistanceMetric::L1)?;
    register_vss_distance(db, "vss_distance_cosine", DistanceMetric::Cosine)?;

    register_vss_factory_info(db)?;

    Ok(())
}

fn user_error(e: Error) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

/// Parse argument `idx` as a vector; NULL yields `None`
fn vector_arg(ctx: &Context, idx: usize) -> rusqlite::Result<Option<Vec<f32>>> {
    vector::from_value(ctx.get_raw(idx)).map_err(user_error)
}

fn register_vss_version(db: &Connection) -> Result<()> {
    db.create_scalar_function(
        "vss_version",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |_ctx| Ok(format!("v{}", VERSION)),
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}

fn register_vss_f32(db: &Connection) -> Result<()> {
    db.create_scalar_function(
        "vss_f32",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(vector_arg(ctx, 0)?.map(|v| vector::to_blob(&v))),
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}

fn register_vss_to_json(db: &Connection) -> Result<()> {
    db.create_scalar_function(
        "vss_to_json",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            vector_arg(ctx, 0)?
                .map(|v| vector::to_json(&v))
                .transpose()
                .map_err(user_error)
        },
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}

fn register_vss_length(db: &Connection) -> Result<()> {
    db.create_scalar_function(
        "vss_length",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(vector_arg(ctx, 0)?.map(|v| v.len() as i64)),
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}

fn register_vss_distance(db: &Connection, name: &str, metric: DistanceMetric) -> Result<()> {
    db.create_scalar_function(
        name,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let (Some(a), Some(b)) = (vector_arg(ctx, 0)?, vector_arg(ctx, 1)?) else {
                return Ok(None);
            };
            let dist = checked_distance(&a, &b, metric).map_err(user_error)?;
            Ok(Some(dist as f64))
        },
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}

fn register_vss_factory_info(db: &Connection) -> Result<()> {
    db.create_scalar_function(
        "vss_factory_info",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let source = ctx.get::<String>(0)?;
            let factory = IndexFactory::parse(&source).map_err(user_error)?;
            serde_json::to_string(&factory).map_err(|e| user_error(e.into()))
        },
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}
