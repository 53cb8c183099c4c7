//! Vector marshaling between SQL values and f32 slices
//!
//! Vectors arrive either as JSON arrays (`'[1.0, 2.0]'`) or as little-endian
//! f32 blobs, the same layout `vss_f32()` produces.

use crate::error::{Error, Result};
use rusqlite::types::ValueRef;

/// Parse a vector from a JSON array
pub fn from_json(json: &str) -> Result<Vec<f32>> {
    let values: Vec<f64> = serde_json::from_str(json)?;
    let vector: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    check_finite(&vector)?;
    Ok(vector)
}

/// Parse a vector from a little-endian f32 blob
pub fn from_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::InvalidVectorFormat(format!(
            "Blob length {} is not a multiple of 4",
            blob.len()
        )));
    }

    let vector: Vec<f32> = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    check_finite(&vector)?;
    Ok(vector)
}

/// Encode a vector as a little-endian f32 blob
pub fn to_blob(vector: &[f32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        data.extend_from_slice(&v.to_le_bytes());
    }
    data
}

/// Encode a vector as a JSON array
pub fn to_json(vector: &[f32]) -> Result<String> {
    Ok(serde_json::to_string(vector)?)
}

/// Parse a vector from an SQL value; NULL yields `None`
pub fn from_value(value: ValueRef<'_>) -> Result<Option<Vec<f32>>> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Text(s) => {
            let json_str = std::str::from_utf8(s)
                .map_err(|e| Error::InvalidVectorFormat(format!("Invalid UTF-8: {}", e)))?;
            from_json(json_str).map(Some)
        }
        ValueRef::Blob(b) => from_blob(b).map(Some),
        _ => Err(Error::InvalidVectorFormat(
            "Vector must be TEXT (JSON) or BLOB".to_string(),
        )),
    }
}

fn check_finite(vector: &[f32]) -> Result<()> {
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(Error::InvalidVectorFormat(format!(
            "Element {} is not a finite number",
            pos
        )));
    }
    Ok(())
}
