//! Factory string parsing
//!
//! A factory string selects the index structure of a column, in the spirit
//! of the FAISS index factory: `Flat,IDMap2`, `IDMap2,IVF16,Flat`, `HNSW32`.

use crate::error::{Error, Result};
use serde::Serialize;

/// Factory used when a column declares none
pub const DEFAULT_FACTORY: &str = "Flat,IDMap2";

/// Upper bound for `IVF<nlist>`
pub const MAX_NLIST: usize = 65_536;

/// Bounds for `HNSW<M>`
pub const MIN_HNSW_M: usize = 2;
pub const MAX_HNSW_M: usize = 256;

/// Index structure selected by the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexKind {
    /// Exhaustive scan
    Flat,
    /// Inverted file with `nlist` k-means clusters
    Ivf { nlist: usize },
    /// Hierarchical navigable small world graph with `m` links per node
    Hnsw { m: usize },
}

/// Id mapping wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMap {
    None,
    /// Ids are mapped but stored vectors cannot be read back
    IdMap,
    /// Ids are mapped and vectors can be reconstructed
    IdMap2,
}

/// Parsed factory string
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexFactory {
    pub kind: IndexKind,
    pub id_map: IdMap,
    pub requires_training: bool,
    #[serde(rename = "factory")]
    source: String,
}

impl IndexFactory {
    /// Parse a factory string, returning `InvalidConfig` if it is not accepted
    pub fn parse(factory: &str) -> Result<Self> {
        let source = factory.trim();
        if source.is_empty() {
            return Err(Error::InvalidConfig("Empty factory string".to_string()));
        }

        let mut tokens: Vec<&str> = source.split(',').map(str::trim).collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(invalid(source, "empty component"));
        }

        let mut id_map = IdMap::None;
        if let Some(map) = tokens.first().and_then(|t| parse_id_map(t)) {
            id_map = map;
            tokens.remove(0);
        } else if let Some(map) = tokens.last().and_then(|t| parse_id_map(t)) {
            id_map = map;
            tokens.pop();
        }
        if tokens.iter().any(|t| parse_id_map(t).is_some()) {
            return Err(invalid(source, "IDMap may appear only once, first or last"));
        }

        let kind = match tokens.as_slice() {
            ["Flat"] => IndexKind::Flat,
            [ivf, "Flat"] if ivf.starts_with("IVF") => {
                let nlist = parse_count(source, ivf, "IVF")?;
                if nlist == 0 || nlist > MAX_NLIST {
                    return Err(invalid(
                        source,
                        &format!("IVF list count must be between 1 and {}", MAX_NLIST),
                    ));
                }
                IndexKind::Ivf { nlist }
            }
            [hnsw] | [hnsw, "Flat"] if hnsw.starts_with("HNSW") => {
                let m = parse_count(source, hnsw, "HNSW")?;
                if !(MIN_HNSW_M..=MAX_HNSW_M).contains(&m) {
                    return Err(invalid(
                        source,
                        &format!("HNSW M must be between {} and {}", MIN_HNSW_M, MAX_HNSW_M),
                    ));
                }
                IndexKind::Hnsw { m }
            }
            [] => return Err(invalid(source, "missing index structure")),
            _ => return Err(invalid(source, "unsupported index structure")),
        };

        Ok(IndexFactory {
            kind,
            id_map,
            requires_training: matches!(kind, IndexKind::Ivf { .. }),
            source: source.to_string(),
        })
    }

    /// The factory string as declared (trimmed)
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn requires_training(&self) -> bool {
        self.requires_training
    }

    /// Whether stored vectors can be read back by id
    pub fn supports_reconstruct(&self) -> bool {
        self.id_map != IdMap::IdMap
    }
}

fn parse_id_map(token: &str) -> Option<IdMap> {
    match token {
        "IDMap" => Some(IdMap::IdMap),
        "IDMap2" => Some(IdMap::IdMap2),
        _ => None,
    }
}

fn parse_count(source: &str, token: &str, prefix: &str) -> Result<usize> {
    token[prefix.len()..]
        .parse::<usize>()
        .map_err(|_| invalid(source, &format!("'{}' needs a numeric suffix", token)))
}

fn invalid(source: &str, reason: &str) -> Error {
    Error::InvalidConfig(format!("Invalid factory string '{}': {}", source, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factory() {
        let f = IndexFactory::parse(DEFAULT_FACTORY).unwrap();
        assert_eq!(f.kind, IndexKind::Flat);
        assert_eq!(f.id_map, IdMap::IdMap2);
        assert!(!f.requires_training());
        assert!(f.supports_reconstruct());
    }

    #[test]
    fn test_ivf_factory() {
        let f = IndexFactory::parse("IVF4,Flat").unwrap();
        assert_eq!(f.kind, IndexKind::Ivf { nlist: 4 });
        assert!(f.requires_training());

        let f = IndexFactory::parse("IDMap2, IVF16, Flat").unwrap();
        assert_eq!(f.kind, IndexKind::Ivf { nlist: 16 });
        assert_eq!(f.id_map, IdMap::IdMap2);
    }

    #[test]
    fn test_hnsw_factory() {
        assert_eq!(
            IndexFactory::parse("HNSW32").unwrap().kind,
            IndexKind::Hnsw { m: 32 }
        );
        assert_eq!(
            IndexFactory::parse("HNSW8,Flat,IDMap").unwrap().kind,
            IndexKind::Hnsw { m: 8 }
        );
    }

    #[test]
    fn test_idmap_without_reconstruct() {
        let f = IndexFactory::parse("IDMap,Flat").unwrap();
        assert!(!f.supports_reconstruct());
    }

    #[test]
    fn test_rejected_factories() {
        for bad in [
            "",
            "Flat,",
            "PQ8",
            "IVF,Flat",
            "IVF0,Flat",
            "IVF4",
            "HNSW1",
            "HNSWx",
            "IDMap2",
            "IDMap,IDMap2,Flat",
            "Flat,IDMap2,Flat",
            "flat",
        ] {
            assert!(
                matches!(IndexFactory::parse(bad), Err(Error::InvalidConfig(_))),
                "factory '{}' should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_factory_serializes_to_json() {
        let f = IndexFactory::parse("IVF4,Flat").unwrap();
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["kind"]["kind"], "ivf");
        assert_eq!(json["kind"]["nlist"], 4);
        assert_eq!(json["requires_training"], true);
        assert_eq!(json["factory"], "IVF4,Flat");
    }
}
