//! HNSW (Hierarchical Navigable Small World) index implementation
//!
//! The graph lives in memory and is persisted as a whole through
//! [`IndexBackend::write_payload`]. Deleted vectors stay in the graph as
//! tombstones so searches can still route through them; the graph is rebuilt
//! once tombstones outnumber live nodes.

pub mod insert;
pub mod search;

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::index::codec::{ByteReader, ByteWriter};
use crate::index::ivf::XorShiftRng;
use crate::index::{IndexBackend, Neighbor, SearchParams, sort_neighbors};
use std::collections::HashMap;

const LEVEL_SEED: u64 = 0x2545_f491_4f6c_dd1d;

/// Rebuild is never attempted below this many tombstones
pub const MIN_TOMBSTONES_FOR_REBUILD: usize = 16;

/// HNSW index parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HnswParams {
    /// Number of bidirectional links per node (default: 32)
    pub m: usize,
    /// Max connections at layer 0 (default: 64, typically 2*M)
    pub max_m0: usize,
    /// Dynamic candidate list size during construction (default: 400)
    pub ef_construction: usize,
    /// Dynamic candidate list size during search (default: 200)
    pub ef_search: usize,
    /// Maximum hierarchy depth (default: 16)
    pub max_level: usize,
    /// Level generation factor for exponential decay (1/ln(M))
    pub level_factor: f64,
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams::with_m(32)
    }
}

impl HnswParams {
    /// Parameters for a given link count, as parsed from `HNSW<M>`
    pub fn with_m(m: usize) -> Self {
        HnswParams {
            m,
            max_m0: m * 2,
            ef_construction: 400,
            ef_search: 200,
            max_level: 16,
            level_factor: 1.0 / (m as f64).ln(),
        }
    }

    fn max_connections(&self, level: usize) -> usize {
        if level == 0 { self.max_m0 } else { self.m }
    }
}

/// A graph node. `neighbors[level]` holds node indexes.
#[derive(Debug, Clone)]
pub struct HnswNode {
    pub id: i64,
    pub level: usize,
    pub vector: Vec<f32>,
    pub neighbors: Vec<Vec<u32>>,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct HnswIndex {
    params: HnswParams,
    dimension: usize,
    metric: DistanceMetric,
    nodes: Vec<HnswNode>,
    /// Live ids only
    id_to_node: HashMap<i64, u32>,
    entry_point: Option<u32>,
    entry_level: usize,
    rng: XorShiftRng,
    tombstones: usize,
}

impl HnswIndex {
    pub fn new(dimension: usize, metric: DistanceMetric, params: HnswParams) -> Self {
        HnswIndex {
            params,
            dimension,
            metric,
            nodes: Vec::new(),
            id_to_node: HashMap::new(),
            entry_point: None,
            entry_level: 0,
            rng: XorShiftRng::new(LEVEL_SEED),
            tombstones: 0,
        }
    }

    /// Nodes in the graph, tombstones included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    fn node(&self, idx: u32) -> &HnswNode {
        &self.nodes[idx as usize]
    }

    fn needs_rebuild(&self) -> bool {
        self.tombstones >= MIN_TOMBSTONES_FOR_REBUILD && self.tombstones > self.id_to_node.len()
    }

    pub fn read_payload(
        r: &mut ByteReader<'_>,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Self> {
        let m = r.get_len()?;
        let params = HnswParams {
            m,
            max_m0: r.get_len()?,
            ef_construction: r.get_len()?,
            ef_search: r.get_len()?,
            max_level: r.get_len()?,
            level_factor: r.get_f64()?,
        };
        if params.m < 2 || params.max_level == 0 {
            return Err(Error::Corrupt(format!(
                "Invalid HNSW parameters {:?}",
                params
            )));
        }

        let mut index = HnswIndex::new(dimension, metric, params);
        index.rng = XorShiftRng::from_state(r.get_u64()?);
        index.entry_point = match r.get_u8()? {
            0 => None,
            _ => Some(r.get_u32()?),
        };
        index.entry_level = r.get_len()?;

        let count = r.get_len()?;
        for idx in 0..count {
            let id = r.get_i64()?;
            let level = r.get_len()?;
            if level >= params.max_level {
                return Err(Error::Corrupt(format!("Node level {} out of range", level)));
            }
            let deleted = r.get_u8()? != 0;
            let vector = r.get_f32_vec(index.dimension)?;
            let mut neighbors = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let n = r.get_len()?;
                let mut links = Vec::with_capacity(n);
                for _ in 0..n {
                    let link = r.get_u32()?;
                    if link as usize >= count {
                        return Err(Error::Corrupt(format!("Dangling HNSW link {}", link)));
                    }
                    links.push(link);
                }
                neighbors.push(links);
            }

            if deleted {
                index.tombstones += 1;
            } else if index.id_to_node.insert(id, idx as u32).is_some() {
                return Err(Error::Corrupt(format!("Duplicate id {} in HNSW index", id)));
            }
            index.nodes.push(HnswNode {
                id,
                level,
                vector,
                neighbors,
                deleted,
            });
        }

        match index.entry_point {
            Some(ep) if ep as usize >= count => {
                return Err(Error::Corrupt("HNSW entry point out of range".to_string()));
            }
            None if count > 0 => {
                return Err(Error::Corrupt("HNSW graph without entry point".to_string()));
            }
            _ => {}
        }
        Ok(index)
    }
}

impl IndexBackend for HnswIndex {
    fn len(&self) -> usize {
        self.id_to_node.len()
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn train(&mut self, _vectors: &[Vec<f32>]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, id: i64, vector: &[f32]) {
        self.insert(id, vector);
    }

    fn remove(&mut self, id: i64) -> bool {
        let Some(idx) = self.id_to_node.remove(&id) else {
            return false;
        };
        self.nodes[idx as usize].deleted = true;
        self.tombstones += 1;

        if self.needs_rebuild() {
            tracing::debug!(
                live = self.id_to_node.len(),
                tombstones = self.tombstones,
                "rebuilding HNSW graph"
            );
            self.rebuild();
        }
        true
    }

    fn contains(&self, id: i64) -> bool {
        self.id_to_node.contains_key(&id)
    }

    fn vector(&self, id: i64) -> Option<Vec<f32>> {
        let idx = *self.id_to_node.get(&id)?;
        Some(self.node(idx).vector.clone())
    }

    fn search(&self, query: &[f32], k: usize, params: &SearchParams) -> Vec<Neighbor> {
        let ef = params.ef_search.unwrap_or(self.params.ef_search);
        self.knn(query, k, ef)
    }

    fn range_search(&self, query: &[f32], radius: f32, params: &SearchParams) -> Vec<Neighbor> {
        let live = self.len();
        if live == 0 {
            return Vec::new();
        }
        let ef = params.ef_search.unwrap_or(self.params.ef_search);

        // Widen k until the farthest hit leaves the radius
        let mut k = live.min(32);
        loop {
            let hits = self.knn(query, k, ef);
            let exhausted = hits.len() < k || k >= live;
            let beyond = hits.last().is_some_and(|h| h.1 > radius);
            if exhausted || beyond {
                let mut within: Vec<Neighbor> =
                    hits.into_iter().filter(|h| h.1 <= radius).collect();
                sort_neighbors(&mut within);
                return within;
            }
            k = (k * 2).min(live);
        }
    }

    fn write_payload(&self, w: &mut ByteWriter) {
        w.put_len(self.params.m);
        w.put_len(self.params.max_m0);
        w.put_len(self.params.ef_construction);
        w.put_len(self.params.ef_search);
        w.put_len(self.params.max_level);
        w.put_f64(self.params.level_factor);
        w.put_u64(self.rng.state());
        match self.entry_point {
            Some(ep) => {
                w.put_u8(1);
                w.put_u32(ep);
            }
            None => w.put_u8(0),
        }
        w.put_len(self.entry_level);

        w.put_len(self.nodes.len());
        for node in &self.nodes {
            w.put_i64(node.id);
            w.put_len(node.level);
            w.put_u8(node.deleted as u8);
            w.put_f32_slice(&node.vector);
            for links in &node.neighbors {
                w.put_len(links.len());
                for &link in links {
                    w.put_u32(link);
                }
            }
        }
    }

    fn clone_box(&self) -> Box<dyn IndexBackend> {
        Box::new(self.clone())
    }
}
