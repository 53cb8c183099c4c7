//! Vector index adapter
//!
//! A [`ColumnIndex`] owns one ANN structure for one vector column. The
//! structure itself is an [`IndexBackend`] chosen by the parsed factory
//! string; `ColumnIndex` enforces the column invariants (dimension, training
//! state, id uniqueness) so backends only ever see validated input.

pub mod codec;
pub mod factory;
pub mod flat;
pub mod ivf;

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::hnsw::{HnswIndex, HnswParams};
use codec::{ByteReader, ByteWriter};
use factory::{IndexFactory, IndexKind};
use flat::FlatIndex;
use ivf::IvfFlatIndex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

/// Largest accepted column dimension
pub const MAX_DIMENSIONS: usize = 65_536;

/// Serialized index header
const INDEX_MAGIC: &[u8; 4] = b"VSSI";
const INDEX_FORMAT_VERSION: u8 = 1;

/// A search hit: (row id, distance)
pub type Neighbor = (i64, f32);

/// Ascending distance, ties broken by ascending id
pub fn cmp_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

pub fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(cmp_neighbors);
}

/// Heap entry ordered by [`cmp_neighbors`]
#[derive(Debug, Clone, Copy)]
struct Ranked(Neighbor);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        cmp_neighbors(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_neighbors(&self.0, &other.0)
    }
}

/// Select the k best candidates, returned in ascending order
pub fn top_k(candidates: impl IntoIterator<Item = Neighbor>, k: usize) -> Vec<Neighbor> {
    if k == 0 {
        return Vec::new();
    }

    // Max-heap: peek() is the worst hit kept so far
    let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(k + 1);
    for candidate in candidates {
        if heap.len() < k {
            heap.push(Ranked(candidate));
        } else if let Some(worst) = heap.peek()
            && cmp_neighbors(&candidate, &worst.0) == Ordering::Less
        {
            heap.pop();
            heap.push(Ranked(candidate));
        }
    }

    let mut result: Vec<Neighbor> = heap.into_iter().map(|r| r.0).collect();
    sort_neighbors(&mut result);
    result
}

/// Runtime search parameter overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchParams {
    /// Number of inverted lists IVF indexes scan
    pub nprobe: Option<usize>,
    /// Candidate list size for HNSW searches
    #[serde(alias = "efSearch")]
    pub ef_search: Option<usize>,
}

impl SearchParams {
    /// Parse either a JSON object (`{"nprobe": 4}`) or a `key=value` list
    /// (`nprobe=4,efSearch=32`)
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(SearchParams::default());
        }

        let params: SearchParams = if input.starts_with('{') {
            serde_json::from_str(input)
                .map_err(|e| Error::Usage(format!("Invalid search params '{}': {}", input, e)))?
        } else {
            let mut params = SearchParams::default();
            for pair in input.split(',') {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::Usage(format!("Search param '{}' is not key=value", pair.trim()))
                })?;
                let value: usize = value.trim().parse().map_err(|_| {
                    Error::Usage(format!(
                        "Search param '{}' needs a non-negative integer",
                        key.trim()
                    ))
                })?;
                match key.trim() {
                    "nprobe" => params.nprobe = Some(value),
                    "efSearch" | "ef_search" => params.ef_search = Some(value),
                    other => {
                        return Err(Error::Usage(format!("Unknown search param '{}'", other)));
                    }
                }
            }
            params
        };

        if params.nprobe == Some(0) || params.ef_search == Some(0) {
            return Err(Error::Usage("Search params must be positive".to_string()));
        }
        Ok(params)
    }
}

/// Pluggable ANN structure behind a column
///
/// Inputs are validated by [`ColumnIndex`]: vectors have the configured
/// dimension, added ids are absent, and `add` is only called once trained.
pub trait IndexBackend: Send {
    /// Number of live vectors
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_trained(&self) -> bool;

    /// Smallest training set the backend accepts
    fn min_training_vectors(&self) -> usize {
        0
    }

    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()>;

    fn add(&mut self, id: i64, vector: &[f32]);

    /// Returns whether the id was present
    fn remove(&mut self, id: i64) -> bool;

    fn contains(&self, id: i64) -> bool;

    /// Stored vector for an id
    fn vector(&self, id: i64) -> Option<Vec<f32>>;

    /// At most k hits, ascending
    fn search(&self, query: &[f32], k: usize, params: &SearchParams) -> Vec<Neighbor>;

    /// Hits with distance <= radius, ascending
    fn range_search(&self, query: &[f32], radius: f32, params: &SearchParams) -> Vec<Neighbor>;

    fn write_payload(&self, w: &mut ByteWriter);

    fn clone_box(&self) -> Box<dyn IndexBackend>;
}

/// ANN index for one vector column
pub struct ColumnIndex {
    factory: IndexFactory,
    metric: DistanceMetric,
    dimension: usize,
    backend: Box<dyn IndexBackend>,
}

impl Clone for ColumnIndex {
    fn clone(&self) -> Self {
        ColumnIndex {
            factory: self.factory.clone(),
            metric: self.metric,
            dimension: self.dimension,
            backend: self.backend.clone_box(),
        }
    }
}

impl fmt::Debug for ColumnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnIndex")
            .field("factory", &self.factory.as_str())
            .field("metric", &self.metric)
            .field("dimension", &self.dimension)
            .field("len", &self.backend.len())
            .field("trained", &self.backend.is_trained())
            .finish()
    }
}

impl ColumnIndex {
    /// Build an empty index, validating dimension and factory
    pub fn configure(dimension: usize, factory: &str, metric: DistanceMetric) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSIONS {
            return Err(Error::InvalidConfig(format!(
                "Dimension must be between 1 and {}, got {}",
                MAX_DIMENSIONS, dimension
            )));
        }
        let factory = IndexFactory::parse(factory)?;
        let backend = new_backend(&factory, dimension, metric);
        Ok(ColumnIndex {
            factory,
            metric,
            dimension,
            backend,
        })
    }

    pub fn factory(&self) -> &IndexFactory {
        &self.factory
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.backend.contains(id)
    }

    pub fn requires_training(&self) -> bool {
        self.factory.requires_training()
    }

    pub fn is_trained(&self) -> bool {
        self.backend.is_trained()
    }

    /// Reject vectors whose length differs from the column dimension
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Train the index. A no-op for structures that need no training.
    pub fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            self.check_dimension(v)?;
        }
        if !self.requires_training() {
            tracing::debug!(
                factory = self.factory.as_str(),
                "training ignored, index needs none"
            );
            return Ok(());
        }

        let required = self.backend.min_training_vectors();
        if vectors.len() < required {
            return Err(Error::InsufficientTrainingData {
                required,
                provided: vectors.len(),
            });
        }
        self.backend.train(vectors)
    }

    pub fn add(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        if !self.backend.is_trained() {
            return Err(Error::NotTrained(self.factory.as_str().to_string()));
        }
        if self.backend.contains(id) {
            return Err(Error::DuplicateId(id));
        }
        self.backend.add(id, vector);
        Ok(())
    }

    /// Remove an id; absent ids are a successful no-op
    pub fn remove(&mut self, id: i64) -> bool {
        self.backend.remove(id)
    }

    /// Stored vector, when the factory keeps vectors readable
    pub fn reconstruct(&self, id: i64) -> Option<Vec<f32>> {
        if !self.factory.supports_reconstruct() {
            return None;
        }
        self.backend.vector(id)
    }

    pub fn search(&self, query: &[f32], k: usize, params: &SearchParams) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        Ok(self.backend.search(query, k, params))
    }

    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        params: &SearchParams,
    ) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        if radius.is_nan() || radius < 0.0 {
            return Ok(Vec::new());
        }
        Ok(self.backend.range_search(query, radius, params))
    }

    /// Serialize the complete index state
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_bytes(INDEX_MAGIC);
        w.put_u8(INDEX_FORMAT_VERSION);
        w.put_u8(self.metric.to_tag());
        w.put_len(self.dimension);
        w.put_str(self.factory.as_str());
        self.backend.write_payload(&mut w);
        w.into_bytes()
    }

    /// Restore an index written by [`ColumnIndex::serialize`]
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        if r.get_bytes(INDEX_MAGIC.len())? != INDEX_MAGIC {
            return Err(Error::Corrupt("Missing index header".to_string()));
        }
        let version = r.get_u8()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "Unsupported index format version {}",
                version
            )));
        }
        let metric = DistanceMetric::from_tag(r.get_u8()?)?;
        let dimension = r.get_len()?;
        if dimension == 0 || dimension > MAX_DIMENSIONS {
            return Err(Error::Corrupt(format!("Invalid dimension {}", dimension)));
        }
        let factory = IndexFactory::parse(&r.get_str()?)
            .map_err(|e| Error::Corrupt(format!("Stored factory rejected: {}", e)))?;

        let backend: Box<dyn IndexBackend> = match factory.kind {
            IndexKind::Flat => Box::new(FlatIndex::read_payload(&mut r, dimension, metric)?),
            IndexKind::Ivf { nlist } => Box::new(IvfFlatIndex::read_payload(
                &mut r, dimension, metric, nlist,
            )?),
            IndexKind::Hnsw { .. } => Box::new(HnswIndex::read_payload(&mut r, dimension, metric)?),
        };
        if !r.is_exhausted() {
            return Err(Error::Corrupt(
                "Trailing bytes after index data".to_string(),
            ));
        }

        Ok(ColumnIndex {
            factory,
            metric,
            dimension,
            backend,
        })
    }
}

fn new_backend(
    factory: &IndexFactory,
    dimension: usize,
    metric: DistanceMetric,
) -> Box<dyn IndexBackend> {
    match factory.kind {
        IndexKind::Flat => Box::new(FlatIndex::new(dimension, metric)),
        IndexKind::Ivf { nlist } => Box::new(IvfFlatIndex::new(dimension, metric, nlist)),
        IndexKind::Hnsw { m } => Box::new(HnswIndex::new(dimension, metric, HnswParams::with_m(m))),
    }
}
