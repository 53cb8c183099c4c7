//! Inverted-file index with flat (uncompressed) lists
//!
//! Training runs k-means over the supplied vectors to place `nlist`
//! centroids. Every vector is stored in the list of its nearest centroid and
//! a search scans the `nprobe` lists whose centroids are closest to the query.

use super::codec::{ByteReader, ByteWriter};
use super::factory::MAX_NLIST;
use super::{IndexBackend, Neighbor, SearchParams, sort_neighbors, top_k};
use crate::distance::scalar::l2_squared;
use crate::distance::{DistanceMetric, distance};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Lists scanned when a query does not override `nprobe`
pub const DEFAULT_NPROBE: usize = 1;

/// Lloyd iterations after k-means++ seeding
pub const KMEANS_ITERATIONS: usize = 20;

const KMEANS_SEED: u64 = 0x517c_c1b7_2722_0a95;

#[derive(Debug, Clone, Default)]
struct InvertedList {
    ids: Vec<i64>,
    data: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct IvfFlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    nlist: usize,
    /// `nlist * dimension` floats once trained, empty before
    centroids: Vec<f32>,
    lists: Vec<InvertedList>,
    /// id -> (list, position in list)
    locations: HashMap<i64, (usize, usize)>,
}

impl IvfFlatIndex {
    pub fn new(dimension: usize, metric: DistanceMetric, nlist: usize) -> Self {
        IvfFlatIndex {
            dimension,
            metric,
            nlist,
            centroids: Vec::new(),
            lists: vec![InvertedList::default(); nlist],
            locations: HashMap::new(),
        }
    }

    fn centroid(&self, list: usize) -> &[f32] {
        &self.centroids[list * self.dimension..(list + 1) * self.dimension]
    }

    fn nearest_list(&self, vector: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for list in 0..self.nlist {
            let d = l2_squared(vector, self.centroid(list));
            if d < best_dist {
                best_dist = d;
                best = list;
            }
        }
        best
    }

    /// Lists to scan for a query, closest centroid first
    fn nearest_lists(&self, query: &[f32], params: &SearchParams) -> Vec<usize> {
        if !self.is_trained() {
            return Vec::new();
        }
        let nprobe = params.nprobe.unwrap_or(DEFAULT_NPROBE).min(self.nlist);
        let mut ranked: Vec<(usize, f32)> = (0..self.nlist)
            .map(|list| (list, l2_squared(query, self.centroid(list))))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(nprobe)
            .map(|(list, _)| list)
            .collect()
    }

    fn scan_lists<'a>(
        &'a self,
        lists: &'a [usize],
        query: &'a [f32],
    ) -> impl Iterator<Item = Neighbor> + 'a {
        let dim = self.dimension;
        lists.iter().flat_map(move |&list| {
            let inv = &self.lists[list];
            inv.ids.iter().enumerate().map(move |(pos, &id)| {
                (
                    id,
                    distance(&inv.data[pos * dim..(pos + 1) * dim], query, self.metric),
                )
            })
        })
    }

    fn insert_into(&mut self, list: usize, id: i64, vector: &[f32]) {
        let inv = &mut self.lists[list];
        self.locations.insert(id, (list, inv.ids.len()));
        inv.ids.push(id);
        inv.data.extend_from_slice(vector);
    }

    fn drain_entries(&mut self) -> Vec<(i64, Vec<f32>)> {
        let dim = self.dimension;
        let mut entries = Vec::with_capacity(self.locations.len());
        for inv in &mut self.lists {
            for (pos, &id) in inv.ids.iter().enumerate() {
                entries.push((id, inv.data[pos * dim..(pos + 1) * dim].to_vec()));
            }
            inv.ids.clear();
            inv.data.clear();
        }
        self.locations.clear();
        entries
    }

    /// Read a payload written for a factory with `expected_nlist` lists
    pub fn read_payload(
        r: &mut ByteReader<'_>,
        dimension: usize,
        metric: DistanceMetric,
        expected_nlist: usize,
    ) -> Result<Self> {
        let nlist = r.get_len()?;
        if nlist != expected_nlist || nlist == 0 || nlist > MAX_NLIST {
            return Err(Error::Corrupt(format!(
                "IVF list count {} does not match factory ({})",
                nlist, expected_nlist
            )));
        }
        let mut index = IvfFlatIndex::new(dimension, metric, nlist);
        if r.get_u8()? == 1 {
            index.centroids = r.get_f32_vec(nlist * dimension)?;
        }
        for list in 0..nlist {
            let count = r.get_len()?;
            for _ in 0..count {
                let id = r.get_i64()?;
                let vector = r.get_f32_vec(dimension)?;
                if index.locations.contains_key(&id) {
                    return Err(Error::Corrupt(format!("Duplicate id {} in IVF index", id)));
                }
                index.insert_into(list, id, &vector);
            }
        }
        if !index.is_trained() && !index.locations.is_empty() {
            return Err(Error::Corrupt(
                "Untrained IVF index holds vectors".to_string(),
            ));
        }
        Ok(index)
    }
}

impl IndexBackend for IvfFlatIndex {
    fn len(&self) -> usize {
        self.locations.len()
    }

    fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn min_training_vectors(&self) -> usize {
        self.nlist
    }

    /// (Re-)cluster. Vectors already stored are re-assigned to the new lists.
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() < self.nlist {
            return Err(Error::InsufficientTrainingData {
                required: self.nlist,
                provided: vectors.len(),
            });
        }

        let mut data = Vec::with_capacity(vectors.len() * self.dimension);
        for v in vectors {
            data.extend_from_slice(v);
        }
        self.centroids = kmeans(&data, self.dimension, self.nlist);

        let entries = self.drain_entries();
        for (id, vector) in entries {
            let list = self.nearest_list(&vector);
            self.insert_into(list, id, &vector);
        }
        Ok(())
    }

    fn add(&mut self, id: i64, vector: &[f32]) {
        let list = self.nearest_list(vector);
        self.insert_into(list, id, vector);
    }

    fn remove(&mut self, id: i64) -> bool {
        let Some((list, pos)) = self.locations.remove(&id) else {
            return false;
        };

        let dim = self.dimension;
        let inv = &mut self.lists[list];
        let last = inv.ids.len() - 1;
        if pos != last {
            let moved_id = inv.ids[last];
            inv.ids[pos] = moved_id;
            let (head, tail) = inv.data.split_at_mut(last * dim);
            head[pos * dim..(pos + 1) * dim].copy_from_slice(&tail[..dim]);
            self.locations.insert(moved_id, (list, pos));
        }
        inv.ids.truncate(last);
        inv.data.truncate(last * dim);
        true
    }

    fn contains(&self, id: i64) -> bool {
        self.locations.contains_key(&id)
    }

    fn vector(&self, id: i64) -> Option<Vec<f32>> {
        let &(list, pos) = self.locations.get(&id)?;
        let dim = self.dimension;
        Some(self.lists[list].data[pos * dim..(pos + 1) * dim].to_vec())
    }

    fn search(&self, query: &[f32], k: usize, params: &SearchParams) -> Vec<Neighbor> {
        let lists = self.nearest_lists(query, params);
        top_k(self.scan_lists(&lists, query), k)
    }

    fn range_search(&self, query: &[f32], radius: f32, params: &SearchParams) -> Vec<Neighbor> {
        let lists = self.nearest_lists(query, params);
        let mut hits: Vec<Neighbor> = self
            .scan_lists(&lists, query)
            .filter(|&(_, d)| d <= radius)
            .collect();
        sort_neighbors(&mut hits);
        hits
    }

    fn write_payload(&self, w: &mut ByteWriter) {
        w.put_len(self.nlist);
        if self.is_trained() {
            w.put_u8(1);
            w.put_f32_slice(&self.centroids);
        } else {
            w.put_u8(0);
        }
        for inv in &self.lists {
            w.put_len(inv.ids.len());
            for (pos, &id) in inv.ids.iter().enumerate() {
                w.put_i64(id);
                w.put_f32_slice(&inv.data[pos * self.dimension..(pos + 1) * self.dimension]);
            }
        }
    }

    fn clone_box(&self) -> Box<dyn IndexBackend> {
        Box::new(self.clone())
    }
}

/// K-means clustering with k-means++ initialization.
/// Returns k × dim centroids as flat Vec<f32>. Requires at least k points.
fn kmeans(data: &[f32], dim: usize, k: usize) -> Vec<f32> {
    let n = data.len() / dim;
    let point = |i: usize| &data[i * dim..(i + 1) * dim];

    let mut centroids = vec![0.0f32; k * dim];
    let mut rng = XorShiftRng::new(KMEANS_SEED ^ n as u64);

    // First centroid: random point
    let first = rng.next_usize() % n;
    centroids[..dim].copy_from_slice(point(first));

    // Distance from each point to its nearest centroid
    let mut min_dists = vec![f32::MAX; n];

    for ci in 1..k {
        let last_centroid = centroids[(ci - 1) * dim..ci * dim].to_vec();
        let mut total = 0.0f64;
        for (i, min_dist) in min_dists.iter_mut().enumerate() {
            let d = l2_squared(point(i), &last_centroid);
            if d < *min_dist {
                *min_dist = d;
            }
            total += *min_dist as f64;
        }

        // Weighted random selection proportional to distance²
        let chosen = if total < 1e-30 {
            rng.next_usize() % n
        } else {
            let threshold = rng.next_f64() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids[ci * dim..(ci + 1) * dim].copy_from_slice(point(chosen));
    }

    let mut assignments = vec![0usize; n];
    for _ in 0..KMEANS_ITERATIONS {
        let mut changed = false;
        for (i, assignment) in assignments.iter_mut().enumerate() {
            let mut best = 0;
            let mut best_dist = f32::MAX;
            for ci in 0..k {
                let d = l2_squared(point(i), &centroids[ci * dim..(ci + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = ci;
                }
            }
            if *assignment != best {
                *assignment = best;
                changed = true;
            }
        }

        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0usize; k];
        for (i, &ci) in assignments.iter().enumerate() {
            counts[ci] += 1;
            for (s, &x) in sums[ci * dim..(ci + 1) * dim].iter_mut().zip(point(i)) {
                *s += x as f64;
            }
        }
        // Empty clusters keep their previous centroid
        for ci in 0..k {
            if counts[ci] == 0 {
                continue;
            }
            for d in 0..dim {
                centroids[ci * dim + d] = (sums[ci * dim + d] / counts[ci] as f64) as f32;
            }
        }

        if !changed {
            break;
        }
    }

    centroids
}

/// Deterministic xorshift generator so training is reproducible
#[derive(Debug, Clone)]
pub(crate) struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub(crate) fn new(seed: u64) -> Self {
        XorShiftRng {
            state: if seed == 0 { KMEANS_SEED } else { seed },
        }
    }

    pub(crate) fn from_state(state: u64) -> Self {
        Self::new(state)
    }

    pub(crate) fn state(&self) -> u64 {
        self.state
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub(crate) fn next_usize(&mut self) -> usize {
        self.next_u64() as usize
    }

    /// Uniform in [0, 1)
    pub(crate) fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
