//! Exhaustive flat index

use super::codec::{ByteReader, ByteWriter};
use super::{IndexBackend, Neighbor, SearchParams, sort_neighbors, top_k};
use crate::distance::{DistanceMetric, distance};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Brute-force index: every search scans all stored vectors, results are exact
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    ids: Vec<i64>,
    /// Contiguous arena, `ids.len() * dimension` floats
    data: Vec<f32>,
    positions: HashMap<i64, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        FlatIndex {
            dimension,
            metric,
            ids: Vec::new(),
            data: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn slot(&self, pos: usize) -> &[f32] {
        &self.data[pos * self.dimension..(pos + 1) * self.dimension]
    }

    fn scan<'a>(&'a self, query: &'a [f32]) -> impl Iterator<Item = Neighbor> + 'a {
        self.ids
            .iter()
            .enumerate()
            .map(move |(pos, &id)| (id, distance(self.slot(pos), query, self.metric)))
    }

    pub fn read_payload(
        r: &mut ByteReader<'_>,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Self> {
        let mut index = FlatIndex::new(dimension, metric);
        let count = r.get_len()?;
        for _ in 0..count {
            let id = r.get_i64()?;
            let vector = r.get_f32_vec(dimension)?;
            if index.positions.contains_key(&id) {
                return Err(Error::Corrupt(format!("Duplicate id {} in flat index", id)));
            }
            index.add(id, &vector);
        }
        Ok(index)
    }
}

impl IndexBackend for FlatIndex {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn train(&mut self, _vectors: &[Vec<f32>]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, id: i64, vector: &[f32]) {
        self.positions.insert(id, self.ids.len());
        self.ids.push(id);
        self.data.extend_from_slice(vector);
    }

    fn remove(&mut self, id: i64) -> bool {
        let Some(pos) = self.positions.remove(&id) else {
            return false;
        };

        let last = self.ids.len() - 1;
        if pos != last {
            // Move the last slot into the hole
            let moved_id = self.ids[last];
            self.ids[pos] = moved_id;
            let (head, tail) = self.data.split_at_mut(last * self.dimension);
            head[pos * self.dimension..(pos + 1) * self.dimension]
                .copy_from_slice(&tail[..self.dimension]);
            self.positions.insert(moved_id, pos);
        }
        self.ids.truncate(last);
        self.data.truncate(last * self.dimension);
        true
    }

    fn contains(&self, id: i64) -> bool {
        self.positions.contains_key(&id)
    }

    fn vector(&self, id: i64) -> Option<Vec<f32>> {
        self.positions.get(&id).map(|&pos| self.slot(pos).to_vec())
    }

    fn search(&self, query: &[f32], k: usize, _params: &SearchParams) -> Vec<Neighbor> {
        top_k(self.scan(query), k)
    }

    fn range_search(&self, query: &[f32], radius: f32, _params: &SearchParams) -> Vec<Neighbor> {
        let mut hits: Vec<Neighbor> = self.scan(query).filter(|&(_, d)| d <= radius).collect();
        sort_neighbors(&mut hits);
        hits
    }

    fn write_payload(&self, w: &mut ByteWriter) {
        w.put_len(self.ids.len());
        for (pos, &id) in self.ids.iter().enumerate() {
            w.put_i64(id);
            w.put_f32_slice(self.slot(pos));
        }
    }

    fn clone_box(&self) -> Box<dyn IndexBackend> {
        Box::new(self.clone())
    }
}
