//! HNSW insert algorithm implementation

use super::{HnswIndex, HnswNode};
use crate::distance;
use crate::index::ivf::XorShiftRng;

/// Generate a random level for a new node
///
/// Uses exponential decay: level = floor(-ln(uniform_random()) * level_factor)
fn generate_level(rng: &mut XorShiftRng, level_factor: f64, max_level: usize) -> usize {
    // (0, 1], avoids log(0)
    let random_val = 1.0 - rng.next_f64();
    let level = (-random_val.ln() * level_factor).floor() as usize;
    level.min(max_level.saturating_sub(1))
}

impl HnswIndex {
    /// Choose up to `max_connections` links from `candidates`, scored by
    /// distance to the base node.
    ///
    /// A candidate is taken when it is closer to the base than to every link
    /// already taken, so links spread across directions and outliers keep an
    /// edge. Remaining slots are filled with the closest skipped candidates.
    fn select_neighbors(
        &self,
        candidates: &[(u32, f32)],
        max_connections: usize,
    ) -> Vec<(u32, f32)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut selected: Vec<(u32, f32)> = Vec::with_capacity(max_connections);
        let mut skipped = Vec::new();
        for (node, dist) in sorted {
            if selected.len() >= max_connections {
                break;
            }
            let vector = &self.node(node).vector;
            let diverse = selected.iter().all(|&(kept, _)| {
                distance::distance(vector, &self.node(kept).vector, self.metric) > dist
            });
            if diverse {
                selected.push((node, dist));
            } else {
                skipped.push((node, dist));
            }
        }

        let room = max_connections - selected.len();
        selected.extend(skipped.into_iter().take(room));
        selected
    }

    /// Insert a vector into the graph
    ///
    /// # Algorithm
    /// 1. Generate random level for new node
    /// 2. If first node, set as entry point
    /// 3. Otherwise, greedy-descend to the node's top level, then find
    ///    ef_construction candidates at each level down to 0
    /// 4. Create bidirectional edges, pruning neighbors that overflow
    /// 5. Update entry point if new node has higher level
    pub(super) fn insert(&mut self, id: i64, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimension);
        let level = generate_level(
            &mut self.rng,
            self.params.level_factor,
            self.params.max_level,
        );
        let idx = self.nodes.len() as u32;
        self.nodes.push(HnswNode {
            id,
            level,
            vector: vector.to_vec(),
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.id_to_node.insert(id, idx);

        // Handle first node case
        let Some(entry) = self.entry_point else {
            self.entry_point = Some(idx);
            self.entry_level = level;
            return;
        };

        // Traverse from top level down to insertion level + 1 (greedy search)
        let mut current_nearest = entry;
        for lv in (level + 1..=self.entry_level).rev() {
            current_nearest = self.greedy_closest(vector, current_nearest, lv);
        }

        for lv in (0..=level.min(self.entry_level)).rev() {
            let candidates: Vec<(u32, f32)> = self
                .search_layer(vector, current_nearest, self.params.ef_construction, lv)
                .into_iter()
                .filter(|&(node, _)| node != idx)
                .collect();
            let max_connections = self.params.max_connections(lv);
            let pruned = self.select_neighbors(&candidates, max_connections);

            self.nodes[idx as usize].neighbors[lv] = pruned.iter().map(|&(n, _)| n).collect();
            for &(neighbor, _) in &pruned {
                self.link(neighbor, idx, lv);
            }

            // Update current_nearest for next level
            if let Some(&(nearest, _)) = candidates.first() {
                current_nearest = nearest;
            }
        }

        // Update entry point if new node has higher level
        if level > self.entry_level {
            self.entry_point = Some(idx);
            self.entry_level = level;
        }
    }

    /// Add `to` to `from`'s links, reselecting them on overflow
    fn link(&mut self, from: u32, to: u32, level: usize) {
        let max_connections = self.params.max_connections(level);
        let links = &mut self.nodes[from as usize].neighbors[level];
        links.push(to);
        if links.len() <= max_connections {
            return;
        }

        let origin = &self.nodes[from as usize];
        let scored: Vec<(u32, f32)> = origin.neighbors[level]
            .iter()
            .map(|&n| {
                (
                    n,
                    distance::distance(&origin.vector, &self.nodes[n as usize].vector, self.metric),
                )
            })
            .collect();
        let kept = self.select_neighbors(&scored, max_connections);
        self.nodes[from as usize].neighbors[level] = kept.into_iter().map(|(n, _)| n).collect();
    }

    /// Rebuild the graph from live nodes, dropping tombstones
    pub(super) fn rebuild(&mut self) {
        let live: Vec<(i64, Vec<f32>)> = std::mem::take(&mut self.nodes)
            .into_iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.vector))
            .collect();

        self.id_to_node.clear();
        self.entry_point = None;
        self.entry_level = 0;
        self.tombstones = 0;

        for (id, vector) in live {
            self.insert(id, &vector);
        }
    }
}
