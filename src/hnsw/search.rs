//! HNSW search algorithm implementation

use super::HnswIndex;
use crate::distance;
use crate::index::{Neighbor, top_k};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Candidate for exploration - min-heap ordering (closest first)
#[derive(Debug, Clone, Copy)]
struct MinCandidate {
    node: u32,
    distance: f32,
}

impl PartialEq for MinCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MinCandidate {}

impl PartialOrd for MinCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MinCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (closest first when popped)
        other
            .distance
            .total_cmp(&self.distance)
            .then(other.node.cmp(&self.node))
    }
}

/// Result candidate - max-heap ordering (farthest first)
#[derive(Debug, Clone, Copy)]
struct MaxCandidate {
    node: u32,
    distance: f32,
}

impl PartialEq for MaxCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MaxCandidate {}

impl PartialOrd for MaxCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MaxCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Normal ordering for max-heap (farthest first when peeked/popped)
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

impl HnswIndex {
    pub(super) fn distance_to(&self, query: &[f32], node: u32) -> f32 {
        distance::distance(query, &self.node(node).vector, self.metric)
    }

    /// k nearest live neighbors
    pub(super) fn knn(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<Neighbor> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let ef = ef_search.max(k);

        // Greedy search from top level down to level 1
        let mut current_nearest = entry;
        for level in (1..=self.entry_level).rev() {
            current_nearest = self.greedy_closest(query, current_nearest, level);
        }

        // Search at level 0 with full ef_search
        let results = self.search_layer(query, current_nearest, ef, 0);
        let live = results.into_iter().filter_map(|(node, dist)| {
            let node = self.node(node);
            (!node.deleted).then_some((node.id, dist))
        });
        let hits = top_k(live, k);
        if hits.len() >= k.min(self.id_to_node.len()) {
            return hits;
        }

        // Graph walk came up short; fall back to an exact scan
        tracing::debug!(found = hits.len(), k, "HNSW walk incomplete, scanning");
        self.exhaustive_knn(query, k)
    }

    /// Exact k nearest live neighbors
    fn exhaustive_knn(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let live = self.nodes.iter().filter(|node| !node.deleted).map(|node| {
            (
                node.id,
                distance::distance(query, &node.vector, self.metric),
            )
        });
        top_k(live, k)
    }

    /// Walk to the closest node at one level, ef=1
    pub(super) fn greedy_closest(&self, query: &[f32], start: u32, level: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance_to(query, current);
        let mut changed = true;

        while changed {
            changed = false;
            let Some(links) = self.node(current).neighbors.get(level) else {
                break;
            };
            for &neighbor in links {
                let d = self.distance_to(query, neighbor);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    changed = true;
                }
            }
        }
        current
    }

    /// Search a single layer for nearest neighbors
    ///
    /// Returns up to `ef` (node, distance) pairs sorted ascending. Tombstoned
    /// nodes are included; callers filter them when producing results.
    pub(super) fn search_layer(
        &self,
        query: &[f32],
        entry: u32,
        ef: usize,
        level: usize,
    ) -> Vec<(u32, f32)> {
        let mut visited = HashSet::new();
        // candidates: min-heap - we explore closest candidates first
        let mut candidates: BinaryHeap<MinCandidate> = BinaryHeap::new();
        // results: max-heap - peek() gives us the worst (farthest) result for termination check
        let mut results: BinaryHeap<MaxCandidate> = BinaryHeap::new();

        let entry_dist = self.distance_to(query, entry);
        candidates.push(MinCandidate {
            node: entry,
            distance: entry_dist,
        });
        results.push(MaxCandidate {
            node: entry,
            distance: entry_dist,
        });
        visited.insert(entry);

        while let Some(candidate) = candidates.pop() {
            // If closest unexplored candidate is farther than our worst result, we're done
            if let Some(worst) = results.peek()
                && candidate.distance > worst.distance
            {
                break;
            }

            let Some(links) = self.node(candidate.node).neighbors.get(level) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let neighbor_dist = self.distance_to(query, neighbor);

                let has_room = results.len() < ef;
                let improves = results.peek().is_some_and(|w| neighbor_dist < w.distance);
                if has_room || improves {
                    candidates.push(MinCandidate {
                        node: neighbor,
                        distance: neighbor_dist,
                    });
                    results.push(MaxCandidate {
                        node: neighbor,
                        distance: neighbor_dist,
                    });

                    // Trim results to ef (removes farthest)
                    while results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        // Ascending via into_sorted_vec on the max-heap ordering
        results
            .into_sorted_vec()
            .into_iter()
            .map(|c| (c.node, c.distance))
            .collect()
    }
}
