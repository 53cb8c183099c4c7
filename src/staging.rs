//! Write-transaction staging
//!
//! Mutations issued inside a transaction are recorded here and only applied
//! to the column indexes when the transaction commits.

use std::collections::{BTreeMap, BTreeSet};

/// Transaction state of one virtual table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    Idle,
    Active,
    /// Changes prepared and written, waiting for `xCommit`
    Committing,
    Aborting,
}

/// Per-column vectors of one staged row; `None` where the column is NULL
pub type RowVectors = Vec<Option<Vec<f32>>>;

#[derive(Debug, Clone, Default)]
pub struct StagedTransaction {
    /// Row id -> vectors, in row id order
    pub inserts: BTreeMap<i64, RowVectors>,
    /// Committed row ids to remove
    pub deletes: BTreeSet<i64>,
    /// Training batch per column
    pub training: Vec<Vec<Vec<f32>>>,
}

impl StagedTransaction {
    pub fn new(num_columns: usize) -> Self {
        StagedTransaction {
            inserts: BTreeMap::new(),
            deletes: BTreeSet::new(),
            training: vec![Vec::new(); num_columns],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.deletes.is_empty()
            && self.training.iter().all(Vec::is_empty)
    }

    pub fn stage_insert(&mut self, row_id: i64, vectors: RowVectors) {
        self.inserts.insert(row_id, vectors);
    }

    /// Cancel a staged insert of the row and, if it is committed, stage its
    /// removal. Returns whether anything changed.
    pub fn stage_delete(&mut self, row_id: i64, committed: bool) -> bool {
        let cancelled = self.inserts.remove(&row_id).is_some();
        let staged = committed && self.deletes.insert(row_id);
        cancelled || staged
    }

    /// Append a training vector, honoring the column's row cap.
    /// Returns false when the vector was dropped.
    pub fn stage_training(
        &mut self,
        column: usize,
        vector: Vec<f32>,
        limit: Option<usize>,
    ) -> bool {
        let batch = &mut self.training[column];
        if limit.is_some_and(|l| batch.len() >= l) {
            return false;
        }
        batch.push(vector);
        true
    }

    pub fn has_training(&self, column: usize) -> bool {
        !self.training[column].is_empty()
    }

    /// Whether the row exists once this transaction applies
    pub fn row_visible(&self, row_id: i64, committed: bool) -> bool {
        self.inserts.contains_key(&row_id) || (committed && !self.deletes.contains(&row_id))
    }

    /// Largest row id staged for insertion
    pub fn max_staged_id(&self) -> Option<i64> {
        self.inserts.keys().next_back().copied()
    }

    /// Columns whose index changes when this transaction applies
    pub fn touched_columns(&self) -> BTreeSet<usize> {
        let mut touched = BTreeSet::new();
        for (column, batch) in self.training.iter().enumerate() {
            if !batch.is_empty() {
                touched.insert(column);
            }
        }
        for vectors in self.inserts.values() {
            for (column, vector) in vectors.iter().enumerate() {
                if vector.is_some() {
                    touched.insert(column);
                }
            }
        }
        // Deletes can touch any column holding the row
        if !self.deletes.is_empty() {
            touched.extend(0..self.training.len());
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_cancels_staged_insert() {
        let mut staged = StagedTransaction::new(1);
        staged.stage_insert(5, vec![Some(vec![1.0])]);
        assert!(staged.stage_delete(5, false));
        assert!(staged.inserts.is_empty());
        assert!(staged.deletes.is_empty());
        assert!(staged.is_empty());
    }

    #[test]
    fn test_delete_then_reinsert_committed_row() {
        let mut staged = StagedTransaction::new(1);
        assert!(staged.stage_delete(3, true));
        assert!(!staged.row_visible(3, true));
        staged.stage_insert(3, vec![Some(vec![2.0])]);
        assert!(staged.row_visible(3, true));
        assert!(staged.deletes.contains(&3));
    }

    #[test]
    fn test_delete_unknown_row_is_noop() {
        let mut staged = StagedTransaction::new(2);
        assert!(!staged.stage_delete(9, false));
        assert!(staged.is_empty());
    }

    #[test]
    fn test_training_limit() {
        let mut staged = StagedTransaction::new(2);
        assert!(staged.stage_training(1, vec![0.0], Some(2)));
        assert!(staged.stage_training(1, vec![1.0], Some(2)));
        assert!(!staged.stage_training(1, vec![2.0], Some(2)));
        assert_eq!(staged.training[1].len(), 2);
        assert!(!staged.has_training(0));
        assert!(staged.has_training(1));
    }

    #[test]
    fn test_touched_columns() {
        let mut staged = StagedTransaction::new(3);
        staged.stage_insert(1, vec![None, Some(vec![1.0]), None]);
        staged.stage_training(2, vec![0.0], None);
        assert_eq!(
            staged.touched_columns().into_iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        staged.stage_delete(7, true);
        assert_eq!(staged.touched_columns().len(), 3);
        assert_eq!(staged.max_staged_id(), Some(1));
    }
}
