//! Virtual table engine
//!
//! [`VectorTable`] owns the committed column indexes and row ledger of one
//! virtual table on one connection, plus the staged transaction. Readers
//! always see committed state. Writes are staged, applied to clones of the
//! touched indexes in `sync`, persisted inside the host transaction and
//! swapped in at `commit`.

use crate::error::{Error, Result};
use crate::index::{ColumnIndex, Neighbor};
use crate::query::{SearchMode, SearchRequest};
use crate::schema::TableSchema;
use crate::shadow;
use crate::staging::{RowVectors, StagedTransaction, TxState};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};

/// Live row ids and the auto row id high-water mark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowLedger {
    rows: BTreeSet<i64>,
    next_rowid: i64,
}

impl RowLedger {
    pub fn new(rows: impl IntoIterator<Item = i64>, next_rowid: i64) -> Self {
        RowLedger {
            rows: rows.into_iter().collect(),
            next_rowid,
        }
    }

    pub fn contains(&self, row_id: i64) -> bool {
        self.rows.contains(&row_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_ids(&self) -> Vec<i64> {
        self.rows.iter().copied().collect()
    }

    pub fn next_rowid(&self) -> i64 {
        self.next_rowid
    }

    pub fn max_rowid(&self) -> Option<i64> {
        self.rows.last().copied()
    }

    /// Ledger after removing `deletes` and adding `inserts`
    fn apply(&self, deletes: &BTreeSet<i64>, inserts: &BTreeSet<i64>, reserved: i64) -> Self {
        let mut rows = self.rows.clone();
        for id in deletes {
            rows.remove(id);
        }
        rows.extend(inserts.iter().copied());
        let above_max = rows.last().map_or(1, |max| max.saturating_add(1));
        RowLedger {
            next_rowid: self.next_rowid.max(reserved).max(above_max),
            rows,
        }
    }
}

/// Index and ledger state written in `sync`, installed in `commit`
#[derive(Debug)]
struct PreparedCommit {
    columns: Vec<(usize, ColumnIndex)>,
    ledger: RowLedger,
    generation: i64,
}

#[derive(Debug)]
pub struct VectorTable {
    schema: TableSchema,
    columns: Vec<ColumnIndex>,
    ledger: RowLedger,
    /// Generation of the committed state held in memory
    generation: i64,
    /// Next auto row id handed out by this connection
    reserved_rowid: i64,
    state: TxState,
    staged: Option<StagedTransaction>,
    prepared: Option<PreparedCommit>,
}

impl VectorTable {
    /// Configure empty indexes and create the shadow tables
    pub fn create(db: &Connection, schema: TableSchema) -> Result<Self> {
        let columns = schema
            .columns
            .iter()
            .map(|c| ColumnIndex::configure(c.dimension, &c.factory, c.metric))
            .collect::<Result<Vec<_>>>()?;

        shadow::create_shadow_tables(db, &schema.schema_name, &schema.table_name)?;
        for (position, (config, index)) in schema.columns.iter().zip(&columns).enumerate() {
            shadow::write_index_blob(
                db,
                &schema.schema_name,
                &schema.table_name,
                position,
                &config.name,
                &index.serialize(),
            )?;
        }

        tracing::info!(
            table = %schema.table_name,
            columns = columns.len(),
            "created vss0 table"
        );
        Ok(VectorTable {
            schema,
            columns,
            ledger: RowLedger::new([], 1),
            generation: 0,
            reserved_rowid: 1,
            state: TxState::Idle,
            staged: None,
            prepared: None,
        })
    }

    /// Load committed state from the shadow tables
    pub fn open(db: &Connection, schema: TableSchema) -> Result<Self> {
        let (columns, ledger, generation) = load_state(db, &schema)?;
        tracing::debug!(
            table = %schema.table_name,
            rows = ledger.len(),
            generation,
            "opened vss0 table"
        );
        Ok(VectorTable {
            reserved_rowid: ledger.next_rowid(),
            schema,
            columns,
            ledger,
            generation,
            state: TxState::Idle,
            staged: None,
            prepared: None,
        })
    }

    /// Drop the shadow tables
    pub fn destroy(&self, db: &Connection) -> Result<()> {
        shadow::drop_shadow_tables(db, &self.schema.schema_name, &self.schema.table_name)
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn column(&self, position: usize) -> Option<&ColumnIndex> {
        self.columns.get(position)
    }

    pub fn ledger(&self) -> &RowLedger {
        &self.ledger
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn staged(&self) -> Option<&StagedTransaction> {
        self.staged.as_ref()
    }

    /// Reload when another connection committed since our last load.
    /// Skipped while this connection has changes in flight.
    pub fn refresh_if_stale(&mut self, db: &Connection) -> Result<bool> {
        let in_flight = match self.state {
            TxState::Idle | TxState::Aborting => false,
            TxState::Active => self.staged.as_ref().is_some_and(|s| !s.is_empty()),
            TxState::Committing => true,
        };
        if in_flight {
            return Ok(false);
        }

        let stored =
            shadow::read_generation(db, &self.schema.schema_name, &self.schema.table_name)?;
        if stored == self.generation {
            return Ok(false);
        }

        let (columns, ledger, generation) = load_state(db, &self.schema)?;
        tracing::debug!(
            table = %self.schema.table_name,
            from = self.generation,
            to = generation,
            "reloaded stale vss0 table"
        );
        self.reserved_rowid = self.reserved_rowid.max(ledger.next_rowid());
        self.columns = columns;
        self.ledger = ledger;
        self.generation = generation;
        Ok(true)
    }

    /// Start a write transaction
    pub fn begin(&mut self, db: &Connection) -> Result<()> {
        match self.state {
            TxState::Idle => {
                self.refresh_if_stale(db)?;
                self.state = TxState::Active;
                self.staged = Some(StagedTransaction::new(self.columns.len()));
                Ok(())
            }
            TxState::Active => Ok(()),
            TxState::Committing | TxState::Aborting => Err(Error::Busy(format!(
                "table '{}' is finishing a transaction",
                self.schema.table_name
            ))),
        }
    }

    fn staged_mut(&mut self) -> Result<&mut StagedTransaction> {
        match self.state {
            TxState::Idle => {
                self.state = TxState::Active;
                self.staged = Some(StagedTransaction::new(self.columns.len()));
            }
            TxState::Active => {}
            TxState::Committing | TxState::Aborting => {
                return Err(Error::InvalidState(
                    "write issued while a commit is in progress".to_string(),
                ));
            }
        }
        let num_columns = self.columns.len();
        Ok(self
            .staged
            .get_or_insert_with(|| StagedTransaction::new(num_columns)))
    }

    /// Whether the row exists for this connection, staged writes included
    pub fn row_visible(&self, row_id: i64) -> bool {
        let committed = self.ledger.contains(row_id);
        match &self.staged {
            Some(staged) => staged.row_visible(row_id, committed),
            None => committed,
        }
    }

    /// Check arity, dimensions and training state of a row
    fn validate_row(&self, vectors: &RowVectors) -> Result<()> {
        if vectors.len() != self.columns.len() {
            return Err(Error::InvalidState(format!(
                "Expected {} vector values, got {}",
                self.columns.len(),
                vectors.len()
            )));
        }
        for (position, vector) in vectors.iter().enumerate() {
            let Some(vector) = vector else { continue };
            let index = &self.columns[position];
            index.check_dimension(vector)?;
            let training_staged = self
                .staged
                .as_ref()
                .is_some_and(|s| s.has_training(position));
            if !index.is_trained() && !training_staged {
                return Err(Error::NotTrained(
                    self.schema.columns[position].name.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Next auto row id: above the high-water mark, every live id and every
    /// staged id
    fn reserve_rowid(&mut self) -> Result<i64> {
        let staged_max = self.staged.as_ref().and_then(|s| s.max_staged_id());
        let mut candidate = self.reserved_rowid.max(self.ledger.next_rowid());
        for max in [self.ledger.max_rowid(), staged_max].into_iter().flatten() {
            let above = max
                .checked_add(1)
                .ok_or_else(|| Error::InvalidState("row id space exhausted".to_string()))?;
            candidate = candidate.max(above);
        }
        self.reserved_rowid = candidate.saturating_add(1);
        Ok(candidate)
    }

    /// Stage a row; returns its row id
    pub fn insert(&mut self, row_id: Option<i64>, vectors: RowVectors) -> Result<i64> {
        self.validate_row(&vectors)?;
        let row_id = match row_id {
            Some(id) => {
                if self.row_visible(id) {
                    return Err(Error::DuplicateId(id));
                }
                id
            }
            None => self.reserve_rowid()?,
        };

        self.staged_mut()?.stage_insert(row_id, vectors);
        tracing::debug!(table = %self.schema.table_name, row_id, "staged insert");
        Ok(row_id)
    }

    /// Stage a delete; absent rows are a no-op
    pub fn delete(&mut self, row_id: i64) -> Result<()> {
        let committed = self.ledger.contains(row_id);
        let changed = self.staged_mut()?.stage_delete(row_id, committed);
        tracing::debug!(table = %self.schema.table_name, row_id, changed, "staged delete");
        Ok(())
    }

    /// Replace a row, possibly under a new row id
    pub fn update(&mut self, old_row_id: i64, new_row_id: i64, vectors: RowVectors) -> Result<()> {
        self.validate_row(&vectors)?;
        if new_row_id != old_row_id && self.row_visible(new_row_id) {
            return Err(Error::DuplicateId(new_row_id));
        }

        let committed = self.ledger.contains(old_row_id);
        let staged = self.staged_mut()?;
        staged.stage_delete(old_row_id, committed);
        staged.stage_insert(new_row_id, vectors);
        tracing::debug!(
            table = %self.schema.table_name,
            old_row_id,
            new_row_id,
            "staged update"
        );
        Ok(())
    }

    /// Stage training vectors; they never become rows
    pub fn insert_training(&mut self, vectors: RowVectors) -> Result<()> {
        if vectors.len() != self.columns.len() {
            return Err(Error::InvalidState(format!(
                "Expected {} vector values, got {}",
                self.columns.len(),
                vectors.len()
            )));
        }
        for (position, vector) in vectors.iter().enumerate() {
            if let Some(vector) = vector {
                self.columns[position].check_dimension(vector)?;
            }
        }

        let limits: Vec<Option<usize>> =
            self.schema.columns.iter().map(|c| c.train_limit).collect();
        let staged = self.staged_mut()?;
        for (position, vector) in vectors.into_iter().enumerate() {
            let Some(vector) = vector else { continue };
            if !staged.stage_training(position, vector, limits[position]) {
                tracing::warn!(
                    column = position,
                    limit = limits[position],
                    "training row dropped, train_limit reached"
                );
            }
        }
        Ok(())
    }

    /// Apply staged changes to index clones and write them to the shadow
    /// tables. Live state is untouched until [`VectorTable::commit`].
    pub fn sync(&mut self, db: &Connection) -> Result<()> {
        if !matches!(self.state, TxState::Active | TxState::Idle) {
            return Err(Error::InvalidState(format!(
                "sync called in state {:?}",
                self.state
            )));
        }
        let staged = match self.staged.as_ref() {
            Some(staged) if !staged.is_empty() => staged,
            _ => {
                self.state = TxState::Committing;
                self.prepared = None;
                return Ok(());
            }
        };

        let schema_name = &self.schema.schema_name;
        let table_name = &self.schema.table_name;

        let stored = shadow::read_generation(db, schema_name, table_name)?;
        if stored != self.generation {
            tracing::warn!(
                table = %table_name,
                loaded = self.generation,
                stored,
                "commit based on a stale generation"
            );
            return Err(Error::Busy(format!(
                "table '{}' was modified by another connection",
                table_name
            )));
        }

        let inserted: BTreeSet<i64> = staged.inserts.keys().copied().collect();
        let mut prepared_columns = Vec::new();
        for position in staged.touched_columns() {
            let mut index = self.columns[position].clone();
            let batch = &staged.training[position];
            if !batch.is_empty() {
                index.train(batch)?;
                tracing::debug!(
                    table = %table_name,
                    column = position,
                    vectors = batch.len(),
                    "trained column index"
                );
            }
            for &row_id in &staged.deletes {
                index.remove(row_id);
            }
            for (&row_id, vectors) in &staged.inserts {
                if let Some(vector) = &vectors[position] {
                    index.add(row_id, vector)?;
                }
            }
            prepared_columns.push((position, index));
        }

        let ledger = self
            .ledger
            .apply(&staged.deletes, &inserted, self.reserved_rowid);
        let generation = self.generation + 1;

        for (position, index) in &prepared_columns {
            shadow::write_index_blob(
                db,
                schema_name,
                table_name,
                *position,
                &self.schema.columns[*position].name,
                &index.serialize(),
            )?;
        }
        let removed: BTreeSet<i64> = staged.deletes.difference(&inserted).copied().collect();
        shadow::update_rowids(db, schema_name, table_name, &removed, &inserted)?;
        shadow::write_meta(db, schema_name, table_name, generation, ledger.next_rowid())?;

        tracing::info!(
            table = %table_name,
            inserts = staged.inserts.len(),
            deletes = staged.deletes.len(),
            columns = prepared_columns.len(),
            generation,
            "wrote vss0 commit"
        );
        self.prepared = Some(PreparedCommit {
            columns: prepared_columns,
            ledger,
            generation,
        });
        self.state = TxState::Committing;
        Ok(())
    }

    /// Install the state prepared by [`VectorTable::sync`]
    pub fn commit(&mut self) -> Result<()> {
        if let Some(prepared) = self.prepared.take() {
            for (position, index) in prepared.columns {
                self.columns[position] = index;
            }
            self.ledger = prepared.ledger;
            self.generation = prepared.generation;
            self.reserved_rowid = self.reserved_rowid.max(self.ledger.next_rowid());
        }
        self.staged = None;
        self.state = TxState::Idle;
        Ok(())
    }

    /// Discard staged and prepared changes
    pub fn rollback(&mut self) -> Result<()> {
        self.state = TxState::Aborting;
        let discarded = self
            .staged
            .take()
            .map_or(0, |s| s.inserts.len() + s.deletes.len());
        self.prepared = None;
        tracing::debug!(table = %self.schema.table_name, discarded, "rolled back vss0 transaction");
        self.state = TxState::Idle;
        Ok(())
    }

    /// Run a search against committed state
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<Neighbor>> {
        let index = self.columns.get(request.column).ok_or_else(|| {
            Error::Usage(format!("Column {} is not a vector column", request.column))
        })?;
        match request.mode {
            SearchMode::Knn { k } => {
                let k = k.min(index.len());
                if k == 0 {
                    return Ok(Vec::new());
                }
                index.search(&request.query, k, &request.params)
            }
            SearchMode::Range { radius } => {
                index.range_search(&request.query, radius, &request.params)
            }
        }
    }

    /// Committed vector of a row, if the column stores one readable
    pub fn column_vector(&self, position: usize, row_id: i64) -> Option<Vec<f32>> {
        self.columns.get(position)?.reconstruct(row_id)
    }

    /// Row ids this connection sees: committed rows minus staged deletes,
    /// plus staged inserts, in ascending order
    pub fn visible_row_ids(&self) -> Vec<i64> {
        let Some(staged) = &self.staged else {
            return self.ledger.row_ids();
        };
        let mut rows: BTreeSet<i64> = self
            .ledger
            .rows
            .iter()
            .copied()
            .filter(|id| !staged.deletes.contains(id))
            .collect();
        rows.extend(staged.inserts.keys().copied());
        rows.into_iter().collect()
    }

    /// Vector of a row as this connection sees it
    pub fn visible_vector(&self, position: usize, row_id: i64) -> Option<Vec<f32>> {
        if let Some(staged) = &self.staged {
            if let Some(vectors) = staged.inserts.get(&row_id) {
                return vectors.get(position)?.clone();
            }
            if staged.deletes.contains(&row_id) {
                return None;
            }
        }
        self.column_vector(position, row_id)
    }
}

/// Deserialize every column and the ledger
fn load_state(db: &Connection, schema: &TableSchema) -> Result<(Vec<ColumnIndex>, RowLedger, i64)> {
    let meta = shadow::read_meta(db, &schema.schema_name, &schema.table_name)?;

    let mut blobs: BTreeMap<usize, shadow::StoredIndex> =
        shadow::read_index_blobs(db, &schema.schema_name, &schema.table_name)?
            .into_iter()
            .map(|stored| (stored.position, stored))
            .collect();

    let mut columns = Vec::with_capacity(schema.columns.len());
    for (position, config) in schema.columns.iter().enumerate() {
        let stored = blobs
            .remove(&position)
            .ok_or_else(|| Error::Corrupt(format!("Missing index for column '{}'", config.name)))?;
        if stored.column_name != config.name {
            return Err(Error::Corrupt(format!(
                "Index at position {} belongs to '{}', expected '{}'",
                position, stored.column_name, config.name
            )));
        }
        let index = ColumnIndex::deserialize(&stored.blob)?;
        if index.dimension() != config.dimension || index.metric() != config.metric {
            return Err(Error::Corrupt(format!(
                "Stored index for '{}' does not match its declaration",
                config.name
            )));
        }
        columns.push(index);
    }

    let rows = shadow::get_all_rowids(db, &schema.schema_name, &schema.table_name)?;
    let ledger = RowLedger::new(rows, meta.next_rowid);
    Ok((columns, ledger, meta.generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SearchParams;

    fn schema(cols: &[&str]) -> TableSchema {
        let mut args = vec!["vss0", "main", "items"];
        args.extend_from_slice(cols);
        TableSchema::parse(&args).unwrap()
    }

    fn knn(column: usize, query: Vec<f32>, k: usize) -> SearchRequest {
        SearchRequest {
            column,
            query,
            mode: SearchMode::Knn { k },
            params: SearchParams::default(),
        }
    }

    fn commit(table: &mut VectorTable, db: &Connection) {
        table.sync(db).unwrap();
        table.commit().unwrap();
    }

    fn unit_rows(table: &mut VectorTable) {
        table
            .insert(Some(1), vec![Some(vec![1.0, 0.0, 0.0])])
            .unwrap();
        table
            .insert(Some(2), vec![Some(vec![0.0, 1.0, 0.0])])
            .unwrap();
        table
            .insert(Some(3), vec![Some(vec![0.0, 0.0, 1.0])])
            .unwrap();
    }

    #[test]
    fn test_three_row_scenario() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v float[3]"])).unwrap();
        table.begin(&db).unwrap();
        unit_rows(&mut table);

        // Searches do not see staged rows yet
        assert!(
            table
                .search(&knn(0, vec![1.0, 0.0, 0.0], 2))
                .unwrap()
                .is_empty()
        );

        commit(&mut table, &db);
        let hits = table.search(&knn(0, vec![1.0, 0.0, 0.0], 2)).unwrap();
        assert_eq!(hits[0], (1, 0.0));
        assert_eq!(hits[1].0, 2);
        assert_eq!(table.ledger().row_ids(), vec![1, 2, 3]);
        assert_eq!(table.generation(), 1);
    }

    #[test]
    fn test_reopen_restores_state() {
        let db = Connection::open_in_memory().unwrap();
        let s = schema(&["v float[3]"]);
        let mut table = VectorTable::create(&db, s.clone()).unwrap();
        table.begin(&db).unwrap();
        unit_rows(&mut table);
        commit(&mut table, &db);

        let reopened = VectorTable::open(&db, s).unwrap();
        assert_eq!(reopened.ledger(), table.ledger());
        assert_eq!(reopened.generation(), 1);
        assert_eq!(
            reopened.search(&knn(0, vec![0.0, 0.0, 1.0], 3)).unwrap(),
            table.search(&knn(0, vec![0.0, 0.0, 1.0], 3)).unwrap()
        );
    }

    #[test]
    fn test_rollback_discards() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v float[3]"])).unwrap();
        table.begin(&db).unwrap();
        unit_rows(&mut table);
        table.rollback().unwrap();
        assert_eq!(table.state(), TxState::Idle);
        assert!(table.staged().is_none());

        table.begin(&db).unwrap();
        commit(&mut table, &db);
        assert!(table.ledger().is_empty());
        assert_eq!(table.generation(), 0, "empty commit writes nothing");
    }

    #[test]
    fn test_insert_validation() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v float[3]"])).unwrap();
        table.begin(&db).unwrap();
        unit_rows(&mut table);
        assert!(matches!(
            table.insert(Some(9), vec![Some(vec![1.0])]),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
        assert!(matches!(
            table.insert(Some(2), vec![Some(vec![1.0, 1.0, 1.0])]),
            Err(Error::DuplicateId(2))
        ));
        assert!(matches!(
            table.insert(Some(4), vec![]),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(table.staged().unwrap().inserts.len(), 3);
    }

    #[test]
    fn test_auto_rowids() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v(1)"])).unwrap();
        table.begin(&db).unwrap();
        assert_eq!(table.insert(None, vec![Some(vec![0.0])]).unwrap(), 1);
        assert_eq!(table.insert(Some(10), vec![Some(vec![1.0])]).unwrap(), 10);
        assert_eq!(table.insert(None, vec![Some(vec![2.0])]).unwrap(), 11);
        commit(&mut table, &db);
        assert_eq!(table.ledger().next_rowid(), 12);

        table.begin(&db).unwrap();
        table.delete(11).unwrap();
        assert_eq!(table.insert(None, vec![None]).unwrap(), 12);
        commit(&mut table, &db);
        assert_eq!(table.ledger().row_ids(), vec![1, 10, 12]);
    }

    #[test]
    fn test_delete_and_reinsert_same_id() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v(2)"])).unwrap();
        table.begin(&db).unwrap();
        table.insert(Some(1), vec![Some(vec![0.0, 0.0])]).unwrap();
        commit(&mut table, &db);

        table.begin(&db).unwrap();
        table.delete(1).unwrap();
        table.insert(Some(1), vec![Some(vec![5.0, 5.0])]).unwrap();
        commit(&mut table, &db);

        assert_eq!(table.column_vector(0, 1), Some(vec![5.0, 5.0]));
        assert_eq!(table.ledger().row_ids(), vec![1]);
    }

    #[test]
    fn test_staged_rows_visible_to_writer() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v(2)"])).unwrap();
        table.begin(&db).unwrap();
        table.insert(Some(1), vec![Some(vec![0.0, 0.0])]).unwrap();
        table.insert(Some(2), vec![Some(vec![1.0, 1.0])]).unwrap();
        commit(&mut table, &db);

        table.begin(&db).unwrap();
        table.insert(Some(5), vec![Some(vec![5.0, 5.0])]).unwrap();
        table.delete(1).unwrap();
        assert_eq!(table.visible_row_ids(), vec![2, 5]);
        assert!(table.row_visible(5));
        assert!(!table.row_visible(1));
        assert_eq!(table.visible_vector(0, 5), Some(vec![5.0, 5.0]));
        assert_eq!(table.visible_vector(0, 1), None);
        assert_eq!(table.visible_vector(0, 2), Some(vec![1.0, 1.0]));
        // Committed state is untouched until commit
        assert_eq!(table.ledger().row_ids(), vec![1, 2]);
        assert_eq!(table.column_vector(0, 1), Some(vec![0.0, 0.0]));

        // Deleting the staged row cancels its insert
        table.delete(5).unwrap();
        assert_eq!(table.visible_row_ids(), vec![2]);
        table.insert(Some(1), vec![Some(vec![9.0, 9.0])]).unwrap();
        assert_eq!(table.visible_vector(0, 1), Some(vec![9.0, 9.0]));
        commit(&mut table, &db);

        assert_eq!(table.ledger().row_ids(), vec![1, 2]);
        assert_eq!(table.visible_row_ids(), vec![1, 2]);
        assert_eq!(table.column_vector(0, 1), Some(vec![9.0, 9.0]));
    }

    #[test]
    fn test_update_moves_row() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v(2)"])).unwrap();
        table.begin(&db).unwrap();
        table.insert(Some(1), vec![Some(vec![0.0, 0.0])]).unwrap();
        table.insert(Some(2), vec![Some(vec![1.0, 1.0])]).unwrap();
        commit(&mut table, &db);

        table.begin(&db).unwrap();
        assert!(matches!(
            table.update(1, 2, vec![Some(vec![3.0, 3.0])]),
            Err(Error::DuplicateId(2))
        ));
        table.update(1, 7, vec![Some(vec![3.0, 3.0])]).unwrap();
        commit(&mut table, &db);
        assert_eq!(table.ledger().row_ids(), vec![2, 7]);
        assert_eq!(table.column_vector(0, 7), Some(vec![3.0, 3.0]));
        assert_eq!(table.column_vector(0, 1), None);
    }

    #[test]
    fn test_training_flow() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&[r#"v(2) factory="IVF4,Flat""#])).unwrap();
        table.begin(&db).unwrap();
        assert!(matches!(
            table.insert(Some(1), vec![Some(vec![0.0, 0.0])]),
            Err(Error::NotTrained(_))
        ));

        for i in 0..3 {
            table
                .insert_training(vec![Some(vec![i as f32, 0.0])])
                .unwrap();
        }
        // A staged training batch satisfies the check at insert time
        table.insert(Some(1), vec![Some(vec![0.0, 0.0])]).unwrap();
        assert!(matches!(
            table.sync(&db),
            Err(Error::InsufficientTrainingData {
                required: 4,
                provided: 3
            })
        ));
        table.rollback().unwrap();
        assert!(table.ledger().is_empty());
        assert!(!table.column(0).unwrap().is_trained());

        table.begin(&db).unwrap();
        for i in 0..8 {
            table
                .insert_training(vec![Some(vec![i as f32, (i % 2) as f32])])
                .unwrap();
        }
        table.insert(Some(1), vec![Some(vec![0.0, 0.0])]).unwrap();
        commit(&mut table, &db);
        assert!(table.column(0).unwrap().is_trained());
        assert_eq!(table.ledger().row_ids(), vec![1]);
    }

    #[test]
    fn test_train_limit_caps_batch() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v(1) train_limit=2"])).unwrap();
        table.begin(&db).unwrap();
        for i in 0..5 {
            table.insert_training(vec![Some(vec![i as f32])]).unwrap();
        }
        assert_eq!(table.staged().unwrap().training[0].len(), 2);
    }

    #[test]
    fn test_stale_generation_reload_and_busy() {
        let db = Connection::open_in_memory().unwrap();
        let s = schema(&["v(1)"]);
        let mut first = VectorTable::create(&db, s.clone()).unwrap();
        let mut second = VectorTable::open(&db, s).unwrap();

        first.begin(&db).unwrap();
        first.insert(Some(1), vec![Some(vec![1.0])]).unwrap();
        commit(&mut first, &db);

        // Idle connection reloads on begin
        second.begin(&db).unwrap();
        assert_eq!(second.ledger().row_ids(), vec![1]);
        second.insert(Some(2), vec![Some(vec![2.0])]).unwrap();

        // Another commit lands while `second` has staged changes
        first.begin(&db).unwrap();
        first.insert(Some(3), vec![Some(vec![3.0])]).unwrap();
        commit(&mut first, &db);

        assert!(matches!(second.sync(&db), Err(Error::Busy(_))));
        second.rollback().unwrap();
        assert!(second.refresh_if_stale(&db).unwrap());
        assert_eq!(second.ledger().row_ids(), vec![1, 3]);
    }

    #[test]
    fn test_range_search_through_table() {
        let db = Connection::open_in_memory().unwrap();
        let mut table = VectorTable::create(&db, schema(&["v float[3]"])).unwrap();
        table.begin(&db).unwrap();
        unit_rows(&mut table);
        commit(&mut table, &db);

        let hits = table
            .search(&SearchRequest {
                column: 0,
                query: vec![1.0, 0.0, 0.0],
                mode: SearchMode::Range { radius: 1.5 },
                params: SearchParams::default(),
            })
            .unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
