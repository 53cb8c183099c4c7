//! Virtual table implementation for vss0

use crate::error::{Error, Result};
use crate::query::{
    ConstraintOp, PlanConstraint, QueryPlan, ResultCursor, SearchRequest, parse_idxstr, plan_query,
};
use crate::schema::{DISTANCE_OFFSET, OPERATION_OFFSET, TableSchema};
use crate::staging::RowVectors;
use crate::table::VectorTable;
use crate::vector;
use rusqlite::types::{Null, Value, ValueRef};
use rusqlite::vtab::{
    Context, CreateVTab, Filters, IndexConstraintOp, IndexInfo, Inserts, TransactionVTab,
    UpdateVTab, Updates, VTab, VTabConnection, VTabCursor, VTabKind, Values, sqlite3_vtab,
    sqlite3_vtab_cursor,
};
use rusqlite::{Connection, ffi};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::os::raw::c_int;

/// Module name used in `CREATE VIRTUAL TABLE ... USING vss0(...)`
pub const MODULE_NAME: &str = "vss0";

/// Value of the `operation` column that marks a training row
pub const TRAINING_OPERATION: &str = "training";

/// Register the vss0 virtual table module
pub fn register_vss0_module(db: &Connection) -> Result<()> {
    // update_module_with_tx: writes plus xBegin/xSync/xCommit/xRollback
    let module = rusqlite::vtab::update_module_with_tx::<VssTab>();
    db.create_module(MODULE_NAME, module, None)
        .map_err(Error::Sqlite)?;
    Ok(())
}

/// vss0 virtual table structure
#[repr(C)]
pub struct VssTab {
    base: sqlite3_vtab,
    db: *mut ffi::sqlite3, // Raw database handle for shadow table access
    table: RefCell<VectorTable>,
}

impl VssTab {
    fn parse_args(args: &[&[u8]]) -> Result<TableSchema> {
        let args_str = args
            .iter()
            .map(|arg| {
                std::str::from_utf8(arg)
                    .map_err(|e| Error::InvalidConfig(format!("Invalid UTF-8 argument: {}", e)))
            })
            .collect::<Result<Vec<&str>>>()?;
        TableSchema::parse(&args_str)
    }

    /// Non-owning connection over the table's database handle
    fn connection(&self) -> rusqlite::Result<Connection> {
        // SAFETY: self.db is the connection that owns this virtual table and
        // outlives it; from_handle does not close it on drop
        unsafe { Connection::from_handle(self.db) }
    }

    fn num_vector_columns(&self) -> usize {
        self.table.borrow().schema().num_vector_columns()
    }

    /// Vector values of a row from xUpdate arguments (args[2..])
    fn row_vectors(&self, args: &Values<'_>) -> rusqlite::Result<RowVectors> {
        let n = self.num_vector_columns();
        let mut vectors = Vec::with_capacity(n);
        for col in 0..n {
            let value: Value = args.get(col + 2)?;
            vectors.push(vector::from_value(ValueRef::from(&value))?);
        }
        Ok(vectors)
    }

    fn operation(&self, args: &Values<'_>) -> rusqlite::Result<Option<String>> {
        let idx = 2 + self.table.borrow().schema().hidden_column(OPERATION_OFFSET);
        if idx >= args.len() {
            return Ok(None);
        }
        args.get::<Option<String>>(idx)
    }
}

unsafe impl<'vtab> VTab<'vtab> for VssTab {
    type Aux = ();
    type Cursor = VssTabCursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        _aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let schema = Self::parse_args(args)?;
        let sql = schema.declare_sql();

        // SAFETY: Store the database handle for later operations
        let db_handle = unsafe { db.handle() };
        let conn = unsafe { Connection::from_handle(db_handle) }?;
        let table = VectorTable::open(&conn, schema)?;

        Ok((
            sql,
            VssTab {
                base: sqlite3_vtab::default(),
                db: db_handle,
                table: RefCell::new(table),
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let constraints: Vec<PlanConstraint> = info
            .constraints()
            .map(|c| PlanConstraint {
                column: c.column(),
                op: match c.operator() {
                    IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => ConstraintOp::Eq,
                    IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_MATCH => ConstraintOp::Match,
                    _ => ConstraintOp::Other,
                },
                usable: c.is_usable(),
            })
            .collect();
        let order_by: Vec<(i32, bool)> = info
            .order_bys()
            .map(|o| (o.column(), o.is_order_by_desc()))
            .collect();

        let Some(plan) = plan_query(&constraints, &order_by, self.num_vector_columns()) else {
            // Unusable join order: the query vector is not bound yet
            return Err(rusqlite::Error::SqliteFailure(
                ffi::Error::new(ffi::SQLITE_CONSTRAINT),
                None,
            ));
        };

        for (i, (_, mut usage)) in info.constraints_and_usages().enumerate() {
            if let Some(argv) = plan.argv[i] {
                usage.set_argv_index(argv);
                usage.set_omit(true);
            }
        }
        info.set_idx_str(&plan.idx_str);
        info.set_estimated_cost(plan.estimated_cost);
        info.set_estimated_rows(plan.estimated_rows);
        if plan.order_by_consumed {
            info.set_order_by_consumed(true);
        }
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<VssTabCursor<'vtab>> {
        Ok(VssTabCursor::new())
    }
}

impl<'vtab> CreateVTab<'vtab> for VssTab {
    const KIND: VTabKind = VTabKind::Default;

    fn create(
        db: &mut VTabConnection,
        _aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let schema = Self::parse_args(args)?;
        let sql = schema.declare_sql();

        // SAFETY: the handle belongs to the connection running CREATE VIRTUAL TABLE
        let db_handle = unsafe { db.handle() };
        let conn = unsafe { Connection::from_handle(db_handle) }?;
        let table = VectorTable::create(&conn, schema)?;

        Ok((
            sql,
            VssTab {
                base: sqlite3_vtab::default(),
                db: db_handle,
                table: RefCell::new(table),
            },
        ))
    }

    fn destroy(&self) -> rusqlite::Result<()> {
        let conn = self.connection()?;
        self.table.borrow().destroy(&conn)?;
        Ok(())
    }
}

impl<'vtab> UpdateVTab<'vtab> for VssTab {
    fn delete(&mut self, arg: ValueRef<'_>) -> rusqlite::Result<()> {
        let ValueRef::Integer(rowid) = arg else {
            return Err(Error::InvalidState("rowid must be an integer".to_string()).into());
        };
        self.table.get_mut().delete(rowid)?;
        Ok(())
    }

    fn insert(&mut self, args: &Inserts<'_>) -> rusqlite::Result<i64> {
        // args[0]: NULL for insert
        // args[1]: new rowid (or NULL for auto)
        // args[2..]: column values
        let vectors = self.row_vectors(args)?;

        match self.operation(args)? {
            None => {}
            Some(op) if op.eq_ignore_ascii_case(TRAINING_OPERATION) => {
                self.table.get_mut().insert_training(vectors)?;
                // Training rows never become visible rows
                return Ok(0);
            }
            Some(op) => {
                return Err(Error::Usage(format!("Unknown operation '{}'", op)).into());
            }
        }

        let rowid = args.get::<Option<i64>>(1)?;
        Ok(self.table.get_mut().insert(rowid, vectors)?)
    }

    fn update(&mut self, args: &Updates<'_>) -> rusqlite::Result<()> {
        // args[0]: old rowid, args[1]: new rowid, args[2..]: column values
        if self.operation(args)?.is_some() {
            return Err(Error::Usage("operation cannot be updated".to_string()).into());
        }
        let old_rowid = args.get::<i64>(0)?;
        let new_rowid = args.get::<Option<i64>>(1)?.unwrap_or(old_rowid);
        let vectors = self.row_vectors(args)?;
        self.table.get_mut().update(old_rowid, new_rowid, vectors)?;
        Ok(())
    }
}

impl TransactionVTab<'_> for VssTab {
    fn begin(&mut self) -> rusqlite::Result<()> {
        let conn = self.connection()?;
        self.table.get_mut().begin(&conn)?;
        Ok(())
    }

    fn sync(&mut self) -> rusqlite::Result<()> {
        let conn = self.connection()?;
        self.table.get_mut().sync(&conn)?;
        Ok(())
    }

    fn commit(&mut self) -> rusqlite::Result<()> {
        self.table.get_mut().commit()?;
        Ok(())
    }

    fn rollback(&mut self) -> rusqlite::Result<()> {
        self.table.get_mut().rollback()?;
        Ok(())
    }
}

/// vss0 cursor over one result list
#[repr(C)]
pub struct VssTabCursor<'vtab> {
    base: sqlite3_vtab_cursor,
    phantom: PhantomData<&'vtab VssTab>,
    results: ResultCursor,
}

impl VssTabCursor<'_> {
    fn new() -> Self {
        VssTabCursor {
            base: sqlite3_vtab_cursor::default(),
            phantom: PhantomData,
            results: ResultCursor::default(),
        }
    }

    /// Accessor to the associated virtual table
    fn vtab(&self) -> &VssTab {
        unsafe { &*(self.base.pVtab as *const VssTab) }
    }
}

unsafe impl VTabCursor for VssTabCursor<'_> {
    fn filter(
        &mut self,
        _idx_num: c_int,
        idx_str: Option<&str>,
        args: &Filters<'_>,
    ) -> rusqlite::Result<()> {
        let vtab = self.vtab();
        let conn = vtab.connection()?;
        vtab.table.borrow_mut().refresh_if_stale(&conn)?;

        let (plan, blocks) = parse_idxstr(idx_str.unwrap_or("1"))?;
        let values = (0..args.len())
            .map(|i| args.get::<Value>(i))
            .collect::<rusqlite::Result<Vec<Value>>>()?;

        let table = vtab.table.borrow();
        let results = match plan {
            // Scans and point lookups include this connection's staged rows
            QueryPlan::FullScan => ResultCursor::from_row_ids(table.visible_row_ids()),
            QueryPlan::Point => {
                let rows = match values.first() {
                    Some(Value::Integer(id)) if table.row_visible(*id) => vec![*id],
                    _ => Vec::new(),
                };
                ResultCursor::from_row_ids(rows)
            }
            QueryPlan::Search => {
                let dimensions: Vec<usize> =
                    table.schema().columns.iter().map(|c| c.dimension).collect();
                let request = SearchRequest::from_constraints(&blocks, &values, &dimensions)?;
                let hits = table.search(&request)?;
                tracing::debug!(
                    table = %table.schema().table_name,
                    column = request.column,
                    hits = hits.len(),
                    "vss0 search"
                );
                ResultCursor::from_hits(hits)
            }
        };
        drop(table);

        self.results = results;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.results.next();
        Ok(())
    }

    fn eof(&self) -> bool {
        self.results.eof()
    }

    fn column(&self, ctx: &mut Context, col: c_int) -> rusqlite::Result<()> {
        let vtab = self.vtab();
        let table = vtab.table.borrow();
        let num_vector_columns = table.schema().num_vector_columns();
        let col = col as usize;

        let Some(rowid) = self.results.row_id() else {
            return ctx.set_result(&Null);
        };

        if col < num_vector_columns {
            return match table.visible_vector(col, rowid) {
                Some(v) => ctx.set_result(&vector::to_blob(&v)),
                None => ctx.set_result(&Null),
            };
        }

        if col == table.schema().hidden_column(DISTANCE_OFFSET)
            && let Some(distance) = self.results.distance()
        {
            return ctx.set_result(&(distance as f64));
        }

        // k, radius, params and operation only carry input
        ctx.set_result(&Null)
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.results.row_id().unwrap_or(0))
    }
}
