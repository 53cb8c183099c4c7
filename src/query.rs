//! Query planning and result cursors
//!
//! `xBestIndex` encodes the constraints it consumes into an `idx_str`: a plan
//! header character followed by one 4-character block per constraint, in
//! argument order. `xFilter` decodes the string and turns the arguments into
//! a [`SearchRequest`] or a row id lookup.

use crate::error::{Error, Result};
use crate::index::{Neighbor, SearchParams};
use crate::schema::{K_OFFSET, PARAMS_OFFSET, RADIUS_OFFSET};
use crate::vector;
use rusqlite::types::{Value, ValueRef};

/// Query plan types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPlan {
    /// Full table scan
    FullScan,
    /// Point query by rowid
    Point,
    /// KNN or range search
    Search,
}

impl QueryPlan {
    /// Convert to idxStr header character
    pub fn to_header_char(&self) -> char {
        match self {
            QueryPlan::FullScan => '1',
            QueryPlan::Point => '2',
            QueryPlan::Search => '3',
        }
    }

    /// Parse from idxStr header character
    pub fn from_header_char(c: char) -> Result<Self> {
        match c {
            '1' => Ok(QueryPlan::FullScan),
            '2' => Ok(QueryPlan::Point),
            '3' => Ok(QueryPlan::Search),
            _ => Err(Error::InvalidState(format!(
                "Invalid query plan header: '{}'",
                c
            ))),
        }
    }
}

/// idxStr block types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxStrKind {
    /// Query vector on a column: '{NNN' (NNN = column)
    Match,
    /// KNN k limit: '}___'
    K,
    /// Range radius: ')___'
    Radius,
    /// Search parameter overrides: '#___'
    Params,
    /// Point query rowid: '!___'
    RowId,
}

impl IdxStrKind {
    /// Convert to 4-character block (first character)
    pub fn to_char(&self) -> char {
        match self {
            IdxStrKind::Match => '{',
            IdxStrKind::K => '}',
            IdxStrKind::Radius => ')',
            IdxStrKind::Params => '#',
            IdxStrKind::RowId => '!',
        }
    }

    /// Parse from first character of 4-character block
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            '{' => Ok(IdxStrKind::Match),
            '}' => Ok(IdxStrKind::K),
            ')' => Ok(IdxStrKind::Radius),
            '#' => Ok(IdxStrKind::Params),
            '!' => Ok(IdxStrKind::RowId),
            _ => Err(Error::InvalidState(format!(
                "Invalid idxStr block kind: '{}'",
                c
            ))),
        }
    }
}

/// One decoded idxStr block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxBlock {
    pub kind: IdxStrKind,
    /// Target column of a MATCH block
    pub column: Option<usize>,
}

impl IdxBlock {
    fn encode(&self, out: &mut String) {
        out.push(self.kind.to_char());
        match self.column {
            Some(col) => out.push_str(&format!("{:03}", col)),
            None => out.push_str("___"),
        }
    }
}

/// Parse idxStr into components
pub fn parse_idxstr(idxstr: &str) -> Result<(QueryPlan, Vec<IdxBlock>)> {
    let mut chars = idxstr.chars();
    let header = chars
        .next()
        .ok_or_else(|| Error::InvalidState("Empty idxStr".to_string()))?;
    let plan = QueryPlan::from_header_char(header)?;

    let rest = chars.as_str().as_bytes();
    if rest.len() % 4 != 0 {
        return Err(Error::InvalidState(format!(
            "Truncated idxStr '{}'",
            idxstr
        )));
    }

    // Parse 4-character blocks
    let mut blocks = Vec::with_capacity(rest.len() / 4);
    for chunk in rest.chunks(4) {
        let kind = IdxStrKind::from_char(chunk[0] as char)?;
        let tail = std::str::from_utf8(&chunk[1..])
            .map_err(|_| Error::InvalidState(format!("Invalid idxStr '{}'", idxstr)))?;
        let column =
            match tail {
                "___" => None,
                digits => Some(digits.parse::<usize>().map_err(|_| {
                    Error::InvalidState(format!("Invalid idxStr column '{}'", digits))
                })?),
            };
        blocks.push(IdxBlock { kind, column });
    }

    Ok((plan, blocks))
}

/// Constraint operators the planner cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Match,
    Other,
}

/// A host constraint as seen by the planner
#[derive(Debug, Clone, Copy)]
pub struct PlanConstraint {
    /// Host column number, -1 for rowid
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

/// Planner output for one `xBestIndex` call
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPlan {
    pub plan: QueryPlan,
    pub idx_str: String,
    /// 1-based argv index per constraint, `None` when not consumed
    pub argv: Vec<Option<i32>>,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
    pub order_by_consumed: bool,
}

const FULL_SCAN_COST: f64 = 1_000_000.0;
const SEARCH_COST: f64 = 10.0;
const POINT_COST: f64 = 1.0;

/// Pick a plan for the given constraints
///
/// `order_by` lists (column, descending) terms of the query's ORDER BY.
/// Returns `None` when a MATCH, k, radius or params constraint is present
/// but not usable yet, i.e. its value comes from a table joined later; the
/// host then has to pick a join order that binds it first.
pub fn plan_query(
    constraints: &[PlanConstraint],
    order_by: &[(i32, bool)],
    num_vector_columns: usize,
) -> Option<IndexPlan> {
    let hidden = |offset: usize| (num_vector_columns + offset) as i32;
    let distance_column = num_vector_columns as i32;

    let mut search_blocks: Vec<(usize, IdxBlock)> = Vec::new();
    let mut rowid_constraint: Option<usize> = None;

    for (i, c) in constraints.iter().enumerate() {
        let block = match c.op {
            ConstraintOp::Match if c.column >= 0 && c.column < 1000 => IdxBlock {
                kind: IdxStrKind::Match,
                column: Some(c.column as usize),
            },
            ConstraintOp::Eq if c.column == hidden(K_OFFSET) => IdxBlock {
                kind: IdxStrKind::K,
                column: None,
            },
            ConstraintOp::Eq if c.column == hidden(RADIUS_OFFSET) => IdxBlock {
                kind: IdxStrKind::Radius,
                column: None,
            },
            ConstraintOp::Eq if c.column == hidden(PARAMS_OFFSET) => IdxBlock {
                kind: IdxStrKind::Params,
                column: None,
            },
            ConstraintOp::Eq if c.column == -1 => {
                if c.usable {
                    rowid_constraint.get_or_insert(i);
                }
                continue;
            }
            _ => continue,
        };
        if !c.usable {
            return None;
        }
        search_blocks.push((i, block));
    }

    let mut argv = vec![None; constraints.len()];
    let mut idx_str = String::new();

    if !search_blocks.is_empty() {
        idx_str.push(QueryPlan::Search.to_header_char());
        for (n, (i, block)) in search_blocks.iter().enumerate() {
            argv[*i] = Some(n as i32 + 1);
            block.encode(&mut idx_str);
        }
        let order_by_consumed = matches!(order_by, [(col, false)] if *col == distance_column);
        return Some(IndexPlan {
            plan: QueryPlan::Search,
            idx_str,
            argv,
            estimated_cost: SEARCH_COST,
            estimated_rows: 10,
            order_by_consumed,
        });
    }

    if let Some(i) = rowid_constraint {
        idx_str.push(QueryPlan::Point.to_header_char());
        IdxBlock {
            kind: IdxStrKind::RowId,
            column: None,
        }
        .encode(&mut idx_str);
        argv[i] = Some(1);
        return Some(IndexPlan {
            plan: QueryPlan::Point,
            idx_str,
            argv,
            estimated_cost: POINT_COST,
            estimated_rows: 1,
            order_by_consumed: false,
        });
    }

    idx_str.push(QueryPlan::FullScan.to_header_char());
    Some(IndexPlan {
        plan: QueryPlan::FullScan,
        idx_str,
        argv,
        estimated_cost: FULL_SCAN_COST,
        estimated_rows: FULL_SCAN_COST as i64,
        order_by_consumed: false,
    })
}

/// KNN or range bound
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    Knn { k: usize },
    Range { radius: f32 },
}

/// A decoded search predicate
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub column: usize,
    pub query: Vec<f32>,
    pub mode: SearchMode,
    pub params: SearchParams,
}

impl SearchRequest {
    /// Validate search blocks and their arguments
    ///
    /// `dimensions` holds the dimension of every vector column.
    pub fn from_constraints(
        blocks: &[IdxBlock],
        args: &[Value],
        dimensions: &[usize],
    ) -> Result<Self> {
        if blocks.len() != args.len() {
            return Err(Error::InvalidState(format!(
                "Expected {} filter arguments, got {}",
                blocks.len(),
                args.len()
            )));
        }

        let mut matched: Option<(usize, &Value)> = None;
        let mut k: Option<&Value> = None;
        let mut radius: Option<&Value> = None;
        let mut params: Option<&Value> = None;

        for (block, arg) in blocks.iter().zip(args) {
            match block.kind {
                IdxStrKind::Match => {
                    let column = block.column.ok_or_else(|| {
                        Error::InvalidState("MATCH block without column".to_string())
                    })?;
                    if matched.replace((column, arg)).is_some() {
                        return Err(Error::Usage(
                            "Only one MATCH constraint is allowed per query".to_string(),
                        ));
                    }
                }
                IdxStrKind::K => set_once(&mut k, arg, "k")?,
                IdxStrKind::Radius => set_once(&mut radius, arg, "radius")?,
                IdxStrKind::Params => set_once(&mut params, arg, "params")?,
                IdxStrKind::RowId => {
                    return Err(Error::InvalidState(
                        "rowid block in a search plan".to_string(),
                    ));
                }
            }
        }

        let (column, query) = matched.ok_or_else(|| {
            Error::Usage("k, radius and params require a MATCH constraint".to_string())
        })?;
        let dimension = *dimensions
            .get(column)
            .ok_or_else(|| Error::Usage("MATCH is only supported on vector columns".to_string()))?;

        let mode = match (k, radius) {
            (Some(_), Some(_)) => {
                return Err(Error::Usage("k and radius cannot be combined".to_string()));
            }
            (None, None) => {
                return Err(Error::Usage(
                    "A MATCH constraint needs either k or radius".to_string(),
                ));
            }
            (Some(k), None) => SearchMode::Knn { k: parse_k(k)? },
            (None, Some(r)) => SearchMode::Range {
                radius: parse_radius(r)?,
            },
        };

        let params = match params {
            None | Some(Value::Null) => SearchParams::default(),
            Some(Value::Text(s)) => SearchParams::parse(s)?,
            Some(_) => return Err(Error::Usage("params must be TEXT".to_string())),
        };

        let query = vector::from_value(ValueRef::from(query))
            .map_err(|e| Error::Usage(format!("Invalid query vector: {}", e)))?
            .ok_or_else(|| Error::Usage("Query vector is NULL".to_string()))?;
        if query.len() != dimension {
            return Err(Error::Usage(format!(
                "Query vector has {} dimensions, column expects {}",
                query.len(),
                dimension
            )));
        }

        Ok(SearchRequest {
            column,
            query,
            mode,
            params,
        })
    }
}

fn set_once<'a>(slot: &mut Option<&'a Value>, arg: &'a Value, name: &str) -> Result<()> {
    if slot.replace(arg).is_some() {
        return Err(Error::Usage(format!("{} given more than once", name)));
    }
    Ok(())
}

fn parse_k(value: &Value) -> Result<usize> {
    let k = match value {
        Value::Integer(k) => *k,
        Value::Real(r) if r.fract() == 0.0 && r.is_finite() => *r as i64,
        _ => return Err(Error::Usage("k must be an integer".to_string())),
    };
    if k < 1 {
        return Err(Error::Usage(format!("k must be at least 1, got {}", k)));
    }
    Ok(usize::try_from(k).unwrap_or(usize::MAX))
}

fn parse_radius(value: &Value) -> Result<f32> {
    let radius = match value {
        Value::Integer(r) => *r as f64,
        Value::Real(r) => *r,
        _ => return Err(Error::Usage("radius must be a number".to_string())),
    };
    if !radius.is_finite() || radius < 0.0 {
        return Err(Error::Usage(format!(
            "radius must be a finite non-negative number, got {}",
            radius
        )));
    }
    Ok(radius as f32)
}

/// One-shot list of result rows: row id and, for searches, distance
#[derive(Debug, Clone, Default)]
pub struct ResultCursor {
    rows: Vec<(i64, Option<f32>)>,
    position: usize,
}

impl ResultCursor {
    pub fn from_hits(hits: Vec<Neighbor>) -> Self {
        ResultCursor {
            rows: hits.into_iter().map(|(id, d)| (id, Some(d))).collect(),
            position: 0,
        }
    }

    pub fn from_row_ids(row_ids: Vec<i64>) -> Self {
        ResultCursor {
            rows: row_ids.into_iter().map(|id| (id, None)).collect(),
            position: 0,
        }
    }

    pub fn next(&mut self) {
        if self.position < self.rows.len() {
            self.position += 1;
        }
    }

    pub fn eof(&self) -> bool {
        self.position >= self.rows.len()
    }

    pub fn row_id(&self) -> Option<i64> {
        self.rows.get(self.position).map(|r| r.0)
    }

    pub fn distance(&self) -> Option<f32> {
        self.rows.get(self.position).and_then(|r| r.1)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
