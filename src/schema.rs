//! `CREATE VIRTUAL TABLE` argument parsing
//!
//! ```sql
//! CREATE VIRTUAL TABLE items USING vss0(
//!     embedding float[384] factory="HNSW32",
//!     thumbnail(64) metric=cosine
//! );
//! ```

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::index::MAX_DIMENSIONS;
use crate::index::factory::{DEFAULT_FACTORY, IndexFactory};

/// Hidden columns declared after the vector columns, in this order
pub const HIDDEN_COLUMNS: [&str; 5] = ["distance", "k", "radius", "params", "operation"];

/// Offsets of the hidden columns relative to the first hidden column
pub const DISTANCE_OFFSET: usize = 0;
pub const K_OFFSET: usize = 1;
pub const RADIUS_OFFSET: usize = 2;
pub const PARAMS_OFFSET: usize = 3;
pub const OPERATION_OFFSET: usize = 4;

/// Configuration of one vector column, fixed for the table's lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnConfig {
    pub name: String,
    pub dimension: usize,
    pub factory: String,
    pub metric: DistanceMetric,
    /// Cap on rows kept per training batch
    pub train_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnConfig>,
}

impl TableSchema {
    /// Parse module arguments
    ///
    /// args[0] = module name, args[1] = schema name, args[2] = table name,
    /// args[3..] = column definitions
    pub fn parse(args: &[&str]) -> Result<Self> {
        if args.len() < 3 {
            return Err(Error::InvalidConfig(
                "Missing schema or table name".to_string(),
            ));
        }
        let schema_name = args[1].to_string();
        let table_name = args[2].to_string();

        let mut columns: Vec<ColumnConfig> = Vec::new();
        for arg in args.iter().skip(3) {
            let arg = arg.trim();
            if arg.is_empty() {
                continue;
            }
            let column = parse_column(arg)?;
            if columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate column name '{}'",
                    column.name
                )));
            }
            columns.push(column);
        }

        if columns.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one vector column is required".to_string(),
            ));
        }

        Ok(TableSchema {
            schema_name,
            table_name,
            columns,
        })
    }

    /// Schema passed to `sqlite3_declare_vtab`
    pub fn declare_sql(&self) -> String {
        let mut sql = String::from("CREATE TABLE x(");
        for col in &self.columns {
            sql.push_str(&quote_identifier(&col.name));
            sql.push_str(" BLOB, ");
        }
        let hidden: Vec<String> = HIDDEN_COLUMNS
            .iter()
            .map(|name| format!("{} HIDDEN", name))
            .collect();
        sql.push_str(&hidden.join(", "));
        sql.push(')');
        sql
    }

    pub fn num_vector_columns(&self) -> usize {
        self.columns.len()
    }

    /// Host column number of a hidden column
    pub fn hidden_column(&self, offset: usize) -> usize {
        self.columns.len() + offset
    }
}

/// Wrap an identifier in double quotes, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_column(def: &str) -> Result<ColumnConfig> {
    let tokens = tokenize(def)?;
    let mut iter = tokens.into_iter();

    let head = iter
        .next()
        .ok_or_else(|| Error::InvalidConfig("Empty column definition".to_string()))?;

    // `name(dim)` or `name float[dim]`
    let (name, dimension) = if let Some(open) = head.find('(') {
        let name = head[..open].to_string();
        let dimension = parse_dimension(&head[open..], '(', ')')?;
        (name, dimension)
    } else {
        let type_spec = iter
            .next()
            .ok_or_else(|| Error::InvalidConfig(format!("Column '{}' has no vector type", head)))?;
        let dimension = parse_type_spec(&type_spec)?;
        (head, dimension)
    };
    validate_name(&name)?;

    let mut column = ColumnConfig {
        name,
        dimension,
        factory: DEFAULT_FACTORY.to_string(),
        metric: DistanceMetric::default(),
        train_limit: None,
    };

    while let Some(key) = iter.next() {
        if iter.next().as_deref() != Some("=") {
            return Err(Error::InvalidConfig(format!(
                "Expected '=' after option '{}' on column '{}'",
                key, column.name
            )));
        }
        let value = iter
            .next()
            .ok_or_else(|| Error::InvalidConfig(format!("Option '{}' has no value", key)))?;
        let value = unquote(&value);

        match key.to_ascii_lowercase().as_str() {
            "factory" => {
                IndexFactory::parse(&value)?;
                column.factory = value;
            }
            "metric" | "metric_type" => column.metric = DistanceMetric::from_str(&value)?,
            "train_limit" => {
                let limit: usize = value.parse().map_err(|_| {
                    Error::InvalidConfig(format!("Invalid train_limit '{}'", value))
                })?;
                if limit == 0 {
                    return Err(Error::InvalidConfig(
                        "train_limit must be positive".to_string(),
                    ));
                }
                column.train_limit = Some(limit);
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "Unknown column option '{}'",
                    other
                )));
            }
        }
    }

    Ok(column)
}

/// `float[768]`, `float32[768]` or `f32[768]`
fn parse_type_spec(spec: &str) -> Result<usize> {
    let bracket = spec
        .find('[')
        .ok_or_else(|| Error::InvalidConfig(format!("Invalid vector type '{}'", spec)))?;
    match spec[..bracket].to_ascii_lowercase().as_str() {
        "float" | "float32" | "f32" => parse_dimension(&spec[bracket..], '[', ']'),
        other => Err(Error::InvalidConfig(format!(
            "Unsupported element type '{}'",
            other
        ))),
    }
}

fn parse_dimension(s: &str, open: char, close: char) -> Result<usize> {
    let inner = s
        .strip_prefix(open)
        .and_then(|rest| rest.strip_suffix(close))
        .ok_or_else(|| Error::InvalidConfig(format!("Invalid dimension spec '{}'", s)))?;
    let dimension: usize = inner
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("Invalid dimensions: {}", inner)))?;
    if dimension == 0 || dimension > MAX_DIMENSIONS {
        return Err(Error::InvalidConfig(format!(
            "Dimension must be between 1 and {}, got {}",
            MAX_DIMENSIONS, dimension
        )));
    }
    Ok(dimension)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidConfig("Empty column name".to_string()));
    }
    let reserved = HIDDEN_COLUMNS
        .iter()
        .chain(["rowid"].iter())
        .any(|r| r.eq_ignore_ascii_case(name));
    if reserved {
        return Err(Error::InvalidConfig(format!(
            "Column name '{}' is reserved",
            name
        )));
    }
    Ok(())
}

/// Split on whitespace and '=', keeping quoted runs intact
fn tokenize(def: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = def.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' | '`' => {
                current.push(c);
                loop {
                    match chars.next() {
                        Some(q) if q == c => {
                            current.push(q);
                            // Doubled quote is an escaped quote
                            if chars.peek() == Some(&c) {
                                current.push(c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        Some(other) => current.push(other),
                        None => {
                            return Err(Error::InvalidConfig(format!(
                                "Unterminated quote in '{}'",
                                def
                            )));
                        }
                    }
                }
            }
            '=' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push("=".to_string());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unquote(token: &str) -> String {
    for q in ['"', '\'', '`'] {
        if token.len() >= 2 && token.starts_with(q) && token.ends_with(q) {
            let doubled = format!("{}{}", q, q);
            return token[1..token.len() - 1].replace(&doubled, &q.to_string());
        }
    }
    token.to_string()
}
