use crate::error::SqlError;

/// A dynamically-typed SQL parameter value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A row returned from a SQL query — column name to value.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

impl Row {
    /// Get a column value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Get a text column value by name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get an integer column value by name.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    /// Get a real column value by name.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(Value::Real(f)) => Some(*f),
            Some(Value::Integer(i)) => Some(*i as f64),
            _ => None,
        }
    }
}

/// Statement execution surface, shared by a store and by an open
/// transaction on that store.
pub trait SqlConn {
    /// Execute a query and return rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SqlError>;

    /// Execute a statement (INSERT/UPDATE/DELETE) and return affected row count.
    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SqlError>;
}

/// The body of a transaction, run against a connection that sees the
/// transaction's uncommitted writes.
pub type TxBody<'a> = &'a mut dyn FnMut(&dyn SqlConn) -> Result<(), SqlError>;

/// SqlStore provides SQL execution backed by an embedded database.
///
/// Statements issued through [`SqlConn`] are individually atomic;
/// [`SqlStore::transaction`] groups several into one atomic unit —
/// the body's writes either all commit or all roll back.
pub trait SqlStore: SqlConn + Send + Sync {
    /// Run `body` inside a write transaction. The transaction commits
    /// when the body returns `Ok` and rolls back when it returns `Err`
    /// (the body's error is passed through to the caller).
    fn transaction(&self, body: TxBody<'_>) -> Result<(), SqlError>;
}
