use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::SqlError;
use crate::traits::{Row, SqlConn, SqlStore, TxBody, Value};

/// SqliteStore is a SqlStore implementation backed by rusqlite (bundled SQLite).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, SqlError> {
        let conn = Connection::open(path)
            .map_err(|e| SqlError::Connection(e.to_string()))?;

        // WAL for concurrent readers; busy_timeout so writers queue
        // instead of failing when another process holds the write lock.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| SqlError::Connection(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SqlError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SqlError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Convert our Value enum to rusqlite's ToSql.
fn bind_params(params: &[Value]) -> Vec<Box<dyn rusqlite::types::ToSql + '_>> {
    params
        .iter()
        .map(|v| -> Box<dyn rusqlite::types::ToSql + '_> {
            match v {
                Value::Null => Box::new(rusqlite::types::Null),
                Value::Integer(i) => Box::new(*i),
                Value::Real(f) => Box::new(*f),
                Value::Text(s) => Box::new(s.as_str()),
                Value::Blob(b) => Box::new(b.as_slice()),
            }
        })
        .collect()
}

fn query_on(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, SqlError> {
    let bound = bind_params(params);
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        bound.iter().map(|b| b.as_ref()).collect();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SqlError::Query(e.to_string()))?;

    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            let mut columns = Vec::new();
            for (i, name) in column_names.iter().enumerate() {
                let val = row_value_at(row, i);
                columns.push((name.clone(), val));
            }
            Ok(Row { columns })
        })
        .map_err(|e| SqlError::Query(e.to_string()))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| SqlError::Query(e.to_string()))?);
    }
    Ok(result)
}

fn exec_on(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64, SqlError> {
    let bound = bind_params(params);
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        bound.iter().map(|b| b.as_ref()).collect();

    let affected = conn
        .execute(sql, param_refs.as_slice())
        .map_err(|e| SqlError::Execution(e.to_string()))?;

    Ok(affected as u64)
}

impl SqlConn for SqliteStore {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SqlError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SqlError::Query(e.to_string()))?;
        query_on(&conn, sql, params)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SqlError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SqlError::Execution(e.to_string()))?;
        exec_on(&conn, sql, params)
    }
}

/// Execution surface over an open transaction. Borrows the connection
/// guard held by [`SqliteStore::transaction`], so statements issued here
/// see the transaction's uncommitted writes.
struct TxConn<'a> {
    conn: &'a Connection,
}

impl SqlConn for TxConn<'_> {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SqlError> {
        query_on(self.conn, sql, params)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SqlError> {
        exec_on(self.conn, sql, params)
    }
}

impl SqlStore for SqliteStore {
    fn transaction(&self, body: TxBody<'_>) -> Result<(), SqlError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SqlError::Transaction(e.to_string()))?;

        // IMMEDIATE takes the write lock up front so the body never
        // hits SQLITE_BUSY mid-flight on upgrade.
        conn.execute_batch("BEGIN IMMEDIATE;")
            .map_err(|e| SqlError::Transaction(e.to_string()))?;

        let result = body(&TxConn { conn: &*conn });

        match result {
            Ok(()) => conn
                .execute_batch("COMMIT;")
                .map_err(|e| SqlError::Transaction(e.to_string())),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK;");
                Err(e)
            }
        }
    }
}

/// Extract a Value from a rusqlite row at a given column index.
fn row_value_at(row: &rusqlite::Row, idx: usize) -> Value {
    // Try integer first, then real, then text, then blob, then null.
    if let Ok(i) = row.get::<_, i64>(idx) {
        return Value::Integer(i);
    }
    if let Ok(f) = row.get::<_, f64>(idx) {
        return Value::Real(f);
    }
    if let Ok(s) = row.get::<_, String>(idx) {
        return Value::Text(s);
    }
    if let Ok(b) = row.get::<_, Vec<u8>>(idx) {
        return Value::Blob(b);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(
                "CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER NOT NULL)",
                &[],
            )
            .unwrap();
        store
    }

    #[test]
    fn exec_and_query_roundtrip() {
        let store = test_store();
        let affected = store
            .exec(
                "INSERT INTO kv (k, v) VALUES (?1, ?2)",
                &[Value::Text("a".into()), Value::Integer(1)],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let rows = store
            .query("SELECT k, v FROM kv WHERE k = ?1", &[Value::Text("a".into())])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("k"), Some("a"));
        assert_eq!(rows[0].get_i64("v"), Some(1));
    }

    #[test]
    fn conditional_update_reports_no_match() {
        let store = test_store();
        store
            .exec(
                "INSERT INTO kv (k, v) VALUES ('a', 1)",
                &[],
            )
            .unwrap();

        let affected = store
            .exec("UPDATE kv SET v = 2 WHERE k = 'a' AND v = 99", &[])
            .unwrap();
        assert_eq!(affected, 0);

        let affected = store
            .exec("UPDATE kv SET v = 2 WHERE k = 'a' AND v = 1", &[])
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[test]
    fn transaction_commits() {
        let store = test_store();
        store
            .transaction(&mut |tx| {
                tx.exec("INSERT INTO kv (k, v) VALUES ('a', 1)", &[])?;
                tx.exec("INSERT INTO kv (k, v) VALUES ('b', 2)", &[])?;
                // The body sees its own writes.
                let rows = tx.query("SELECT COUNT(*) AS cnt FROM kv", &[])?;
                assert_eq!(rows[0].get_i64("cnt"), Some(2));
                Ok(())
            })
            .unwrap();

        let rows = store.query("SELECT COUNT(*) AS cnt FROM kv", &[]).unwrap();
        assert_eq!(rows[0].get_i64("cnt"), Some(2));
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = test_store();
        let result = store.transaction(&mut |tx| {
            tx.exec("INSERT INTO kv (k, v) VALUES ('a', 1)", &[])?;
            Err(SqlError::Execution("boom".into()))
        });
        assert!(result.is_err());

        let rows = store.query("SELECT COUNT(*) AS cnt FROM kv", &[]).unwrap();
        assert_eq!(rows[0].get_i64("cnt"), Some(0));
    }

    #[test]
    fn open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.sqlite")).unwrap();
        store
            .exec("CREATE TABLE t (x INTEGER)", &[])
            .unwrap();
        store.exec("INSERT INTO t (x) VALUES (42)", &[]).unwrap();
        let rows = store.query("SELECT x FROM t", &[]).unwrap();
        assert_eq!(rows[0].get_i64("x"), Some(42));
    }

    #[test]
    fn real_and_null_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec("CREATE TABLE t (x REAL, y TEXT)", &[])
            .unwrap();
        store
            .exec(
                "INSERT INTO t (x, y) VALUES (?1, ?2)",
                &[Value::Real(1.5), Value::Null],
            )
            .unwrap();
        let rows = store.query("SELECT x, y FROM t", &[]).unwrap();
        assert_eq!(rows[0].get_f64("x"), Some(1.5));
        assert!(rows[0].get_str("y").is_none());
    }
}
