use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqlError {
    #[error("query error: {0}")]
    Query(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("connection error: {0}")]
    Connection(String),
}
