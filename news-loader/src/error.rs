use stream_common::streams::StreamError;
use thiserror::Error;

/// Enumeration of reasons a stream entry could not be turned into a typed message.
/// The `Display` of these errors is what ends up in the dead-letter `reason` field.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid records json: {0}")]
    InvalidRecordsJson(#[from] serde_json::Error),
    #[error("records is not a json array")]
    RecordsNotArray,
    #[error("record {0} is not a json object")]
    RecordNotObject(usize),
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(String),
}

/// Enumeration of errors for operations on the relational store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("company {0} could not be resolved to an id")]
    CompanyNotResolved(String),
}

/// Errors that stop the loader loop.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("a stream operation failed: {0}")]
    Stream(#[from] StreamError),
    #[error("a store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode records: {0}")]
    Encode(#[from] serde_json::Error),
}
