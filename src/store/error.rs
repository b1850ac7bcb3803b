//! Typed store errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("duplicate object: {0}")]
    Duplicate(String),

    #[error("corrupt row in {otype} for oid {oid}: {source}")]
    CorruptRow {
        otype: String,
        oid: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("bad object reference: {0}")]
    BadORef(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
