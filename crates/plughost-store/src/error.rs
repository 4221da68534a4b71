//! Store error types.

use thiserror::Error;

use crate::value::MAX_NESTING;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The value has no lossless JSON representation.
    #[error("value cannot be stored: {0}")]
    Value(String),

    #[error("value nests deeper than {MAX_NESTING} levels (cyclic or too deep to store)")]
    NestingTooDeep,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
