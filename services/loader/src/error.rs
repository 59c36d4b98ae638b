//! Error types for the load path

use thiserror::Error;

/// Failures reported by a warehouse backend.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid identifier '{0}': expected [a-z0-9_], starting with a letter")]
    InvalidIdentifier(String),

    #[error("relation not found: {0}")]
    NotFound(String),

    #[error("key {key} appears more than once in {relation}")]
    DuplicateKey { relation: String, key: String },

    #[error("{0}")]
    Rejected(String),
}

/// Failures of the staging and merge steps. Each is fatal for the series it
/// happened in and nothing else.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("dataset {dataset} unavailable: {source}")]
    DatasetUnavailable {
        dataset: String,
        #[source]
        source: WarehouseError,
    },

    #[error("staging write to {relation} failed: {source}")]
    StagingWriteFailed {
        relation: String,
        #[source]
        source: WarehouseError,
    },

    #[error("final relation {relation} could not be created: {source}")]
    FinalTableUnavailable {
        relation: String,
        #[source]
        source: WarehouseError,
    },

    #[error("merge of {staging} into {target} failed: {source}")]
    MergeFailed {
        staging: String,
        target: String,
        #[source]
        source: WarehouseError,
    },

    #[error("could not drop staging relation {relation}: {source}")]
    CleanupFailed {
        relation: String,
        #[source]
        source: WarehouseError,
    },
}

/// Configuration problems found at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env var missing")]
    MissingVar(&'static str),

    #[error("{key} has an invalid value '{value}'")]
    InvalidVar { key: &'static str, value: String },

    #[error("could not read catalog {path}: {source}")]
    CatalogRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse catalog {path}: {source}")]
    CatalogParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("catalog entry '{0}' is declared more than once")]
    DuplicateIndicator(String),

    #[error("catalog entry '{name}': {reason}")]
    InvalidIndicator { name: String, reason: String },
}
