use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error, Diagnostic)]
pub enum SeqTaxError {
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid taxonomy id: {0:?}")]
    InvalidTaxonomyId(String),

    #[error("{0}")]
    #[diagnostic(help("pass either accession ids or a query, not both"))]
    Usage(String),

    #[error("no valid identifiers left to fetch")]
    #[diagnostic(help("identifiers must be accessions (e.g. MT345279.1) or numeric ids"))]
    NoValidIdentifiers,

    #[error("search returned no records: {0}")]
    EmptySearch(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value for {field}: {message}")]
    ConfigInvalid { field: &'static str, message: String },

    #[error("NCBI client setup failed: {0}")]
    NcbiHttp(String),

    #[error("{context} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        context: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("{context} failed: {source}")]
    Request {
        context: String,
        #[source]
        source: TransportError,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SeqTaxError {
    /// Whether the error came from talking to NCBI rather than from local input.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            SeqTaxError::NcbiHttp(_)
                | SeqTaxError::RetriesExhausted { .. }
                | SeqTaxError::Request { .. }
        )
    }
}
