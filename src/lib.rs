//! Fetch nucleotide or protein sequences from NCBI Entrez together with
//! rank-prefixed taxonomy strings, dropping records whose upstream data is
//! unusable instead of failing the whole run.

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod lineage;
pub mod output;
pub mod retry;
pub mod taxonomy;
pub mod transport;
pub mod validate;
