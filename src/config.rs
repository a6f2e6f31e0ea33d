use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Database;
use crate::error::SeqTaxError;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "seqtax.json";
pub const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
/// Upper bound on identifiers per E-utilities request.
pub const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub database: Option<Database>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub taxonomy_batch_size: Option<usize>,
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub ranks: Option<Vec<String>>,
    #[serde(default)]
    pub rank_propagation: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub database: Database,
    pub api_key: Option<String>,
    pub email: Option<String>,
    pub tool: String,
    pub batch_size: usize,
    pub taxonomy_batch_size: usize,
    pub jobs: usize,
    pub request_delay: Duration,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    pub ranks: Vec<String>,
    pub rank_propagation: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: EUTILS_BASE.to_string(),
            database: Database::Nuccore,
            api_key: None,
            email: None,
            tool: "seqtax".to_string(),
            batch_size: 200,
            taxonomy_batch_size: 100,
            jobs: 1,
            request_delay: Duration::from_millis(334),
            timeout_secs: 60,
            retry: RetryPolicy::default(),
            ranks: default_ranks(),
            rank_propagation: true,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `seqtax.json` from the working directory when present.
    /// A missing default file means built-in defaults. `NCBI_API_KEY` fills in
    /// the API key when the file does not set one.
    pub fn resolve(path: Option<&str>) -> Result<Settings, SeqTaxError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let mut config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| SeqTaxError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| SeqTaxError::ConfigParse(err.to_string()))?
        };

        if config.api_key.is_none() {
            if let Ok(api_key) = std::env::var("NCBI_API_KEY") {
                if !api_key.trim().is_empty() {
                    config.api_key = Some(api_key.trim().to_string());
                }
            }
        }

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, SeqTaxError> {
        let defaults = Settings::default();

        let batch_size = check_batch("batch_size", config.batch_size, defaults.batch_size)?;
        let taxonomy_batch_size = check_batch(
            "taxonomy_batch_size",
            config.taxonomy_batch_size,
            defaults.taxonomy_batch_size,
        )?;

        let jobs = config.jobs.unwrap_or(defaults.jobs);
        if jobs == 0 {
            return Err(SeqTaxError::ConfigInvalid {
                field: "jobs",
                message: "must be at least 1".to_string(),
            });
        }

        let api_key = config
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        // NCBI allows 3 requests/s anonymously and 10 with a key
        let request_delay = match config.request_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None if api_key.is_some() => Duration::from_millis(100),
            None => defaults.request_delay,
        };

        let retry = match config.retry {
            Some(retry) => {
                let max_attempts = retry.max_attempts.unwrap_or(defaults.retry.max_attempts);
                if max_attempts == 0 {
                    return Err(SeqTaxError::ConfigInvalid {
                        field: "retry.max_attempts",
                        message: "must be at least 1".to_string(),
                    });
                }
                RetryPolicy {
                    max_attempts,
                    base_delay: retry
                        .base_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.retry.base_delay),
                    max_delay: retry
                        .max_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.retry.max_delay),
                    jitter: defaults.retry.jitter,
                }
            }
            None => defaults.retry,
        };

        let ranks = match config.ranks {
            Some(ranks) => normalize_ranks(ranks)?,
            None => defaults.ranks,
        };

        Ok(Settings {
            base_url: config.base_url.unwrap_or(defaults.base_url),
            database: config.database.unwrap_or(defaults.database),
            api_key,
            email: config.email.filter(|email| !email.trim().is_empty()),
            tool: config.tool.unwrap_or(defaults.tool),
            batch_size,
            taxonomy_batch_size,
            jobs,
            request_delay,
            timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
            retry,
            ranks,
            rank_propagation: config.rank_propagation.unwrap_or(defaults.rank_propagation),
        })
    }
}

fn check_batch(
    field: &'static str,
    value: Option<usize>,
    default: usize,
) -> Result<usize, SeqTaxError> {
    let value = value.unwrap_or(default);
    if value == 0 || value > MAX_BATCH_SIZE {
        return Err(SeqTaxError::ConfigInvalid {
            field,
            message: format!("must be between 1 and {MAX_BATCH_SIZE}, got {value}"),
        });
    }
    Ok(value)
}

/// Trims and lowercases requested ranks; an empty list or blank entry is a usage error.
pub fn normalize_ranks(ranks: Vec<String>) -> Result<Vec<String>, SeqTaxError> {
    if ranks.is_empty() {
        return Err(SeqTaxError::Usage(
            "at least one rank must be requested".to_string(),
        ));
    }
    ranks
        .into_iter()
        .map(|rank| {
            let rank = rank.trim().to_lowercase();
            if rank.is_empty() {
                Err(SeqTaxError::Usage("rank names must not be blank".to_string()))
            } else {
                Ok(rank)
            }
        })
        .collect()
}

pub fn default_ranks() -> Vec<String> {
    ["kingdom", "phylum", "class", "order", "family", "genus", "species"]
        .iter()
        .map(|rank| rank.to_string())
        .collect()
}
