use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SeqTaxError;

static ACCESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{1,6}_?[0-9]{5,}(\.[0-9]+)?$").expect("accession pattern compiles")
});

/// Entrez database the sequences are pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    #[default]
    Nuccore,
    Protein,
}

impl Database {
    pub fn as_str(&self) -> &'static str {
        match self {
            Database::Nuccore => "nuccore",
            Database::Protein => "protein",
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated sequence identifier: an accession (optionally versioned) or a
/// numeric Entrez UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_numeric(&self) -> bool {
        self.0.bytes().all(|b| b.is_ascii_digit())
    }

    /// Accession with any `.version` suffix removed.
    pub fn unversioned(&self) -> &str {
        unversioned(&self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identifier {
    type Err = SeqTaxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SeqTaxError::InvalidIdentifier(value.to_string()));
        }
        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            // UIDs must fit the service's unsigned 64-bit id space
            trimmed
                .parse::<u64>()
                .map_err(|_| SeqTaxError::InvalidIdentifier(value.to_string()))?;
            return Ok(Self(trimmed.to_string()));
        }
        if !ACCESSION_RE.is_match(trimmed) {
            return Err(SeqTaxError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

pub fn unversioned(accession: &str) -> &str {
    accession
        .split_once('.')
        .map(|(base, _)| base)
        .unwrap_or(accession)
}

/// An Entrez search expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query(String);

impl Query {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Query {
    type Err = SeqTaxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SeqTaxError::Usage("query must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxonomyId(u64);

impl TaxonomyId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaxonomyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaxonomyId {
    type Err = SeqTaxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| SeqTaxError::InvalidTaxonomyId(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceRecord {
    pub accession: String,
    pub description: String,
    pub sequence: String,
}

/// Ranked path from the root of the classification down to one taxon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lineage {
    pub taxid: TaxonomyId,
    /// Ranked ancestors, root first. Unranked nodes are not kept.
    pub ancestors: Vec<(String, String)>,
    pub scientific_name: String,
    pub rank: String,
    pub division: Option<String>,
}

impl Lineage {
    /// Name assigned to `rank` among the ancestors or the terminal taxon.
    pub fn name_at(&self, rank: &str) -> Option<&str> {
        if self.rank == rank {
            return Some(self.scientific_name.as_str());
        }
        self.ancestors
            .iter()
            .rev()
            .find(|(ancestor_rank, _)| ancestor_rank == rank)
            .map(|(_, name)| name.as_str())
    }
}

pub fn is_unranked(rank: &str) -> bool {
    let rank = rank.trim();
    rank.is_empty() || rank == "no rank" || rank == "clade"
}
