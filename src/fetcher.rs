use std::fmt;
use std::sync::Mutex;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{Database, Identifier, Query, SequenceRecord, TaxonomyId};
use crate::error::SeqTaxError;
use crate::retry::RetryingClient;
use crate::transport::{Endpoint, EutilsRequest, Transport, TransportError};

pub const SEARCH_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRecord {
    pub uid: String,
    pub accession: String,
    pub taxid: TaxonomyId,
}

/// A single upstream record that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordFault {
    MissingField { field: String },
    WrongType { field: String, value: String },
}

impl RecordFault {
    pub fn missing(field: &str) -> Self {
        RecordFault::MissingField {
            field: field.to_string(),
        }
    }

    pub fn wrong_type(field: &str, value: impl Into<String>) -> Self {
        RecordFault::WrongType {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RecordFault::MissingField { .. } => "MissingField",
            RecordFault::WrongType { .. } => "WrongType",
        }
    }
}

impl fmt::Display for RecordFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFault::MissingField { field } => write!(f, "MissingField: no {field}"),
            RecordFault::WrongType { field, value } => {
                write!(f, "WrongType: {field} has unusable value {value:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Fault(RecordFault),
    Retired {
        status: String,
        replaced_by: Option<String>,
    },
    ServiceError {
        message: String,
    },
}

/// A summary entry left out of the results. `key` is the accession when the
/// record carried one, otherwise the UID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub key: String,
    pub uid: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceBatches {
    pub records: Vec<SequenceRecord>,
    pub failed: Vec<Identifier>,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryBatches {
    pub records: Vec<SummaryRecord>,
    pub skipped: Vec<SkippedRecord>,
    pub failed: Vec<Identifier>,
}

pub struct BatchFetcher<'a, T> {
    client: &'a RetryingClient<T>,
    database: Database,
    batch_size: usize,
    jobs: usize,
}

impl<'a, T: Transport> BatchFetcher<'a, T> {
    pub fn new(
        client: &'a RetryingClient<T>,
        database: Database,
        batch_size: usize,
        jobs: usize,
    ) -> Self {
        Self {
            client,
            database,
            batch_size: batch_size.max(1),
            jobs: jobs.max(1),
        }
    }

    /// Runs an esearch and pages through every matching accession. Any
    /// failure here is fatal to the caller.
    pub fn search_ids(&self, query: &Query) -> Result<Vec<String>, SeqTaxError> {
        let mut ids: Vec<String> = Vec::new();
        loop {
            let request = EutilsRequest::get(Endpoint::Search)
                .param("db", self.database.as_str())
                .param("term", query.as_str())
                .param("idtype", "acc")
                .param("retmode", "json")
                .param("retstart", ids.len().to_string())
                .param("retmax", SEARCH_PAGE_SIZE.to_string());
            let context = format!("esearch for {query:?} (offset {})", ids.len());
            let page = self.client.execute(&context, &request, parse_search)?;
            let page_len = page.ids.len();
            ids.extend(page.ids);
            debug!("esearch page: {page_len} ids, {} of {}", ids.len(), page.count);
            if page_len == 0 || ids.len() >= page.count {
                break;
            }
        }
        Ok(ids)
    }

    pub fn fetch_sequences(&self, ids: &[Identifier]) -> SequenceBatches {
        let outcomes = run_batches(ids, self.batch_size, self.jobs, |index, batch| {
            let request = EutilsRequest::post(Endpoint::Fetch)
                .param("db", self.database.as_str())
                .param("id", join_ids(batch))
                .param("rettype", "fasta")
                .param("retmode", "text");
            let context = format!("sequence batch {} ({} ids)", index + 1, batch.len());
            (batch, context.clone(), self.client.execute(&context, &request, parse_fasta))
        });

        let mut result = SequenceBatches::default();
        for (batch, context, outcome) in outcomes {
            match outcome {
                Ok(records) => result.records.extend(records),
                Err(err) => {
                    warn!("Giving up on {context}: {err}");
                    result.failed.extend(batch.iter().cloned());
                }
            }
        }
        result
    }

    /// Looks up the taxonomy id recorded for each identifier.
    pub fn fetch_taxonomy_ids(&self, ids: &[Identifier]) -> SummaryBatches {
        let outcomes = run_batches(ids, self.batch_size, self.jobs, |index, batch| {
            let request = EutilsRequest::post(Endpoint::Summary)
                .param("db", self.database.as_str())
                .param("id", join_ids(batch))
                .param("retmode", "json");
            let context = format!("summary batch {} ({} ids)", index + 1, batch.len());
            (batch, context.clone(), self.client.execute(&context, &request, parse_summaries))
        });

        let mut result = SummaryBatches::default();
        for (batch, context, outcome) in outcomes {
            match outcome {
                Ok((records, skipped)) => {
                    for skip in &skipped {
                        log_skip(skip);
                    }
                    result.records.extend(records);
                    result.skipped.extend(skipped);
                }
                Err(err) => {
                    warn!("Giving up on {context}: {err}");
                    result.failed.extend(batch.iter().cloned());
                }
            }
        }
        result
    }
}

fn log_skip(skip: &SkippedRecord) {
    match &skip.reason {
        SkipReason::Fault(fault) => warn!("Skipping record {}: {fault}", skip.key),
        SkipReason::Retired {
            status,
            replaced_by: Some(replacement),
        } => warn!(
            "Skipping accession {}: record is {status}, replaced by {replacement}",
            skip.key
        ),
        SkipReason::Retired {
            status,
            replaced_by: None,
        } => warn!("Skipping accession {}: record is {status}", skip.key),
        SkipReason::ServiceError { message } => {
            warn!("Skipping record {}: service reported {message:?}", skip.key)
        }
    }
}

pub(crate) fn join_ids(batch: &[Identifier]) -> String {
    batch
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Applies `work` to each chunk of `items`, on a pool of `jobs` threads when
/// more than one is allowed. Results come back in chunk order.
pub(crate) fn run_batches<'i, I, R, F>(
    items: &'i [I],
    batch_size: usize,
    jobs: usize,
    work: F,
) -> Vec<R>
where
    I: Sync,
    R: Send,
    F: Fn(usize, &'i [I]) -> R + Sync,
{
    let chunks: Vec<&'i [I]> = items.chunks(batch_size.max(1)).collect();
    if jobs <= 1 || chunks.len() <= 1 {
        return chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| work(index, chunk))
            .collect();
    }

    let pool = match ThreadPoolBuilder::new().num_threads(jobs).build() {
        Ok(pool) => pool,
        Err(err) => {
            warn!("could not start {jobs} workers, fetching batches one by one: {err}");
            return chunks
                .into_iter()
                .enumerate()
                .map(|(index, chunk)| work(index, chunk))
                .collect();
        }
    };

    let finished = Mutex::new(Vec::with_capacity(chunks.len()));
    pool.install(|| {
        chunks.par_iter().enumerate().for_each(|(index, chunk)| {
            let outcome = work(index, *chunk);
            finished
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((index, outcome));
        });
    });
    let mut finished = finished
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    finished.sort_by_key(|(index, _)| *index);
    finished.into_iter().map(|(_, outcome)| outcome).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub count: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    esearchresult: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(default, rename = "ERROR")]
    error: Option<String>,
}

pub fn parse_search(body: &str) -> Result<SearchPage, TransportError> {
    let envelope: SearchEnvelope = serde_json::from_str(body)
        .map_err(|err| TransportError::Malformed(format!("esearch response: {err}")))?;
    let result = envelope.esearchresult;
    if let Some(error) = result.error {
        return Err(TransportError::Malformed(format!("esearch error: {error}")));
    }
    let count = match result.count {
        Some(count) => count
            .trim()
            .parse::<usize>()
            .map_err(|_| TransportError::Malformed(format!("esearch count {count:?}")))?,
        None => result.idlist.len(),
    };
    Ok(SearchPage {
        count,
        ids: result.idlist,
    })
}

/// Splits a FASTA payload into records keyed by the first header token. Only a
/// `>` at the start of a line opens a record; one inside a description does not.
pub fn parse_fasta(body: &str) -> Result<Vec<SequenceRecord>, TransportError> {
    let trimmed = body.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if !trimmed.starts_with('>') {
        return Err(TransportError::Malformed(
            "sequence payload does not start with a FASTA header".to_string(),
        ));
    }

    let mut records = Vec::new();
    let mut current: Option<SequenceRecord> = None;
    for line in trimmed.lines() {
        if let Some(header) = line.strip_prefix('>') {
            records.extend(current.take());
            let header = header.trim();
            let (accession, description) = header
                .split_once(char::is_whitespace)
                .map(|(accession, rest)| (accession, rest.trim()))
                .unwrap_or((header, ""));
            if accession.is_empty() {
                warn!("Skipping FASTA block without an accession in its header");
                continue;
            }
            current = Some(SequenceRecord {
                accession: accession.to_string(),
                description: description.to_string(),
                sequence: String::new(),
            });
        } else if let Some(record) = current.as_mut() {
            record.sequence.extend(
                line.chars()
                    .filter(|ch| !ch.is_whitespace())
                    .map(|ch| ch.to_ascii_uppercase()),
            );
        }
    }
    records.extend(current);
    Ok(records)
}

/// Reads an esummary JSON document. Broken entries become [`SkippedRecord`]s
/// instead of failing the whole batch.
pub fn parse_summaries(
    body: &str,
) -> Result<(Vec<SummaryRecord>, Vec<SkippedRecord>), TransportError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| TransportError::Malformed(format!("esummary response: {err}")))?;

    let Some(result) = value.get("result").and_then(Value::as_object) else {
        // e.g. {"esummaryresult": ["Invalid uid ..."]} when nothing in the batch exists
        if let Some(messages) = value.get("esummaryresult").and_then(Value::as_array) {
            let messages: Vec<&str> = messages.iter().filter_map(Value::as_str).collect();
            warn!("esummary returned no documents: {}", messages.join("; "));
            return Ok((Vec::new(), Vec::new()));
        }
        return Err(TransportError::Malformed(
            "esummary response has no result".to_string(),
        ));
    };

    let uids: Vec<String> = result
        .get("uids")
        .and_then(Value::as_array)
        .map(|uids| {
            uids.iter()
                .filter_map(|uid| match uid {
                    Value::String(uid) => Some(uid.clone()),
                    Value::Number(uid) => Some(uid.to_string()),
                    _ => None,
                })
                .collect()
        })
        .ok_or_else(|| TransportError::Malformed("esummary result has no uids".to_string()))?;

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for uid in uids {
        let Some(doc) = result.get(&uid) else {
            skipped.push(SkippedRecord {
                key: uid.clone(),
                uid,
                reason: SkipReason::Fault(RecordFault::missing("document")),
            });
            continue;
        };
        match read_summary(&uid, doc) {
            Ok(record) => records.push(record),
            Err(skip) => skipped.push(skip),
        }
    }
    Ok((records, skipped))
}

fn read_summary(uid: &str, doc: &Value) -> Result<SummaryRecord, SkippedRecord> {
    let accession = doc
        .get("accessionversion")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|accession| !accession.is_empty());
    let key = accession.unwrap_or(uid).to_string();
    let skip = |reason| SkippedRecord {
        key: key.clone(),
        uid: uid.to_string(),
        reason,
    };

    if let Some(message) = doc.get("error").and_then(Value::as_str) {
        return Err(skip(SkipReason::ServiceError {
            message: message.to_string(),
        }));
    }
    let Some(accession) = accession else {
        return Err(skip(SkipReason::Fault(RecordFault::missing(
            "accessionversion",
        ))));
    };

    if let Some(status) = doc.get("status").and_then(Value::as_str) {
        if !status.eq_ignore_ascii_case("live") {
            let replaced_by = doc
                .get("replacedby")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|replacement| !replacement.is_empty())
                .map(str::to_string);
            return Err(skip(SkipReason::Retired {
                status: status.to_string(),
                replaced_by,
            }));
        }
    }

    let taxid = match doc.get("taxid") {
        None | Some(Value::Null) => Err(RecordFault::missing("taxid")),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(TaxonomyId::new)
            .ok_or_else(|| RecordFault::wrong_type("taxid", number.to_string())),
        Some(Value::String(text)) => text
            .parse::<TaxonomyId>()
            .map_err(|_| RecordFault::wrong_type("taxid", text.clone())),
        Some(other) => Err(RecordFault::wrong_type("taxid", other.to_string())),
    }
    .map_err(|fault| skip(SkipReason::Fault(fault)))?;

    Ok(SummaryRecord {
        uid: uid.to_string(),
        accession: accession.to_string(),
        taxid,
    })
}
