use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Settings, normalize_ranks};
use crate::domain::{Identifier, Lineage, Query, SequenceRecord, TaxonomyId, unversioned};
use crate::error::SeqTaxError;
use crate::fetcher::{BatchFetcher, SequenceBatches, SkipReason, SummaryBatches, SummaryRecord};
use crate::lineage::format_lineage;
use crate::retry::RetryingClient;
use crate::taxonomy::{Resolution, TaxidFailure, TaxonomyResolver};
use crate::transport::Transport;
use crate::validate::validate_identifiers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Accessions(Vec<String>),
    Query(Query),
}

#[derive(Debug, Clone)]
pub struct DataRequest {
    pub source: Source,
    /// Falls back to the configured ranks.
    pub ranks: Option<Vec<String>>,
    /// Falls back to the configured setting.
    pub rank_propagation: Option<bool>,
}

impl DataRequest {
    /// Exactly one of `accession_ids` and `query` must be given.
    pub fn new(
        accession_ids: Option<Vec<String>>,
        query: Option<&str>,
    ) -> Result<Self, SeqTaxError> {
        let source = match (accession_ids, query) {
            (Some(_), Some(_)) => {
                return Err(SeqTaxError::Usage(
                    "accession ids and a query cannot be combined".to_string(),
                ));
            }
            (None, None) => {
                return Err(SeqTaxError::Usage(
                    "either accession ids or a query is required".to_string(),
                ));
            }
            (Some(ids), None) => Source::Accessions(ids),
            (None, Some(query)) => Source::Query(query.parse()?),
        };
        Ok(Self {
            source,
            ranks: None,
            rank_propagation: None,
        })
    }

    pub fn with_ranks(mut self, ranks: Vec<String>) -> Self {
        self.ranks = Some(ranks);
        self
    }

    pub fn with_rank_propagation(mut self, propagate: bool) -> Self {
        self.rank_propagation = Some(propagate);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    ResolvingIds,
    FetchingSequences,
    FetchingTaxonomy,
    Formatting,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "Validating",
            Stage::ResolvingIds => "ResolvingIds",
            Stage::FetchingSequences => "FetchingSequences",
            Stage::FetchingTaxonomy => "FetchingTaxonomy",
            Stage::Formatting => "Formatting",
            Stage::Done => "Done",
            Stage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Discards progress events.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Sequences and taxonomy strings keyed by accession. Both maps are only
/// ever written together, so they always hold the same keys in the same
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    sequences: IndexMap<String, SequenceRecord>,
    taxonomy: IndexMap<String, String>,
}

impl ResultSet {
    pub fn insert(&mut self, record: SequenceRecord, taxonomy: String) {
        let accession = record.accession.clone();
        self.taxonomy.insert(accession.clone(), taxonomy);
        self.sequences.insert(accession, record);
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn contains(&self, accession: &str) -> bool {
        self.sequences.contains_key(accession)
    }

    pub fn accessions(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }

    pub fn sequence(&self, accession: &str) -> Option<&SequenceRecord> {
        self.sequences.get(accession)
    }

    pub fn taxonomy(&self, accession: &str) -> Option<&str> {
        self.taxonomy.get(accession).map(String::as_str)
    }

    pub fn sequences(&self) -> impl Iterator<Item = (&str, &SequenceRecord)> {
        self.sequences
            .iter()
            .map(|(accession, record)| (accession.as_str(), record))
    }

    pub fn taxonomies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.taxonomy
            .iter()
            .map(|(accession, taxonomy)| (accession.as_str(), taxonomy.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    InvalidIdentifier,
    /// Resolved to an accession that an earlier input already returned.
    Duplicate { accession: String },
    BatchFailed { stage: Stage },
    NotReturned { stage: Stage },
    Skipped(SkipReason),
    ProblematicTaxid {
        taxid: TaxonomyId,
        failure: TaxidFailure,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::InvalidIdentifier => write!(f, "invalid identifier"),
            DropReason::Duplicate { accession } => write!(f, "same record as {accession}"),
            DropReason::BatchFailed { stage } => write!(f, "request failed during {stage}"),
            DropReason::NotReturned { stage } => write!(f, "not returned during {stage}"),
            DropReason::Skipped(SkipReason::Fault(fault)) => write!(f, "{fault}"),
            DropReason::Skipped(SkipReason::Retired { status, .. }) => {
                write!(f, "record is {status}")
            }
            DropReason::Skipped(SkipReason::ServiceError { message }) => {
                write!(f, "service error: {message}")
            }
            DropReason::ProblematicTaxid { taxid, failure } => {
                write!(f, "taxid {taxid}: {failure}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedId {
    pub id: String,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    /// Distinct valid ids plus every rejected entry; always `returned + dropped.len()`.
    pub requested: usize,
    pub returned: usize,
    pub dropped: Vec<DroppedId>,
    /// RFC 3339 timestamp.
    pub completed_at: String,
}

impl FetchReport {
    pub fn reason_for(&self, id: &str) -> Option<&DropReason> {
        self.dropped
            .iter()
            .find(|dropped| dropped.id == id)
            .map(|dropped| &dropped.reason)
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub results: ResultSet,
    pub report: FetchReport,
}

pub struct App<T: Transport> {
    settings: Settings,
    client: RetryingClient<T>,
}

impl<T: Transport> App<T> {
    pub fn new(settings: Settings, transport: T) -> Self {
        let client = RetryingClient::new(transport, settings.retry.clone());
        Self { settings, client }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Fetches sequences and taxonomy strings for the requested records.
    /// Records that cannot be completed are dropped and listed in the report;
    /// only bad input or a failed search is an error.
    pub fn get_data(
        &self,
        request: DataRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchOutcome, SeqTaxError> {
        let started = Instant::now();
        let result = self.run(request, sink, started);
        match &result {
            Ok(outcome) => {
                info!(
                    "Fetched {} of {} records ({} dropped)",
                    outcome.report.returned,
                    outcome.report.requested,
                    outcome.report.dropped.len()
                );
                emit(sink, Stage::Done, started, format!("{} records", outcome.results.len()));
            }
            Err(err) => emit(sink, Stage::Failed, started, err.to_string()),
        }
        result
    }

    fn run(
        &self,
        request: DataRequest,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<FetchOutcome, SeqTaxError> {
        let ranks = match request.ranks {
            Some(ranks) => normalize_ranks(ranks)?,
            None => self.settings.ranks.clone(),
        };
        let propagate = request
            .rank_propagation
            .unwrap_or(self.settings.rank_propagation);

        let fetcher = BatchFetcher::new(
            &self.client,
            self.settings.database,
            self.settings.batch_size,
            self.settings.jobs,
        );

        let mut dropped = Vec::new();
        let (requested, ids) = match request.source {
            Source::Accessions(raw) => {
                emit(sink, Stage::Validating, started, format!("{} ids", raw.len()));
                let validated = validate_identifiers(&raw)?;
                let requested = validated.valid.len() + validated.invalid.len();
                dropped.extend(validated.invalid.into_iter().map(|id| DroppedId {
                    id,
                    reason: DropReason::InvalidIdentifier,
                }));
                (requested, validated.valid)
            }
            Source::Query(query) => {
                emit(sink, Stage::Validating, started, format!("query {query}"));
                emit(sink, Stage::ResolvingIds, started, format!("searching {query}"));
                let found = fetcher.search_ids(&query)?;
                if found.is_empty() {
                    return Err(SeqTaxError::EmptySearch(query.to_string()));
                }
                debug!("search {query:?} matched {} records", found.len());
                let validated = validate_identifiers(&found)?;
                let requested = validated.valid.len() + validated.invalid.len();
                dropped.extend(validated.invalid.into_iter().map(|id| DroppedId {
                    id,
                    reason: DropReason::InvalidIdentifier,
                }));
                (requested, validated.valid)
            }
        };

        emit(
            sink,
            Stage::FetchingSequences,
            started,
            format!("{} ids in batches of {}", ids.len(), self.settings.batch_size),
        );
        let sequences = fetcher.fetch_sequences(&ids);

        emit(sink, Stage::FetchingTaxonomy, started, format!("{} ids", ids.len()));
        let summaries = fetcher.fetch_taxonomy_ids(&ids);
        let mut taxids: Vec<TaxonomyId> = summaries.records.iter().map(|s| s.taxid).collect();
        taxids.sort_unstable();
        taxids.dedup();
        let resolution = TaxonomyResolver::new(
            &self.client,
            self.settings.taxonomy_batch_size,
            self.settings.jobs,
        )
        .resolve(&taxids);

        emit(sink, Stage::Formatting, started, format!("{} ranks", ranks.len()));
        let collected = Collected::new(&sequences, &summaries, &resolution);

        let mut results = ResultSet::default();
        let mut problematic: Vec<String> = Vec::new();
        for id in &ids {
            match collected.assemble(id) {
                Ok((record, lineage)) => {
                    if results.contains(&record.accession) {
                        debug!("{id} repeats accession {}", record.accession);
                        dropped.push(DroppedId {
                            id: id.to_string(),
                            reason: DropReason::Duplicate {
                                accession: record.accession.clone(),
                            },
                        });
                        continue;
                    }
                    let taxonomy = format_lineage(lineage, &ranks, propagate);
                    results.insert(record.clone(), taxonomy);
                }
                Err(reason) => {
                    match &reason {
                        DropReason::ProblematicTaxid { .. } => {
                            let accession = collected
                                .summary(id)
                                .map(|summary| summary.accession.clone())
                                .unwrap_or_else(|| id.to_string());
                            problematic.push(accession);
                        }
                        DropReason::NotReturned { stage } => {
                            warn!("Dropping {id}: nothing returned during {stage}");
                        }
                        _ => {}
                    }
                    dropped.push(DroppedId {
                        id: id.to_string(),
                        reason,
                    });
                }
            }
        }

        if !problematic.is_empty() {
            warn!(
                "Dropped {} accession(s) with problematic taxids: {}",
                problematic.len(),
                problematic.join(", ")
            );
        }

        let returned = results.len();
        Ok(FetchOutcome {
            results,
            report: FetchReport {
                requested,
                returned,
                dropped,
                completed_at: chrono::Utc::now().to_rfc3339(),
            },
        })
    }
}

fn emit(sink: &dyn ProgressSink, stage: Stage, started: Instant, message: String) {
    debug!("stage={stage}; {message}");
    sink.event(ProgressEvent {
        stage,
        message,
        elapsed: Some(started.elapsed()),
    });
}

/// Finds the returned record an input id refers to: by exact accession, by
/// UID, or by accession without its version.
struct AccessionIndex<'a> {
    exact: HashMap<&'a str, usize>,
    unversioned: HashMap<&'a str, usize>,
}

impl<'a> AccessionIndex<'a> {
    fn new(keys: impl Iterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let mut exact = HashMap::new();
        let mut by_base = HashMap::new();
        for (index, (accession, uid)) in keys.enumerate() {
            exact.entry(accession).or_insert(index);
            if let Some(uid) = uid {
                exact.entry(uid).or_insert(index);
            }
            by_base.entry(unversioned(accession)).or_insert(index);
        }
        Self {
            exact,
            unversioned: by_base,
        }
    }

    fn find(&self, id: &Identifier) -> Option<usize> {
        self.exact
            .get(id.as_str())
            .or_else(|| self.unversioned.get(id.as_str()))
            .copied()
    }
}

/// Everything fetched for one run, looked up per input id.
struct Collected<'r> {
    sequences: &'r SequenceBatches,
    summaries: &'r SummaryBatches,
    resolution: &'r Resolution,
    sequence_index: AccessionIndex<'r>,
    summary_index: AccessionIndex<'r>,
    skip_index: AccessionIndex<'r>,
    failed_sequences: HashSet<&'r Identifier>,
    failed_summaries: HashSet<&'r Identifier>,
}

impl<'r> Collected<'r> {
    fn new(
        sequences: &'r SequenceBatches,
        summaries: &'r SummaryBatches,
        resolution: &'r Resolution,
    ) -> Self {
        Self {
            sequences,
            summaries,
            resolution,
            sequence_index: AccessionIndex::new(
                sequences
                    .records
                    .iter()
                    .map(|record| (record.accession.as_str(), None)),
            ),
            summary_index: AccessionIndex::new(
                summaries
                    .records
                    .iter()
                    .map(|summary| (summary.accession.as_str(), Some(summary.uid.as_str()))),
            ),
            skip_index: AccessionIndex::new(
                summaries
                    .skipped
                    .iter()
                    .map(|skip| (skip.key.as_str(), Some(skip.uid.as_str()))),
            ),
            failed_sequences: sequences.failed.iter().collect(),
            failed_summaries: summaries.failed.iter().collect(),
        }
    }

    fn summary(&self, id: &Identifier) -> Option<&'r SummaryRecord> {
        self.summary_index
            .find(id)
            .map(|index| &self.summaries.records[index])
    }

    fn assemble(&self, id: &Identifier) -> Result<(&'r SequenceRecord, &'r Lineage), DropReason> {
        if self.failed_sequences.contains(id) {
            return Err(DropReason::BatchFailed {
                stage: Stage::FetchingSequences,
            });
        }
        if self.failed_summaries.contains(id) {
            return Err(DropReason::BatchFailed {
                stage: Stage::FetchingTaxonomy,
            });
        }

        let Some(summary) = self.summary(id) else {
            if let Some(index) = self.skip_index.find(id) {
                return Err(DropReason::Skipped(
                    self.summaries.skipped[index].reason.clone(),
                ));
            }
            return Err(DropReason::NotReturned {
                stage: Stage::FetchingTaxonomy,
            });
        };

        let record = self
            .sequence_index
            .find(id)
            .or_else(|| {
                self.sequence_index
                    .exact
                    .get(summary.accession.as_str())
                    .copied()
            })
            .map(|index| &self.sequences.records[index])
            .ok_or(DropReason::NotReturned {
                stage: Stage::FetchingSequences,
            })?;

        match self.resolution.lineages.get(&summary.taxid) {
            Some(lineage) => Ok((record, lineage)),
            None => Err(DropReason::ProblematicTaxid {
                taxid: summary.taxid,
                failure: self
                    .resolution
                    .failures
                    .get(&summary.taxid)
                    .cloned()
                    .unwrap_or(TaxidFailure::NotFound),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn request_needs_exactly_one_source() {
        assert_matches!(DataRequest::new(None, None), Err(SeqTaxError::Usage(_)));
        assert_matches!(
            DataRequest::new(Some(vec!["MT345279.1".to_string()]), Some("Boletus")),
            Err(SeqTaxError::Usage(_))
        );
        assert_matches!(DataRequest::new(None, Some("  ")), Err(SeqTaxError::Usage(_)));
        let request = DataRequest::new(None, Some("Boletus edulis[ORGN]")).unwrap();
        assert_matches!(request.source, Source::Query(_));
    }

    #[test]
    fn result_set_keeps_both_sides_aligned() {
        let mut results = ResultSet::default();
        for accession in ["B00002.1", "A00001.1"] {
            results.insert(
                SequenceRecord {
                    accession: accession.to_string(),
                    description: String::new(),
                    sequence: "ACGT".to_string(),
                },
                format!("g__{accession}"),
            );
        }
        let sequence_keys: Vec<&str> = results.sequences().map(|(key, _)| key).collect();
        let taxonomy_keys: Vec<&str> = results.taxonomies().map(|(key, _)| key).collect();
        assert_eq!(sequence_keys, vec!["B00002.1", "A00001.1"]);
        assert_eq!(sequence_keys, taxonomy_keys);
        assert_eq!(results.taxonomy("A00001.1"), Some("g__A00001.1"));
    }

    #[test]
    fn index_matches_uid_and_unversioned_accession() {
        let index = AccessionIndex::new(
            [("MT345279.1", Some("1843453260")), ("JQ430715.1", None)].into_iter(),
        );
        let by_uid: Identifier = "1843453260".parse().unwrap();
        let by_base: Identifier = "JQ430715".parse().unwrap();
        let missing: Identifier = "AB000001.1".parse().unwrap();
        assert_eq!(index.find(&by_uid), Some(0));
        assert_eq!(index.find(&by_base), Some(1));
        assert_eq!(index.find(&missing), None);
    }
}
