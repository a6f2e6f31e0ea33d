//! Taxonomy lookups against `efetch db=taxonomy`.
//!
//! Each requested taxid becomes a [`Lineage`], or a [`TaxidFailure`] that says
//! why it could not. Ids that NCBI merged into another taxon come back as the
//! surviving record with the old id listed under `AkaTaxIds`, so one fetch of
//! the requested ids already holds every redirect target. Those pairs form a
//! redirect table that is walked with a hop limit.

use std::collections::{HashMap, HashSet};
use std::fmt;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{Lineage, TaxonomyId, is_unranked};
use crate::fetcher::{RecordFault, run_batches};
use crate::retry::RetryingClient;
use crate::transport::{Endpoint, EutilsRequest, Transport, TransportError};

/// Longest chain of merged-id redirections that will be followed.
pub const MAX_REDIRECT_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonRecord {
    pub lineage: Lineage,
    /// Former ids that now point at this taxon.
    pub aka: Vec<TaxonomyId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonFault {
    /// `TaxId` text exactly as received, `"?"` when absent.
    pub raw_taxid: String,
    pub taxid: Option<TaxonomyId>,
    /// Former ids listed on the broken record, so they share its fault.
    pub aka: Vec<TaxonomyId>,
    pub fault: RecordFault,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTaxa {
    pub records: Vec<TaxonRecord>,
    pub faults: Vec<TaxonFault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxidFailure {
    Fault(RecordFault),
    NotFound,
    BatchFailed,
    RedirectCycle,
    RedirectTooDeep,
}

impl fmt::Display for TaxidFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaxidFailure::Fault(fault) => write!(f, "{fault}"),
            TaxidFailure::NotFound => write!(f, "not found"),
            TaxidFailure::BatchFailed => write!(f, "request failed"),
            TaxidFailure::RedirectCycle => write!(f, "merged-id redirects form a cycle"),
            TaxidFailure::RedirectTooDeep => write!(
                f,
                "more than {MAX_REDIRECT_DEPTH} merged-id redirects"
            ),
        }
    }
}

/// Outcome for every requested taxid: exactly one of the two maps holds it.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub lineages: HashMap<TaxonomyId, Lineage>,
    pub failures: HashMap<TaxonomyId, TaxidFailure>,
}

#[derive(Debug, Default)]
struct Lookup {
    records: HashMap<TaxonomyId, Lineage>,
    faults: HashMap<TaxonomyId, RecordFault>,
    redirects: HashMap<TaxonomyId, TaxonomyId>,
    failed: HashSet<TaxonomyId>,
}

impl Lookup {
    fn absorb(&mut self, parsed: ParsedTaxa) {
        for record in parsed.records {
            for old in &record.aka {
                if *old != record.lineage.taxid {
                    self.redirects.insert(*old, record.lineage.taxid);
                }
            }
            self.records.insert(record.lineage.taxid, record.lineage);
        }
        for fault in parsed.faults {
            let Some(taxid) = fault.taxid else {
                continue;
            };
            for old in &fault.aka {
                if *old != taxid {
                    self.redirects.insert(*old, taxid);
                }
            }
            self.faults.insert(taxid, fault.fault);
        }
    }

    fn walk(&self, start: TaxonomyId) -> Result<&Lineage, TaxidFailure> {
        let mut current = start;
        let mut visited = HashSet::from([start]);
        for _ in 0..=MAX_REDIRECT_DEPTH {
            if let Some(lineage) = self.records.get(&current) {
                return Ok(lineage);
            }
            if let Some(fault) = self.faults.get(&current) {
                return Err(TaxidFailure::Fault(fault.clone()));
            }
            match self.redirects.get(&current) {
                Some(next) => {
                    if !visited.insert(*next) {
                        return Err(TaxidFailure::RedirectCycle);
                    }
                    current = *next;
                }
                None if self.failed.contains(&current) => return Err(TaxidFailure::BatchFailed),
                None => return Err(TaxidFailure::NotFound),
            }
        }
        Err(TaxidFailure::RedirectTooDeep)
    }
}

pub struct TaxonomyResolver<'a, T> {
    client: &'a RetryingClient<T>,
    batch_size: usize,
    jobs: usize,
}

impl<'a, T: Transport> TaxonomyResolver<'a, T> {
    pub fn new(client: &'a RetryingClient<T>, batch_size: usize, jobs: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            jobs: jobs.max(1),
        }
    }

    pub fn resolve(&self, taxids: &[TaxonomyId]) -> Resolution {
        let mut requested: Vec<TaxonomyId> = Vec::with_capacity(taxids.len());
        let mut seen = HashSet::new();
        for taxid in taxids {
            if seen.insert(*taxid) {
                requested.push(*taxid);
            }
        }

        debug!("fetching {} taxids", requested.len());
        let mut lookup = Lookup::default();
        self.fetch(&requested, &mut lookup);

        let mut resolution = Resolution::default();
        for taxid in requested {
            match lookup.walk(taxid) {
                Ok(lineage) => {
                    if lineage.taxid != taxid {
                        debug!("taxid {taxid} was merged into {}", lineage.taxid);
                    }
                    resolution.lineages.insert(taxid, lineage.clone());
                }
                Err(failure) => {
                    // record-level faults were already reported while parsing
                    if !matches!(failure, TaxidFailure::Fault(_)) {
                        warn!("Could not resolve taxid {taxid}: {failure}");
                    }
                    resolution.failures.insert(taxid, failure);
                }
            }
        }
        resolution
    }

    fn fetch(&self, taxids: &[TaxonomyId], lookup: &mut Lookup) {
        let outcomes = run_batches(taxids, self.batch_size, self.jobs, |index, batch| {
            let ids = batch
                .iter()
                .map(|taxid| taxid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let request = EutilsRequest::post(Endpoint::Fetch)
                .param("db", "taxonomy")
                .param("id", ids)
                .param("retmode", "xml");
            let context = format!("taxonomy batch {} ({} taxids)", index + 1, batch.len());
            (batch, context.clone(), self.client.execute(&context, &request, parse_taxa))
        });

        for (batch, context, outcome) in outcomes {
            match outcome {
                Ok(parsed) => {
                    for fault in &parsed.faults {
                        warn!("Skipping taxid {}: {}", fault.raw_taxid, fault.fault);
                    }
                    lookup.absorb(parsed);
                }
                Err(err) => {
                    warn!("Giving up on {context}: {err}");
                    lookup.failed.extend(batch.iter().copied());
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct RawNode {
    taxid: Option<String>,
    name: Option<String>,
    rank: Option<String>,
}

#[derive(Debug, Default)]
struct RawTaxon {
    node: RawNode,
    division: Option<String>,
    lineage: Option<Vec<RawNode>>,
    aka: Vec<String>,
}

/// Parses a `<TaxaSet>` document. Only a broken document is an error; a
/// broken `<Taxon>` becomes a [`TaxonFault`].
pub fn parse_taxa(body: &str) -> Result<ParsedTaxa, TransportError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut current: Option<RawTaxon> = None;
    let mut raw_taxa = Vec::new();

    loop {
        let event = reader.read_event().map_err(|err| {
            TransportError::Malformed(format!(
                "taxonomy XML at byte {}: {err}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                path.push(name);
                open_element(&path, &mut current, &mut saw_root);
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                path.push(name);
                open_element(&path, &mut current, &mut saw_root);
                close_element(&path, &mut current, &mut raw_taxa);
                path.pop();
            }
            Event::End(_) => {
                close_element(&path, &mut current, &mut raw_taxa);
                path.pop();
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|err| {
                    TransportError::Malformed(format!("taxonomy XML text: {err}"))
                })?;
                store_text(&path, &mut current, text.trim());
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                store_text(&path, &mut current, text.trim());
            }
            Event::Eof => {
                if let Some(open) = path.last() {
                    return Err(TransportError::Malformed(format!(
                        "taxonomy XML ends inside <{open}>"
                    )));
                }
                break;
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(TransportError::Malformed(
            "taxonomy response has no TaxaSet".to_string(),
        ));
    }

    let mut parsed = ParsedTaxa::default();
    for raw in raw_taxa {
        match build_record(raw) {
            Ok(record) => parsed.records.push(record),
            Err(fault) => parsed.faults.push(fault),
        }
    }
    Ok(parsed)
}

fn path_is(path: &[String], expected: &[&str]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a == b)
}

fn open_element(path: &[String], current: &mut Option<RawTaxon>, saw_root: &mut bool) {
    if path_is(path, &["TaxaSet"]) {
        *saw_root = true;
    } else if path_is(path, &["TaxaSet", "Taxon"]) {
        *current = Some(RawTaxon::default());
    } else if let Some(taxon) = current.as_mut() {
        if path_is(path, &["TaxaSet", "Taxon", "LineageEx"]) {
            taxon.lineage.get_or_insert_with(Vec::new);
        } else if path_is(path, &["TaxaSet", "Taxon", "LineageEx", "Taxon"]) {
            taxon
                .lineage
                .get_or_insert_with(Vec::new)
                .push(RawNode::default());
        }
    }
}

fn close_element(path: &[String], current: &mut Option<RawTaxon>, raw_taxa: &mut Vec<RawTaxon>) {
    if path_is(path, &["TaxaSet", "Taxon"]) {
        if let Some(taxon) = current.take() {
            raw_taxa.push(taxon);
        }
    }
}

fn store_text(path: &[String], current: &mut Option<RawTaxon>, text: &str) {
    let Some(taxon) = current.as_mut() else {
        return;
    };
    if text.is_empty() || path.len() < 3 {
        return;
    }
    let value = Some(text.to_string());
    match (path.len(), path[2].as_str()) {
        (3, "TaxId") => taxon.node.taxid = value,
        (3, "ScientificName") => taxon.node.name = value,
        (3, "Rank") => taxon.node.rank = value,
        (3, "Division") => taxon.division = value,
        (4, "AkaTaxIds") if path[3] == "TaxId" => taxon.aka.push(text.to_string()),
        (5, "LineageEx") if path[3] == "Taxon" => {
            if let Some(node) = taxon.lineage.as_mut().and_then(|nodes| nodes.last_mut()) {
                match path[4].as_str() {
                    "TaxId" => node.taxid = value,
                    "ScientificName" => node.name = value,
                    "Rank" => node.rank = value,
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn build_record(raw: RawTaxon) -> Result<TaxonRecord, TaxonFault> {
    let raw_taxid = raw.node.taxid.clone().unwrap_or_else(|| "?".to_string());
    let parsed_taxid = raw
        .node
        .taxid
        .as_deref()
        .and_then(|text| text.parse::<TaxonomyId>().ok());
    let known_aka: Vec<TaxonomyId> = raw
        .aka
        .iter()
        .filter_map(|text| text.parse::<TaxonomyId>().ok())
        .collect();
    let fault = |fault: RecordFault| TaxonFault {
        raw_taxid: raw_taxid.clone(),
        taxid: parsed_taxid,
        aka: known_aka.clone(),
        fault,
    };

    let taxid = match raw.node.taxid.as_deref() {
        None => return Err(fault(RecordFault::missing("TaxId"))),
        Some(text) => parsed_taxid.ok_or_else(|| fault(RecordFault::wrong_type("TaxId", text)))?,
    };
    let scientific_name = raw
        .node
        .name
        .ok_or_else(|| fault(RecordFault::missing("ScientificName")))?;
    let rank = raw
        .node
        .rank
        .ok_or_else(|| fault(RecordFault::missing("Rank")))?;
    let nodes = raw
        .lineage
        .ok_or_else(|| fault(RecordFault::missing("LineageEx")))?;

    let mut ancestors = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Some(text) = node.taxid.as_deref() {
            if text.parse::<TaxonomyId>().is_err() {
                return Err(fault(RecordFault::wrong_type("LineageEx/TaxId", text)));
            }
        }
        let name = node
            .name
            .ok_or_else(|| fault(RecordFault::missing("LineageEx/ScientificName")))?;
        let node_rank = node
            .rank
            .ok_or_else(|| fault(RecordFault::missing("LineageEx/Rank")))?;
        if !is_unranked(&node_rank) {
            ancestors.push((node_rank, name));
        }
    }

    let aka = raw
        .aka
        .iter()
        .map(|text| {
            text.parse::<TaxonomyId>()
                .map_err(|_| fault(RecordFault::wrong_type("AkaTaxIds/TaxId", text.as_str())))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TaxonRecord {
        lineage: Lineage {
            taxid,
            ancestors,
            scientific_name,
            rank,
            division: raw.division,
        },
        aka,
    })
}
