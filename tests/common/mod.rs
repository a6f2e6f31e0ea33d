#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tracing_subscriber::fmt::MakeWriter;

use ncbi_seqtax::config::Settings;
use ncbi_seqtax::domain::unversioned;
use ncbi_seqtax::retry::RetryPolicy;
use ncbi_seqtax::transport::{Endpoint, EutilsRequest, RawResponse, Transport, TransportError};

const FIXTURES: &str = "tests/fixtures";

/// What the next matching call returns instead of recorded data.
#[derive(Debug, Clone)]
pub enum Injected {
    Status(u16, String),
    Body(String),
    Error(TransportError),
}

/// Serves E-utilities responses assembled from the recorded records under
/// `tests/fixtures`, so any batch size produces consistent answers.
pub struct RecordedTransport {
    sequences: HashMap<String, String>,
    summaries: Vec<Value>,
    searches: HashMap<String, Vec<String>>,
    taxa: HashMap<String, String>,
    injected: Mutex<VecDeque<(Endpoint, Option<String>, Injected)>>,
    broken_ids: Mutex<HashSet<String>>,
    calls: Mutex<Vec<EutilsRequest>>,
}

impl RecordedTransport {
    pub fn from_fixtures() -> Self {
        let fasta = fs::read_to_string(format!("{FIXTURES}/sequences.fasta")).unwrap();
        let sequences = fasta
            .split('>')
            .filter(|block| !block.trim().is_empty())
            .map(|block| {
                let accession = block.split_whitespace().next().unwrap().to_string();
                (accession, format!(">{block}"))
            })
            .collect();

        let summaries: HashMap<String, Value> = serde_json::from_str(
            &fs::read_to_string(format!("{FIXTURES}/summaries.json")).unwrap(),
        )
        .unwrap();
        let mut summaries: Vec<Value> = summaries.into_values().collect();
        summaries.sort_by_key(|doc| doc["accessionversion"].as_str().unwrap_or("").to_string());

        let searches = serde_json::from_str(
            &fs::read_to_string(format!("{FIXTURES}/search.json")).unwrap(),
        )
        .unwrap();

        let mut taxa = HashMap::new();
        for entry in fs::read_dir(format!("{FIXTURES}/taxonomy")).unwrap() {
            let path = entry.unwrap().path();
            let taxid = path.file_stem().unwrap().to_string_lossy().into_owned();
            taxa.insert(taxid, fs::read_to_string(&path).unwrap());
        }

        Self {
            sequences,
            summaries,
            searches,
            taxa,
            injected: Mutex::new(VecDeque::new()),
            broken_ids: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues a one-off answer for the next call to `endpoint`.
    pub fn inject(&self, endpoint: Endpoint, injected: Injected) {
        self.injected
            .lock()
            .unwrap()
            .push_back((endpoint, None, injected));
    }

    /// Like [`inject`](Self::inject), but only for calls against database `db`.
    pub fn inject_db(&self, endpoint: Endpoint, db: &str, injected: Injected) {
        self.injected
            .lock()
            .unwrap()
            .push_back((endpoint, Some(db.to_string()), injected));
    }

    /// Every request mentioning `id` fails with a 503 from now on.
    pub fn break_id(&self, id: &str) {
        self.broken_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<EutilsRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, endpoint: Endpoint) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .count()
    }

    fn respond(
        &self,
        request: EutilsRequest,
    ) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());

        {
            let mut injected = self.injected.lock().unwrap();
            if let Some(position) = injected.iter().position(|(endpoint, db, _)| {
                *endpoint == request.endpoint
                    && db.as_deref().is_none_or(|db| request.value("db") == Some(db))
            }) {
                let (_, _, answer) = injected.remove(position).unwrap();
                return match answer {
                    Injected::Status(status, body) => Ok(RawResponse { status, body }),
                    Injected::Body(body) => Ok(RawResponse::ok(body)),
                    Injected::Error(err) => Err(err),
                };
            }
        }

        let ids: Vec<&str> = request
            .value("id")
            .map(|ids| ids.split(',').collect())
            .unwrap_or_default();
        {
            let broken = self.broken_ids.lock().unwrap();
            if ids.iter().any(|id| broken.contains(*id)) {
                return Ok(RawResponse {
                    status: 503,
                    body: "Service Temporarily Unavailable".to_string(),
                });
            }
        }

        let body = match (request.endpoint, request.value("db")) {
            (Endpoint::Search, _) => self.search(&request),
            (Endpoint::Fetch, Some("taxonomy")) => self.taxonomy(&ids),
            (Endpoint::Fetch, _) => self.fasta(&ids),
            (Endpoint::Summary, _) => self.summary(&ids),
        };
        Ok(RawResponse::ok(body))
    }

    fn find_summary(&self, id: &str) -> Option<&Value> {
        self.summaries.iter().find(|doc| {
            let accession = doc["accessionversion"].as_str().unwrap_or("");
            doc["uid"].as_str() == Some(id) || accession == id || unversioned(accession) == id
        })
    }

    fn search(&self, request: &EutilsRequest) -> String {
        let term = request.value("term").unwrap_or("");
        let found = self.searches.get(term).cloned().unwrap_or_default();
        let start: usize = request.value("retstart").unwrap_or("0").parse().unwrap();
        let max: usize = request.value("retmax").unwrap_or("20").parse().unwrap();
        let page: Vec<&String> = found.iter().skip(start).take(max).collect();
        json!({
            "header": {"type": "esearch", "version": "0.3"},
            "esearchresult": {
                "count": found.len().to_string(),
                "retmax": page.len().to_string(),
                "retstart": start.to_string(),
                "idlist": page,
            }
        })
        .to_string()
    }

    fn fasta(&self, ids: &[&str]) -> String {
        let mut body = String::new();
        for id in ids {
            let accession = self
                .find_summary(id)
                .and_then(|doc| doc["accessionversion"].as_str())
                .unwrap_or(*id);
            let block = self.sequences.get(accession).or_else(|| {
                self.sequences
                    .iter()
                    .find(|(key, _)| unversioned(key) == *id)
                    .map(|(_, block)| block)
            });
            if let Some(block) = block {
                body.push_str(block);
            }
        }
        if body.is_empty() {
            body.push('\n');
        }
        body
    }

    fn summary(&self, ids: &[&str]) -> String {
        let mut uids = Vec::new();
        let mut result = serde_json::Map::new();
        for id in ids {
            if let Some(doc) = self.find_summary(id) {
                let uid = doc["uid"].as_str().unwrap().to_string();
                result.insert(uid.clone(), doc.clone());
                uids.push(Value::String(uid));
            }
        }
        if uids.is_empty() {
            return json!({
                "header": {"type": "esummary", "version": "0.3"},
                "esummaryresult": [format!("Invalid uid {} at position=0", ids.join(","))]
            })
            .to_string();
        }
        result.insert("uids".to_string(), Value::Array(uids));
        json!({
            "header": {"type": "esummary", "version": "0.3"},
            "result": result,
        })
        .to_string()
    }

    fn taxonomy(&self, ids: &[&str]) -> String {
        let mut body = String::from(
            "<?xml version=\"1.0\" ?>\n<!DOCTYPE TaxaSet PUBLIC \"-//NLM//DTD Taxon, 14th January 2002//EN\" \"https://www.ncbi.nlm.nih.gov/entrez/query/DTD/taxon.dtd\">\n<TaxaSet>",
        );
        for id in ids {
            if let Some(fragment) = self.taxa.get(*id) {
                body.push_str(fragment);
            }
        }
        body.push_str("</TaxaSet>\n");
        body
    }
}

impl Transport for RecordedTransport {
    fn get(
        &self,
        endpoint: Endpoint,
        params: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        let mut request = EutilsRequest::get(endpoint);
        request.params = params.to_vec();
        self.respond(request)
    }

    fn post(
        &self,
        endpoint: Endpoint,
        form: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        let mut request = EutilsRequest::post(endpoint);
        request.params = form.to_vec();
        self.respond(request)
    }
}

/// Settings that never sleep: no request spacing, immediate retries.
pub fn test_settings() -> Settings {
    Settings {
        request_delay: Duration::ZERO,
        retry: RetryPolicy::immediate(3),
        batch_size: 2,
        taxonomy_batch_size: 2,
        ..Settings::default()
    }
}

#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs `f` with a DEBUG-level subscriber on this thread and returns its
/// result together with everything that was logged.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}

pub fn warnings(logs: &str) -> Vec<&str> {
    logs.lines().filter(|line| line.contains("WARN")).collect()
}
