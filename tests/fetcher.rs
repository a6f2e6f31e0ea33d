mod common;

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;

use ncbi_seqtax::domain::{Database, Identifier, Query, TaxonomyId};
use ncbi_seqtax::error::SeqTaxError;
use ncbi_seqtax::fetcher::{BatchFetcher, RecordFault, SkipReason, parse_summaries};
use ncbi_seqtax::retry::{RetryPolicy, RetryingClient};
use ncbi_seqtax::transport::{
    Endpoint, EutilsRequest, Method, RawResponse, Transport, TransportError,
};

use common::{Injected, RecordedTransport, capture_logs, warnings};

fn ids(raw: &[&str]) -> Vec<Identifier> {
    raw.iter().map(|id| id.parse().unwrap()).collect()
}

fn recorded() -> Arc<RecordedTransport> {
    Arc::new(RecordedTransport::from_fixtures())
}

/// Answers every esearch with at most two ids per page, whatever `retmax` says.
struct ShortPages {
    total: Vec<String>,
    offsets: Mutex<Vec<usize>>,
}

impl Transport for ShortPages {
    fn get(
        &self,
        _endpoint: Endpoint,
        params: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        let start: usize = params
            .iter()
            .find(|(key, _)| key == "retstart")
            .map(|(_, value)| value.parse().unwrap())
            .unwrap();
        self.offsets.lock().unwrap().push(start);
        let page: Vec<&String> = self.total.iter().skip(start).take(2).collect();
        Ok(RawResponse::ok(
            serde_json::json!({
                "esearchresult": {"count": self.total.len().to_string(), "idlist": page}
            })
            .to_string(),
        ))
    }

    fn post(
        &self,
        _endpoint: Endpoint,
        _form: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        Err(TransportError::Fatal("unexpected POST".to_string()))
    }
}

#[test]
fn search_pages_until_count_is_reached() {
    let transport = ShortPages {
        total: ["A00001.1", "A00002.1", "A00003.1", "A00004.1", "A00005.1"]
            .iter()
            .map(|id| id.to_string())
            .collect(),
        offsets: Mutex::new(Vec::new()),
    };
    let client = RetryingClient::new(transport, RetryPolicy::immediate(1));
    let fetcher = BatchFetcher::new(&client, Database::Nuccore, 200, 1);
    let query: Query = "A[ORGN]".parse().unwrap();

    let found = fetcher.search_ids(&query).unwrap();
    assert_eq!(found.len(), 5);
    assert_eq!(found[4], "A00005.1");
}

#[test]
fn search_uses_get_with_accession_ids() {
    let transport = recorded();
    let client = RetryingClient::new(transport.clone(), RetryPolicy::immediate(1));
    let fetcher = BatchFetcher::new(&client, Database::Nuccore, 200, 1);
    let query: Query = "Amanita[ORGN]".parse().unwrap();

    let found = fetcher.search_ids(&query).unwrap();
    assert_eq!(found, vec!["KY800406.1", "AY123456.1"]);
    let call: EutilsRequest = transport.calls().remove(0);
    assert_eq!(call.method, Method::Get);
    assert_eq!(call.value("idtype"), Some("acc"));
    assert_eq!(call.value("retmode"), Some("json"));
    assert_eq!(call.value("retmax"), Some("10000"));
}

#[test]
fn search_error_body_is_retried_then_fatal() {
    let transport = recorded();
    for _ in 0..2 {
        transport.inject(
            Endpoint::Search,
            Injected::Body(
                r#"{"esearchresult":{"ERROR":"Search Backend failed: read failure"}}"#.to_string(),
            ),
        );
    }
    let client = RetryingClient::new(transport.clone(), RetryPolicy::immediate(2));
    let fetcher = BatchFetcher::new(&client, Database::Nuccore, 200, 1);
    let err = fetcher
        .search_ids(&"Amanita[ORGN]".parse().unwrap())
        .unwrap_err();
    assert_matches!(
        err,
        SeqTaxError::RetriesExhausted {
            attempts: 2,
            source: TransportError::Malformed(_),
            ..
        }
    );
}

#[test]
fn sequences_are_posted_in_batches() {
    let transport = recorded();
    let client = RetryingClient::new(transport.clone(), RetryPolicy::immediate(1));
    let fetcher = BatchFetcher::new(&client, Database::Nuccore, 2, 1);

    let batches = fetcher.fetch_sequences(&ids(&["MT345279.1", "JQ430715.1", "KY800406.1"]));
    assert!(batches.failed.is_empty());
    let accessions: Vec<&str> = batches.records.iter().map(|r| r.accession.as_str()).collect();
    assert_eq!(accessions, vec!["MT345279.1", "JQ430715.1", "KY800406.1"]);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.method == Method::Post));
    assert_eq!(calls[0].value("id"), Some("MT345279.1,JQ430715.1"));
    assert_eq!(calls[0].value("rettype"), Some("fasta"));
    assert_eq!(calls[1].value("id"), Some("KY800406.1"));
}

#[test]
fn fatal_status_fails_the_batch_without_retrying() {
    let transport = recorded();
    transport.inject(Endpoint::Fetch, Injected::Status(414, "URI Too Long".to_string()));
    let client = RetryingClient::new(transport.clone(), RetryPolicy::immediate(3));
    let fetcher = BatchFetcher::new(&client, Database::Nuccore, 1, 1);

    let (batches, logs) =
        capture_logs(|| fetcher.fetch_sequences(&ids(&["MT345279.1", "JQ430715.1"])));
    assert_eq!(batches.failed, ids(&["MT345279.1"]));
    assert_eq!(batches.records.len(), 1);
    assert_eq!(transport.calls_to(Endpoint::Fetch), 2);
    assert!(!logs.contains("Retrying"));
    assert!(warnings(&logs)[0].contains("Giving up on sequence batch 1 (1 ids)"));
}

#[test]
fn retired_summaries_are_skipped_with_a_warning() {
    let client = RetryingClient::new(recorded(), RetryPolicy::immediate(1));
    let fetcher = BatchFetcher::new(&client, Database::Nuccore, 200, 1);

    let (summaries, logs) =
        capture_logs(|| fetcher.fetch_taxonomy_ids(&ids(&["MT345279.1", "AB000123.1"])));
    assert_eq!(summaries.records.len(), 1);
    assert_eq!(summaries.records[0].taxid, TaxonomyId::new(5341));
    assert_eq!(summaries.skipped[0].key, "AB000123.1");
    assert!(
        warnings(&logs)
            .iter()
            .any(|line| line.contains("AB000123.1") && line.contains("replaced by AB000123.2"))
    );
}

#[test]
fn summary_with_string_taxid_and_error_entry() {
    let body = r#"{
        "header": {"type": "esummary", "version": "0.3"},
        "result": {
            "uids": ["380039261", "999"],
            "380039261": {"uid": "380039261", "accessionversion": "JQ430715.1", "taxid": "1131716", "status": "live"},
            "999": {"uid": "999", "error": "cannot get document summary"}
        }
    }"#;
    let (records, skipped) = parse_summaries(body).unwrap();
    assert_eq!(records[0].taxid, TaxonomyId::new(1131716));
    assert_matches!(&skipped[0].reason, SkipReason::ServiceError { .. });

    let missing = r#"{"result": {"uids": ["1"], "1": {"uid": "1", "accessionversion": "M27461.1"}}}"#;
    let (_, skipped) = parse_summaries(missing).unwrap();
    assert_eq!(
        skipped[0].reason,
        SkipReason::Fault(RecordFault::missing("taxid"))
    );
}
