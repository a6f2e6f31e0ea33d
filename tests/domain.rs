use assert_matches::assert_matches;

use ncbi_seqtax::domain::{Database, Identifier, Query, TaxonomyId, unversioned};
use ncbi_seqtax::error::SeqTaxError;
use ncbi_seqtax::validate::validate_identifiers;

#[test]
fn parse_genbank_accessions() {
    for raw in ["MT345279.1", "JQ430715.1", "M27461.1", "DI201845.1", "KY800406"] {
        let id: Identifier = raw.parse().unwrap();
        assert_eq!(id.as_str(), raw);
    }
}

#[test]
fn parse_refseq_and_wgs_accessions() {
    let refseq: Identifier = "XM_024451234.2".parse().unwrap();
    assert_eq!(refseq.unversioned(), "XM_024451234");
    let wgs: Identifier = "AAAA02000001.1".parse().unwrap();
    assert!(!wgs.is_numeric());
}

#[test]
fn parse_identifier_invalid() {
    for raw in ["", "   ", "MT345279.1; DROP", "ABCDEFG12345", "12.5", "-42"] {
        let err = raw.parse::<Identifier>().unwrap_err();
        assert_matches!(err, SeqTaxError::InvalidIdentifier(_));
    }
}

#[test]
fn unversioned_leaves_bare_accessions_alone() {
    assert_eq!(unversioned("MT345279.1"), "MT345279");
    assert_eq!(unversioned("MT345279"), "MT345279");
}

#[test]
fn parse_query() {
    let query: Query = "  txid5341[ORGN] AND ITS1[TITL] ".parse().unwrap();
    assert_eq!(query.as_str(), "txid5341[ORGN] AND ITS1[TITL]");
    assert_matches!("".parse::<Query>(), Err(SeqTaxError::Usage(_)));
}

#[test]
fn parse_taxonomy_id() {
    let taxid: TaxonomyId = "5341".parse().unwrap();
    assert_eq!(taxid.get(), 5341);
    assert_matches!(
        "unknown".parse::<TaxonomyId>(),
        Err(SeqTaxError::InvalidTaxonomyId(_))
    );
}

#[test]
fn database_names() {
    assert_eq!(Database::Nuccore.as_str(), "nuccore");
    assert_eq!(Database::Protein.to_string(), "protein");
    let parsed: Database = serde_json::from_str("\"protein\"").unwrap();
    assert_eq!(parsed, Database::Protein);
}

#[test]
fn validation_reports_rejects_in_input_order() {
    let validated =
        validate_identifiers(["18446744073709551616", "MT345279.1", "x", "1843453260"]).unwrap();
    assert_eq!(validated.invalid, vec!["18446744073709551616", "x"]);
    assert_eq!(validated.valid.len(), 2);
    assert!(validated.valid[1].is_numeric());
}
