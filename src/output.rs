use std::fs;
use std::io::{self, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::app::{FetchReport, ProgressEvent, ProgressSink, ResultSet};
use crate::error::SeqTaxError;

pub const FASTA_FILE: &str = "sequences.fasta";
pub const TAXONOMY_FILE: &str = "taxonomy.tsv";
pub const TAXONOMY_HEADER: &str = "Feature ID\tTaxon";

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub fasta: Utf8PathBuf,
    pub taxonomy: Utf8PathBuf,
}

/// Writes `sequences.fasta` and `taxonomy.tsv` into `dir`, creating it if needed.
pub fn write_outputs(dir: &Utf8Path, results: &ResultSet) -> Result<OutputPaths, SeqTaxError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| SeqTaxError::Filesystem(format!("create {dir}: {err}")))?;
    let paths = OutputPaths {
        fasta: dir.join(FASTA_FILE),
        taxonomy: dir.join(TAXONOMY_FILE),
    };
    write_fasta(&paths.fasta, results)?;
    write_taxonomy_tsv(&paths.taxonomy, results)?;
    Ok(paths)
}

/// One `>accession` header and a single sequence line per record.
pub fn write_fasta(path: &Utf8Path, results: &ResultSet) -> Result<(), SeqTaxError> {
    write_atomic(path, |out| {
        for (accession, record) in results.sequences() {
            writeln!(out, ">{accession}")?;
            writeln!(out, "{}", record.sequence)?;
        }
        Ok(())
    })
}

pub fn write_taxonomy_tsv(path: &Utf8Path, results: &ResultSet) -> Result<(), SeqTaxError> {
    write_atomic(path, |out| {
        writeln!(out, "{TAXONOMY_HEADER}")?;
        for (accession, taxonomy) in results.taxonomies() {
            writeln!(out, "{accession}\t{taxonomy}")?;
        }
        Ok(())
    })
}

/// Writes through a temp file in the destination directory, then renames it
/// into place, so readers never see a partial file.
fn write_atomic<F>(path: &Utf8Path, write: F) -> Result<(), SeqTaxError>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let temp = tempfile::Builder::new()
        .prefix(".seqtax-")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SeqTaxError::Filesystem(format!("temp file in {parent}: {err}")))?;

    {
        let mut out = BufWriter::new(temp.as_file());
        write(&mut out)
            .and_then(|_| out.flush())
            .map_err(|err| SeqTaxError::Filesystem(format!("write {path}: {err}")))?;
    }
    temp.persist(path.as_std_path())
        .map_err(|err| SeqTaxError::Filesystem(format!("persist {path}: {err}")))?;
    Ok(())
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &FetchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Prints one line per stage to stderr.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!(
                "[{:>6.1}s] {}: {}",
                elapsed.as_secs_f64(),
                event.stage,
                event.message
            ),
            None => eprintln!("{}: {}", event.stage, event.message),
        }
    }
}
