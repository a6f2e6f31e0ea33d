use std::fs;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ncbi_seqtax::app::{App, DataRequest, FetchOutcome, ProgressSink};
use ncbi_seqtax::config::ConfigLoader;
use ncbi_seqtax::domain::Database;
use ncbi_seqtax::error::SeqTaxError;
use ncbi_seqtax::lineage::canonical_ranks;
use ncbi_seqtax::output::{JsonOutput, OutputPaths, StderrProgress, write_outputs};
use ncbi_seqtax::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "seqtax")]
#[command(about = "Fetch NCBI sequences together with rank-prefixed taxonomy strings")]
#[command(version, author)]
struct Cli {
    /// Show debug logs, including every retry.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch sequences and taxonomy for accessions or a search query")]
    Fetch(FetchArgs),
    #[command(about = "List ranks with fixed abbreviations")]
    Ranks,
}

#[derive(Args)]
#[group(id = "source", required = true, multiple = false)]
struct SourceArgs {
    /// Accession or numeric id; repeat or comma-separate for several.
    #[arg(long = "accession", value_delimiter = ',')]
    accessions: Vec<String>,

    /// File with one id per line; blank lines and `#` comments are ignored.
    #[arg(long)]
    accession_file: Option<Utf8PathBuf>,

    /// Entrez search expression, e.g. `txid5341[ORGN] AND ITS[TITL]`.
    #[arg(long)]
    query: Option<String>,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Rank to include, in output order; repeat or comma-separate.
    #[arg(long = "rank", value_delimiter = ',')]
    ranks: Vec<String>,

    #[arg(long)]
    no_rank_propagation: bool,

    #[arg(long)]
    database: Option<Database>,

    #[arg(long, default_value = ".")]
    output_dir: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    /// Print the drop report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SeqTaxError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SeqTaxError) -> u8 {
    match error {
        SeqTaxError::Usage(_)
        | SeqTaxError::NoValidIdentifiers
        | SeqTaxError::EmptySearch(_)
        | SeqTaxError::InvalidIdentifier(_)
        | SeqTaxError::InvalidTaxonomyId(_) => 2,
        error if error.is_network() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ncbi_seqtax=debug,seqtax=debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Fetch(args) => run_fetch(args),
        Commands::Ranks => {
            for (rank, abbreviation) in canonical_ranks() {
                println!("{abbreviation}\t{rank}");
            }
            Ok(())
        }
    }
}

fn run_fetch(args: FetchArgs) -> miette::Result<()> {
    let mut settings = ConfigLoader::resolve(args.config.as_deref())?;
    if let Some(database) = args.database {
        settings.database = database;
    }

    let accessions = match (&args.source.accession_file, args.source.accessions.is_empty()) {
        (Some(path), _) => Some(read_accession_file(path)?),
        (None, false) => Some(args.source.accessions.clone()),
        (None, true) => None,
    };
    let mut request = DataRequest::new(accessions, args.source.query.as_deref())?;
    if !args.ranks.is_empty() {
        request = request.with_ranks(args.ranks);
    }
    if args.no_rank_propagation {
        request = request.with_rank_propagation(false);
    }

    let transport = HttpTransport::new(&settings)?;
    let app = App::new(settings, transport);
    let sink: &dyn ProgressSink = if args.json {
        &JsonOutput
    } else {
        &StderrProgress
    };
    let outcome = app.get_data(request, sink)?;
    let paths = write_outputs(&args.output_dir, &outcome.results)?;

    if args.json {
        JsonOutput::print_report(&outcome.report).into_diagnostic()?;
    } else {
        print_summary(&outcome, &paths);
    }
    Ok(())
}

fn read_accession_file(path: &Utf8PathBuf) -> Result<Vec<String>, SeqTaxError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| SeqTaxError::Filesystem(format!("read {path}: {err}")))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn print_summary(outcome: &FetchOutcome, paths: &OutputPaths) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}seqtax summary{reset}");
    println!(
        "{green}Fetched {} of {} records{reset}",
        outcome.report.returned, outcome.report.requested
    );
    if !outcome.report.dropped.is_empty() {
        println!("{yellow}Dropped {}:{reset}", outcome.report.dropped.len());
        for dropped in &outcome.report.dropped {
            println!("{yellow}  {} ({}){reset}", dropped.id, dropped.reason);
        }
    }
    println!("  sequences: {}", paths.fasta);
    println!("  taxonomy:  {}", paths.taxonomy);
}
