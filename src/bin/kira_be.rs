use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_brain_etl::config::{ConfigLoader, RunConfig};
use kira_brain_etl::error::KiraError;
use kira_brain_etl::output::{JsonOutput, OutputMode, StderrProgress, schema_columns};
use kira_brain_etl::pipeline::{Pipeline, RunSummary};
use kira_brain_etl::schema::Schema;
use kira_brain_etl::store::{ArtifactStore, MANIFEST_FILE, Manifest};

#[derive(Parser)]
#[command(name = "kira-be")]
#[command(about = "Harmonize cached brain-cancer source artifacts into one subject-level table")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: kira-be.json in the current directory, if present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Normalize, resolve, merge, validate and write the table")]
    Run(RunArgs),
    #[command(about = "Inspect or build the fetch manifest")]
    Manifest(ManifestArgs),
    #[command(about = "List the output schema")]
    Schema,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    manifest: Option<Utf8PathBuf>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long)]
    diagnostics: Option<Utf8PathBuf>,

    /// Abort when any source is unavailable.
    #[arg(long)]
    strict: bool,

    #[arg(long)]
    threshold: Option<f64>,

    /// Also write the per-cell provenance sidecar.
    #[arg(long)]
    provenance: bool,

    /// Apply robust scaling to the configured numeric columns.
    #[arg(long)]
    scale: bool,
}

#[derive(Args)]
struct ManifestArgs {
    #[command(subcommand)]
    command: ManifestCommand,
}

#[derive(Subcommand)]
enum ManifestCommand {
    #[command(about = "Show the manifest with per-source availability")]
    Show {
        #[arg(long)]
        manifest: Option<Utf8PathBuf>,
    },
    #[command(about = "Build a manifest from the conventional data layout")]
    Scan {
        data_root: Utf8PathBuf,

        /// Where to write the manifest (default: <data-root>/manifest.json).
        #[arg(long)]
        write: Option<Utf8PathBuf>,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidConfig(_)
        | KiraError::InvalidSourceId(_)
        | KiraError::InvalidModality(_)
        | KiraError::ManifestRead(_)
        | KiraError::ManifestParse(_)
        | KiraError::Crosswalk { .. }
        | KiraError::StrictSourceMissing(_) => 2,
        KiraError::InternalConsistency(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => {
            let config = ConfigLoader::resolve(cli.config.as_deref())?;
            run_pipeline(apply_overrides(config, args)?, output_mode)
        }
        Commands::Manifest(args) => match args.command {
            ManifestCommand::Show { manifest } => {
                let path = match manifest {
                    Some(path) => path,
                    None => ConfigLoader::resolve(cli.config.as_deref())?.paths.manifest,
                };
                show_manifest(&path, output_mode)
            }
            ManifestCommand::Scan { data_root, write } => {
                let manifest = ArtifactStore::scan(&data_root)?;
                let path = write.unwrap_or_else(|| data_root.join(MANIFEST_FILE));
                ArtifactStore::write_manifest(&path, &manifest)?;
                match output_mode {
                    OutputMode::Json => JsonOutput::print_manifest(&manifest).into_diagnostic()?,
                    OutputMode::Human => {
                        println!("manifest written to {path}");
                        print_manifest(&manifest);
                    }
                }
                Ok(())
            }
        },
        Commands::Schema => {
            let columns = schema_columns(&Schema::standard());
            match output_mode {
                OutputMode::Json => JsonOutput::print_schema(&columns).into_diagnostic()?,
                OutputMode::Human => {
                    for column in columns {
                        let unit = column.unit.unwrap_or_default();
                        println!("{:<36} {:<8} {unit}", column.column, column.kind);
                    }
                }
            }
            Ok(())
        }
    }
}

fn apply_overrides(mut config: RunConfig, args: RunArgs) -> Result<RunConfig, KiraError> {
    if let Some(manifest) = args.manifest {
        config.paths.manifest = manifest;
    }
    if let Some(output) = args.output {
        config.paths.output = output;
    }
    if let Some(diagnostics) = args.diagnostics {
        config.paths.diagnostics = diagnostics;
    }
    if let Some(threshold) = args.threshold {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(KiraError::InvalidConfig(format!(
                "--threshold must be in (0, 1], got {threshold}"
            )));
        }
        config.fuzzy_match_threshold = threshold;
    }
    config.strict_source_requirement |= args.strict;
    config.emit_provenance |= args.provenance;
    config.scaling.enabled |= args.scale;
    Ok(config)
}

fn run_pipeline(config: RunConfig, output_mode: OutputMode) -> miette::Result<()> {
    let store = ArtifactStore::open(&config.paths.manifest)?;
    let pipeline = Pipeline::new(config);
    match output_mode {
        OutputMode::Json => {
            let summary = pipeline.run(&store, &JsonOutput)?;
            JsonOutput::print_run(&summary).into_diagnostic()?;
        }
        OutputMode::Human => {
            let summary = pipeline.run(&store, &StderrProgress)?;
            print_run_summary(&summary);
        }
    }
    Ok(())
}

fn show_manifest(path: &Utf8PathBuf, output_mode: OutputMode) -> miette::Result<()> {
    let store = ArtifactStore::open(path)?;
    let manifest = Manifest {
        sources: store.entries().to_vec(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_manifest(&manifest).into_diagnostic()?,
        OutputMode::Human => print_manifest(&manifest),
    }
    Ok(())
}

fn print_manifest(manifest: &Manifest) {
    for entry in &manifest.sources {
        let state = if entry.available { "available" } else { "unavailable" };
        println!(
            "{:<7} {:<11} fetched {} ({} artifacts)",
            entry.source_id.as_str(),
            state,
            entry.fetched_at.to_rfc3339(),
            entry.artifact_paths.len()
        );
        for path in &entry.artifact_paths {
            println!("        {path}");
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}KIRA-BE summary{reset}");
    println!(
        "{green}rows accepted: {}  rejected: {}  subjects: {}  observations: {}{reset}",
        summary.rows_accepted, summary.rows_rejected, summary.subjects, summary.observations
    );
    if !summary.sources_unavailable.is_empty() {
        let missing: Vec<&str> = summary
            .sources_unavailable
            .iter()
            .map(|source| source.as_str())
            .collect();
        println!("{yellow}unavailable sources: {}{reset}", missing.join(", "));
    }
    println!(
        "{yellow}diagnostics: {} ({} warnings){reset}",
        summary.diagnostics_total, summary.warnings
    );
    println!("table:       {}", summary.output);
    println!("diagnostics: {}", summary.diagnostics);
    if let Some(path) = &summary.provenance {
        println!("provenance:  {path}");
    }
}
