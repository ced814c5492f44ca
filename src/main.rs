use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use stitch::config::{FlushPolicy, InstrumentationConfig, RecorderStrategy};
use stitch::error::Error;
use stitch::instrumenter::Instrumenter;
use stitch::registry::Registry;
use stitch::resolve::discover_sources;

#[derive(Parser)]
#[command(
    name = "stitch",
    about = "Source-level coverage instrumentation for Java-family sources",
    version,
    after_help = "Workflow: stitch instrument --src src/main/java --dest build/instr, then stitch inspect"
)]
struct Cli {
    /// Log debug output (or set STITCH_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument every source file under the given roots.
    Instrument {
        /// Source root directory or single file (repeatable).
        #[arg(long = "src", value_name = "DIR", required = true)]
        sources: Vec<PathBuf>,

        /// Destination root; files land under their package directories.
        #[arg(long, value_name = "DIR")]
        dest: PathBuf,

        /// Registry file (defaults to .stitch/registry.json).
        #[arg(long, value_name = "FILE")]
        registry: Option<PathBuf>,

        /// Read settings from a stitch.toml. Flags override it.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Source encoding: UTF-8, US-ASCII or ISO-8859-1.
        #[arg(long)]
        encoding: Option<String>,

        /// How types reach their recorder: field or class.
        #[arg(long)]
        strategy: Option<RecorderStrategy>,

        /// When recorders flush: directed, interval or threaded.
        #[arg(long)]
        flush_policy: Option<FlushPolicy>,

        /// Milliseconds between flushes for the interval and threaded policies.
        #[arg(long, value_name = "MS")]
        flush_interval: Option<u64>,

        /// Keep registry entries for files not instrumented in this run.
        #[arg(long)]
        append: bool,

        /// Only instrument sources matching GLOB (repeatable).
        #[arg(long, value_name = "GLOB")]
        include: Vec<String>,

        /// Skip sources matching GLOB (repeatable).
        #[arg(long, value_name = "GLOB")]
        exclude: Vec<String>,
    },
    /// Show what a registry holds.
    Inspect {
        /// Path to the registry file.
        registry: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("STITCH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("stitch={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Instrument {
            sources,
            dest,
            registry,
            config,
            encoding,
            strategy,
            flush_policy,
            flush_interval,
            append,
            include,
            exclude,
        } => {
            let mut settings = match config {
                Some(path) => InstrumentationConfig::load(&path)?,
                None => InstrumentationConfig::default(),
            };
            if registry.is_some() {
                settings.registry = registry;
            }
            if encoding.is_some() {
                settings.encoding = encoding;
            }
            if let Some(strategy) = strategy {
                settings.strategy = strategy;
            }
            if let Some(policy) = flush_policy {
                settings.flush_policy = policy;
            }
            if let Some(interval) = flush_interval {
                settings.flush_interval = interval;
            }
            settings.include.extend(include);
            settings.exclude.extend(exclude);
            settings.validate()?;
            cmd_instrument(settings, &sources, &dest, append)
        }
        Commands::Inspect { registry } => cmd_inspect(registry),
    }
}

fn cmd_instrument(
    config: InstrumentationConfig,
    sources: &[PathBuf],
    dest: &Path,
    append: bool,
) -> Result<(), Error> {
    let files = discover_sources(sources, &config)?;
    eprintln!("found {} source file(s)", files.len());

    let mut instrumenter = Instrumenter::new(config)?;
    instrumenter.start_instrumentation()?;
    for file in &files {
        let written = instrumenter.instrument(&file.path, dest, None)?;
        debug!("{} -> {}", file.path.display(), written.display());
        eprintln!("  {}", file.relative().display());
    }
    let registry = instrumenter.end_instrumentation(append)?;

    let stats = instrumenter.statistics();
    eprintln!(
        "instrumented {} file(s) in {} package(s): {} class(es), {} method(s), {} test method(s)",
        stats.files,
        stats.packages.len(),
        stats.classes,
        stats.methods,
        stats.test_methods
    );
    info!(
        "registry {} now holds {} slot(s)",
        instrumenter.registry_path().display(),
        registry.data_length
    );
    Ok(())
}

fn cmd_inspect(path: PathBuf) -> Result<(), Error> {
    let registry = Registry::load(&path)?;
    print!("{}", registry.format_summary());
    Ok(())
}
