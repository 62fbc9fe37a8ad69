use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use notnull_instrumenter::telemetry::{Telemetry, current_trace_id, init_logging, run_span};
use notnull_instrumenter::{Settings, instrument_directory};

/// CLI arguments for notnull-instrumenter execution.
#[derive(Parser, Debug)]
#[command(
    name = "notnull-instrumenter",
    about = "Injects runtime @NotNull checks into compiled JVM class files.",
    version
)]
struct Cli {
    /// Directory of compiled classes, rewritten in place.
    #[arg(long, value_name = "DIR")]
    classes: PathBuf,
    /// JSON file with `not_null`, `nullable`, `implicit` and `exclude` keys.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long = "not-null", value_name = "NAME")]
    not_null: Vec<String>,
    #[arg(long, value_name = "NAME")]
    nullable: Vec<String>,
    /// Treat every unannotated reference parameter and return value as not-null.
    #[arg(long)]
    implicit: bool,
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,
    /// OTLP/HTTP endpoint receiving trace spans.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[arg(long)]
    timing: bool,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        settings.extend(Settings {
            not_null: self.not_null.clone(),
            nullable: self.nullable.clone(),
            implicit: self.implicit,
            exclude: self.exclude.clone(),
        });
        Ok(settings)
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let telemetry = cli
        .otel
        .as_deref()
        .map(Telemetry::new)
        .transpose()
        .context("initialize telemetry")?;
    let result = run_span(telemetry.as_ref(), &cli.classes, || {
        run(&cli, telemetry.as_ref())
    });
    if let Some(telemetry) = telemetry {
        telemetry.shutdown()?;
    }
    result
}

fn run(cli: &Cli, telemetry: Option<&Telemetry>) -> Result<()> {
    if let Some(trace_id) = current_trace_id() {
        info!(trace_id = %trace_id, "exporting spans");
    }
    let config = cli.settings()?.resolve().context("invalid configuration")?;

    let started_at = Instant::now();
    let report = instrument_directory(&cli.classes, &config, telemetry)?;

    if cli.timing {
        eprintln!(
            "timing: total_ms={} scanned={} modified={} failures={}",
            started_at.elapsed().as_millis(),
            report.scanned,
            report.modified,
            report.failures
        );
    }
    info!(modified = report.modified, "class files instrumented");
    Ok(())
}
