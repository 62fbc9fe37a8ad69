use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opentelemetry::Context as OtelContext;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::engine::{InstrumentationResult, instrument};
use crate::error::InstrumentError;
use crate::telemetry::{Telemetry, file_span};

/// Counts reported after a directory run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DriverReport {
    /// Class files found under the root.
    pub scanned: usize,
    /// Class files rewritten in place.
    pub modified: usize,
    /// Class files skipped because they could not be read, parsed or written.
    pub failures: usize,
}

/// Instrument every class file below `root` and overwrite the modified ones.
///
/// All files are processed before anything is written. An invariant violation in any file
/// aborts the run and leaves the directory as it was.
pub fn instrument_directory(
    root: &Path,
    config: &Configuration,
    telemetry: Option<&Telemetry>,
) -> Result<DriverReport> {
    if !root.exists() {
        anyhow::bail!("classes directory not found: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("not a directory: {}", root.display());
    }

    let mut paths = Vec::new();
    collect_class_files(root, &mut paths)?;
    debug!(root = %root.display(), files = paths.len(), "class files collected");

    let run_cx = OtelContext::current();
    let outcomes: Vec<(PathBuf, Result<InstrumentationResult>)> = paths
        .into_par_iter()
        .map(|path| {
            let outcome = file_span(telemetry, &run_cx, &path, || instrument_file(&path, config));
            (path, outcome)
        })
        .collect();

    for (path, outcome) in &outcomes {
        if let Err(err) = outcome
            && err
                .downcast_ref::<InstrumentError>()
                .is_some_and(InstrumentError::is_fatal)
        {
            anyhow::bail!("{}: {err}; no files were written", path.display());
        }
    }

    let mut report = DriverReport {
        scanned: outcomes.len(),
        ..DriverReport::default()
    };
    for (path, outcome) in outcomes {
        match outcome {
            Ok(InstrumentationResult::Modified(bytes)) => match fs::write(&path, bytes) {
                Ok(()) => {
                    debug!(path = %path.display(), "class file rewritten");
                    report.modified += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to write class file");
                    report.failures += 1;
                }
            },
            Ok(InstrumentationResult::Unmodified(reason)) => {
                debug!(path = %path.display(), ?reason, "class file left untouched");
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "skipping class file");
                report.failures += 1;
            }
        }
    }
    info!(
        scanned = report.scanned,
        modified = report.modified,
        failures = report.failures,
        "instrumentation finished"
    );
    Ok(report)
}

fn instrument_file(path: &Path, config: &Configuration) -> Result<InstrumentationResult> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let result = instrument(&bytes, config)?;
    Ok(result)
}

fn collect_class_files(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", dir.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            collect_class_files(&entry, paths)?;
        } else if is_class_path(&entry) {
            paths.push(entry);
        }
    }
    Ok(())
}

fn is_class_path(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("class")
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
