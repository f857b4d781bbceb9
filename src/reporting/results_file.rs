//! Machine-readable results: a JSON document for the whole run and, optionally,
//! one output file per finished test. Both are written when the run completes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::core::scheduler::{ResultSink, RunSummary, Tally};
use crate::core::status::{TestStatus, Tester};
use crate::infra::fs::write_output_file;

/// One test as written to the results file.
#[derive(Debug, Serialize)]
pub struct TesterRecord<'a> {
    pub name: &'a str,
    pub status: TestStatus,
    pub reason: &'a str,
    pub caveats: Vec<&'a str>,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub output: &'a str,
}

impl<'a> From<&'a Tester> for TesterRecord<'a> {
    fn from(tester: &'a Tester) -> Self {
        Self {
            name: tester.name(),
            status: tester.status(),
            reason: tester.reason(),
            caveats: tester.caveats().collect(),
            command: tester.launch().map(|c| c.display()),
            exit_code: tester.exit_code(),
            started_at: tester.started_at(),
            finished_at: tester.finished_at(),
            duration_secs: tester.duration().as_secs_f64(),
            output: tester.output(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultsDocument<'a> {
    pub tally: Tally,
    pub interrupted: bool,
    pub max_fails_reached: bool,
    pub elapsed_secs: f64,
    pub tests: Vec<TesterRecord<'a>>,
}

impl<'a> From<&'a RunSummary> for ResultsDocument<'a> {
    fn from(summary: &'a RunSummary) -> Self {
        Self {
            tally: summary.tally,
            interrupted: summary.interrupted,
            max_fails_reached: summary.max_fails_reached,
            elapsed_secs: summary.elapsed.as_secs_f64(),
            tests: summary
                .testers
                .iter()
                .filter(|t| t.status() != TestStatus::Silent)
                .map(TesterRecord::from)
                .collect(),
        }
    }
}

/// Writes the JSON results file and per-test output files.
#[derive(Debug, Clone, Default)]
pub struct ResultsFileWriter {
    results_path: Option<PathBuf>,
    sep_files_dir: Option<PathBuf>,
}

impl ResultsFileWriter {
    pub fn new(results_path: Option<PathBuf>, sep_files_dir: Option<PathBuf>) -> Self {
        Self {
            results_path,
            sep_files_dir,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.results_path.is_some() || self.sep_files_dir.is_some()
    }
}

impl ResultsFileWriter {
    /// Writes `<dir>/<test>.<status>.txt` for every test that ran.
    fn write_separate_files(dir: &Path, summary: &RunSummary) -> Result<()> {
        for tester in &summary.testers {
            if tester.started_at().is_none() {
                continue;
            }
            let status = match tester.status() {
                TestStatus::Pass => "pass",
                TestStatus::Fail => "fail",
                TestStatus::Diff => "diff",
                _ => continue,
            };
            write_output_file(dir, tester.name(), status, tester.output())?;
        }
        Ok(())
    }

    fn write_document(path: &Path, summary: &RunSummary) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create results file: {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &ResultsDocument::from(summary))
            .with_context(|| format!("Failed to write results file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote results file");
        Ok(())
    }
}

// Files are written once the run is over so the control loop never waits on disk.
impl ResultSink for ResultsFileWriter {
    fn on_finished(&mut self, _tester: &Tester, _tally: &Tally) -> Result<()> {
        Ok(())
    }

    fn on_run_complete(&mut self, summary: &RunSummary) -> Result<()> {
        if let Some(dir) = &self.sep_files_dir {
            Self::write_separate_files(dir, summary)?;
        }
        if let Some(path) = &self.results_path {
            Self::write_document(path, summary)?;
        }
        Ok(())
    }
}
