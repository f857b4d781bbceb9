// Shared test helpers for integration tests
#![allow(dead_code)]

use anyhow::Result;
use sim_harness::core::evaluator::{CapabilityCache, StaticCapabilities};
use sim_harness::core::options::RunOptions;
use sim_harness::core::planner::{RunPlan, plan_run};
use sim_harness::core::scheduler::{ResultSink, Tally};
use sim_harness::core::spec::{RunEnvironment, TestSpec};
use sim_harness::core::status::{TestStatus, Tester};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A spec with default settings living in `dir`.
pub fn spec_in(name: &str, dir: &Path) -> TestSpec {
    TestSpec {
        test_dir: dir.to_path_buf(),
        ..TestSpec::new(name)
    }
}

/// A spec that runs `script` through `sh -c` in `dir`.
pub fn shell_spec(name: &str, dir: &Path, script: &str) -> TestSpec {
    TestSpec {
        executable: Some("sh".to_string()),
        cli_args: vec!["-c".to_string(), script.to_string()],
        ..spec_in(name, dir)
    }
}

pub fn default_env() -> RunEnvironment {
    RunEnvironment::default()
}

pub fn plan(specs: Vec<TestSpec>, options: &RunOptions) -> Result<RunPlan> {
    let capabilities = CapabilityCache::new(StaticCapabilities::default());
    plan_run(specs, &default_env(), options, &capabilities, None)
}

pub fn status_of(testers: &[Tester], name: &str) -> TestStatus {
    testers
        .iter()
        .find(|t| t.name() == name)
        .map(|t| t.status())
        .unwrap_or_else(|| panic!("no tester named {name}"))
}

pub fn tester<'a>(testers: &'a [Tester], name: &str) -> &'a Tester {
    testers
        .iter()
        .find(|t| t.name() == name)
        .unwrap_or_else(|| panic!("no tester named {name}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    LongRunning(String),
    Finished(String, TestStatus),
}

/// Records every sink call so tests can inspect ordering and concurrency.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Started(_)))
            .count()
    }

    /// Highest number of tests started but not yet finished at any point.
    pub fn max_in_flight(&self) -> usize {
        let mut running = HashSet::new();
        let mut max = 0usize;
        for event in self.events() {
            match event {
                Event::Started(name) => {
                    running.insert(name);
                    max = max.max(running.len());
                }
                Event::Finished(name, _) => {
                    running.remove(&name);
                }
                Event::LongRunning(_) => {}
            }
        }
        max
    }

    /// Whether the two tests were ever running at the same time.
    pub fn overlapped(&self, a: &str, b: &str) -> bool {
        let mut running = HashSet::new();
        for event in self.events() {
            match event {
                Event::Started(name) => {
                    running.insert(name);
                    if running.contains(a) && running.contains(b) {
                        return true;
                    }
                }
                Event::Finished(name, _) => {
                    running.remove(&name);
                }
                Event::LongRunning(_) => {}
            }
        }
        false
    }

    /// Waits until `count` tests have started, or `timeout` passes.
    pub async fn wait_for_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.started_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.started_count() >= count
    }

    pub fn position(&self, wanted: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == wanted)
    }
}

impl ResultSink for RecordingSink {
    fn on_started(&mut self, tester: &Tester) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Started(tester.name().to_string()));
        Ok(())
    }

    fn on_long_running(&mut self, tester: &Tester, _elapsed: Duration) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::LongRunning(tester.name().to_string()));
        Ok(())
    }

    fn on_finished(&mut self, tester: &Tester, _tally: &Tally) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Finished(tester.name().to_string(), tester.status()));
        Ok(())
    }
}

/// Writes a suite file into `dir` and returns its path.
pub fn write_suite(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("tests.toml");
    fs::write(&path, content).expect("Failed to write suite file");
    path
}
