//! Aggregates per-step results into a JUnit suite.
//!
//! One suite per graph execution; a test case per step, plus whatever
//! sub-tests a step derived from its containers. The suite is written
//! whether or not the graph succeeded.

use std::io;
use std::path::Path;
use std::sync::Mutex;

use gantry_core::Error;
use gantry_core::junit::{TestCase, TestSuite};

pub struct Reporter {
    suite_name: String,
    cases: Mutex<Vec<TestCase>>,
}

impl Reporter {
    pub fn new(suite_name: impl Into<String>) -> Self {
        Self {
            suite_name: suite_name.into(),
            cases: Mutex::new(Vec::new()),
        }
    }

    /// Record a step's own outcome.
    pub fn record_step(&self, name: &str, duration_seconds: f64, error: Option<&Error>) {
        let case = match error {
            None => TestCase::passed(name, duration_seconds),
            Some(e) => TestCase::failed(name, duration_seconds, e.to_string()),
        };
        self.record_case(case);
    }

    pub fn record_skipped(&self, name: &str, reason: &str) {
        self.record_case(TestCase::skipped(name, reason));
    }

    /// Record a sub-test derived by a step.
    pub fn record_case(&self, case: TestCase) {
        self.cases.lock().unwrap().push(case);
    }

    pub fn suite(&self) -> TestSuite {
        TestSuite {
            name: self.suite_name.clone(),
            test_cases: self.cases.lock().unwrap().clone(),
        }
    }

    /// Write the suite as JUnit XML.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        self.suite().write_xml(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_steps_and_subtests() {
        let reporter = Reporter::new("gantry");
        reporter.record_step("build src", 12.0, None);
        reporter.record_step(
            "e2e",
            100.0,
            Some(&Error::PodFailed {
                name: "e2e".into(),
                message: "exit 1".into(),
            }),
        );
        reporter.record_case(TestCase::passed("container other", 50.0));
        reporter.record_skipped("publish", "an earlier step failed");

        let suite = reporter.suite();
        assert_eq!(suite.num_tests(), 4);
        assert_eq!(suite.num_failed(), 1);
        assert_eq!(suite.num_skipped(), 1);
        assert_eq!(suite.test_cases[0].name, "build src");
    }
}
