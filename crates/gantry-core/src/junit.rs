//! JUnit-shaped result model.
//!
//! Sub-tests derived from per-container pod outcomes are aggregated
//! into one suite per graph and written as XML at the end of every
//! invocation, successful or not.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Wall-clock seconds, clamped to non-negative.
    pub duration_seconds: f64,
    pub failure_output: Option<String>,
    pub skipped_output: Option<String>,
    pub system_out: Option<String>,
}

impl TestCase {
    pub fn passed(name: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            duration_seconds: duration_seconds.max(0.0),
            ..Default::default()
        }
    }

    pub fn failed(name: impl Into<String>, duration_seconds: f64, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration_seconds: duration_seconds.max(0.0),
            failure_output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skipped_output: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub test_cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test_cases: Vec::new(),
        }
    }

    pub fn num_tests(&self) -> usize {
        self.test_cases.len()
    }

    pub fn num_failed(&self) -> usize {
        self.test_cases
            .iter()
            .filter(|c| c.failure_output.is_some())
            .count()
    }

    pub fn num_skipped(&self) -> usize {
        self.test_cases
            .iter()
            .filter(|c| c.skipped_output.is_some())
            .count()
    }

    /// Serialize the suite as JUnit XML. No XML crate is involved;
    /// the format is flat enough for a hand escaper.
    pub fn write_xml(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(
            w,
            r#"<testsuite name="{}" tests="{}" failures="{}" skipped="{}">"#,
            escape(&self.name),
            self.num_tests(),
            self.num_failed(),
            self.num_skipped(),
        )?;
        for case in &self.test_cases {
            write!(
                w,
                r#"  <testcase name="{}" time="{}""#,
                escape(&case.name),
                case.duration_seconds,
            )?;
            if case.failure_output.is_none()
                && case.skipped_output.is_none()
                && case.system_out.is_none()
            {
                writeln!(w, "/>")?;
                continue;
            }
            writeln!(w, ">")?;
            if let Some(failure) = &case.failure_output {
                writeln!(w, r#"    <failure>{}</failure>"#, escape(failure))?;
            }
            if let Some(skipped) = &case.skipped_output {
                writeln!(w, r#"    <skipped>{}</skipped>"#, escape(skipped))?;
            }
            if let Some(out) = &case.system_out {
                writeln!(w, r#"    <system-out>{}</system-out>"#, escape(out))?;
            }
            writeln!(w, "  </testcase>")?;
        }
        writeln!(w, "</testsuite>")
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
