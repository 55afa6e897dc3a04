use serde::{Deserialize, Serialize};

use crate::sanitize::{Sanitize, Sanitizer};

/// Aggregated statistics of a test report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TestStats {
    pub errors: u32,
    pub failures: u32,
    pub skipped: u32,
    pub tests: u32,
    /// Elapsed time of the first reported suite, in seconds.
    pub time: f64,
    /// Timestamp of the first reported suite, as written by the framework.
    pub timestamp: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Failure {
    pub stacktrace: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub time: f64,
    pub failure: Option<Failure>,
}

impl TestCase {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TestReport {
    pub stats: TestStats,
    pub tests: Vec<TestCase>,
}

impl TestReport {
    /// Appends a failing case and counts it in the statistics.
    pub fn push_failed_case(&mut self, case: TestCase) {
        self.stats.tests += 1;
        self.stats.failures += 1;
        self.tests.push(case);
    }

    /// Number of cases that did not pass, as reported by the framework.
    pub fn unsuccessful(&self) -> u32 {
        self.stats.failures + self.stats.errors
    }
}

/// A deduplicated memory error attributed to a file and line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemoryFinding {
    /// `Memory leak N`, numbered in order of first occurrence.
    pub name: String,
    pub file: String,
    pub line: u32,
    pub stacktrace: String,
    pub message: String,
    /// How many raw errors were grouped into this finding.
    pub occurrences: u32,
}

impl From<MemoryFinding> for TestCase {
    fn from(f: MemoryFinding) -> Self {
        TestCase {
            name: f.name,
            file: Some(f.file),
            line: Some(f.line),
            time: 0.0,
            failure: Some(Failure {
                stacktrace: f.stacktrace,
                message: f.message,
            }),
        }
    }
}

impl Sanitize for Failure {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        self.stacktrace.sanitize(sanitizer);
        self.message.sanitize(sanitizer);
    }
}

impl Sanitize for TestCase {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        self.name.sanitize(sanitizer);
        self.file.sanitize(sanitizer);
        self.failure.sanitize(sanitizer);
    }
}

impl Sanitize for TestReport {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        self.tests.sanitize(sanitizer);
    }
}
