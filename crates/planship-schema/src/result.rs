use crate::backend::{PointRef, TestCaseRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one automated test execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
}

impl Outcome {
    /// The literal the backend expects in result payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "Passed",
            Outcome::Failed => "Failed",
        }
    }
}

/// One execution record as read from a JUnit result file.
///
/// Ephemeral: produced by the result-file parser, consumed once per sync
/// run. Names and error text are already secret-redacted by the parser.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ParsedTestCase {
    pub name: String,
    pub duration_ms: f64,
    pub outcome: Outcome,
    pub error_message: Option<String>,
    /// Paths extracted from `[[ATTACHMENT|...]]` markers in captured output.
    pub attachments: Vec<String>,
}

/// A parsed result joined with its resolved test case.
///
/// A record whose `point` is still `None` after point mapping must not be
/// published; the backend would file it under an "unassigned" bucket.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub test_case: TestCaseRef,
    pub title: String,
    pub automated_test_name: String,
    pub duration_ms: f64,
    pub outcome: Outcome,
    pub error_message: Option<String>,
    pub point: Option<PointRef>,
    /// Local artifact files to upload alongside this result.
    pub local_attachments: Vec<PathBuf>,
}

impl ResultRecord {
    pub fn is_publishable(&self) -> bool {
        self.point.is_some()
    }
}
