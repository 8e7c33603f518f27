//! JUnit XML result-file parser.
//!
//! Reads a whole (bounded-size) result file and produces one
//! [`ParsedTestCase`] per `<testcase>`, whether it sits under
//! `<testsuites>`, a bare `<testsuite>`, or nested suites. A `<failure>`
//! or `<error>` child marks the case failed. Captured output is scanned
//! for `[[ATTACHMENT|path]]` markers.
//!
//! Test names and error text are secret-redacted before they leave this
//! crate, and error text is truncated to a fixed budget.

use anyhow::{Context, Result, bail};
use planship_redact::redact;
use planship_schema::result::{Outcome, ParsedTestCase};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Hard ceiling for the result file itself; larger inputs are rejected.
pub const MAX_RESULT_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Character budget for one error message, truncation marker included.
pub const MAX_ERROR_LEN: usize = 4096;

const TRUNCATION_MARKER: &str = "...[truncated]";

// The path match is bounded so a pathological marker cannot blow up the
// scan; anything longer than the bound is simply not a valid marker.
static ATTACHMENT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[ATTACHMENT\|([^\[\]|]{1,4096})\]\]").expect("static attachment pattern")
});

/// Parses a JUnit XML file into execution records.
///
/// Rejects missing files, non-regular files, and files above
/// [`MAX_RESULT_FILE_SIZE`]; these are primary inputs, so a suspicious
/// file fails loudly instead of being skipped.
pub fn parse_junit(path: &Path) -> Result<Vec<ParsedTestCase>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("stat result file {}", path.display()))?;
    if !meta.is_file() {
        bail!("result path is not a regular file: {}", path.display());
    }
    if meta.len() > MAX_RESULT_FILE_SIZE {
        bail!(
            "result file is too large ({} bytes, max {}): {}",
            meta.len(),
            MAX_RESULT_FILE_SIZE,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read result file {}", path.display()))?;
    parse_junit_str(&content)
}

/// Parses JUnit XML from an in-memory string (no file-level checks).
pub fn parse_junit_str(content: &str) -> Result<Vec<ParsedTestCase>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut results = Vec::new();
    let mut current: Option<CaseInProgress> = None;
    let mut in_fault = false;
    let mut in_output = false;

    loop {
        match reader.read_event().context("parse JUnit XML")? {
            Event::Start(e) => match e.name().as_ref() {
                b"testcase" => current = Some(read_case_start(&e)?),
                b"failure" | b"error" => {
                    in_fault = true;
                    if let Some(case) = current.as_mut() {
                        case.mark_failed(fault_message(&e)?);
                    }
                }
                b"system-out" | b"system-err" => in_output = true,
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"testcase" => results.push(read_case_start(&e)?.finish()),
                b"failure" | b"error" => {
                    if let Some(case) = current.as_mut() {
                        case.mark_failed(fault_message(&e)?);
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape().context("decode text node")?;
                if let Some(case) = current.as_mut() {
                    if in_fault {
                        case.push_fault_text(&text);
                    } else if in_output {
                        case.push_output(&text);
                    }
                }
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t).into_owned();
                if let Some(case) = current.as_mut() {
                    if in_fault {
                        case.push_fault_text(&text);
                    } else if in_output {
                        case.push_output(&text);
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"testcase" => {
                    if let Some(case) = current.take() {
                        results.push(case.finish());
                    }
                }
                b"failure" | b"error" => in_fault = false,
                b"system-out" | b"system-err" => in_output = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(results)
}

struct CaseInProgress {
    name: String,
    duration_ms: f64,
    failed: bool,
    fault_message: Option<String>,
    fault_text: String,
    output: String,
}

impl CaseInProgress {
    fn mark_failed(&mut self, message: Option<String>) {
        self.failed = true;
        if self.fault_message.is_none() {
            self.fault_message = message;
        }
    }

    fn push_fault_text(&mut self, text: &str) {
        if !self.fault_text.is_empty() {
            self.fault_text.push('\n');
        }
        self.fault_text.push_str(text);
    }

    fn push_output(&mut self, text: &str) {
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(text);
    }

    fn finish(self) -> ParsedTestCase {
        let error_message = if self.failed {
            let mut parts = Vec::new();
            if let Some(m) = self.fault_message {
                if !m.is_empty() {
                    parts.push(m);
                }
            }
            if !self.fault_text.is_empty() {
                parts.push(self.fault_text);
            }
            if parts.is_empty() {
                None
            } else {
                Some(truncate_error(&redact(&parts.join("\n"))))
            }
        } else {
            None
        };

        let attachments = extract_attachments(&self.output);

        ParsedTestCase {
            name: redact(&self.name),
            duration_ms: self.duration_ms,
            outcome: if self.failed {
                Outcome::Failed
            } else {
                Outcome::Passed
            },
            error_message,
            attachments,
        }
    }
}

fn read_case_start(e: &BytesStart<'_>) -> Result<CaseInProgress> {
    let mut name = String::new();
    let mut duration_ms = 0.0;
    for attr in e.attributes() {
        let attr = attr.context("read testcase attribute")?;
        match attr.key.as_ref() {
            b"name" => name = attr.unescape_value().context("decode name")?.into_owned(),
            b"time" => {
                let raw = attr.unescape_value().context("decode time")?;
                duration_ms = raw.trim().parse::<f64>().unwrap_or(0.0) * 1000.0;
            }
            _ => {}
        }
    }
    Ok(CaseInProgress {
        name,
        duration_ms,
        failed: false,
        fault_message: None,
        fault_text: String::new(),
        output: String::new(),
    })
}

fn fault_message(e: &BytesStart<'_>) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.context("read failure attribute")?;
        if attr.key.as_ref() == b"message" {
            return Ok(Some(
                attr.unescape_value().context("decode message")?.into_owned(),
            ));
        }
    }
    Ok(None)
}

/// Extracts `[[ATTACHMENT|path]]` references from captured output.
pub fn extract_attachments(output: &str) -> Vec<String> {
    ATTACHMENT_MARKER
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect()
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let keep = MAX_ERROR_LEN - TRUNCATION_MARKER.chars().count();
    let mut out: String = message.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
