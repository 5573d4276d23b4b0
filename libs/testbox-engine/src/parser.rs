// Output Parser
// Re-keys raw harness output into per-test outcomes. The structured report
// between the nonce markers is authoritative; the verbose unittest prose on
// stderr fills in whatever the report never got to say.

use crate::harness::MethodBinding;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use testbox_common::types::{TestStatus, TestStatusEntry};

const NO_OUTCOME: &str = "no outcome reported for this test";

lazy_static! {
    static ref VERDICT_LINE: Regex =
        Regex::new(r"(?m)^(test_case_\w+) \([^)]*\)(?: \.\.\.)? .*?(ok|FAIL|ERROR)\s*$").unwrap();
    static ref DETAIL_HEADER: Regex = Regex::new(r"^(FAIL|ERROR): (test_case_\w+) ").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: TestStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    /// Keyed by generated method name
    pub outcomes: HashMap<String, Outcome>,
    /// The submitted module could not be imported
    pub load_error: Option<String>,
    /// A marker-delimited report was found
    pub structured: bool,
}

#[derive(Deserialize)]
struct Report {
    #[serde(default)]
    load_error: Option<String>,
    #[serde(default)]
    results: Vec<ReportEntry>,
}

#[derive(Deserialize)]
struct ReportEntry {
    method: String,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

pub fn parse(stdout: &str, stderr: &str, begin: &str, end: &str) -> ParsedReport {
    let mut parsed = ParsedReport {
        outcomes: parse_prose(stderr),
        ..ParsedReport::default()
    };

    if let Some(report) = extract_report(stdout, begin, end) {
        parsed.structured = true;
        parsed.load_error = report.load_error;
        for entry in report.results {
            let status = match entry.status.as_str() {
                "success" => TestStatus::Success,
                "fail" => TestStatus::Fail,
                _ => TestStatus::Unresolved,
            };
            parsed.outcomes.insert(
                entry.method,
                Outcome {
                    status,
                    error: entry.error,
                },
            );
        }
    }

    parsed
}

/// The last complete marker block in `stdout`
fn extract_report(stdout: &str, begin: &str, end: &str) -> Option<Report> {
    let start = stdout.rfind(begin)? + begin.len();
    let rest = &stdout[start..];
    let stop = rest.find(end)?;
    serde_json::from_str(rest[..stop].trim()).ok()
}

fn is_rule(line: &str, ch: char) -> bool {
    line.len() >= 20 && line.chars().all(|c| c == ch)
}

/// Verdicts from `verbosity=2` lines plus the FAIL/ERROR detail blocks
fn parse_prose(stderr: &str) -> HashMap<String, Outcome> {
    let mut outcomes = HashMap::new();

    for caps in VERDICT_LINE.captures_iter(stderr) {
        let status = match &caps[2] {
            "ok" => TestStatus::Success,
            _ => TestStatus::Fail,
        };
        outcomes.insert(caps[1].to_string(), Outcome { status, error: None });
    }

    let lines: Vec<&str> = stderr.lines().collect();
    let mut idx = 0;
    while idx < lines.len() {
        let Some(caps) = DETAIL_HEADER.captures(lines[idx]) else {
            idx += 1;
            continue;
        };
        let method = caps[2].to_string();
        idx += 1;
        if idx < lines.len() && is_rule(lines[idx], '-') {
            idx += 1;
        }

        let start = idx;
        while idx < lines.len() && !is_rule(lines[idx], '=') && !is_rule(lines[idx], '-') {
            idx += 1;
        }
        let detail = lines[start..idx].join("\n").trim_end().to_string();

        outcomes.insert(
            method,
            Outcome {
                status: TestStatus::Fail,
                error: Some(detail),
            },
        );
    }

    outcomes
}

/// Map outcomes back to caller ids, explicitly by method name.
///
/// Every binding yields exactly one entry; tests without an outcome are
/// `unresolved`. Entries are ordered by id.
pub fn rekey(bindings: &[MethodBinding], parsed: &ParsedReport) -> Vec<TestStatusEntry> {
    let mut entries: Vec<TestStatusEntry> = bindings
        .iter()
        .map(|binding| {
            let (status, error) = match parsed.outcomes.get(&binding.method) {
                Some(outcome) => (outcome.status, outcome.error.clone()),
                None => (
                    TestStatus::Unresolved,
                    Some(
                        parsed
                            .load_error
                            .clone()
                            .unwrap_or_else(|| NO_OUTCOME.to_string()),
                    ),
                ),
            };
            TestStatusEntry {
                id: binding.id.clone(),
                name: binding.name.clone(),
                status,
                error,
            }
        })
        .collect();

    entries.sort_by(|a, b| a.id.cmp(&b.id));
    entries
}
