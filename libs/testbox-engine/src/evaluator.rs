/// Response Assembler
///
/// **Core Responsibility:**
/// Turn a finished run into the reply contract: install output, raw harness
/// output, per-test outcomes keyed by caller id, and one overall status.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Never returns empty-handed: whatever output exists is carried along
/// - Every submitted test appears exactly once in `test_statuses`
///
/// **Status Rules:**
/// - Build, start or timeout failure, or a runtime fault: `error`, every
///   test `unresolved`
/// - Harness crash: `error`, with whatever verdicts the prose still shows
/// - No tests: `no_tests`
/// - All tests unresolved: `error`
/// - All tests passed: `success`
/// - Anything else: `fail`
use crate::engine::{ContainerRun, Termination};
use crate::error::SandboxError;
use crate::harness::{HarnessSpec, MethodBinding};
use crate::parser::{self, ParsedReport};
use crate::runtime::ExecOutput;
use testbox_common::types::{
    ExecutionResponse, RunStatus, TestStatus, TestStatusEntry, NOTHING_TO_INSTALL,
};

/// Overall status from per-test outcomes of a run that completed
pub fn overall_status(statuses: &[TestStatusEntry]) -> RunStatus {
    if statuses.is_empty() {
        RunStatus::NoTests
    } else if statuses.iter().all(|s| s.status == TestStatus::Unresolved) {
        RunStatus::Error
    } else if statuses.iter().all(|s| s.status == TestStatus::Success) {
        RunStatus::Success
    } else {
        RunStatus::Fail
    }
}

fn unresolved(bindings: &[MethodBinding]) -> Vec<TestStatusEntry> {
    parser::rekey(bindings, &ParsedReport::default())
        .into_iter()
        .map(|entry| TestStatusEntry { error: None, ..entry })
        .collect()
}

fn install_output(install: Option<&ExecOutput>) -> String {
    install
        .map(ExecOutput::combined)
        .unwrap_or_else(|| NOTHING_TO_INSTALL.to_string())
}

fn exit_description(output: Option<&ExecOutput>) -> String {
    match output.and_then(|o| o.exit_code) {
        Some(code) => format!("exit code {}", code),
        None => "unknown exit status".to_string(),
    }
}

/// Last line of a traceback, the part that names the exception
fn summary_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or(text)
        .trim()
}

/// Response for a run that failed before producing any per-test data
pub fn failure(
    bindings: &[MethodBinding],
    install_output: String,
    test_output: String,
    err: &SandboxError,
) -> ExecutionResponse {
    ExecutionResponse {
        status: RunStatus::Error,
        install_output,
        test_output,
        test_statuses: unresolved(bindings),
        error: Some(err.to_string()),
    }
}

/// Assemble the reply for a run the engine brought to an end
pub fn assemble(run: &ContainerRun, harness: &HarnessSpec) -> ExecutionResponse {
    let install = install_output(run.install.as_ref());
    let test_output = run
        .test
        .as_ref()
        .map(ExecOutput::combined)
        .unwrap_or_default();

    match &run.termination {
        Termination::InstallFailed => {
            let err = SandboxError::BuildFailure(format!(
                "library installation failed with {}",
                exit_description(run.install.as_ref())
            ));
            failure(&harness.bindings, install, test_output, &err)
        }
        Termination::TimedOut { after } => {
            let err = SandboxError::Timeout {
                ms: after.as_millis() as u64,
            };
            failure(&harness.bindings, install, test_output, &err)
        }
        Termination::Faulted(reason) => {
            let err = SandboxError::Internal(format!("run aborted: {}", reason));
            failure(&harness.bindings, install, test_output, &err)
        }
        Termination::Crashed => {
            let (stdout, stderr) = run
                .test
                .as_ref()
                .map(|o| (o.stdout.as_str(), o.stderr.as_str()))
                .unwrap_or(("", ""));
            let parsed =
                parser::parse(stdout, stderr, &harness.begin_marker(), &harness.end_marker());
            let err = SandboxError::RuntimeCrash(format!(
                "harness exited with {} before reporting",
                exit_description(run.test.as_ref())
            ));
            ExecutionResponse {
                status: RunStatus::Error,
                install_output: install,
                test_output,
                test_statuses: parser::rekey(&harness.bindings, &parsed),
                error: Some(err.to_string()),
            }
        }
        Termination::Completed => {
            let (stdout, stderr) = run
                .test
                .as_ref()
                .map(|o| (o.stdout.as_str(), o.stderr.as_str()))
                .unwrap_or(("", ""));
            let parsed =
                parser::parse(stdout, stderr, &harness.begin_marker(), &harness.end_marker());
            let test_statuses = parser::rekey(&harness.bindings, &parsed);
            let status = match &parsed.load_error {
                Some(_) => RunStatus::Error,
                None => overall_status(&test_statuses),
            };
            let error = parsed
                .load_error
                .as_deref()
                .map(|trace| format!("submitted code failed to load: {}", summary_line(trace)));

            ExecutionResponse {
                status,
                install_output: install,
                test_output,
                test_statuses,
                error,
            }
        }
    }
}
