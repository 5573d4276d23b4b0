/// Execution Engine
///
/// Drives one container through its lifecycle:
///
/// `Created → Started → Installing → Testing → {Completed | TimedOut | Crashed} → Removed`
///
/// **Guarantees:**
/// - One container per run; install and test phases share it, strictly in order
/// - A single wall-clock timeout bounds start, install and test together
/// - On expiry the container is killed, the run is `TimedOut`, and it is still removed
/// - Removal is attempted on every path; a guard retries it if the run future is
///   dropped midway (client disconnect, panic)
/// - Install and test output are captured in full, separately
///
/// The engine does not judge test results. It reports what happened and
/// leaves parsing to `parser` and aggregation to `evaluator`.
use crate::container_spec::{ContainerSpec, NetworkMode};
use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerRuntime, ExecOutput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Started,
    Installing,
    Testing,
    Completed,
    TimedOut,
    Crashed,
    Removed,
}

/// How the run ended, before cleanup
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed,
    /// Install exec exited non-zero; tests never ran
    InstallFailed,
    TimedOut { after: Duration },
    /// Test exec exited non-zero without printing a report
    Crashed,
    /// The runtime failed mid-run (exec stream, network detach)
    Faulted(String),
}

impl Termination {
    fn state(&self) -> RunState {
        match self {
            Termination::Completed => RunState::Completed,
            Termination::TimedOut { .. } => RunState::TimedOut,
            Termination::InstallFailed | Termination::Crashed | Termination::Faulted(_) => {
                RunState::Crashed
            }
        }
    }
}

/// What to execute inside the container
#[derive(Debug, Clone)]
pub struct PhaseCommands {
    pub install: Option<Vec<String>>,
    pub test: Vec<String>,
    pub working_dir: String,
    /// Presence in test stdout means the harness got to report
    pub report_marker: String,
}

#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub run_id: String,
    pub container_id: String,
    pub image: String,
    pub history: Vec<RunState>,
    pub install: Option<ExecOutput>,
    pub test: Option<ExecOutput>,
    pub termination: Termination,
    pub elapsed: Duration,
    pub removed: bool,
}

impl ContainerRun {
    pub fn state(&self) -> Option<RunState> {
        self.history.last().copied()
    }
}

#[derive(Debug, Default)]
struct Progress {
    history: Vec<RunState>,
    install: Option<ExecOutput>,
    test: Option<ExecOutput>,
}

impl Progress {
    fn enter(&mut self, state: RunState) {
        debug!(?state, "Run state");
        self.history.push(state);
    }
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if the run future is cancelled
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, container_id: String) -> Self {
        Self {
            runtime,
            container_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runtime = self.runtime.clone();
        let container_id = self.container_id.clone();

        // Best-effort cleanup - cannot be async in Drop
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.remove_container(&container_id).await {
                        warn!(container_id = %container_id, error = %e, "⚠ Failed to cleanup container");
                    }
                });
            }
            Err(_) => warn!(
                container_id = %self.container_id,
                "⚠ No async runtime for cleanup; container left for the reaper"
            ),
        }
    }
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Run both phases in one container under `timeout`.
    ///
    /// Returns `Err` only when the container could not be created or
    /// started; the container has been removed by then either way. Runtime
    /// faults after start end the run as `Faulted` with the output captured
    /// so far.
    #[tracing::instrument(skip(self, spec, commands), fields(image = %spec.image))]
    pub async fn run(
        &self,
        run_id: &str,
        spec: &ContainerSpec,
        commands: &PhaseCommands,
        timeout: Duration,
    ) -> Result<ContainerRun> {
        let started = Instant::now();
        let mut progress = Progress::default();

        let container_id = self
            .runtime
            .create_container(spec)
            .await
            .map_err(|e| SandboxError::StartFailure(format!("create container: {}", e)))?;
        progress.enter(RunState::Created);
        let mut guard = ContainerGuard::new(self.runtime.clone(), container_id.clone());

        let outcome = tokio::time::timeout(
            timeout,
            self.drive(&container_id, spec, commands, &mut progress),
        )
        .await;

        let result = match outcome {
            Ok(Ok(termination)) => Ok(termination),
            Ok(Err(e @ SandboxError::StartFailure(_))) => Err(e),
            Ok(Err(e)) => {
                warn!(container_id = %container_id, error = %e, "Runtime fault during run");
                Ok(Termination::Faulted(e.to_string()))
            }
            Err(_) => {
                warn!(container_id = %container_id, timeout_ms = timeout.as_millis() as u64, "⚠ Run timed out, killing container");
                if let Err(e) = self.runtime.kill_container(&container_id).await {
                    warn!(container_id = %container_id, error = %e, "Failed to kill container");
                }
                Ok(Termination::TimedOut { after: timeout })
            }
        };

        if let Ok(termination) = &result {
            progress.enter(termination.state());
        }

        let removed = match self.runtime.remove_container(&container_id).await {
            Ok(()) => {
                guard.disarm();
                progress.enter(RunState::Removed);
                true
            }
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Container removal failed, retrying in background");
                false
            }
        };

        let elapsed = started.elapsed();
        let termination = result?;
        info!(
            container_id = %container_id,
            termination = ?termination,
            elapsed_ms = elapsed.as_millis() as u64,
            "Run finished"
        );

        Ok(ContainerRun {
            run_id: run_id.to_string(),
            container_id,
            image: spec.image.clone(),
            history: progress.history,
            install: progress.install,
            test: progress.test,
            termination,
            elapsed,
            removed,
        })
    }

    async fn drive(
        &self,
        container_id: &str,
        spec: &ContainerSpec,
        commands: &PhaseCommands,
        progress: &mut Progress,
    ) -> Result<Termination> {
        self.runtime
            .start_container(container_id)
            .await
            .map_err(|e| SandboxError::StartFailure(format!("start container: {}", e)))?;
        progress.enter(RunState::Started);

        if let Some(argv) = &commands.install {
            progress.enter(RunState::Installing);
            let output = progress.install.insert(ExecOutput::default());
            self.runtime
                .exec(container_id, argv, &commands.working_dir, output)
                .await?;
            if !output.succeeded() {
                warn!(exit_code = ?output.exit_code, "Library installation failed");
                return Ok(Termination::InstallFailed);
            }

            if let NetworkMode::InstallOnly(network) = &spec.network {
                self.runtime.disconnect_network(container_id, network).await?;
                debug!(network = %network, "Install network detached");
            }
        }

        progress.enter(RunState::Testing);
        let output = progress.test.insert(ExecOutput::default());
        self.runtime
            .exec(container_id, &commands.test, &commands.working_dir, output)
            .await?;

        if !output.succeeded() && !output.stdout.contains(&commands.report_marker) {
            warn!(exit_code = ?output.exit_code, "Harness exited without a report");
            return Ok(Termination::Crashed);
        }
        Ok(Termination::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::python_config;
    use crate::container_spec::{self, SecurityProfile};
    use crate::install::{InstallPlan, Library};
    use crate::testing::{FakeRuntime, ScriptedExec};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn spec(plan: &InstallPlan) -> ContainerSpec {
        container_spec::build(
            "run1",
            &python_config(),
            "python:3.11-slim",
            Path::new("/tmp/run1"),
            plan,
            &SecurityProfile::default(),
            "bridge",
        )
    }

    fn commands(install: bool) -> PhaseCommands {
        PhaseCommands {
            install: install.then(|| vec!["python3".into(), "-m".into(), "pip".into()]),
            test: vec!["python3".into(), "/sandbox/harness.py".into()],
            working_dir: "/sandbox".into(),
            report_marker: "@@REPORT".into(),
        }
    }

    fn output(stdout: &str, stderr: &str, exit_code: i64) -> ScriptedExec {
        ScriptedExec::Output(ExecOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        })
    }

    fn engine(runtime: &Arc<FakeRuntime>) -> ExecutionEngine {
        ExecutionEngine::new(runtime.clone())
    }

    #[tokio::test]
    async fn test_completed_run_is_removed() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(output("@@REPORT {}", "", 0));

        let run = engine(&runtime)
            .run("run1", &spec(&InstallPlan::Nothing), &commands(false), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::Completed);
        assert_eq!(
            run.history,
            vec![
                RunState::Created,
                RunState::Started,
                RunState::Testing,
                RunState::Completed,
                RunState::Removed
            ]
        );
        assert!(run.install.is_none());
        assert!(run.removed);
        assert_eq!(runtime.removed_containers(), vec![run.container_id.clone()]);
    }

    #[tokio::test]
    async fn test_install_then_network_detached() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(output("Successfully installed numpy", "", 0));
        runtime.script(output("@@REPORT {}", "", 0));
        let plan = InstallPlan::Install(vec![Library::parse("numpy").unwrap()]);

        let run = engine(&runtime)
            .run("run1", &spec(&plan), &commands(true), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.history[2], RunState::Installing);
        assert_eq!(run.install.unwrap().stdout, "Successfully installed numpy");
        assert_eq!(
            runtime.disconnected(),
            vec![(run.container_id.clone(), "bridge".to_string())]
        );
        // one container served both phases
        assert_eq!(runtime.created_specs().len(), 1);
        assert_eq!(runtime.exec_argvs().len(), 2);
    }

    #[tokio::test]
    async fn test_runtime_fault_keeps_captured_output() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_disconnect();
        runtime.script(output("Successfully installed numpy-1.26", "", 0));
        let plan = InstallPlan::Install(vec![Library::parse("numpy").unwrap()]);

        let run = engine(&runtime)
            .run("run1", &spec(&plan), &commands(true), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(&run.termination, Termination::Faulted(msg) if msg.contains("network disconnect failed")));
        assert_eq!(run.install.unwrap().stdout, "Successfully installed numpy-1.26");
        assert!(run.test.is_none());
        assert!(run.removed);
    }

    #[tokio::test]
    async fn test_install_failure_skips_tests() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(output("", "ERROR: No matching distribution found", 1));
        let plan = InstallPlan::Install(vec![Library::parse("not-a-real-package-xyz").unwrap()]);

        let run = engine(&runtime)
            .run("run1", &spec(&plan), &commands(true), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::InstallFailed);
        assert!(run.test.is_none());
        assert!(runtime.disconnected().is_empty());
        assert_eq!(runtime.exec_argvs().len(), 1);
        assert_eq!(run.state(), Some(RunState::Removed));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_removes() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(ScriptedExec::Hang(ExecOutput {
            stdout: "partial".into(),
            ..ExecOutput::default()
        }));

        let bound = Duration::from_millis(100);
        let run = engine(&runtime)
            .run("run1", &spec(&InstallPlan::Nothing), &commands(false), bound)
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::TimedOut { after: bound });
        assert!(run.elapsed < bound + Duration::from_secs(2));
        assert_eq!(run.test.unwrap().stdout, "partial");
        assert_eq!(runtime.killed_containers(), vec![run.container_id.clone()]);
        assert_eq!(runtime.removed_containers(), vec![run.container_id.clone()]);
        assert!(run.history.ends_with(&[RunState::TimedOut, RunState::Removed]));
    }

    #[tokio::test]
    async fn test_exit_without_report_is_crash() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(output("", "Segmentation fault", 139));

        let run = engine(&runtime)
            .run("run1", &spec(&InstallPlan::Nothing), &commands(false), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::Crashed);
        assert!(run.removed);
    }

    #[tokio::test]
    async fn test_failing_tests_with_report_complete() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(output("@@REPORT {}", "FAIL", 1));

        let run = engine(&runtime)
            .run("run1", &spec(&InstallPlan::Nothing), &commands(false), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::Completed);
    }

    #[tokio::test]
    async fn test_start_failure_still_removes() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_start();

        let err = engine(&runtime)
            .run("run1", &spec(&InstallPlan::Nothing), &commands(false), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::StartFailure(_)));
        assert_eq!(runtime.removed_containers().len(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_start_failure() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_create();

        let err = engine(&runtime)
            .run("run1", &spec(&InstallPlan::Nothing), &commands(false), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::StartFailure(_)));
        assert!(runtime.removed_containers().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_run_cleans_up_via_guard() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(ScriptedExec::Hang(ExecOutput::default()));
        let engine = engine(&runtime);
        let spec = spec(&InstallPlan::Nothing);
        let commands = commands(false);

        let run = engine.run("run1", &spec, &commands, Duration::from_secs(60));
        // abandon the run like a disconnected client would
        let _ = tokio::time::timeout(Duration::from_millis(50), run).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(runtime.removed_containers().len(), 1);
    }
}
