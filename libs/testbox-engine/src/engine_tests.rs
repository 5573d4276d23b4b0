/// End-to-end runs against a real Docker daemon
///
/// These tests verify the full pipeline on a live host:
/// 1. A passing function reports success per id
/// 2. A wrong answer reports fail with the assertion detail
/// 3. An uninstallable library escalates to an error with install evidence
/// 4. A custom image bakes libraries in so nothing is installed at run time
/// 5. A never-returning function times out and its container is removed
/// 6. State a submission keeps on itself never carries between tests

#[cfg(test)]
mod docker_tests {
    use crate::config::{python_config, LanguageConfigManager};
    use crate::container_spec::{self, SecurityProfile};
    use crate::docker::DockerRuntime;
    use crate::engine::{ExecutionEngine, PhaseCommands, Termination};
    use crate::harness;
    use crate::install::InstallPlan;
    use crate::policy::DenylistPolicy;
    use crate::runtime::ContainerRuntime;
    use crate::testing::{case, submission};
    use crate::Orchestrator;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use testbox_common::config::Settings;
    use testbox_common::types::{
        ExecutionRequest, ImageBuildStatus, ImageRemoveStatus, RunStatus, TestId, TestStatus,
        NOTHING_TO_INSTALL,
    };

    fn languages() -> LanguageConfigManager {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        LanguageConfigManager::load(&path).expect("Failed to load language config")
    }

    async fn orchestrator(timeout: Duration) -> Orchestrator {
        let runtime = Arc::new(DockerRuntime::connect().expect("Failed to connect to Docker"));
        let settings = Settings {
            run_timeout: timeout,
            // CI hosts frequently lack AppArmor
            allow_unconfined: true,
            ..Settings::default()
        };
        Orchestrator::new(runtime, languages(), Arc::new(DenylistPolicy), settings)
            .await
            .expect("Failed to create orchestrator")
    }

    fn add_request(tests: Value) -> ExecutionRequest {
        serde_json::from_value(json!({
            "code": "return a + b",
            "script_name": "add",
            "script_parameters": ["a", "b"],
            "libraries": [],
            "tests": tests
        }))
        .unwrap()
    }

    /// Scenario A
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_add_passes() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let resp = orch
            .execute(add_request(json!([{"id": 1, "parameters": [1, 2], "results": [3]}])))
            .await
            .unwrap();

        assert_eq!(resp.status, RunStatus::Success);
        assert_eq!(resp.install_output, NOTHING_TO_INSTALL);
        assert_eq!(resp.test_statuses.len(), 1);
        assert_eq!(resp.test_statuses[0].id, TestId::Number(1));
        assert_eq!(resp.test_statuses[0].status, TestStatus::Success);
    }

    /// Scenario B
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_wrong_answer_fails_with_trace() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let resp = orch
            .execute(add_request(json!([{"id": 1, "parameters": [1, 2], "results": [4]}])))
            .await
            .unwrap();

        assert_eq!(resp.status, RunStatus::Fail);
        let status = &resp.test_statuses[0];
        assert_eq!(status.status, TestStatus::Fail);
        let trace = status.error.as_deref().unwrap();
        assert!(trace.contains('3') && trace.contains('4'), "trace: {}", trace);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_results_rekeyed_and_isolated() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let resp = orch
            .execute(add_request(json!([
                {"id": "edge case", "parameters": [0, 0], "results": [0]},
                {"id": 10, "parameters": [5, 5], "results": [11]},
                {"id": 2, "parameters": [1, "x"], "results": [3]},
                {"id": 1, "parameters": [1, 2, 3], "results": [3]}
            ])))
            .await
            .unwrap();

        let got: Vec<(TestId, TestStatus)> = resp
            .test_statuses
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();
        assert_eq!(
            got,
            vec![
                (TestId::Number(1), TestStatus::Fail),
                (TestId::Number(2), TestStatus::Fail),
                (TestId::Number(10), TestStatus::Fail),
                (TestId::Text("edge case".into()), TestStatus::Success),
            ]
        );
    }

    /// Scenario C
    #[tokio::test]
    #[ignore] // Requires Docker and network access
    async fn test_uninstallable_library_is_error() {
        let orch = orchestrator(Duration::from_secs(120)).await;

        let mut req = add_request(json!([{"id": 1, "parameters": [1, 2], "results": [3]}]));
        req.libraries = vec!["not-a-real-package-xyz".into()];
        let resp = orch.execute(req).await.unwrap();

        assert_eq!(resp.status, RunStatus::Error);
        assert!(resp.install_output.contains("not-a-real-package-xyz"));
        assert!(resp
            .test_statuses
            .iter()
            .all(|s| s.status == TestStatus::Unresolved));
    }

    /// Scenario D
    #[tokio::test]
    #[ignore] // Requires Docker and network access
    async fn test_custom_image_has_libraries_baked_in() {
        let orch = orchestrator(Duration::from_secs(60)).await;
        let name = format!("testbox-e2e-{}", uuid::Uuid::new_v4().simple());

        let built = orch.build_image(&name, &["numpy".into()]).await.unwrap();
        assert_eq!(built.status, ImageBuildStatus::Success, "log: {}", built.log);

        let req: ExecutionRequest = serde_json::from_value(json!({
            "code": "import numpy\nreturn int(numpy.add(a, b))",
            "script_name": "add",
            "script_parameters": ["a", "b"],
            "libraries": ["numpy"],
            "docker_image": name,
            "tests": [{"id": 1, "parameters": [1, 2], "results": [3]}]
        }))
        .unwrap();
        let resp = orch.execute(req).await.unwrap();

        assert_eq!(resp.status, RunStatus::Success, "output: {}", resp.test_output);
        assert_eq!(resp.install_output, NOTHING_TO_INSTALL);

        let removed = orch.remove_image(&name).await.unwrap();
        assert_eq!(removed.status, ImageRemoveStatus::Success);
        let again = orch.remove_image(&name).await.unwrap();
        assert_eq!(again.status, ImageRemoveStatus::NotFound);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_infinite_loop_times_out() {
        let bound = Duration::from_secs(5);
        let orch = orchestrator(bound).await;

        let req: ExecutionRequest = serde_json::from_value(json!({
            "code": "while True:\n    pass",
            "script_name": "spin",
            "tests": [{"id": 1, "parameters": [], "results": [null]}]
        }))
        .unwrap();

        let started = Instant::now();
        let resp = orch.execute(req).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(resp.status, RunStatus::Error);
        assert!(resp.error.unwrap().contains("timed out"));
        assert!(elapsed < bound + Duration::from_secs(10), "took {:?}", elapsed);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_timed_out_container_is_gone() {
        let runtime = Arc::new(DockerRuntime::connect().expect("Failed to connect to Docker"));
        let language = python_config();
        if runtime.image_labels(&language.image).await.unwrap().is_none() {
            runtime.pull_image(&language.image).await.unwrap();
        }

        let tests = vec![case(1, json!([]), Value::Null)];
        let harness = harness::generate(&submission("spin", &[], "while True:\n    pass", tests)).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        harness.write_to(scratch.path()).unwrap();

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let spec = container_spec::build(
            &run_id,
            &language,
            &language.image,
            scratch.path(),
            &InstallPlan::Nothing,
            &SecurityProfile::default(),
            "bridge",
        );
        let commands = PhaseCommands {
            install: None,
            test: vec![language.interpreter.clone(), "/sandbox/harness.py".into()],
            working_dir: "/sandbox".into(),
            report_marker: harness.begin_marker(),
        };

        let run = ExecutionEngine::new(runtime.clone())
            .run(&run_id, &spec, &commands, Duration::from_secs(3))
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::TimedOut { after: Duration::from_secs(3) });
        assert!(run.removed);
        let live = runtime.list_managed_containers().await.unwrap();
        assert!(live.iter().all(|c| c.id != run.container_id));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_compile_error_reports_load_error() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let req: ExecutionRequest = serde_json::from_value(json!({
            "code": "break",
            "script_name": "add",
            "script_parameters": ["a", "b"],
            "tests": [{"id": 1, "parameters": [1, 2], "results": [3]}]
        }))
        .unwrap();
        let resp = orch.execute(req).await.unwrap();

        assert_eq!(resp.status, RunStatus::Error);
        assert_eq!(resp.test_statuses[0].status, TestStatus::Unresolved);
        assert!(resp.test_statuses[0].error.as_deref().unwrap().contains("SyntaxError"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_syntax_error_rejected_before_run() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let err = orch
            .execute(serde_json::from_value(json!({
                "code": "return (a +",
                "script_name": "add",
                "script_parameters": ["a", "b"],
                "tests": [{"id": 1, "parameters": [1, 2], "results": [3]}]
            }))
            .unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "policy_rejected");
    }

    fn stateful_request(tests: Value) -> ExecutionRequest {
        serde_json::from_value(json!({
            "code": "add.calls = getattr(add, 'calls', 0) + 1\nreturn a + b + add.calls - 1",
            "script_name": "add",
            "script_parameters": ["a", "b"],
            "tests": tests
        }))
        .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_function_state_does_not_leak_between_tests() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let together = orch
            .execute(stateful_request(json!([
                {"id": 1, "parameters": [1, 2], "results": [3]},
                {"id": 2, "parameters": [1, 2], "results": [3]}
            ])))
            .await
            .unwrap();
        let alone = orch
            .execute(stateful_request(json!([
                {"id": 2, "parameters": [1, 2], "results": [3]}
            ])))
            .await
            .unwrap();

        assert_eq!(together.status, RunStatus::Success, "output: {}", together.test_output);
        assert_eq!(alone.test_statuses[0].status, TestStatus::Success);
        assert_eq!(together.test_statuses[1].status, alone.test_statuses[0].status);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_multiline_string_literal_unchanged() {
        let orch = orchestrator(Duration::from_secs(60)).await;

        let req: ExecutionRequest = serde_json::from_value(json!({
            "code": "s = \"\"\"x\ny\"\"\"\nreturn s",
            "script_name": "text",
            "tests": [{"id": 1, "parameters": [], "results": ["x\ny"]}]
        }))
        .unwrap();
        let resp = orch.execute(req).await.unwrap();

        assert_eq!(resp.status, RunStatus::Success, "output: {}", resp.test_output);
    }
}
