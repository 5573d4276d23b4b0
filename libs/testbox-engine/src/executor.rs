/// Orchestrator - High-Level Pipeline
///
/// **Responsibility:**
/// Take one execution request from the wire to the reply:
/// 1. Validate the request and consult the policy gate (no container yet)
/// 2. Resolve the image: base image (pulled if missing) or a leased custom image
/// 3. Plan installs, generate the harness, write it to a scratch directory
/// 4. Wait for an admission permit, build the container spec, run the engine
/// 5. Parse and assemble the response
///
/// Rejections (validation, policy, unknown or busy image) come back as
/// `Err` before any container exists. Build, start, timeout and crash
/// failures come back as an `error` response carrying the evidence.
use crate::config::LanguageConfigManager;
use crate::container_spec::{self, resolve_security_profile, SecurityProfile, SCRATCH_MOUNT};
use crate::engine::{ExecutionEngine, PhaseCommands};
use crate::error::{Result, SandboxError};
use crate::evaluator;
use crate::harness::{self, HARNESS_FILE};
use crate::images::ImageManager;
use crate::install::InstallPlan;
use crate::policy::{PolicyGate, PolicyVerdict};
use crate::reaper::Reaper;
use crate::runtime::ContainerRuntime;
use crate::validate::validate;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use testbox_common::config::Settings;
use testbox_common::types::{
    ExecutionRequest, ExecutionResponse, ImageBuildResponse, ImageRemoveResponse,
    ImageStatusResponse, NOTHING_TO_INSTALL,
};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Language whose base image custom images are built from
pub const IMAGE_BASE_LANGUAGE: &str = "python";

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    engine: ExecutionEngine,
    images: ImageManager,
    languages: LanguageConfigManager,
    policy: Arc<dyn PolicyGate>,
    settings: Settings,
    profile: SecurityProfile,
    admission: Semaphore,
}

impl Orchestrator {
    /// Resolves the AppArmor decision against the host once, up front
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        languages: LanguageConfigManager,
        policy: Arc<dyn PolicyGate>,
        settings: Settings,
    ) -> Result<Self> {
        let host_supports = runtime.host_supports_apparmor().await?;
        let profile = resolve_security_profile(host_supports, &settings)?;

        let base = languages
            .get_config(IMAGE_BASE_LANGUAGE)
            .cloned()
            .ok_or_else(|| {
                SandboxError::Internal(format!(
                    "language '{}' must be configured",
                    IMAGE_BASE_LANGUAGE
                ))
            })?;

        info!(
            apparmor = ?profile.apparmor(),
            max_concurrent_runs = settings.max_concurrent_runs,
            run_timeout_ms = settings.run_timeout.as_millis() as u64,
            "Orchestrator ready"
        );

        Ok(Self {
            engine: ExecutionEngine::new(runtime.clone()),
            images: ImageManager::new(runtime.clone(), base),
            admission: Semaphore::new(settings.max_concurrent_runs.max(1)),
            runtime,
            languages,
            policy,
            settings,
            profile,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    /// Runs currently holding a permit
    pub fn active_runs(&self) -> usize {
        self.settings
            .max_concurrent_runs
            .max(1)
            .saturating_sub(self.admission.available_permits())
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.runtime.clone(), self.settings.run_timeout)
    }

    #[tracing::instrument(skip(self, request), fields(run_id = tracing::field::Empty))]
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let submission = validate(request, &self.languages)?;

        if let PolicyVerdict::Deny { reasons } = self.policy.check(&submission.code) {
            warn!(reasons = ?reasons, "Submission rejected by policy");
            return Err(SandboxError::PolicyRejected(reasons.join("; ")));
        }

        let (image, baked, _lease) = match &submission.docker_image {
            Some(name) => {
                let (lease, custom) = self.images.lease_for_run(name).await?;
                (custom.name, custom.libraries, Some(lease))
            }
            None => {
                self.ensure_base_image(&submission.language.image).await?;
                (submission.language.image.clone(), BTreeSet::new(), None)
            }
        };

        let plan = InstallPlan::for_libraries(&submission.libraries).without_baked(&baked);
        let harness = harness::generate(&submission)?;
        let interpreter = submission.language.interpreter.clone();

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| SandboxError::Internal("admission control closed".to_string()))?;

        let scratch = self.scratch_dir()?;
        harness.write_to(scratch.path())?;

        let spec = container_spec::build(
            &run_id,
            &submission.language,
            &image,
            scratch.path(),
            &plan,
            &self.profile,
            &self.settings.install_network,
        );
        let commands = PhaseCommands {
            install: plan.argv(&interpreter),
            test: vec![interpreter, format!("{}/{}", SCRATCH_MOUNT, HARNESS_FILE)],
            working_dir: SCRATCH_MOUNT.to_string(),
            report_marker: harness.begin_marker(),
        };

        info!(
            image = %image,
            tests = harness.bindings.len(),
            install = %plan.directive(&submission.language.interpreter),
            "Starting run"
        );

        let response = match self
            .engine
            .run(&run_id, &spec, &commands, self.settings.run_timeout)
            .await
        {
            Ok(run) => evaluator::assemble(&run, &harness),
            Err(err @ SandboxError::StartFailure(_)) => {
                warn!(error = %err, "Run could not start");
                let install_output = if plan.is_empty() {
                    NOTHING_TO_INSTALL.to_string()
                } else {
                    String::new()
                };
                evaluator::failure(&harness.bindings, install_output, String::new(), &err)
            }
            Err(err) => return Err(err),
        };

        info!(status = response.status.as_str(), "Run complete");
        Ok(response)
    }

    async fn ensure_base_image(&self, image: &str) -> Result<()> {
        if self.runtime.image_labels(image).await?.is_some() {
            return Ok(());
        }
        self.runtime.pull_image(image).await.map_err(|e| match e {
            SandboxError::ImageUnavailable(_) => e,
            other => SandboxError::ImageUnavailable(format!("{}: {}", image, other)),
        })
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("testbox-");
        let dir = match &self.settings.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    pub async fn build_image(&self, image_name: &str, libraries: &[String]) -> Result<ImageBuildResponse> {
        self.images.build(image_name, libraries).await
    }

    pub async fn remove_image(&self, image_name: &str) -> Result<ImageRemoveResponse> {
        self.images.remove(image_name).await
    }

    pub async fn image_status(&self, image_name: &str) -> Result<ImageStatusResponse> {
        self.images.status(image_name).await
    }
}
