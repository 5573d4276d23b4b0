/// Container Spec Builder
///
/// One immutable configuration per run. The same container serves the
/// install phase and then the test phase; there is never a second one.
///
/// Every run gets:
/// - the scratch directory bind-mounted read-write at `/sandbox`
/// - memory, CPU and pid ceilings from the language config
/// - all capabilities dropped and `no-new-privileges`
/// - the resolved AppArmor profile, when the host supports one
/// - networking disabled, unless there is something to install, in which
///   case the install network is attached and detached again before tests
use crate::config::LanguageConfig;
use crate::error::{Result, SandboxError};
use crate::install::InstallPlan;
use crate::runtime::{MANAGED_LABEL, RUN_ID_LABEL};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use testbox_common::config::Settings;
use tracing::warn;

pub const SCRATCH_MOUNT: &str = "/sandbox";
pub const CONTAINER_PREFIX: &str = "testbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Disabled,
    /// Attached for the install phase only
    InstallOnly(String),
}

/// Mandatory-access-control decision, made once per process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityProfile {
    apparmor: Option<String>,
}

impl SecurityProfile {
    pub fn apparmor(&self) -> Option<&str> {
        self.apparmor.as_deref()
    }
}

/// Decide which profile runs get.
///
/// A host without AppArmor only runs unconfined when the operator opted in;
/// otherwise this is a startup error.
pub fn resolve_security_profile(host_supports: bool, settings: &Settings) -> Result<SecurityProfile> {
    if host_supports {
        return Ok(SecurityProfile {
            apparmor: Some(settings.apparmor_profile.clone()),
        });
    }
    if settings.allow_unconfined {
        warn!(
            profile = %settings.apparmor_profile,
            "Host does not support AppArmor; running WITHOUT a mandatory access control profile (TESTBOX_ALLOW_UNCONFINED=true)"
        );
        return Ok(SecurityProfile { apparmor: None });
    }
    Err(SandboxError::Internal(
        "host does not support AppArmor; set TESTBOX_ALLOW_UNCONFINED=true to run without a profile"
            .to_string(),
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub scratch_dir: PathBuf,
    pub working_dir: String,
    pub keepalive_cmd: Vec<String>,
    pub env: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub network: NetworkMode,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn bind(&self) -> String {
        format!("{}:{}:rw", self.scratch_dir.display(), SCRATCH_MOUNT)
    }

    pub fn network_disabled(&self) -> bool {
        self.network == NetworkMode::Disabled
    }

    /// Docker network mode for container creation
    pub fn network_mode(&self) -> &str {
        match &self.network {
            NetworkMode::Disabled => "none",
            NetworkMode::InstallOnly(network) => network,
        }
    }
}

pub fn container_name(run_id: &str) -> String {
    format!("{}-{}", CONTAINER_PREFIX, run_id)
}

pub fn build(
    run_id: &str,
    language: &LanguageConfig,
    image: &str,
    scratch_dir: &Path,
    plan: &InstallPlan,
    profile: &SecurityProfile,
    install_network: &str,
) -> ContainerSpec {
    let network = if plan.is_empty() {
        NetworkMode::Disabled
    } else {
        NetworkMode::InstallOnly(install_network.to_string())
    };

    let mut security_opt = vec!["no-new-privileges:true".to_string()];
    if let Some(apparmor) = profile.apparmor() {
        security_opt.push(format!("apparmor={}", apparmor));
    }

    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (RUN_ID_LABEL.to_string(), run_id.to_string()),
    ]);

    ContainerSpec {
        name: container_name(run_id),
        image: image.to_string(),
        scratch_dir: scratch_dir.to_path_buf(),
        working_dir: SCRATCH_MOUNT.to_string(),
        keepalive_cmd: vec!["sleep".to_string(), "infinity".to_string()],
        env: vec![
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
            "PYTHONIOENCODING=utf-8".to_string(),
        ],
        memory_bytes: language.memory_limit_bytes(),
        nano_cpus: language.nano_cpus(),
        pids_limit: language.pids_limit,
        network,
        cap_drop: vec!["ALL".to_string()],
        security_opt,
        labels,
    }
}
