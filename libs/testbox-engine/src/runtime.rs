// Container runtime abstraction
// The engine and the image manager talk to this trait only; `docker.rs`
// implements it over bollard and tests use a scripted fake.

use crate::container_spec::ContainerSpec;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Labels applied to every container and image the service creates
pub const MANAGED_LABEL: &str = "testbox.managed";
pub const RUN_ID_LABEL: &str = "testbox.run_id";
pub const BASE_IMAGE_LABEL: &str = "testbox.base_image";
pub const LIBRARIES_LABEL: &str = "testbox.libraries";

/// Output of one exec inside a container, filled while the process runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    /// stdout followed by stderr, nothing dropped
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => {
                format!("{}{}", self.stdout, self.stderr)
            }
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Incremental UTF-8 decoding for a byte stream delivered in frames.
///
/// A character split across two frames is held back until its remaining
/// bytes arrive; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn push(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        // incomplete sequence at the end, wait for more bytes
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }

    /// Flush bytes of a sequence the stream never completed
    pub fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    /// Unix seconds
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub success: bool,
    pub log: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageRemoval {
    Removed,
    NotFound,
    /// The store refused, e.g. a container still references the image
    Conflict(String),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the host can attach AppArmor profiles
    async fn host_supports_apparmor(&self) -> Result<bool>;

    /// Content id of a local image, `None` when the image does not exist
    async fn image_id(&self, image: &str) -> Result<Option<String>>;

    /// Labels of a local image, `None` when the image does not exist
    async fn image_labels(&self, image: &str) -> Result<Option<HashMap<String, String>>>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Run `argv` in the container, appending output to `output` as it arrives
    /// and setting `output.exit_code` once the process ends.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        working_dir: &str,
        output: &mut ExecOutput,
    ) -> Result<()>;

    async fn disconnect_network(&self, container_id: &str, network: &str) -> Result<()>;

    async fn kill_container(&self, container_id: &str) -> Result<()>;

    /// Force-remove; removing an already-gone container succeeds
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>>;

    /// Build a tar build context into `tag`
    async fn build_image(
        &self,
        tag: &str,
        context: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<BuildOutcome>;

    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<ImageRemoval>;
}
