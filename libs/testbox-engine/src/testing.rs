// Test doubles: a scripted in-memory container runtime and submission builders

use crate::config::python_config;
use crate::container_spec::ContainerSpec;
use crate::error::{Result, SandboxError};
use crate::harness::{Identifier, HARNESS_FILE, REPORT_BEGIN, REPORT_END};
use crate::runtime::{BuildOutcome, ContainerRuntime, ExecOutput, ImageRemoval, ManagedContainer};
use crate::validate::{Submission, TestCase};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use testbox_common::types::TestId;

pub enum ScriptedExec {
    Output(ExecOutput),
    /// Emit partial output, then never finish
    Hang(ExecOutput),
    /// Print a harness report carrying the run's nonce
    Report { results: Value, exit_code: i64 },
}

impl ScriptedExec {
    pub fn report(results: Value, exit_code: i64) -> Self {
        ScriptedExec::Report { results, exit_code }
    }
}

#[derive(Default)]
struct State {
    apparmor: bool,
    fail_create: bool,
    fail_start: bool,
    fail_pull: bool,
    fail_disconnect: bool,
    next_id: usize,
    script: VecDeque<ScriptedExec>,
    specs: HashMap<String, ContainerSpec>,
    created: Vec<ContainerSpec>,
    live: HashSet<String>,
    max_live: usize,
    removed: Vec<String>,
    killed: Vec<String>,
    disconnected: Vec<(String, String)>,
    execs: Vec<Vec<String>>,
    pulls: Vec<String>,
    images: HashMap<String, HashMap<String, String>>,
    /// tag -> content id
    tags: HashMap<String, String>,
    /// content ids present in the store, tagged or not
    stored: BTreeSet<String>,
    refused: HashSet<String>,
    build_outcome: Option<BuildOutcome>,
    managed: Vec<ManagedContainer>,
}

impl State {
    fn put_image(&mut self, name: &str, id: String, labels: HashMap<String, String>) {
        self.images.insert(name.to_string(), labels);
        self.stored.insert(id.clone());
        self.tags.insert(name.to_string(), id);
    }

    fn untag(&mut self, name: &str) {
        self.images.remove(name);
        self.tags.remove(name);
    }

    fn is_tagged(&self, id: &str) -> bool {
        self.tags.values().any(|tagged| tagged == id)
    }
}

/// Builds with identical labels share a content id, like a fully cached build
fn content_id(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    format!("sha256:{}", pairs.join(";"))
}

pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                apparmor: true,
                ..State::default()
            }),
        }
    }

    pub fn without_apparmor() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn script(&self, exec: ScriptedExec) {
        self.with(|s| s.script.push_back(exec));
    }

    pub fn fail_create(&self) {
        self.with(|s| s.fail_create = true);
    }

    pub fn fail_start(&self) {
        self.with(|s| s.fail_start = true);
    }

    pub fn fail_disconnect(&self) {
        self.with(|s| s.fail_disconnect = true);
    }

    pub fn fail_pull(&self) {
        self.with(|s| s.fail_pull = true);
    }

    pub fn set_build_outcome(&self, outcome: BuildOutcome) {
        self.with(|s| s.build_outcome = Some(outcome));
    }

    pub fn add_image(&self, name: &str, labels: HashMap<String, String>) {
        self.with(|s| s.put_image(name, format!("sha256:{}", name), labels));
    }

    pub fn refuse_removal(&self, name: &str) {
        self.with(|s| s.refused.insert(name.to_string()));
    }

    pub fn add_managed(&self, container: ManagedContainer) {
        self.with(|s| s.managed.push(container));
    }

    pub fn labels_of(&self, name: &str) -> Option<HashMap<String, String>> {
        self.with(|s| s.images.get(name).cloned())
    }

    pub fn id_of(&self, name: &str) -> Option<String> {
        self.with(|s| s.tags.get(name).cloned())
    }

    /// Stored images no tag points at
    pub fn dangling_images(&self) -> Vec<String> {
        self.with(|s| {
            s.stored
                .iter()
                .filter(|id| !s.is_tagged(id))
                .cloned()
                .collect()
        })
    }

    pub fn image_names(&self) -> Vec<String> {
        self.with(|s| s.images.keys().cloned().collect())
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.with(|s| s.created.clone())
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.with(|s| s.removed.clone())
    }

    pub fn killed_containers(&self) -> Vec<String> {
        self.with(|s| s.killed.clone())
    }

    pub fn disconnected(&self) -> Vec<(String, String)> {
        self.with(|s| s.disconnected.clone())
    }

    pub fn exec_argvs(&self) -> Vec<Vec<String>> {
        self.with(|s| s.execs.clone())
    }

    pub fn pulls(&self) -> Vec<String> {
        self.with(|s| s.pulls.clone())
    }

    pub fn max_live_containers(&self) -> usize {
        self.with(|s| s.max_live)
    }
}

fn nonce_in(scratch_dir: &Path) -> String {
    let harness = std::fs::read_to_string(scratch_dir.join(HARNESS_FILE)).unwrap_or_default();
    let marker = format!("{} ", REPORT_BEGIN);
    harness
        .find(&marker)
        .map(|idx| {
            let rest = &harness[idx + marker.len()..];
            rest[..rest.find("@@").unwrap_or(0)].to_string()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn host_supports_apparmor(&self) -> Result<bool> {
        Ok(self.with(|s| s.apparmor))
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>> {
        Ok(self.id_of(image))
    }

    async fn image_labels(&self, image: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(self.labels_of(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.with(|s| {
            if s.fail_pull {
                return Err(SandboxError::ImageUnavailable(format!("{}: pull denied", image)));
            }
            s.pulls.push(image.to_string());
            s.put_image(image, format!("sha256:{}", image), HashMap::new());
            Ok(())
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.with(|s| {
            if s.fail_create {
                return Err(SandboxError::Internal("create refused".into()));
            }
            s.next_id += 1;
            let id = format!("container-{}", s.next_id);
            s.specs.insert(id.clone(), spec.clone());
            s.created.push(spec.clone());
            s.live.insert(id.clone());
            s.max_live = s.max_live.max(s.live.len());
            Ok(id)
        })
    }

    async fn start_container(&self, _container_id: &str) -> Result<()> {
        if self.with(|s| s.fail_start) {
            return Err(SandboxError::Internal("start refused".into()));
        }
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        _working_dir: &str,
        output: &mut ExecOutput,
    ) -> Result<()> {
        let (next, scratch_dir) = self.with(|s| {
            s.execs.push(argv.to_vec());
            (
                s.script.pop_front(),
                s.specs.get(container_id).map(|spec| spec.scratch_dir.clone()),
            )
        });

        match next {
            None => {
                output.exit_code = Some(0);
            }
            Some(ScriptedExec::Output(scripted)) => {
                *output = scripted;
            }
            Some(ScriptedExec::Hang(partial)) => {
                *output = partial;
                std::future::pending::<()>().await;
            }
            Some(ScriptedExec::Report { results, exit_code }) => {
                let nonce = scratch_dir.as_deref().map(nonce_in).unwrap_or_default();
                let report = json!({"load_error": null, "results": results});
                output.stdout = format!(
                    "{} {}@@\n{}\n{} {}@@\n",
                    REPORT_BEGIN, nonce, report, REPORT_END, nonce
                );
                output.exit_code = Some(exit_code);
            }
        }
        Ok(())
    }

    async fn disconnect_network(&self, container_id: &str, network: &str) -> Result<()> {
        self.with(|s| {
            if s.fail_disconnect {
                return Err(SandboxError::Internal("network disconnect failed".into()));
            }
            s.disconnected
                .push((container_id.to_string(), network.to_string()));
            Ok(())
        })
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        self.with(|s| s.killed.push(container_id.to_string()));
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.with(|s| {
            s.live.remove(container_id);
            s.removed.push(container_id.to_string());
        });
        Ok(())
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        Ok(self.with(|s| {
            s.managed
                .iter()
                .filter(|c| !s.removed.contains(&c.id))
                .cloned()
                .collect()
        }))
    }

    async fn build_image(
        &self,
        tag: &str,
        _context: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<BuildOutcome> {
        Ok(self.with(|s| match s.build_outcome.clone() {
            Some(outcome) if !outcome.success => outcome,
            _ => {
                s.put_image(tag, content_id(&labels), labels);
                BuildOutcome {
                    success: true,
                    log: format!("Successfully tagged {}\n", tag),
                    error: None,
                }
            }
        }))
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.with(|s| {
            let (id, labels) = s
                .tags
                .get(source)
                .cloned()
                .zip(s.images.get(source).cloned())
                .ok_or_else(|| SandboxError::Internal(format!("no such image {}", source)))?;
            s.put_image(target, id, labels);
            Ok(())
        })
    }

    async fn remove_image(&self, image: &str) -> Result<ImageRemoval> {
        Ok(self.with(|s| {
            if s.refused.contains(image) {
                return ImageRemoval::Conflict("image is being used by a stopped container".into());
            }
            if let Some(id) = s.tags.get(image).cloned() {
                s.untag(image);
                if !s.is_tagged(&id) {
                    s.stored.remove(&id);
                }
                return ImageRemoval::Removed;
            }
            if s.stored.contains(image) {
                if s.is_tagged(image) {
                    return ImageRemoval::Conflict("image is referenced in multiple repositories".into());
                }
                s.stored.remove(image);
                return ImageRemoval::Removed;
            }
            ImageRemoval::NotFound
        }))
    }
}

pub fn submission(name: &str, params: &[&str], code: &str, tests: Vec<TestCase>) -> Submission {
    Submission {
        language: python_config(),
        code: code.to_string(),
        script_name: Identifier::parse(name).unwrap(),
        script_parameters: params.iter().map(|p| Identifier::parse(p).unwrap()).collect(),
        libraries: BTreeSet::new(),
        tests,
        docker_image: None,
    }
}

/// A test with one expected result; `parameters` must be a JSON array
pub fn case(id: i64, parameters: Value, result: Value) -> TestCase {
    TestCase {
        id: TestId::Number(id),
        name: None,
        parameters: parameters.as_array().cloned().unwrap_or_default(),
        results: vec![result],
    }
}
