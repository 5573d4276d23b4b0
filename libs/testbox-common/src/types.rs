use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Install output reported when a run has nothing to install.
pub const NOTHING_TO_INSTALL: &str = "No libraries to install";

/// Caller-chosen test identifier.
///
/// Opaque to the service: a numeric id is echoed back as a number and a
/// textual id as a string. Ordering puts numbers (numerically) before text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestId {
    Number(i64),
    Text(String),
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestId::Number(n) => write!(f, "{}", n),
            TestId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for TestId {
    fn from(n: i64) -> Self {
        TestId::Number(n)
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        TestId::Text(s.to_string())
    }
}

fn default_language() -> String {
    "python".to_string()
}

/// POST /run body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default = "default_language")]
    pub language: String,
    pub code: String,
    pub script_name: String,
    #[serde(default)]
    pub script_parameters: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub tests: Vec<TestCaseInput>,
    #[serde(default)]
    pub docker_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseInput {
    pub id: TestId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
    pub results: Vec<Value>,
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Fail,
    Error,
    /// The harness ran but there was nothing to assert.
    NoTests,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
            RunStatus::Error => "error",
            RunStatus::NoTests => "no_tests",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    Fail,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatusEntry {
    pub id: TestId,
    pub name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub status: RunStatus,
    pub install_output: String,
    pub test_output: String,
    pub test_statuses: Vec<TestStatusEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /images/build body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuildRequest {
    pub image_name: String,
    #[serde(default)]
    pub libraries: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageBuildStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBuildResponse {
    pub image_name: String,
    pub status: ImageBuildStatus,
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /images/remove body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRemoveRequest {
    pub image_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRemoveStatus {
    Success,
    NotFound,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRemoveResponse {
    pub status: ImageRemoveStatus,
    pub message: String,
}

/// Lifecycle of a named custom image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Building,
    Ready,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStatusResponse {
    pub image_name: String,
    pub state: ImageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
}

/// Body of every non-2xx reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}
