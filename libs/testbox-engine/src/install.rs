// Install Planner
// Turns the requested library set into a pip invocation, or the
// "nothing to install" sentinel. Tokens are checked against a
// conservative package-name pattern before they reach any command line.

use crate::error::{Result, SandboxError};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use testbox_common::types::NOTHING_TO_INSTALL;

const MAX_LIBRARY_LEN: usize = 200;
pub const MAX_LIBRARIES: usize = 64;

lazy_static! {
    // name, optional [extras], optional single version clause
    static ref LIBRARY: Regex = Regex::new(
        r"^[A-Za-z0-9](?:[A-Za-z0-9._-]{0,98}[A-Za-z0-9])?(?:\[[A-Za-z0-9._,-]{1,64}\])?(?:(?:==|~=|!=|<=|>=|<|>)[A-Za-z0-9.*+!_-]{1,64})?$"
    )
    .unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"[-_.]+").unwrap();
}

/// A package requirement that passed the allow-pattern
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Library(String);

impl Library {
    pub fn parse(raw: &str) -> Result<Self> {
        let token = raw.trim();
        if token.is_empty() || token.len() > MAX_LIBRARY_LEN || !LIBRARY.is_match(token) {
            return Err(SandboxError::Validation(format!(
                "library '{}' is not an acceptable package name",
                raw
            )));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased with runs of `-_.` folded to `-`, so `Py_Yaml` and `py-yaml` match.
    pub fn normalized(&self) -> String {
        SEPARATORS.replace_all(&self.0.to_lowercase(), "-").into_owned()
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse and deduplicate a requested library list
pub fn parse_libraries(raw: &[String]) -> Result<BTreeSet<Library>> {
    if raw.len() > MAX_LIBRARIES {
        return Err(SandboxError::Validation(format!(
            "at most {} libraries may be requested",
            MAX_LIBRARIES
        )));
    }
    raw.iter().map(|lib| Library::parse(lib)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    Nothing,
    Install(Vec<Library>),
}

impl InstallPlan {
    pub fn for_libraries(libraries: &BTreeSet<Library>) -> Self {
        if libraries.is_empty() {
            InstallPlan::Nothing
        } else {
            InstallPlan::Install(libraries.iter().cloned().collect())
        }
    }

    /// Drop libraries an image already has baked in (compared normalized)
    pub fn without_baked(self, baked: &BTreeSet<String>) -> Self {
        match self {
            InstallPlan::Nothing => InstallPlan::Nothing,
            InstallPlan::Install(libs) => {
                let remaining: Vec<Library> = libs
                    .into_iter()
                    .filter(|lib| !baked.contains(&lib.normalized()))
                    .collect();
                if remaining.is_empty() {
                    InstallPlan::Nothing
                } else {
                    InstallPlan::Install(remaining)
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, InstallPlan::Nothing)
    }

    /// Argument vector for the install exec; no shell is involved
    pub fn argv(&self, interpreter: &str) -> Option<Vec<String>> {
        match self {
            InstallPlan::Nothing => None,
            InstallPlan::Install(libs) => {
                let mut argv: Vec<String> = [
                    interpreter,
                    "-m",
                    "pip",
                    "install",
                    "--no-cache-dir",
                    "--disable-pip-version-check",
                    "--no-input",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                argv.extend(libs.iter().map(|lib| lib.as_str().to_string()));
                Some(argv)
            }
        }
    }

    /// Human-readable directive with every token single-quoted, or the sentinel
    pub fn directive(&self, interpreter: &str) -> String {
        match self.argv(interpreter) {
            None => NOTHING_TO_INSTALL.to_string(),
            Some(argv) => argv
                .iter()
                .map(|arg| format!("'{}'", arg))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Exec-form `RUN` line for an image build; JSON-encoded so nothing is shell-parsed
    pub fn dockerfile_run(&self, interpreter: &str) -> Option<String> {
        self.argv(interpreter).map(|argv| {
            let encoded = serde_json::to_string(&argv).unwrap_or_else(|_| "[]".to_string());
            format!("RUN {}", encoded)
        })
    }
}
