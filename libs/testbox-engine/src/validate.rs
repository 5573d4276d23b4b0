// Request validation
// Everything here runs before the policy gate and before any container exists.

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::error::{Result, SandboxError};
use crate::harness::Identifier;
use crate::images::ImageName;
use crate::install::{parse_libraries, Library};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use testbox_common::types::{ExecutionRequest, TestId};

/// Safety limits to keep pathological inputs away from Docker
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;
pub const MAX_TESTS: usize = 1000;
pub const MAX_TEST_ID_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub id: TestId,
    pub name: Option<String>,
    pub parameters: Vec<Value>,
    pub results: Vec<Value>,
}

/// A request that passed validation
#[derive(Debug, Clone)]
pub struct Submission {
    pub language: LanguageConfig,
    pub code: String,
    pub script_name: Identifier,
    pub script_parameters: Vec<Identifier>,
    pub libraries: BTreeSet<Library>,
    pub tests: Vec<TestCase>,
    pub docker_image: Option<ImageName>,
}

pub fn validate(request: ExecutionRequest, languages: &LanguageConfigManager) -> Result<Submission> {
    let language = languages
        .get_config(&request.language)
        .cloned()
        .ok_or_else(|| {
            SandboxError::Validation(format!(
                "language '{}' is not supported (available: {})",
                request.language,
                languages.list_languages().join(", ")
            ))
        })?;

    if request.code.trim().is_empty() {
        return Err(SandboxError::Validation("code must not be empty".into()));
    }
    if request.code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SandboxError::Validation(format!(
            "code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }

    let script_name = Identifier::parse(&request.script_name)?;

    let mut seen_params = HashSet::new();
    let mut script_parameters = Vec::with_capacity(request.script_parameters.len());
    for raw in &request.script_parameters {
        let param = Identifier::parse(raw)?;
        if !seen_params.insert(param.clone()) {
            return Err(SandboxError::Validation(format!("duplicate parameter '{}'", raw)));
        }
        script_parameters.push(param);
    }

    let libraries = parse_libraries(&request.libraries)?;

    if request.tests.len() > MAX_TESTS {
        return Err(SandboxError::Validation(format!(
            "at most {} tests may be submitted",
            MAX_TESTS
        )));
    }

    let mut seen_ids = HashSet::new();
    let mut tests = Vec::with_capacity(request.tests.len());
    for (idx, test) in request.tests.into_iter().enumerate() {
        if test.id.to_string().len() > MAX_TEST_ID_LEN {
            return Err(SandboxError::Validation(format!(
                "test at index {} has an id longer than {} characters",
                idx, MAX_TEST_ID_LEN
            )));
        }
        if !seen_ids.insert(test.id.clone()) {
            return Err(SandboxError::Validation(format!("duplicate test id '{}'", test.id)));
        }
        if test.results.is_empty() {
            return Err(SandboxError::Validation(format!(
                "test '{}' has no expected results",
                test.id
            )));
        }
        tests.push(TestCase {
            id: test.id,
            name: test.name,
            parameters: test.parameters,
            results: test.results,
        });
    }

    let docker_image = request
        .docker_image
        .as_deref()
        .map(ImageName::parse)
        .transpose()?;

    Ok(Submission {
        language,
        code: request.code,
        script_name,
        script_parameters,
        libraries,
        tests,
        docker_image,
    })
}
