/// Harness Generator
///
/// Renders a submission into three files for the scratch mount:
/// - `solution.py`: the submitted body, byte for byte
/// - `cases.json`: parameters and expected values, indexed by position
/// - `harness.py`: a unittest module with one test method per case and a
///   reporter that prints a JSON report between nonce-tagged markers
///
/// The harness parses `solution.py` with `ast`, wraps the statements in a
/// function definition built from `script_name` / `script_parameters`, and
/// compiles it once. Every test executes that code object in a fresh
/// namespace, so the function object and its globals are rebuilt for each
/// test. Imported modules stay cached by the interpreter.
///
/// Template insertion points are typed. Identifiers are validated on
/// construction and pass through an escape function that only lets
/// identifier characters through. The code body never enters a template
/// and test data never enters Python source.
use crate::error::{Result, SandboxError};
use crate::validate::{Submission, TestCase};
use handlebars::Handlebars;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use testbox_common::types::TestId;

pub const SOLUTION_FILE: &str = "solution.py";
pub const HARNESS_FILE: &str = "harness.py";
pub const CASES_FILE: &str = "cases.json";

pub const REPORT_BEGIN: &str = "@@TESTBOX-REPORT-BEGIN";
pub const REPORT_END: &str = "@@TESTBOX-REPORT-END";

const METHOD_PREFIX: &str = "test_case_";
const MAX_IDENTIFIER_LEN: usize = 64;

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
    "return", "try", "while", "with", "yield",
];

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref METHOD_SUFFIX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_]{0,47}$").unwrap();
}

const HARNESS_TEMPLATE: &str = r#"import ast
import io
import json
import os
import sys
import traceback
import unittest
from contextlib import redirect_stdout

REPORT_BEGIN = "@@TESTBOX-REPORT-BEGIN {{nonce}}@@"
REPORT_END = "@@TESTBOX-REPORT-END {{nonce}}@@"
FUNCTION_NAME = "{{script_name}}"
PARAMETERS = [{{#each params}}"{{this}}"{{#unless @last}}, {{/unless}}{{/each}}]

_HERE = os.path.dirname(os.path.abspath(__file__))
SOLUTION_PATH = os.path.join(_HERE, "solution.py")

with open(os.path.join(_HERE, "cases.json"), encoding="utf-8") as _fh:
    CASES = json.load(_fh)


def _compile_solution():
    with open(SOLUTION_PATH, encoding="utf-8") as fh:
        source = fh.read()
    body = ast.parse(source, filename=SOLUTION_PATH).body or [ast.Pass()]
    arguments = ast.arguments(
        posonlyargs=[],
        args=[ast.arg(arg=name, annotation=None) for name in PARAMETERS],
        vararg=None,
        kwonlyargs=[],
        kw_defaults=[],
        kwarg=None,
        defaults=[],
    )
    function = ast.FunctionDef(
        name=FUNCTION_NAME,
        args=arguments,
        body=body,
        decorator_list=[],
        returns=None,
    )
    if sys.version_info >= (3, 12):
        function.type_params = []
    module = ast.Module(body=[function], type_ignores=[])
    ast.fix_missing_locations(module)
    return compile(module, SOLUTION_PATH, "exec")


def _fresh_function():
    namespace = {"__name__": "solution", "__file__": SOLUTION_PATH}
    with redirect_stdout(io.StringIO()):
        exec(SOLUTION_CODE, namespace)
    return namespace[FUNCTION_NAME]


SOLUTION_CODE = None
LOAD_ERROR = None
try:
    SOLUTION_CODE = _compile_solution()
    _fresh_function()
except BaseException:
    LOAD_ERROR = traceback.format_exc()


def _normalize(value):
    if isinstance(value, tuple):
        value = list(value)
    if isinstance(value, list):
        return [_normalize(item) for item in value]
    if isinstance(value, dict):
        return {key: _normalize(item) for key, item in value.items()}
    return value


class SubmissionTests(unittest.TestCase):
    maxDiff = None

    def _check(self, index):
        case = CASES[index]
        submitted = _fresh_function()
        with redirect_stdout(io.StringIO()):
            result = submitted(*case["parameters"])
        self.assertEqual(_normalize(result), case["expected"])
{{#each methods}}

    def {{method}}(self):
        self._check({{index}})
{{/each}}


class RecordingResult(unittest.TextTestResult):
    def __init__(self, *args, **kwargs):
        super().__init__(*args, **kwargs)
        self.records = []

    def addSuccess(self, test):
        super().addSuccess(test)
        self.records.append({"method": test._testMethodName, "status": "success"})

    def addFailure(self, test, err):
        super().addFailure(test, err)
        self.records.append({
            "method": test._testMethodName,
            "status": "fail",
            "error": self._exc_info_to_string(err, test),
        })

    def addError(self, test, err):
        super().addError(test, err)
        self.records.append({
            "method": test._testMethodName,
            "status": "fail",
            "error": self._exc_info_to_string(err, test),
        })


def _emit(report):
    sys.stdout.write(REPORT_BEGIN + "\n" + json.dumps(report) + "\n" + REPORT_END + "\n")
    sys.stdout.flush()


def main():
    if LOAD_ERROR is not None:
        _emit({"load_error": LOAD_ERROR, "results": []})
        return 1
    suite = unittest.TestLoader().loadTestsFromTestCase(SubmissionTests)
    runner = unittest.TextTestRunner(stream=sys.stderr, verbosity=2, resultclass=RecordingResult)
    result = runner.run(suite)
    _emit({"load_error": None, "results": result.records})
    return 0 if result.wasSuccessful() else 1


if __name__ == "__main__":
    sys.exit(main())
"#;

/// A validated Python identifier, safe to splice into generated source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() > MAX_IDENTIFIER_LEN {
            return Err(SandboxError::Validation(format!(
                "identifier '{}' exceeds {} characters",
                raw, MAX_IDENTIFIER_LEN
            )));
        }
        if !IDENTIFIER.is_match(raw) {
            return Err(SandboxError::Validation(format!(
                "'{}' is not a valid identifier",
                raw
            )));
        }
        if PYTHON_KEYWORDS.contains(&raw) {
            return Err(SandboxError::Validation(format!(
                "'{}' is a reserved keyword",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Links a generated test method back to the caller's test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBinding {
    pub method: String,
    pub id: TestId,
    /// Caller-supplied name, or the method name when none was given
    pub name: String,
}

/// Generated program, ready to be written to the scratch mount
#[derive(Debug, Clone)]
pub struct HarnessSpec {
    pub solution: String,
    pub harness: String,
    pub cases: String,
    pub nonce: String,
    pub bindings: Vec<MethodBinding>,
}

impl HarnessSpec {
    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        fs::write(dir.join(SOLUTION_FILE), &self.solution)?;
        fs::write(dir.join(HARNESS_FILE), &self.harness)?;
        fs::write(dir.join(CASES_FILE), &self.cases)?;
        Ok(())
    }

    pub fn begin_marker(&self) -> String {
        format!("{} {}@@", REPORT_BEGIN, self.nonce)
    }

    pub fn end_marker(&self) -> String {
        format!("{} {}@@", REPORT_END, self.nonce)
    }
}

#[derive(Serialize)]
struct MethodContext<'a> {
    method: &'a str,
    index: usize,
}

#[derive(Serialize)]
struct HarnessContext<'a> {
    nonce: &'a str,
    script_name: &'a Identifier,
    params: &'a [Identifier],
    methods: Vec<MethodContext<'a>>,
}

#[derive(Serialize)]
struct CaseEntry<'a> {
    method: &'a str,
    parameters: &'a [Value],
    expected: Value,
}

/// Double-stash insertions only ever carry identifiers, digits and the nonce.
fn identifier_escape(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

fn registry() -> Result<Handlebars<'static>> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(identifier_escape);
    handlebars
        .register_template_string("harness", HARNESS_TEMPLATE)
        .map_err(|e| SandboxError::Internal(format!("harness template: {}", e)))?;
    Ok(handlebars)
}

/// Assign one method name per test.
///
/// Ids whose text is a safe suffix map to `test_case_<id>`; anything else,
/// or a second id rendering to the same text, gets `test_case__<position>`.
/// The double underscore keeps the two namespaces disjoint.
pub fn bind_methods(tests: &[TestCase]) -> Vec<MethodBinding> {
    let mut taken = HashSet::new();

    tests
        .iter()
        .enumerate()
        .map(|(idx, test)| {
            let rendered = test.id.to_string();
            let derived = format!("{}{}", METHOD_PREFIX, rendered);
            let method = if METHOD_SUFFIX.is_match(&rendered) && !taken.contains(&derived) {
                derived
            } else {
                format!("{}_{}", METHOD_PREFIX, idx)
            };
            taken.insert(method.clone());

            MethodBinding {
                name: test.name.clone().unwrap_or_else(|| method.clone()),
                method,
                id: test.id.clone(),
            }
        })
        .collect()
}

/// Expected value: a lone result is compared directly, several as a list.
fn expected_value(results: &[Value]) -> Value {
    match results {
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

/// Render the harness for a validated submission
pub fn generate(submission: &Submission) -> Result<HarnessSpec> {
    let handlebars = registry()?;
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let bindings = bind_methods(&submission.tests);

    let harness = handlebars
        .render(
            "harness",
            &HarnessContext {
                nonce: &nonce,
                script_name: &submission.script_name,
                params: &submission.script_parameters,
                methods: bindings
                    .iter()
                    .enumerate()
                    .map(|(index, b)| MethodContext {
                        method: &b.method,
                        index,
                    })
                    .collect(),
            },
        )
        .map_err(|e| SandboxError::Internal(format!("render harness: {}", e)))?;

    let cases: Vec<CaseEntry> = submission
        .tests
        .iter()
        .zip(&bindings)
        .map(|(test, binding)| CaseEntry {
            method: &binding.method,
            parameters: &test.parameters,
            expected: expected_value(&test.results),
        })
        .collect();
    let cases = serde_json::to_string(&cases)
        .map_err(|e| SandboxError::Internal(format!("serialize cases: {}", e)))?;

    Ok(HarnessSpec {
        solution: submission.code.clone(),
        harness,
        cases,
        nonce,
        bindings,
    })
}
