//! Sandboxed execution of submitted functions against parameterized tests.
//!
//! A submission flows through validation and the policy gate, is rendered
//! into a harness, run inside one locked-down container, and its output is
//! re-keyed into per-test outcomes:
//!
//! `validate` → `policy` → `harness` + `install` → `container_spec` →
//! `engine` → `parser` → `evaluator`
//!
//! `images` manages reusable custom images on the same runtime client.

pub mod config;
pub mod container_spec;
pub mod docker;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod harness;
pub mod images;
pub mod install;
pub mod parser;
pub mod policy;
pub mod reaper;
pub mod runtime;
pub mod validate;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod engine_tests;

pub use error::{Result, SandboxError};
pub use executor::Orchestrator;
