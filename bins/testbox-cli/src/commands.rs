// CLI commands: each one drives the engine directly against the local Docker daemon
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use testbox_common::config::Settings;
use testbox_common::types::{ExecutionRequest, ImageBuildStatus, ImageRemoveStatus, RunStatus};
use testbox_engine::config::LanguageConfigManager;
use testbox_engine::docker::DockerRuntime;
use testbox_engine::policy::DenylistPolicy;
use testbox_engine::Orchestrator;

async fn orchestrator() -> Result<Orchestrator> {
    let settings = Settings::from_env().context("Invalid TESTBOX_* settings")?;
    let languages = LanguageConfigManager::load(&settings.languages_path)?;

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    runtime.ping().await.context("Docker daemon is not responding")?;

    Orchestrator::new(Arc::new(runtime), languages, Arc::new(DenylistPolicy), settings)
        .await
        .context("Failed to initialise orchestrator")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read a request body from a file, or stdin for "-"
fn read_request(path: &Path) -> Result<ExecutionRequest> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };

    serde_json::from_str(&content).context("Request is not a valid run body")
}

pub async fn run_submission(path: &Path) -> Result<()> {
    let request = read_request(path)?;
    eprintln!(
        "🚀 Running '{}' against {} test(s)...",
        request.script_name,
        request.tests.len()
    );

    let orchestrator = orchestrator().await?;
    let response = orchestrator.execute(request).await?;
    print_json(&response)?;

    match response.status {
        RunStatus::Success => eprintln!("✅ All tests passed"),
        RunStatus::NoTests => eprintln!("⚠️  No tests were supplied"),
        RunStatus::Fail => bail!("some tests failed"),
        RunStatus::Error => bail!(
            "run errored: {}",
            response.error.as_deref().unwrap_or("see test_statuses")
        ),
    }
    Ok(())
}

pub async fn build_image(name: &str, libs: &[String]) -> Result<()> {
    eprintln!("🔨 Building image '{}' with {} librar(y/ies)...", name, libs.len());

    let orchestrator = orchestrator().await?;
    let response = orchestrator.build_image(name, libs).await?;
    print_json(&response)?;

    if response.status == ImageBuildStatus::Error {
        bail!(
            "build of '{}' failed: {}",
            name,
            response.error.as_deref().unwrap_or("see log")
        );
    }
    eprintln!("✅ Image '{}' is ready", name);
    Ok(())
}

pub async fn remove_image(name: &str) -> Result<()> {
    eprintln!("🗑️  Removing image '{}'...", name);

    let orchestrator = orchestrator().await?;
    let response = orchestrator.remove_image(name).await?;
    print_json(&response)?;

    match response.status {
        ImageRemoveStatus::Success => {
            eprintln!("✅ Image '{}' removed", name);
            Ok(())
        }
        ImageRemoveStatus::NotFound => bail!("image '{}' not found", name),
        ImageRemoveStatus::Conflict => bail!("image '{}' is still referenced: {}", name, response.message),
    }
}

pub async fn image_status(name: &str) -> Result<()> {
    let orchestrator = orchestrator().await?;
    let response = orchestrator.image_status(name).await?;
    print_json(&response)
}

pub async fn reap() -> Result<()> {
    let orchestrator = orchestrator().await?;
    let reaped = orchestrator.reaper().reap_once().await?;

    if reaped.is_empty() {
        eprintln!("✅ No abandoned containers");
    } else {
        for id in &reaped {
            println!("{}", id);
        }
        eprintln!("🧹 Removed {} abandoned container(s)", reaped.len());
    }
    Ok(())
}
