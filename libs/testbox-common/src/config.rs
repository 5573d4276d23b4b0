// Process settings shared by the API and the CLI
// Every value comes from a TESTBOX_* environment variable with a fixed default

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 8;
pub const DEFAULT_APPARMOR_PROFILE: &str = "docker-default";
pub const DEFAULT_INSTALL_NETWORK: &str = "bridge";
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: String,
    pub languages_path: PathBuf,
    pub run_timeout: Duration,
    pub max_concurrent_runs: usize,
    pub apparmor_profile: String,
    /// Run without a mandatory-access-control profile when the host has none.
    pub allow_unconfined: bool,
    pub install_network: String,
    pub scratch_root: Option<PathBuf>,
    pub reaper_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            languages_path: PathBuf::from(DEFAULT_LANGUAGES_PATH),
            run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            apparmor_profile: DEFAULT_APPARMOR_PROFILE.to_string(),
            allow_unconfined: false,
            install_network: DEFAULT_INSTALL_NETWORK.to_string(),
            scratch_root: None,
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests pass a map here)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(v) = lookup("TESTBOX_BIND_ADDR") {
            settings.bind_addr = v;
        }
        if let Some(v) = lookup("TESTBOX_LANGUAGES_PATH") {
            settings.languages_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTBOX_RUN_TIMEOUT_MS") {
            let ms: u64 = parse_number("TESTBOX_RUN_TIMEOUT_MS", &v)?;
            if ms == 0 {
                return Err(invalid("TESTBOX_RUN_TIMEOUT_MS", &v, "must be greater than zero"));
            }
            settings.run_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("TESTBOX_MAX_CONCURRENT_RUNS") {
            let n: usize = parse_number("TESTBOX_MAX_CONCURRENT_RUNS", &v)?;
            if n == 0 {
                return Err(invalid("TESTBOX_MAX_CONCURRENT_RUNS", &v, "must be greater than zero"));
            }
            settings.max_concurrent_runs = n;
        }
        if let Some(v) = lookup("TESTBOX_APPARMOR_PROFILE") {
            if v.trim().is_empty() {
                return Err(invalid(
                    "TESTBOX_APPARMOR_PROFILE",
                    &v,
                    "use TESTBOX_ALLOW_UNCONFINED to run without a profile",
                ));
            }
            settings.apparmor_profile = v;
        }
        if let Some(v) = lookup("TESTBOX_ALLOW_UNCONFINED") {
            settings.allow_unconfined = parse_bool("TESTBOX_ALLOW_UNCONFINED", &v)?;
        }
        if let Some(v) = lookup("TESTBOX_INSTALL_NETWORK") {
            settings.install_network = v;
        }
        if let Some(v) = lookup("TESTBOX_SCRATCH_ROOT") {
            settings.scratch_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TESTBOX_REAPER_INTERVAL_SECS") {
            let secs: u64 = parse_number("TESTBOX_REAPER_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("TESTBOX_REAPER_INTERVAL_SECS", &v, "must be greater than zero"));
            }
            settings.reaper_interval = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, value, &e.to_string()))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(invalid(name, value, "expected true or false")),
    }
}
