use crate::rate_limiter::DEFAULT_REQUESTS_PER_SECOND;
use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub webserver: Webserver,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_registry_requests_per_second")]
    pub registry_requests_per_second: u32,
    #[serde(default = "default_reconcile_schedule")]
    pub reconcile_schedule: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub plain_http_registries: Vec<String>,
    #[serde(default)]
    pub exclude_images: Vec<String>,
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

fn default_poll_interval_seconds() -> u64 {
    300
}

fn default_registry_requests_per_second() -> u32 {
    DEFAULT_REQUESTS_PER_SECOND
}

fn default_reconcile_schedule() -> String {
    "0 * * * * *".to_string()
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.poll_interval_seconds == 0 {
        bail!("pollIntervalSeconds must be greater than zero");
    }
    if config.registry_requests_per_second == 0 {
        bail!("registryRequestsPerSecond must be greater than zero");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing env var.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Compiles a list of glob patterns, e.g. `registry.local:*` or `docker.io/library/*`.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob pattern {}", pattern))?);
    }
    builder.build().context("Failed to build glob set")
}
