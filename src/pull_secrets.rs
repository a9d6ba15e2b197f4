use crate::image::PullSecret;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::BTreeMap;

pub static DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

static DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
}

/// Extracts the credentials for `registry` from a `.dockerconfigjson` document.
pub fn pull_secrets_for(registry: &str, docker_config_json: &[u8]) -> Result<Vec<PullSecret>> {
    let config: DockerConfig =
        serde_json::from_slice(docker_config_json).context("Failed to parse .dockerconfigjson")?;

    config
        .auths
        .iter()
        .filter(|(server, _)| server_matches(server, registry))
        .map(|(server, auth)| {
            credentials(auth).with_context(|| format!("Invalid credentials for {}", server))
        })
        .collect()
}

fn credentials(auth: &DockerAuth) -> Result<PullSecret> {
    if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
        return Ok(PullSecret::new(username.clone(), password.clone()));
    }

    let encoded = auth
        .auth
        .as_deref()
        .context("Neither username/password nor auth is set")?;
    let decoded = STANDARD
        .decode(encoded)
        .context("auth is not valid base64")?;
    let decoded = String::from_utf8(decoded).context("auth is not valid UTF-8")?;
    let (username, password) = decoded
        .split_once(':')
        .context("auth is not in username:password form")?;
    Ok(PullSecret::new(username, password))
}

fn server_matches(server: &str, registry: &str) -> bool {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);

    host == registry
        || (DOCKER_HUB_ALIASES.contains(&host) && DOCKER_HUB_ALIASES.contains(&registry))
}
