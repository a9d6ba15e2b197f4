use crate::config::Config;
use crate::error::RegistryError;
use crate::image::PullSecret;
use crate::image_reference::DOCKER_HUB_REGISTRY;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::fs;
use std::sync::Mutex;
use tracing::{debug, info};

static DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

pub fn create_client(config: &Config) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    // Tokens are only refreshed after the registry rejects them
    #[allow(dead_code)]
    expires_in: Option<u64>,
    #[allow(dead_code)]
    issued_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Tag listing client for a single repository on a registry, speaking the Docker
/// Distribution v2 bearer token flow. The bearer token is cached for the lifetime of the
/// client and dropped whenever the registry rejects it.
#[derive(Debug)]
pub struct RegistryClient {
    http: Client,
    registry: String,
    name: String,
    base_url: String,
    token: Mutex<Option<SecretString>>,
}

impl RegistryClient {
    pub fn new(http: Client, registry: &str, name: &str, plain_http: bool) -> Self {
        let scheme = if plain_http { "http" } else { "https" };
        let api_host = if registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            registry
        };

        RegistryClient {
            http,
            registry: registry.to_string(),
            name: name.to_string(),
            base_url: format!("{}://{}", scheme, api_host),
            token: Mutex::new(None),
        }
    }

    /// Lists all tags of the repository. A cached token is tried first; if the registry
    /// rejects it the full authentication flow runs once more before giving up.
    pub async fn get_tags(&self, secret: Option<&PullSecret>) -> Result<Vec<String>, RegistryError> {
        if let Some(token) = self.cached_token() {
            match self.list_tags(&token).await {
                Err(e) if e.is_permissions() => {
                    debug!(
                        "Cached token for {}/{} was rejected, re-authenticating",
                        self.registry, self.name
                    );
                }
                result => return result,
            }
        }

        let token = self.authenticate(secret).await?;
        self.list_tags(&token).await
    }

    fn cached_token(&self) -> Option<SecretString> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }

    fn store_token(&self, token: Option<SecretString>) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = token;
        }
    }

    async fn authenticate(
        &self,
        secret: Option<&PullSecret>,
    ) -> Result<SecretString, RegistryError> {
        let token_url = self.discover_token_endpoint().await?;
        debug!("Requesting bearer token from {}", token_url);

        let mut request = self.http.get(token_url);
        if let Some(secret) = secret {
            request = request.basic_auth(&secret.username, Some(secret.password.expose_secret()));
        }
        let response = self.send(request).await?;
        let response = self.check_status(response, "requesting a bearer token")?;

        let body: TokenResponse = response.json().await.map_err(|e| {
            RegistryError::client_api(&self.registry, format!("invalid token response: {}", e))
        })?;

        let token = SecretString::new(body.token);
        self.store_token(Some(token.clone()));
        Ok(token)
    }

    async fn discover_token_endpoint(&self) -> Result<Url, RegistryError> {
        let url = format!("{}/v2", self.base_url);
        let response = self.send(self.http.get(&url)).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(RegistryError::ClientApi {
                registry: self.registry.clone(),
                message: format!(
                    "expected status 401 from {} to discover the token endpoint, got {}",
                    url,
                    response.status()
                ),
                status: Some(response.status()),
            });
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                RegistryError::client_api(&self.registry, "missing WWW-Authenticate header")
            })?;

        let (realm, service) = parse_bearer_challenge(challenge).ok_or_else(|| {
            RegistryError::client_api(
                &self.registry,
                format!("unsupported WWW-Authenticate challenge: {}", challenge),
            )
        })?;

        let mut token_url = Url::parse(realm).map_err(|e| {
            RegistryError::client_api(&self.registry, format!("invalid token realm {}: {}", realm, e))
        })?;
        token_url
            .query_pairs_mut()
            .append_pair("service", service)
            .append_pair("scope", &format!("repository:{}:pull", self.name));
        Ok(token_url)
    }

    async fn list_tags(&self, token: &SecretString) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/v2/{}/tags/list", self.base_url, self.name);
        debug!("Listing tags from {}", url);

        let request = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        let response = self.send(request).await?;

        let response = match self.check_status(response, "listing tags") {
            Err(e) if e.is_permissions() => {
                self.store_token(None);
                return Err(e);
            }
            result => result?,
        };

        let body: TagList = response.json().await.map_err(|e| {
            RegistryError::client_api(&self.registry, format!("invalid tag list response: {}", e))
        })?;
        Ok(body.tags.unwrap_or_default())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RegistryError> {
        request.send().await.map_err(|e| {
            RegistryError::client_api(&self.registry, format!("request failed: {}", e))
        })
    }

    fn check_status(&self, response: Response, action: &str) -> Result<Response, RegistryError> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Permissions {
                registry: self.registry.clone(),
                status,
            }),
            s if s.as_u16() >= 300 => Err(RegistryError::ClientApi {
                registry: self.registry.clone(),
                message: format!("unexpected status {} while {}", status, action),
                status: Some(status),
            }),
            _ => Ok(response),
        }
    }
}

/// Extracts realm and service from `Bearer realm="R",service="S"`.
fn parse_bearer_challenge(header: &str) -> Option<(&str, &str)> {
    let rest = header.strip_prefix("Bearer realm=\"")?;
    let (realm, rest) = rest.split_once('"')?;
    let rest = rest.strip_prefix(",service=\"")?;
    let (service, _) = rest.split_once('"')?;
    (!realm.is_empty() && !service.is_empty()).then_some((realm, service))
}


#[cfg(test)]
mod tests {
    use super::fake_registry::{Behaviour, FakeRegistry};
    use super::*;

    fn client_for(registry: &FakeRegistry) -> RegistryClient {
        RegistryClient::new(Client::new(), &registry.host, "acme/app", true)
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com""#;
        assert_eq!(
            parse_bearer_challenge(header),
            Some(("https://auth.example.com/token", "registry.example.com"))
        );
        assert_eq!(parse_bearer_challenge(r#"Basic realm="x""#), None);
        assert_eq!(parse_bearer_challenge(r#"Bearer realm="x""#), None);
    }

    #[test]
    fn test_docker_hub_uses_api_host() {
        let client = RegistryClient::new(Client::new(), "docker.io", "library/nginx", false);
        assert_eq!(client.base_url, "https://registry-1.docker.io");
        assert_eq!(client.registry, "docker.io");
        assert_eq!(client.name, "library/nginx");
    }

    #[tokio::test]
    async fn test_get_tags_runs_bearer_flow() {
        let registry = FakeRegistry::start(Behaviour {
            tags: vec!["1.0.0".to_string(), "1.1.0".to_string()],
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);

        let tags = client.get_tags(None).await.expect("Tags should be listed");
        assert_eq!(tags, vec!["1.0.0", "1.1.0"]);
        assert_eq!(registry.discovery_calls(), 1);
        assert_eq!(registry.token_calls(), 1);
        assert_eq!(
            registry.last_token_query.lock().unwrap().as_deref(),
            Some("service=fake-registry&scope=repository%3Aacme%2Fapp%3Apull")
        );

        // The cached token is reused
        client.get_tags(None).await.expect("Tags should be listed");
        assert_eq!(registry.discovery_calls(), 1);
        assert_eq!(registry.token_calls(), 1);
        assert_eq!(registry.tags_calls(), 2);
    }

    #[tokio::test]
    async fn test_discovery_without_401_is_client_api_error() {
        let registry = FakeRegistry::start(Behaviour {
            discovery_status: Some(StatusCode::OK),
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);

        let err = client.get_tags(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::ClientApi { .. }));
        assert_eq!(registry.token_calls(), 0);
        assert_eq!(registry.tags_calls(), 0);
    }

    #[tokio::test]
    async fn test_token_query_extends_realm_query() {
        let registry = FakeRegistry::start(Behaviour {
            tags: vec!["1.0.0".to_string()],
            ..Default::default()
        })
        .await;
        registry.behaviour.lock().unwrap().challenge = Some(format!(
            r#"Bearer realm="http://{}/token?account=robot",service="fake registry""#,
            registry.host
        ));
        let client = client_for(&registry);

        client.get_tags(None).await.expect("Tags should be listed");
        assert_eq!(
            registry.last_token_query.lock().unwrap().as_deref(),
            Some("account=robot&service=fake+registry&scope=repository%3Aacme%2Fapp%3Apull")
        );
    }

    #[tokio::test]
    async fn test_invalid_realm_is_client_api_error() {
        let registry = FakeRegistry::start(Behaviour {
            challenge: Some(r#"Bearer realm="not a url",service="fake-registry""#.to_string()),
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);

        let err = client.get_tags(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::ClientApi { .. }));
        assert_eq!(registry.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_challenge_is_client_api_error() {
        let registry = FakeRegistry::start(Behaviour {
            challenge: Some(r#"Basic realm="Registry""#.to_string()),
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);

        let err = client.get_tags(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::ClientApi { .. }));
        assert_eq!(registry.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_token_endpoint_status_classification() {
        let registry = FakeRegistry::start(Behaviour {
            token_status: Some(StatusCode::FORBIDDEN),
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);
        let err = client.get_tags(None).await.unwrap_err();
        assert!(err.is_permissions());
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));

        registry.behaviour.lock().unwrap().token_status = Some(StatusCode::BAD_GATEWAY);
        let err = client.get_tags(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::ClientApi { .. }));
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn test_basic_credentials_are_sent_to_token_endpoint() {
        let registry = FakeRegistry::start(Behaviour {
            required_credentials: Some(("robot".to_string(), "s3cret".to_string())),
            tags: vec!["2.0".to_string()],
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);

        let err = client.get_tags(None).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));

        let wrong = PullSecret::new("robot", "wrong");
        assert!(client.get_tags(Some(&wrong)).await.is_err());

        let right = PullSecret::new("robot", "s3cret");
        let tags = client.get_tags(Some(&right)).await.expect("Credentials should work");
        assert_eq!(tags, vec!["2.0"]);
    }

    #[tokio::test]
    async fn test_forbidden_tag_list_clears_token() {
        let registry = FakeRegistry::start(Behaviour {
            tags: vec!["1.0".to_string()],
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);
        client.get_tags(None).await.expect("Tags should be listed");
        assert!(client.cached_token().is_some());

        registry.set_tags_status(Some(StatusCode::FORBIDDEN));
        let err = client.get_tags(None).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert!(client.cached_token().is_none());
        // cached attempt, then one re-authentication
        assert_eq!(registry.discovery_calls(), 2);
        assert_eq!(registry.token_calls(), 2);

        registry.set_tags_status(None);
        client.get_tags(None).await.expect("Tags should be listed");
        // no cached token left, so the full flow runs again
        assert_eq!(registry.discovery_calls(), 3);
        assert_eq!(registry.token_calls(), 3);
    }

    #[tokio::test]
    async fn test_server_error_on_tag_list_keeps_token() {
        let registry = FakeRegistry::start(Behaviour {
            tags: vec!["1.0".to_string()],
            ..Default::default()
        })
        .await;
        let client = client_for(&registry);
        client.get_tags(None).await.expect("Tags should be listed");

        registry.set_tags_status(Some(StatusCode::TOO_MANY_REQUESTS));
        let err = client.get_tags(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::ClientApi { .. }));
        assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert!(client.cached_token().is_some());
        assert_eq!(registry.token_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_tag_list() {
        let registry = FakeRegistry::start(Behaviour::default()).await;
        let client = client_for(&registry);
        let tags = client.get_tags(None).await.expect("Tags should be listed");
        assert!(tags.is_empty());
    }
}
