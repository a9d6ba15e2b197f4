use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("no tags matching pattern {pattern}")]
    NoMatchingTags { pattern: String },
    #[error("invalid tag pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors returned by the OCI registry client. Permission failures are kept apart from
/// every other failure so that callers can drop cached tokens and tally them separately.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry {registry} denied access with status {status}")]
    Permissions { registry: String, status: StatusCode },
    #[error("registry {registry} API error: {message}")]
    ClientApi {
        registry: String,
        message: String,
        status: Option<StatusCode>,
    },
}

impl RegistryError {
    pub fn client_api(registry: &str, message: impl Into<String>) -> Self {
        RegistryError::ClientApi {
            registry: registry.to_string(),
            message: message.into(),
            status: None,
        }
    }

    pub fn is_permissions(&self) -> bool {
        matches!(self, RegistryError::Permissions { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RegistryError::Permissions { status, .. } => Some(*status),
            RegistryError::ClientApi { status, .. } => *status,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self.status() {
            Some(StatusCode::UNAUTHORIZED) => FailureKind::Unauthorized,
            Some(StatusCode::FORBIDDEN) => FailureKind::Forbidden,
            Some(StatusCode::TOO_MANY_REQUESTS) => FailureKind::RateLimited,
            _ => FailureKind::Other,
        }
    }
}

/// Classification of a failed poll, used as the `kind` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    Forbidden,
    RateLimited,
    Other,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Unauthorized,
        FailureKind::Forbidden,
        FailureKind::RateLimited,
        FailureKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Forbidden => "forbidden",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Other => "other",
        }
    }
}

/// Every tracked record and every pull secret candidate failed to list tags.
#[derive(Debug, Error)]
#[error("no pull secret succeeded for {image} after {} attempt(s): {}", .attempts.len(), summary(.attempts))]
pub struct PollError {
    pub image: String,
    pub attempts: Vec<RegistryError>,
}

impl PollError {
    pub fn failure_kind(&self) -> FailureKind {
        self.attempts
            .last()
            .map(RegistryError::failure_kind)
            .unwrap_or(FailureKind::Other)
    }
}

fn summary(attempts: &[RegistryError]) -> String {
    attempts
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
