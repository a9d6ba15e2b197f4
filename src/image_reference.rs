use std::fmt;

pub static DOCKER_HUB_REGISTRY: &str = "docker.io";
static DEFAULT_TAG: &str = "latest";

#[derive(Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug)]
pub enum ParseError {
    MissingRepository,
    InvalidFormat(String),
    DigestNotAllowed,
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestNotAllowed => write!(f, "digest references are not allowed"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        // digest references pin a single manifest, there is no newer tag to look for
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // A tag is a colon after the last slash, anything else is a registry port
        let (without_tag, tag) = match s.rfind(':') {
            Some(pos) if pos > s.rfind('/').unwrap_or(0) => (&s[..pos], &s[pos + 1..]),
            _ => (s, DEFAULT_TAG),
        };
        if tag.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (registry, repository) = match without_tag.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first, rest.to_string()),
            _ => (DOCKER_HUB_REGISTRY, without_tag.to_string()),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(ParseError::MissingRepository);
        }

        // Official Docker Hub images live under the implicit library/ namespace
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: tag.to_string(),
        })
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}
