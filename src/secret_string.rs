use serde::{Deserialize, Serialize};
use std::fmt;

/// Wrapper for secret strings (e.g., registry passwords, bearer tokens) that prints a "<REDACTED, length {length of the secret}>" string for Debug/Display
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        SecretString(s)
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PullSecret;

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::new("hunter2".to_string());
        assert_eq!(format!("{}", secret), "<REDACTED, length 7>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 7>");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_pull_secret_debug_hides_password() {
        let pull_secret = PullSecret::new("robot", "hunter2");
        let printed = format!("{:?}", pull_secret);
        assert!(printed.contains("robot"));
        assert!(!printed.contains("hunter2"));
    }
}
