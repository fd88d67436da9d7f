//! Agent credentials.
//!
//! Credential storage and key management live outside the core; the Core only
//! needs the identity and, for encrypted transports, the key pair.

use serde::{Deserialize, Serialize};

/// Immutable identity plus optional key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publickey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secretkey: Option<String>,
}

impl Credentials {
    /// Credentials carrying only an identity.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            publickey: None,
            secretkey: None,
        }
    }

    /// Attaches a key pair (builder pattern).
    pub fn with_keys(mut self, publickey: &str, secretkey: &str) -> Self {
        self.publickey = Some(publickey.to_string());
        self.secretkey = Some(secretkey.to_string());
        self
    }

    pub fn has_keys(&self) -> bool {
        self.publickey.is_some() && self.secretkey.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_only() {
        let creds = Credentials::new("platform.historian");
        assert_eq!(creds.identity, "platform.historian");
        assert!(!creds.has_keys());
    }

    #[test]
    fn test_keys_serialized_only_when_present() {
        let creds = Credentials::new("a").with_keys("pub", "sec");
        assert!(creds.has_keys());
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"publickey\":\"pub\""));

        let bare = serde_json::to_string(&Credentials::new("a")).unwrap();
        assert_eq!(bare, r#"{"identity":"a"}"#);
    }
}
