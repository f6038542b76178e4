use base64::Engine;
use serde::{Deserialize, Serialize};

/// Body returned to both providers once a callback is parsed.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WebhookAck {
    pub status: String,
}

impl WebhookAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// `user:pass` pair from an `Authorization: Basic ...` header.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn from_header(value: &str) -> Option<Self> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (username, password) = text.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials() {
        // "idm:secret"
        let creds = BasicCredentials::from_header("Basic aWRtOnNlY3JldA==").unwrap();
        assert_eq!(creds.username, "idm");
        assert_eq!(creds.password, "secret");

        assert!(BasicCredentials::from_header("Bearer aWRtOnNlY3JldA==").is_none());
        assert!(BasicCredentials::from_header("Basic !!!").is_none());
        // "nocolon"
        assert!(BasicCredentials::from_header("Basic bm9jb2xvbg==").is_none());
    }

    #[test]
    fn test_ack_shape() {
        assert_eq!(
            serde_json::to_value(WebhookAck::ok()).unwrap(),
            serde_json::json!({"status": "ok"})
        );
    }
}
