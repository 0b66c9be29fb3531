//! Credentials shared by the REST session and stream connections.
//!
//! Flowdock accepts HTTP Basic auth for both surfaces. The `email:secret`
//! pair is encoded once at construction and only the encoded header value is
//! handed to stream connections.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};

/// Encoded `Authorization` value for a Flowdock account.
///
/// Immutable once built. Cloning shares nothing mutable, so a single value can
/// back one session and any number of stream connections.
#[derive(Clone, Debug)]
pub struct Credentials {
    email: String,
    authorization: SecretString,
}

impl Credentials {
    /// Builds Basic credentials from an account email and password.
    pub fn new(email: impl Into<String>, password: SecretString) -> Self {
        let email = email.into();
        let authorization = basic_authorization(&email, password.expose_secret());
        Self {
            email,
            authorization,
        }
    }

    /// Builds credentials from a personal API token.
    ///
    /// The token takes the username slot and the password is left empty.
    pub fn api_token(token: SecretString) -> Self {
        let authorization = basic_authorization(token.expose_secret(), "");
        Self {
            email: String::new(),
            authorization,
        }
    }

    /// Account email, empty for token credentials.
    pub fn email(&self) -> &str {
        &self.email
    }

    pub(crate) fn authorization(&self) -> &str {
        self.authorization.expose_secret()
    }
}

fn basic_authorization(user: &str, password: &str) -> SecretString {
    let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
    SecretString::new(format!("Basic {encoded}"))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::Credentials;

    #[test]
    fn encodes_email_and_password_as_basic_auth() {
        let credentials =
            Credentials::new("user@example.com", SecretString::new("hunter2".to_string()));
        assert_eq!(
            credentials.authorization(),
            "Basic dXNlckBleGFtcGxlLmNvbTpodW50ZXIy"
        );
        assert_eq!(credentials.email(), "user@example.com");
    }

    #[test]
    fn api_token_uses_empty_password() {
        let credentials = Credentials::api_token(SecretString::new("abc123".to_string()));
        assert_eq!(credentials.authorization(), "Basic YWJjMTIzOg==");
        assert!(credentials.email().is_empty());
    }

    #[test]
    fn debug_output_redacts_secret() {
        let credentials =
            Credentials::new("user@example.com", SecretString::new("hunter2".to_string()));
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("dXNlckBleGFtcGxlLmNvbTpodW50ZXIy"));
    }
}
