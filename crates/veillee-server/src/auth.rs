//! Session-token verification.
//!
//! Verifies the compact HS256 session token minted by the identity
//! collaborator and returns the carried identity. Every failure cause --
//! malformed token, bad signature, expiry, missing secret -- collapses
//! into the single opaque [`AuthError::InvalidToken`]; the precise reason
//! is only ever logged at `debug`.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
}

/// Claims carried by a session token.
#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    picture: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// A verified principal. `user_id` is the stable `sub` claim; `name` and
/// `picture` are the only identity fields ever attached to outbound
/// envelopes.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub picture: Option<String>,
    #[allow(dead_code)]
    pub email: Option<String>,
}

pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    dev_mode: bool,
}

impl TokenVerifier {
    /// Build a verifier from the configured signing secret and expected
    /// audience. An unset or empty audience switches to development-only
    /// acceptance: tokens are still parsed and expiry-checked, but the
    /// signature is not validated.
    pub fn new(secret: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);

        let audience = audience.map(str::trim).filter(|a| !a.is_empty());
        let dev_mode = audience.is_none();

        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => {
                validation.insecure_disable_signature_validation();
                // Tokens minted for production still carry an `aud` claim;
                // with no expected audience configured it must not reject
                // them.
                validation.validate_aud = false;
                warn!(
                    "TOKEN_AUDIENCE is unset: accepting UNSIGNED session tokens \
                     (development only)"
                );
            }
        }

        let decoding_key = DecodingKey::from_secret(secret.unwrap_or_default().as_bytes());

        Self {
            decoding_key,
            validation,
            dev_mode,
        }
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    /// Verify a session token and return the identity it carries.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(error = %e, "Session token rejected");
            AuthError::InvalidToken
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            debug!("Session token rejected: empty sub claim");
            return Err(AuthError::InvalidToken);
        }

        Ok(Identity {
            user_id: claims.sub,
            name: claims
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Guest".to_string()),
            picture: claims.picture.filter(|p| !p.trim().is_empty()),
            email: claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";
    const AUDIENCE: &str = "veillee";

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let verifier = TokenVerifier::new(Some(SECRET), Some(AUDIENCE));
        let token = sign(
            &json!({
                "sub": "alice-sub",
                "name": "Alice",
                "email": "alice@example.com",
                "picture": "https://pic/a.png",
                "aud": AUDIENCE,
                "exp": future_exp(),
            }),
            SECRET,
        );

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, "alice-sub");
        assert_eq!(identity.name, "Alice");
        assert_eq!(identity.picture.as_deref(), Some("https://pic/a.png"));
    }

    #[test]
    fn rejects_wrong_signature() {
        let verifier = TokenVerifier::new(Some(SECRET), Some(AUDIENCE));
        let token = sign(
            &json!({"sub": "alice-sub", "aud": AUDIENCE, "exp": future_exp()}),
            "some-other-secret",
        );
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = TokenVerifier::new(Some(SECRET), Some(AUDIENCE));
        let token = sign(
            &json!({
                "sub": "alice-sub",
                "aud": AUDIENCE,
                "exp": chrono::Utc::now().timestamp() - 3600,
            }),
            SECRET,
        );
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_wrong_audience() {
        let verifier = TokenVerifier::new(Some(SECRET), Some(AUDIENCE));
        let token = sign(
            &json!({"sub": "alice-sub", "aud": "someone-else", "exp": future_exp()}),
            SECRET,
        );
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_garbage() {
        let verifier = TokenVerifier::new(Some(SECRET), Some(AUDIENCE));
        assert!(verifier.verify("not-a-token").is_err());
        assert!(verifier.verify("").is_err());
    }

    #[test]
    fn dev_mode_skips_signature_but_not_expiry() {
        let verifier = TokenVerifier::new(None, None);
        assert!(verifier.dev_mode());

        let unsigned = sign(
            &json!({"sub": "alice-sub", "exp": future_exp()}),
            "whatever",
        );
        assert!(verifier.verify(&unsigned).is_ok());

        let expired = sign(
            &json!({"sub": "alice-sub", "exp": chrono::Utc::now().timestamp() - 3600}),
            "whatever",
        );
        assert!(verifier.verify(&expired).is_err());
    }

    #[test]
    fn dev_mode_accepts_tokens_that_carry_an_audience() {
        // The same tokens production mints, aud claim included, must
        // verify when no expected audience is configured.
        let verifier = TokenVerifier::new(None, None);
        let token = sign(
            &json!({"sub": "alice-sub", "aud": AUDIENCE, "exp": future_exp()}),
            "whatever",
        );
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn missing_name_falls_back() {
        let verifier = TokenVerifier::new(None, None);
        let token = sign(&json!({"sub": "alice-sub", "exp": future_exp()}), "x");
        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.name, "Guest");
        assert_eq!(identity.picture, None);
    }
}
