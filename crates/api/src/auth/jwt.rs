//! Bearer-token verification.
//!
//! The auth provider issues HS256 JWTs; the `sub` claim is the external
//! user id and `email` rides along for the first-contact user upsert.
//! Signup-time referral attribution arrives as the optional `referred_by`
//! claim (the referrer's external id).

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// External id of the referring user, set at signup.
    #[serde(default)]
    pub referred_by: Option<String>,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                ApiError::Unauthorized
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let exp = (time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset) as usize;
        let claims = Claims {
            sub: sub.to_string(),
            email: Some("user@example.com".into()),
            referred_by: None,
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = JwtVerifier::new("secret");
        let claims = verifier.verify(&token("secret", "u1", 3600)).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
        assert!(claims.referred_by.is_none());
    }

    #[test]
    fn carries_referral_attribution() {
        let exp = (time::OffsetDateTime::now_utc().unix_timestamp() + 3600) as usize;
        let claims = Claims {
            sub: "u2".into(),
            email: Some("new@example.com".into()),
            referred_by: Some("u1".into()),
            exp,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let verifier = JwtVerifier::new("secret");
        let decoded = verifier.verify(&token).unwrap();
        assert_eq!(decoded.referred_by.as_deref(), Some("u1"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify(&token("other", "u1", 3600)).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify(&token("secret", "u1", -3600)).is_err());
    }

    #[test]
    fn rejects_garbage() {
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify("not.a.jwt").is_err());
    }
}
