//! Signed, time-bound device tokens
//!
//! The broker bridge authenticates a device by a JWT carried in the MQTT
//! password field. Claims are limited to `aud` (project id), `iat` and `exp`.

use super::CredentialError;
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Longest credential lifetime the broker bridge accepts
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Signing algorithms accepted by the broker bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSA with SHA-256; PKCS#1 or PKCS#8 PEM
    #[default]
    RS256,
    /// ECDSA P-256 with SHA-256; PKCS#8 PEM
    ES256,
}

impl SigningAlgorithm {
    fn jwt_algorithm(self) -> Algorithm {
        match self {
            SigningAlgorithm::RS256 => Algorithm::RS256,
            SigningAlgorithm::ES256 => Algorithm::ES256,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningAlgorithm::RS256 => f.write_str("RS256"),
            SigningAlgorithm::ES256 => f.write_str("ES256"),
        }
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Private key bound to a signing algorithm
pub struct TokenSigner {
    key: EncodingKey,
    algorithm: SigningAlgorithm,
}

impl TokenSigner {
    /// Parse the PEM private key for `algorithm`
    pub fn from_pem(private_key_pem: &[u8], algorithm: SigningAlgorithm) -> Result<Self, CredentialError> {
        let key = match algorithm {
            SigningAlgorithm::RS256 => EncodingKey::from_rsa_pem(private_key_pem),
            SigningAlgorithm::ES256 => EncodingKey::from_ec_pem(private_key_pem),
        }
        .map_err(CredentialError::KeyParse)?;

        Ok(Self { key, algorithm })
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Mint a credential valid from `issued_at` for exactly `lifetime`
    pub fn sign(
        &self,
        identity: &DeviceIdentity,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Result<SignedCredential, CredentialError> {
        let chrono_lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|_| CredentialError::InvalidLifetime(lifetime))?;
        let expires_at = issued_at + chrono_lifetime;

        let claims = Claims {
            aud: identity.audience(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let header = Header::new(self.algorithm.jwt_algorithm());
        let token =
            jsonwebtoken::encode(&header, &claims, &self.key).map_err(CredentialError::Signing)?;

        Ok(SignedCredential {
            token,
            issued_at,
            expires_at,
        })
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Validate a configured lifetime against the bridge limits
pub fn validate_lifetime(lifetime: Duration) -> Result<(), CredentialError> {
    if lifetime.is_zero() || lifetime > MAX_TOKEN_LIFETIME {
        return Err(CredentialError::InvalidLifetime(lifetime));
    }
    Ok(())
}

/// Bearer credential presented as the MQTT password
#[derive(Clone, PartialEq, Eq)]
pub struct SignedCredential {
    token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SignedCredential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn lifetime(&self) -> chrono::Duration {
        self.expires_at - self.issued_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Wall-clock instant at `fraction` of the lifetime
    pub fn renewal_deadline(&self, fraction: f64) -> DateTime<Utc> {
        let lifetime_ms = self.lifetime().num_milliseconds() as f64;
        let offset_ms = (lifetime_ms * fraction.clamp(0.0, 1.0)).round() as i64;
        self.issued_at + chrono::Duration::milliseconds(offset_ms)
    }
}

impl fmt::Debug for SignedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedCredential")
            .field("token", &"***REDACTED***")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jsonwebtoken::{DecodingKey, Validation};
    use serde::Deserialize;

    const RSA_PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/rsa_private.pem");
    const RSA_PUBLIC: &[u8] = include_bytes!("../../tests/fixtures/rsa_public.pem");
    const EC_PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/ec_private.pem");
    const EC_PUBLIC: &[u8] = include_bytes!("../../tests/fixtures/ec_public.pem");

    #[derive(Debug, Deserialize)]
    struct DecodedClaims {
        aud: String,
        iat: i64,
        exp: i64,
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("my-project", "us-central1", "reg", "dev").unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn validation(algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_audience(&["my-project"]);
        validation.validate_exp = false;
        validation
    }

    #[test]
    fn test_rs256_claims_round_trip() {
        let signer = TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256).unwrap();
        let credential = signer.sign(&identity(), t0(), Duration::from_secs(3600)).unwrap();

        let decoded = jsonwebtoken::decode::<DecodedClaims>(
            credential.token(),
            &DecodingKey::from_rsa_pem(RSA_PUBLIC).unwrap(),
            &validation(Algorithm::RS256),
        )
        .unwrap();

        assert_eq!(decoded.header.alg, Algorithm::RS256);
        assert_eq!(decoded.claims.aud, "my-project");
        assert_eq!(decoded.claims.iat, t0().timestamp());
        assert_eq!(decoded.claims.exp, t0().timestamp() + 3600);
    }

    #[test]
    fn test_es256_signature_verifies() {
        let signer = TokenSigner::from_pem(EC_PRIVATE, SigningAlgorithm::ES256).unwrap();
        let credential = signer.sign(&identity(), t0(), Duration::from_secs(600)).unwrap();

        let decoded = jsonwebtoken::decode::<DecodedClaims>(
            credential.token(),
            &DecodingKey::from_ec_pem(EC_PUBLIC).unwrap(),
            &validation(Algorithm::ES256),
        )
        .unwrap();

        assert_eq!(decoded.header.alg, Algorithm::ES256);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 600);
    }

    #[test]
    fn test_expiry_is_issued_at_plus_lifetime() {
        let signer = TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256).unwrap();
        let lifetime = Duration::from_secs(24 * 3600);
        let credential = signer.sign(&identity(), t0(), lifetime).unwrap();

        assert_eq!(credential.issued_at(), t0());
        assert_eq!(credential.expires_at(), t0() + chrono::Duration::hours(24));
        assert_eq!(credential.lifetime(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_expiry_boundaries() {
        let signer = TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256).unwrap();
        let credential = signer.sign(&identity(), t0(), Duration::from_secs(60)).unwrap();

        assert!(!credential.is_expired_at(t0() + chrono::Duration::seconds(59)));
        assert!(credential.is_expired_at(t0() + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_renewal_deadline_at_ninety_percent() {
        let signer = TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256).unwrap();
        let credential = signer
            .sign(&identity(), t0(), Duration::from_secs(24 * 3600))
            .unwrap();

        let deadline = credential.renewal_deadline(0.9);
        assert_eq!(deadline, t0() + chrono::Duration::minutes(21 * 60 + 36));
    }

    #[test]
    fn test_wrong_algorithm_key_rejected() {
        let err = TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::ES256).unwrap_err();
        assert!(matches!(err, CredentialError::KeyParse(_)));

        let err = TokenSigner::from_pem(b"not a key", SigningAlgorithm::RS256).unwrap_err();
        assert!(matches!(err, CredentialError::KeyParse(_)));
    }

    #[test]
    fn test_lifetime_validation() {
        assert!(validate_lifetime(Duration::from_secs(1)).is_ok());
        assert!(validate_lifetime(MAX_TOKEN_LIFETIME).is_ok());
        assert!(validate_lifetime(Duration::ZERO).is_err());
        assert!(validate_lifetime(MAX_TOKEN_LIFETIME + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let signer = TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256).unwrap();
        let credential = signer.sign(&identity(), t0(), Duration::from_secs(60)).unwrap();
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains(credential.token()));
    }
}
