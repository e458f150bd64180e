use anyhow::{Context, Result, anyhow};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Issuer the backend stamps on every gateway token.
pub const JWT_ISSUER: &str = "todo-app";

/// Audience reserved for the agent gateways.
pub const JWT_AUDIENCE: &str = "mastra-agents";

/// Claims consumed from backend-issued bearer tokens.
///
/// The backend prefers `userId`; older tokens carry only `sub`. Either one
/// satisfies the subject requirement.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayClaims {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub aud: String,
    pub iss: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl GatewayClaims {
    /// Builds claims for a user with a given time-to-live. Used by tests and
    /// local tooling; production tokens come from the backend.
    pub fn for_user(user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            user_id: Some(user_id.into()),
            sub: None,
            aud: JWT_AUDIENCE.to_string(),
            iss: JWT_ISSUER.to_string(),
            exp: (now + ttl).unix_timestamp(),
            iat: Some(now.unix_timestamp()),
        }
    }

    /// The authenticated user id: `userId` when present, else `sub`.
    pub fn subject(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("token carries neither userId nor sub"))
    }
}

/// HS256 verifier (and signer, for tests) bound to the shared gateway secret.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(anyhow!("AUTH_SECRET must not be empty"));
        }
        Ok(Self { secret })
    }

    /// Verifies signature, expiry, issuer, and audience, returning the claims.
    pub fn verify(&self, token: &str) -> Result<GatewayClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[JWT_AUDIENCE]);
        validation.set_issuer(&[JWT_ISSUER]);
        let data = decode::<GatewayClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .context("JWT verification failed")?;
        Ok(data.claims)
    }

    /// Convenience: verify and extract the subject in one step.
    pub fn verify_subject(&self, token: &str) -> Result<String> {
        let claims = self.verify(token)?;
        Ok(claims.subject()?.to_string())
    }

    pub fn sign(&self, claims: &GatewayClaims) -> Result<String> {
        let header = Header::new(Algorithm::HS256);
        Ok(encode(
            &header,
            claims,
            &EncodingKey::from_secret(&self.secret),
        )?)
    }
}
