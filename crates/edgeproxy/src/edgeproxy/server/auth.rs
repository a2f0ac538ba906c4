use std::{fmt, path::PathBuf};

use anyhow::Context;
use http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Serialize;

use crate::edgeproxy::client::auth::{DEFAULT_AUDIENCE, TunnelClaims};

/// Authenticated identity of a tunnel client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks the tunnel handshake. `None` rejects it.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Subject>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn authenticate(&self, _headers: &HeaderMap) -> Option<Subject> {
        Some(Subject::anonymous())
    }
}

#[derive(Debug, Clone)]
pub struct JwtVerifierConfig {
    pub public_key_files: Vec<PathBuf>,
    pub audience: String,
}

/// Accepts bearer tokens signed by any of the configured keys.
pub struct JwtAuthenticator {
    keys: Vec<(DecodingKey, Algorithm)>,
    audience: String,
}

impl JwtAuthenticator {
    pub fn from_config(cfg: &JwtVerifierConfig) -> anyhow::Result<Self> {
        let mut pems = Vec::with_capacity(cfg.public_key_files.len());
        for p in &cfg.public_key_files {
            pems.push(std::fs::read(p).with_context(|| format!("auth: read public key {}", p.display()))?);
        }
        Self::from_pems(&pems, &cfg.audience)
    }

    pub fn from_pems(pems: &[Vec<u8>], audience: &str) -> anyhow::Result<Self> {
        if pems.is_empty() {
            anyhow::bail!("auth: jwt verification needs at least one public key");
        }
        let mut keys = Vec::with_capacity(pems.len());
        for (i, pem) in pems.iter().enumerate() {
            let key = if let Ok(k) = DecodingKey::from_rsa_pem(pem) {
                (k, Algorithm::RS256)
            } else if let Ok(k) = DecodingKey::from_ec_pem(pem) {
                (k, Algorithm::ES256)
            } else {
                anyhow::bail!("auth: public key #{i} is neither an RSA nor an EC PEM key");
            };
            keys.push(key);
        }
        let audience = if audience.trim().is_empty() {
            DEFAULT_AUDIENCE.to_string()
        } else {
            audience.trim().to_string()
        };
        Ok(Self { keys, audience })
    }

    fn verify(&self, token: &str) -> Option<TunnelClaims> {
        for (key, alg) in &self.keys {
            let mut validation = Validation::new(*alg);
            validation.set_audience(&[self.audience.as_str()]);
            validation.set_required_spec_claims(&["exp", "aud", "sub"]);
            match jsonwebtoken::decode::<TunnelClaims>(token, key, &validation) {
                Ok(data) => return Some(data.claims),
                Err(err) => {
                    tracing::trace!(err = %err, "auth: token rejected by key");
                }
            }
        }
        None
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Subject> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = value.strip_prefix("Bearer ")?.trim();
        let Some(claims) = self.verify(token) else {
            tracing::debug!("auth: invalid bearer token");
            return None;
        };
        let sub = claims.sub.trim();
        if sub.is_empty() {
            return None;
        }
        Some(Subject::new(sub))
    }
}
