use std::{
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use base64::Engine as _;
use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AUDIENCE: &str = "edgeproxy";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
pub const HEADER_CLIENT_CERTIFICATE: &str = "x-client-certificate";

/// Claims carried by tunnel handshake tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelClaims {
    pub sub: String,
    pub aud: String,
    pub exp: u64,
    pub nonce: String,
}

/// Decorates the tunnel handshake with credentials.
pub trait Authenticator: Send + Sync {
    fn add_authentication_headers(&self, headers: &mut HeaderMap) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn add_authentication_headers(&self, _headers: &mut HeaderMap) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JwtSignerConfig {
    pub key_file: PathBuf,
    pub certificate_file: Option<PathBuf>,
    pub subject: String,
    pub audience: String,
    pub ttl: Duration,
}

/// Signs a fresh short-lived token for every handshake.
pub struct JwtAuthenticator {
    key: EncodingKey,
    algorithm: Algorithm,
    certificate: Option<HeaderValue>,
    subject: String,
    audience: String,
    ttl: Duration,
}

impl JwtAuthenticator {
    pub fn from_config(cfg: &JwtSignerConfig) -> anyhow::Result<Self> {
        let key_pem = std::fs::read(&cfg.key_file)
            .with_context(|| format!("auth: read key {}", cfg.key_file.display()))?;
        let cert_pem = match &cfg.certificate_file {
            Some(p) => Some(
                std::fs::read(p).with_context(|| format!("auth: read certificate {}", p.display()))?,
            ),
            None => None,
        };
        Self::from_pem(&key_pem, cert_pem.as_deref(), cfg)
    }

    /// RSA keys sign with RS256, EC keys with ES256.
    pub fn from_pem(
        key_pem: &[u8],
        cert_pem: Option<&[u8]>,
        cfg: &JwtSignerConfig,
    ) -> anyhow::Result<Self> {
        let (key, algorithm) = if let Ok(k) = EncodingKey::from_rsa_pem(key_pem) {
            (k, Algorithm::RS256)
        } else if let Ok(k) = EncodingKey::from_ec_pem(key_pem) {
            (k, Algorithm::ES256)
        } else {
            anyhow::bail!("auth: private key is neither an RSA nor an EC PEM key");
        };

        let certificate = match cert_pem {
            Some(pem) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(pem);
                Some(HeaderValue::from_str(&encoded).context("auth: encode certificate header")?)
            }
            None => None,
        };

        if cfg.subject.trim().is_empty() {
            anyhow::bail!("auth: jwt subject must not be empty");
        }

        Ok(Self {
            key,
            algorithm,
            certificate,
            subject: cfg.subject.trim().to_string(),
            audience: cfg.audience.clone(),
            ttl: cfg.ttl,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn sign(&self) -> anyhow::Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let claims = TunnelClaims {
            sub: self.subject.clone(),
            aud: self.audience.clone(),
            exp: (now + self.ttl).as_secs(),
            nonce: format!("{:016x}", rng().random::<u64>()),
        };
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.key)
            .context("auth: sign token")
    }
}

impl Authenticator for JwtAuthenticator {
    fn add_authentication_headers(&self, headers: &mut HeaderMap) -> anyhow::Result<()> {
        let token = self.sign()?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("auth: encode authorization header")?;
        headers.insert(AUTHORIZATION, value);
        if let Some(cert) = &self.certificate {
            headers.insert(HEADER_CLIENT_CERTIFICATE, cert.clone());
        }
        Ok(())
    }
}
