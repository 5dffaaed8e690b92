// Bearer-token validation against the identity provider's JWKS document.
//
// Keys are cached per `kid` with a single last-fetched timestamp. Reads take
// the shared lock while the cache is fresh; a refresh happens under the
// exclusive lock with a double check, so a thundering herd of sessions
// produces at most one HTTP fetch.

// Standard library imports
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// External crate imports
use base64::prelude::*;
use jwt::{Header, PKeyWithDigest, Token, VerifyWithKey};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Rsa;
use serde_derive::Deserialize;
use tokio::sync::RwLock;

// Internal crate imports
use crate::config::OidcSettings;
use crate::errors::{Error, TokenError};

/// How long a fetched JWKS document stays authoritative.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Timeout for one JWKS fetch.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The projection of a validated token that outlives the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcContext {
    pub email: String,
    pub subject: String,
    pub roles: Vec<String>,
    pub issued_at: Option<u64>,
    pub expires_at: u64,
}

struct KeyCache {
    keys: HashMap<String, PKey<Public>>,
    fetched_at: Option<Instant>,
}

impl KeyCache {
    fn fresh(&self, ttl: Duration) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() < ttl,
            None => false,
        }
    }
}

pub struct TokenValidator {
    settings: OidcSettings,
    http: reqwest::Client,
    cache: RwLock<KeyCache>,
}

impl TokenValidator {
    pub fn new(settings: OidcSettings) -> Result<TokenValidator, Error> {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .map_err(|err| Error::BadConfig(format!("can't build JWKS HTTP client: {err}")))?;
        Ok(TokenValidator {
            settings,
            http,
            cache: RwLock::new(KeyCache {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        })
    }

    /// Install a PEM public key under a fixed `kid`, bypassing HTTP. Used by
    /// air-gapped deployments and tests; marks the cache fresh.
    pub async fn load_static_key(&self, kid: &str, pem: &[u8]) -> Result<(), Error> {
        let key = PKey::public_key_from_pem(pem)
            .map_err(|err| Error::BadConfig(format!("can't load public key: {err}")))?;
        let mut cache = self.cache.write().await;
        cache.keys.insert(kid.to_string(), key);
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }

    pub async fn validate(&self, token: &str) -> Result<OidcContext, TokenError> {
        let header = decode_raw_header(token)?;
        if header.alg != "RS256" {
            return Err(TokenError::Algorithm(header.alg));
        }
        let kid = header.kid.ok_or(TokenError::MissingKeyId)?;

        let key = self.resolve_key(&kid).await?;
        let verifier = PKeyWithDigest {
            digest: MessageDigest::sha256(),
            key,
        };

        let parsed: Token<Header, Claims, _> = VerifyWithKey::verify_with_key(token, &verifier)
            .map_err(|err| TokenError::Signature(err.to_string()))?;
        let (_, claims) = parsed.into();

        self.check_claims(claims)
    }

    async fn resolve_key(&self, kid: &str) -> Result<PKey<Public>, TokenError> {
        {
            let cache = self.cache.read().await;
            if cache.fresh(JWKS_CACHE_TTL) {
                return match cache.keys.get(kid) {
                    Some(key) => Ok(key.clone()),
                    None => Err(TokenError::UnknownKeyId(kid.to_string())),
                };
            }
        }

        let mut cache = self.cache.write().await;
        // Someone else may have refreshed while we waited for the lock.
        if !cache.fresh(JWKS_CACHE_TTL) {
            let document = self.fetch_jwks().await?;
            cache.keys = decode_document(document)?;
            cache.fetched_at = Some(Instant::now());
            log::info!(
                "Refreshed JWKS from {} ({} keys)",
                self.settings.jwks_url,
                cache.keys.len()
            );
        }

        match cache.keys.get(kid) {
            Some(key) => Ok(key.clone()),
            None => Err(TokenError::UnknownKeyId(kid.to_string())),
        }
    }

    async fn fetch_jwks(&self) -> Result<JwksDocument, TokenError> {
        let response = self
            .http
            .get(&self.settings.jwks_url)
            .send()
            .await
            .map_err(|err| TokenError::JwksFetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TokenError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.settings.jwks_url
            )));
        }
        response
            .json::<JwksDocument>()
            .await
            .map_err(|err| TokenError::JwksFetch(err.to_string()))
    }

    fn check_claims(&self, claims: Claims) -> Result<OidcContext, TokenError> {
        match claims.iss {
            Some(ref iss) if *iss == self.settings.issuer => (),
            Some(_) => return Err(TokenError::Issuer),
            None => return Err(TokenError::MissingClaim("iss")),
        }

        match claims.aud {
            Some(ref aud) if aud.contains(&self.settings.audience) => (),
            Some(_) => return Err(TokenError::Audience),
            None => return Err(TokenError::MissingClaim("aud")),
        }

        let expires_at = claims.exp.ok_or(TokenError::MissingClaim("exp"))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now >= expires_at {
            return Err(TokenError::Expired);
        }

        let email = match claims.email {
            Some(email) if !email.is_empty() => email,
            _ => return Err(TokenError::MissingClaim("email")),
        };
        let subject = match claims.sub {
            Some(sub) if !sub.is_empty() => sub,
            _ => return Err(TokenError::MissingClaim("sub")),
        };

        // Either `role` or `roles` may carry the role list; order matters to
        // the role mapper and is preserved.
        let roles = claims
            .role
            .or(claims.roles)
            .map(OneOrMany::into_vec)
            .unwrap_or_default();

        Ok(OidcContext {
            email,
            subject,
            roles,
            issued_at: claims.iat,
            expires_at,
        })
    }
}

/// True when the secret is structurally a JWS compact serialization: three
/// non-empty dot-separated base64url segments. Database passwords that
/// happen to match are treated as tokens and fail closed.
pub fn looks_like_token(secret: &str) -> bool {
    let segments: Vec<&str> = secret.split('.').collect();
    segments.len() == 3
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        })
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

fn decode_raw_header(token: &str) -> Result<RawHeader, TokenError> {
    let header = token
        .split('.')
        .next()
        .ok_or_else(|| TokenError::Malformed("empty token".into()))?;
    let header = BASE64_URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|err| TokenError::Malformed(format!("header is not base64url: {err}")))?;
    serde_json::from_slice(&header)
        .map_err(|err| TokenError::Malformed(format!("header is not JSON: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn contains(&self, wanted: &str) -> bool {
        match self {
            OneOrMany::One(value) => value == wanted,
            OneOrMany::Many(values) => values.iter().any(|value| value == wanted),
        }
    }

    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<OneOrMany>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    iat: Option<u64>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    role: Option<OneOrMany>,
    #[serde(default)]
    roles: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JwksDocument {
    keys: Vec<JwksKey>,
}

#[derive(Debug, Deserialize)]
struct JwksKey {
    kty: String,
    #[serde(rename = "use", default)]
    usage: Option<String>,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Decode every RSA signature key of the document into an openssl public
/// key, keyed by `kid`. Entries of other types or uses are skipped.
fn decode_document(document: JwksDocument) -> Result<HashMap<String, PKey<Public>>, TokenError> {
    let mut keys = HashMap::new();

    for entry in document.keys {
        if entry.kty != "RSA" {
            continue;
        }
        if let Some(usage) = &entry.usage {
            if usage != "sig" {
                continue;
            }
        }
        let kid = match entry.kid {
            Some(kid) => kid,
            None => continue,
        };
        let (n, e) = match (entry.n, entry.e) {
            (Some(n), Some(e)) => (n, e),
            _ => {
                return Err(TokenError::JwksDecode(format!(
                    "RSA key {kid:?} is missing modulus or exponent"
                )))
            }
        };

        let n = BASE64_URL_SAFE_NO_PAD
            .decode(n)
            .map_err(|err| TokenError::JwksDecode(format!("modulus of {kid:?}: {err}")))?;
        let e = BASE64_URL_SAFE_NO_PAD
            .decode(e)
            .map_err(|err| TokenError::JwksDecode(format!("exponent of {kid:?}: {err}")))?;

        let n = BigNum::from_slice(&n)
            .map_err(|err| TokenError::JwksDecode(format!("modulus of {kid:?}: {err}")))?;
        let e = BigNum::from_slice(&e)
            .map_err(|err| TokenError::JwksDecode(format!("exponent of {kid:?}: {err}")))?;

        let rsa = Rsa::from_public_components(n, e)
            .map_err(|err| TokenError::JwksDecode(format!("key {kid:?}: {err}")))?;
        let key = PKey::from_rsa(rsa)
            .map_err(|err| TokenError::JwksDecode(format!("key {kid:?}: {err}")))?;

        keys.insert(kid, key);
    }

    Ok(keys)
}
