//! Credential verification.
//!
//! Two presented-token formats are accepted:
//!
//! 1. **Opaque short-lived token** – base64 JSON
//!    `{display_name, user_id, issued_at}` with no signature, valid for
//!    24 h. Admitted only where the deployment explicitly enables
//!    display-name-only admission.
//! 2. **Signed token** – verified against the store-published signing-key
//!    set. Required claims: `sub`, `iss`, `aud`, `exp`; 30 s clock-skew
//!    tolerance. On signature failure with a cached key set, the set is
//!    invalidated and fetched once more before final failure.
//!
//! The key-set cache is process-wide with time-based expiry; concurrent
//! refreshes collapse to a single store fetch.

use crate::store::{SigningKey, Store, StoreError};
use crate::types::ServerConfig;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine as _;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use log::warn;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential rejected")]
    Failed,
    #[error("credential expired")]
    Expired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Token payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpaquePayload {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    /// Seconds since the Unix epoch.
    issued_at: u64,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Key cache
// ---------------------------------------------------------------------------

struct VerifyKey {
    kid: Option<String>,
    alg: Algorithm,
    key: DecodingKey,
}

struct CachedKeys {
    keys: Arc<Vec<VerifyKey>>,
    fetched: Instant,
    generation: u64,
}

fn build_keys(set: Vec<SigningKey>) -> Vec<VerifyKey> {
    set.into_iter()
        .filter_map(|entry| {
            let alg: Algorithm = match entry.algorithm.parse() {
                Ok(alg) => alg,
                Err(_) => {
                    warn!("Ignoring signing key with unknown algorithm {}", entry.algorithm);
                    return None;
                }
            };
            let key = match alg {
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                    Ok(DecodingKey::from_secret(entry.secret.as_bytes()))
                }
                Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512 => DecodingKey::from_rsa_pem(entry.secret.as_bytes()),
                Algorithm::ES256 | Algorithm::ES384 => {
                    DecodingKey::from_ec_pem(entry.secret.as_bytes())
                }
                Algorithm::EdDSA => DecodingKey::from_ed_pem(entry.secret.as_bytes()),
            };
            match key {
                Ok(key) => Some(VerifyKey {
                    kid: entry.kid,
                    alg,
                    key,
                }),
                Err(e) => {
                    warn!("Ignoring malformed signing key: {}", e);
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

pub struct CredentialVerifier {
    store: Arc<dyn Store>,
    issuer: String,
    audience: String,
    allow_unsigned: bool,
    cache_ttl: Duration,
    opaque_max_age: Duration,
    cache: tokio::sync::Mutex<Option<CachedKeys>>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Self {
        Self {
            store,
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            allow_unsigned: config.allow_unsigned_tokens,
            cache_ttl: config.key_cache_ttl,
            opaque_max_age: config.opaque_token_max_age,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if let Some(result) = self.try_opaque(token) {
            return result;
        }
        self.verify_signed(token).await
    }

    // -----------------------------------------------------------------------
    // Opaque tokens
    // -----------------------------------------------------------------------

    /// Returns `None` when the token does not parse as an opaque payload,
    /// in which case the signed path applies.
    fn try_opaque(&self, token: &str) -> Option<Result<Identity, AuthError>> {
        let raw = BASE64
            .decode(token)
            .or_else(|_| BASE64_URL.decode(token))
            .ok()?;
        let payload: OpaquePayload = serde_json::from_slice(&raw).ok()?;

        if !self.allow_unsigned {
            return Some(Err(AuthError::Failed));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        // 30 s skew tolerance for tokens stamped slightly in the future.
        if payload.issued_at > now + 30 {
            return Some(Err(AuthError::Failed));
        }
        if now.saturating_sub(payload.issued_at) > self.opaque_max_age.as_secs() {
            return Some(Err(AuthError::Expired));
        }
        Some(Ok(Identity {
            user_id: payload.user_id,
            display_name: payload.display_name,
        }))
    }

    // -----------------------------------------------------------------------
    // Signed tokens
    // -----------------------------------------------------------------------

    async fn verify_signed(&self, token: &str) -> Result<Identity, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Failed)?;

        let (generation, keys) = self.keys(None).await?;
        match self.try_keys(&keys, header.kid.as_deref(), header.alg, token) {
            Ok(identity) => Ok(identity),
            Err(first_failure) => {
                if matches!(first_failure, AuthError::Expired) {
                    return Err(first_failure);
                }
                // Key rotation may have invalidated the cache; fetch once
                // more before giving up.
                let (_, keys) = self.keys(Some(generation)).await?;
                self.try_keys(&keys, header.kid.as_deref(), header.alg, token)
            }
        }
    }

    fn try_keys(
        &self,
        keys: &[VerifyKey],
        kid: Option<&str>,
        alg: Algorithm,
        token: &str,
    ) -> Result<Identity, AuthError> {
        let mut validation = Validation::new(alg);
        validation.leeway = 30;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["sub", "exp", "iss", "aud"]);

        let mut last = AuthError::Failed;
        for candidate in keys.iter().filter(|k| k.alg == alg) {
            // A key with a kid only matches tokens naming that kid;
            // kid-less keys are tried for any token.
            if let (Some(want), Some(have)) = (kid, candidate.kid.as_deref()) {
                if want != have {
                    continue;
                }
            }
            match decode::<Claims>(token, &candidate.key, &validation) {
                Ok(data) => {
                    return Ok(Identity {
                        user_id: data.claims.sub,
                        display_name: data.claims.display_name.or(data.claims.name),
                    });
                }
                Err(e) => {
                    last = match e.kind() {
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                        _ => AuthError::Failed,
                    };
                }
            }
        }
        Err(last)
    }

    // -----------------------------------------------------------------------
    // Key-set cache
    // -----------------------------------------------------------------------

    /// Return the cached key set, fetching when absent or expired.
    ///
    /// `stale` names the generation a caller already tried and failed
    /// with: the fetch is skipped when another refresher got there first,
    /// so concurrent rotation refreshes collapse to one store call.
    async fn keys(&self, stale: Option<u64>) -> Result<(u64, Arc<Vec<VerifyKey>>), AuthError> {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            let reusable = match stale {
                None => cached.fetched.elapsed() < self.cache_ttl,
                Some(generation) => cached.generation != generation,
            };
            if reusable {
                return Ok((cached.generation, cached.keys.clone()));
            }
        }
        let set = self.store.key_set().await?;
        let keys = Arc::new(build_keys(set));
        let generation = guard.as_ref().map_or(1, |c| c.generation + 1);
        *guard = Some(CachedKeys {
            keys: keys.clone(),
            fetched: Instant::now(),
            generation,
        });
        Ok((generation, keys))
    }
}
