use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::context::types::{now_ts, ContextError, Permission};
use crate::db::Store;

pub const TOKEN_ISSUER: &str = "shared-context-server";
pub const TOKEN_AUDIENCE: &str = "mcp-agents";
/// Lifetime of an issued token, seconds.
pub const TOKEN_TTL_SECS: i64 = 3600;
/// Clock-skew leeway accepted on `exp`, seconds.
const EXP_LEEWAY_SECS: u64 = 300;

const OPAQUE_PREFIX: &str = "sct_";

/// Claims carried by the inner JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub perms: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    pub fn permissions(&self) -> Vec<Permission> {
        self.perms
            .iter()
            .filter_map(|p| Permission::parse(p))
            .collect()
    }
}

/// What `authenticate` hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AuthGrant {
    pub token: String,
    pub agent_id: String,
    pub agent_type: String,
    pub permissions: Vec<Permission>,
    pub expires_at: i64,
}

struct SigningKeys {
    current: String,
    previous: Option<String>,
}

/// Issues and resolves tokens. Clients hold an opaque `sct_…` id; the JWT it
/// stands for lives AES-256-GCM-encrypted in `secure_tokens`, so the value on
/// the wire can be rotated without re-issuing JWTs and never leaks claims.
pub struct TokenService {
    store: Store,
    api_key: String,
    signing: RwLock<SigningKeys>,
    wrap_key: [u8; 32],
}

impl TokenService {
    /// `jwt_encryption_key` must be 64 hex chars (a 256-bit key). Anything
    /// else is a startup error — there is no weaker fallback.
    pub fn new(
        store: Store,
        api_key: String,
        jwt_secret_key: String,
        jwt_encryption_key: &str,
    ) -> anyhow::Result<Self> {
        let decoded = hex::decode(jwt_encryption_key)
            .map_err(|_| anyhow::anyhow!("JWT_ENCRYPTION_KEY must be hex"))?;
        let wrap_key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("JWT_ENCRYPTION_KEY must decode to exactly 32 bytes"))?;

        Ok(Self {
            store,
            api_key,
            signing: RwLock::new(SigningKeys {
                current: jwt_secret_key,
                previous: None,
            }),
            wrap_key,
        })
    }

    // ── Crypto helpers ───────────────────────────────────────────────────

    fn encrypt_jwt(&self, jwt: &str) -> Result<String, ContextError> {
        let cipher = Aes256Gcm::new_from_slice(&self.wrap_key)
            .map_err(|e| ContextError::Internal(format!("cipher init: {e}")))?;
        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, jwt.as_bytes())
            .map_err(|e| ContextError::Internal(format!("token encryption failed: {e}")))?;
        let mut blob = nonce.to_vec();
        blob.extend(ciphertext);
        Ok(B64.encode(blob))
    }

    fn decrypt_jwt(&self, stored: &str) -> Result<String, ContextError> {
        let blob = B64.decode(stored).map_err(|_| ContextError::AuthFailed)?;
        if blob.len() < 13 {
            return Err(ContextError::AuthFailed);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.wrap_key)
            .map_err(|e| ContextError::Internal(format!("cipher init: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| ContextError::AuthFailed)?;
        String::from_utf8(plaintext).map_err(|_| ContextError::AuthFailed)
    }

    fn new_opaque_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        format!("{OPAQUE_PREFIX}{}", hex::encode(bytes))
    }

    fn sign(&self, claims: &Claims) -> Result<String, ContextError> {
        let key = {
            let keys = self.signing.read().expect("signing key lock");
            keys.current.clone()
        };
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .map_err(|e| ContextError::Internal(format!("jwt signing failed: {e}")))
    }

    fn verify(&self, jwt: &str) -> Result<Claims, ContextError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.leeway = EXP_LEEWAY_SECS;

        let (current, previous) = {
            let keys = self.signing.read().expect("signing key lock");
            (keys.current.clone(), keys.previous.clone())
        };

        // Verification tries the current key, then the pre-rotation one.
        for key in std::iter::once(current).chain(previous) {
            if let Ok(data) = decode::<Claims>(
                jwt,
                &DecodingKey::from_secret(key.as_bytes()),
                &validation,
            ) {
                return Ok(data.claims);
            }
        }
        Err(ContextError::AuthFailed)
    }

    // ── Public operations ────────────────────────────────────────────────

    /// Verifies the machine-to-machine key, intersects the requested
    /// permissions with the allowed set (defaulting to read-only), signs the
    /// JWT, and parks it encrypted behind a fresh opaque id.
    pub async fn authenticate(
        &self,
        agent_id: &str,
        agent_type: &str,
        api_key: &str,
        requested: &[String],
    ) -> Result<AuthGrant, ContextError> {
        if api_key.as_bytes().ct_eq(self.api_key.as_bytes()).unwrap_u8() != 1 {
            return Err(ContextError::AuthFailed);
        }

        let mut permissions: Vec<Permission> = Vec::new();
        for requested_perm in requested.iter().filter_map(|p| Permission::parse(p)) {
            if !permissions.contains(&requested_perm) {
                permissions.push(requested_perm);
            }
        }
        if permissions.is_empty() {
            permissions.push(Permission::Read);
        }

        let iat = now_ts() as i64;
        let claims = Claims {
            sub: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            perms: permissions.iter().map(|p| p.as_str().to_string()).collect(),
            iat,
            exp: iat + TOKEN_TTL_SECS,
            iss: TOKEN_ISSUER.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
        };

        let jwt = self.sign(&claims)?;
        let opaque = self.park(&jwt, agent_id, claims.exp as f64).await?;

        Ok(AuthGrant {
            token: opaque,
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            permissions,
            expires_at: claims.exp,
        })
    }

    async fn park(&self, jwt: &str, agent_id: &str, expires_at: f64) -> Result<String, ContextError> {
        let opaque = Self::new_opaque_id();
        let ciphertext = self.encrypt_jwt(jwt)?;
        self.store
            .execute(
                "INSERT INTO secure_tokens (opaque_id, ciphertext, agent_id, created_at, expires_at)
                 VALUES (:id, :ct, :agent, :now, :exp)",
                &[
                    ("id", json!(opaque)),
                    ("ct", json!(ciphertext)),
                    ("agent", json!(agent_id)),
                    ("now", json!(now_ts())),
                    ("exp", json!(expires_at)),
                ],
            )
            .await?;
        Ok(opaque)
    }

    /// Accepts either token form: an `sct_…` opaque id is unwrapped from the
    /// store first; anything else is treated as a bare JWT.
    pub async fn resolve(&self, token: &str) -> Result<Claims, ContextError> {
        let jwt = if token.starts_with(OPAQUE_PREFIX) {
            use sqlx::Row;
            let rows = self
                .store
                .query(
                    "SELECT ciphertext, expires_at FROM secure_tokens WHERE opaque_id = :id",
                    &[("id", json!(token))],
                )
                .await?;
            let row = rows.first().ok_or(ContextError::AuthFailed)?;
            if row.get::<f64, _>("expires_at") + (EXP_LEEWAY_SECS as f64) < now_ts() {
                return Err(ContextError::AuthFailed);
            }
            self.decrypt_jwt(&row.get::<String, _>("ciphertext"))?
        } else {
            token.to_string()
        };
        self.verify(&jwt)
    }

    /// Issues a fresh JWT with the same subject and permissions under a NEW
    /// opaque id. The old id stays valid until it expires on its own.
    pub async fn refresh(&self, opaque: &str) -> Result<AuthGrant, ContextError> {
        if !opaque.starts_with(OPAQUE_PREFIX) {
            return Err(ContextError::AuthFailed);
        }
        let old = self.resolve(opaque).await?;

        let iat = now_ts() as i64;
        let claims = Claims {
            iat,
            exp: iat + TOKEN_TTL_SECS,
            ..old
        };
        let jwt = self.sign(&claims)?;
        let token = self.park(&jwt, &claims.sub, claims.exp as f64).await?;

        Ok(AuthGrant {
            token,
            agent_id: claims.sub.clone(),
            agent_type: claims.agent_type.clone(),
            permissions: claims.permissions(),
            expires_at: claims.exp,
        })
    }

    /// Swaps in a new signing key. The outgoing key is retained for
    /// verification only, so tokens signed before the rotation stay valid.
    pub fn rotate_signing_key(&self, new_key: String) {
        let mut keys = self.signing.write().expect("signing key lock");
        keys.previous = Some(std::mem::replace(&mut keys.current, new_key));
    }

    /// Deletes expired token rows. Called by the periodic cleanup task.
    pub async fn purge_expired(&self) -> Result<u64, ContextError> {
        let done = self
            .store
            .execute(
                "DELETE FROM secure_tokens WHERE expires_at < :cutoff",
                &[("cutoff", json!(now_ts() - EXP_LEEWAY_SECS as f64))],
            )
            .await?;
        Ok(done.rows_affected)
    }
}
