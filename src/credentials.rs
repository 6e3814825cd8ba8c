//! Credential resolution: BYOK decryption and pool fallback
//!
//! Provider secrets are stored AES-256-GCM encrypted with a per-record
//! nonce; the master key is derived once at startup from the configured
//! passphrase. Plaintext secrets are wrapped in `SecretString` the moment
//! they are produced and never logged or serialized. A record that fails
//! authenticated decryption is treated as unavailable, not as a crash.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use secrecy::SecretString;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::PoolKeys;
use crate::error::GatewayError;
use crate::pricing::is_free_model;
use crate::project_store::{Project, ProjectStore, ProviderCredential};
use crate::upstream::Provider;

/// AES-256 key size.
const AES_KEY_SIZE: usize = 32;

/// AES-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// PBKDF2 iteration count (NIST 2023 recommendation).
const PBKDF2_ITERATIONS: u32 = 600_000;

/// Domain-separation salt for the credential master key.
const KEY_DERIVATION_SALT: &[u8] = b"llm-gateway/provider-credentials/v1";

/// Where the resolved secret came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Byok,
    Pool,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Byok => "byok",
            Self::Pool => "pool",
        }
    }
}

/// Resolution result handed to the upstream dispatcher.
pub struct ResolvedCredential {
    pub secret: SecretString,
    pub source: CredentialSource,
    pub free_model: bool,
    /// Priority of the BYOK record that decrypted, for the usage touch.
    pub priority: Option<u8>,
}

/// AES-256-GCM cipher over the derived master key.
pub struct CredentialCipher {
    key: Zeroizing<[u8; AES_KEY_SIZE]>,
}

impl CredentialCipher {
    /// Derive the master key from the configured passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut key = [0u8; AES_KEY_SIZE];
        pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            KEY_DERIVATION_SALT,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self { key: Zeroizing::new(key) }
    }

    /// Encrypt a plaintext secret, returning base64 (ciphertext, nonce).
    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<(String, String)> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("nonce generation failed: {e}"))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;

        let engine = base64::engine::general_purpose::STANDARD;
        Ok((engine.encode(ciphertext), engine.encode(nonce_bytes)))
    }

    /// Authenticated decryption of a stored record.
    pub fn decrypt(&self, ciphertext_b64: &str, iv_b64: &str) -> anyhow::Result<SecretString> {
        let engine = base64::engine::general_purpose::STANDARD;
        let ciphertext = engine.decode(ciphertext_b64)?;
        let nonce_bytes = engine.decode(iv_b64)?;
        if nonce_bytes.len() != NONCE_SIZE {
            anyhow::bail!("invalid nonce length {}", nonce_bytes.len());
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| anyhow::anyhow!("authenticated decryption failed"))?;

        let secret = String::from_utf8(plaintext)?;
        Ok(SecretString::new(secret))
    }
}

/// Resolves the secret used for one upstream dispatch.
pub struct CredentialResolver {
    store: Arc<dyn ProjectStore>,
    cipher: CredentialCipher,
    pool: PoolKeys,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn ProjectStore>, cipher: CredentialCipher, pool: PoolKeys) -> Self {
        Self { store, cipher, pool }
    }

    fn pool_secret(&self, provider: Provider) -> Option<&String> {
        match provider {
            Provider::OpenAi => self.pool.openai.as_ref(),
            Provider::Anthropic => self.pool.anthropic.as_ref(),
            Provider::Groq => self.pool.groq.as_ref(),
            Provider::OpenRouter => self.pool.openrouter.as_ref(),
        }
    }

    /// BYOK first; otherwise the pool, which only serves free-tier models.
    pub async fn resolve(
        &self,
        project: &Project,
        provider: Provider,
        model: &str,
    ) -> Result<ResolvedCredential, GatewayError> {
        let records = self
            .store
            .credentials(&project.id, provider)
            .await
            .map_err(GatewayError::internal)?;

        if let Some(resolved) = self.try_decrypt(&project.id, provider, &records) {
            return Ok(ResolvedCredential {
                free_model: is_free_model(model),
                ..resolved
            });
        }

        if is_free_model(model) {
            if let Some(secret) = self.pool_secret(provider) {
                debug!(project_id = %project.id, provider = %provider, "using pool credential");
                return Ok(ResolvedCredential {
                    secret: SecretString::new(secret.clone()),
                    source: CredentialSource::Pool,
                    free_model: true,
                    priority: None,
                });
            }
            return Err(GatewayError::internal(format!(
                "no pool credential configured for provider {provider}"
            )));
        }

        Err(GatewayError::PaidModelRequiresByok { model: model.to_string() })
    }

    /// Try records in priority order; a record that fails to decrypt is
    /// skipped with a warning.
    fn try_decrypt(
        &self,
        project_id: &str,
        provider: Provider,
        records: &[ProviderCredential],
    ) -> Option<ResolvedCredential> {
        for record in records {
            match self.cipher.decrypt(&record.ciphertext, &record.iv) {
                Ok(secret) => {
                    self.touch_async(project_id, provider, record.priority);
                    return Some(ResolvedCredential {
                        secret,
                        source: CredentialSource::Byok,
                        free_model: false,
                        priority: Some(record.priority),
                    });
                }
                Err(err) => {
                    warn!(
                        project_id,
                        provider = %provider,
                        priority = record.priority,
                        error = %err,
                        "credential unavailable"
                    );
                }
            }
        }
        None
    }

    /// Update `last_used_at` without blocking the request.
    fn touch_async(&self, project_id: &str, provider: Provider, priority: u8) {
        let store = self.store.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = store.touch_credential(&project_id, provider, priority).await {
                warn!(project_id = %project_id, error = %err, "credential touch failed");
            }
        });
    }

    /// Encrypt and rotate in a new credential at priority 1.
    pub async fn store_credential(
        &self,
        project_id: &str,
        provider: Provider,
        plaintext: &str,
    ) -> Result<(), GatewayError> {
        let (ciphertext, iv) = self
            .cipher
            .encrypt(plaintext)
            .map_err(GatewayError::internal)?;
        let credential = ProviderCredential {
            provider,
            priority: 1,
            ciphertext,
            iv,
            active: true,
            last_used_at: None,
        };
        self.store
            .rotate_credential(project_id, credential)
            .await
            .map_err(GatewayError::internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_store::MemoryProjectStore;
    use secrecy::ExposeSecret;

    fn cipher() -> CredentialCipher {
        CredentialCipher::from_passphrase("test-passphrase")
    }

    fn resolver_with(store: Arc<MemoryProjectStore>, pool: PoolKeys) -> CredentialResolver {
        CredentialResolver::new(store, cipher(), pool)
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = cipher();
        let (ciphertext, iv) = cipher.encrypt("sk-test-secret-value").unwrap();
        let secret = cipher.decrypt(&ciphertext, &iv).unwrap();
        assert_eq!(secret.expose_secret(), "sk-test-secret-value");
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = cipher();
        let (_, iv1) = cipher.encrypt("secret").unwrap();
        let (_, iv2) = cipher.encrypt("secret").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let cipher = cipher();
        let (ciphertext, iv) = cipher.encrypt("secret").unwrap();
        let mut tampered = base64::engine::general_purpose::STANDARD
            .decode(&ciphertext)
            .unwrap();
        tampered[0] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(tampered);
        assert!(cipher.decrypt(&tampered, &iv).is_err());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let (ciphertext, iv) = cipher().encrypt("secret").unwrap();
        let other = CredentialCipher::from_passphrase("different-passphrase");
        assert!(other.decrypt(&ciphertext, &iv).is_err());
    }

    #[tokio::test]
    async fn test_byok_resolution() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = Project::new("p1");
        store.add_project("key-1", project.clone());

        let (ciphertext, iv) = cipher().encrypt("sk-byok-secret").unwrap();
        store.add_credential(
            "p1",
            ProviderCredential {
                provider: Provider::OpenAi,
                priority: 1,
                ciphertext,
                iv,
                active: true,
                last_used_at: None,
            },
        );

        let resolver = resolver_with(store, PoolKeys::default());
        let resolved = resolver
            .resolve(&project, Provider::OpenAi, "gpt-4o")
            .await
            .unwrap();
        assert_eq!(resolved.source, CredentialSource::Byok);
        assert_eq!(resolved.secret.expose_secret(), "sk-byok-secret");
    }

    #[tokio::test]
    async fn test_paid_model_without_byok_is_rejected() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = Project::new("p1");
        store.add_project("key-1", project.clone());

        let pool = PoolKeys { openai: Some("pool-key".to_string()), ..Default::default() };
        let resolver = resolver_with(store, pool);

        let err = resolver
            .resolve(&project, Provider::OpenAi, "gpt-4o")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::PaidModelRequiresByok { .. }));
    }

    #[tokio::test]
    async fn test_free_model_falls_back_to_pool() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = Project::new("p1");
        store.add_project("key-1", project.clone());

        let pool = PoolKeys {
            openrouter: Some("pool-openrouter-key".to_string()),
            ..Default::default()
        };
        let resolver = resolver_with(store, pool);

        let resolved = resolver
            .resolve(&project, Provider::OpenRouter, "mistralai/mistral-7b-instruct:free")
            .await
            .unwrap();
        assert_eq!(resolved.source, CredentialSource::Pool);
        assert!(resolved.free_model);
        assert_eq!(resolved.secret.expose_secret(), "pool-openrouter-key");
    }

    #[tokio::test]
    async fn test_undecryptable_record_falls_through() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = Project::new("p1");
        store.add_project("key-1", project.clone());

        // Encrypted under a different master key, so decryption fails and
        // the free model falls back to the pool.
        let other = CredentialCipher::from_passphrase("other-passphrase");
        let (ciphertext, iv) = other.encrypt("sk-unreachable").unwrap();
        store.add_credential(
            "p1",
            ProviderCredential {
                provider: Provider::Groq,
                priority: 1,
                ciphertext,
                iv,
                active: true,
                last_used_at: None,
            },
        );

        let pool = PoolKeys { groq: Some("pool-groq-key".to_string()), ..Default::default() };
        let resolver = resolver_with(store, pool);

        let resolved = resolver
            .resolve(&project, Provider::Groq, "llama-3.1-8b-instant")
            .await
            .unwrap();
        assert_eq!(resolved.source, CredentialSource::Pool);
    }

    #[tokio::test]
    async fn test_store_credential_round_trips_through_rotation() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = Project::new("p1");
        store.add_project("key-1", project.clone());

        let resolver = resolver_with(store.clone(), PoolKeys::default());
        resolver
            .store_credential("p1", Provider::Anthropic, "sk-ant-rotated")
            .await
            .unwrap();

        let resolved = resolver
            .resolve(&project, Provider::Anthropic, "claude-3-opus-20240229")
            .await
            .unwrap();
        assert_eq!(resolved.secret.expose_secret(), "sk-ant-rotated");
        assert_eq!(resolved.priority, Some(1));
    }
}
