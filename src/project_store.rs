//! Project metadata store client
//!
//! Projects, API keys and encrypted provider credentials live in an external
//! relational store the gateway treats as an opaque key-value service. The
//! trait below is everything the gateway needs from it; `HttpProjectStore`
//! talks to the real service, `MemoryProjectStore` backs single-node and
//! test deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::GatewayError;
use crate::semantic_cache::clamp_threshold;
use crate::upstream::Provider;

/// Project metadata the pipeline needs per request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    /// Semantic cache similarity threshold, clamped to [0.80, 0.99].
    pub cache_threshold: f32,
    /// Cache retention, partitioned by month on the backend.
    pub retention_days: u32,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), cache_threshold: 0.95, retention_days: 30 }
    }
}

/// Encrypted provider credential record. The plaintext secret only ever
/// exists inside the credential resolver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub provider: Provider,
    /// 1 is tried first; rotation inserts at 1 and shifts the rest down.
    pub priority: u8,
    /// Base64 AES-256-GCM ciphertext.
    pub ciphertext: String,
    /// Base64 per-record nonce.
    pub iv: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Map an API key to its project or fail with `Unauthorized`.
    async fn authenticate(&self, api_key: &str) -> Result<Project, GatewayError>;

    async fn get_project(&self, project_id: &str) -> anyhow::Result<Option<Project>>;

    /// Active credentials for one provider, best priority first.
    async fn credentials(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Vec<ProviderCredential>>;

    /// Record credential use. Called from a background task, never on the
    /// request path.
    async fn touch_credential(
        &self,
        project_id: &str,
        provider: Provider,
        priority: u8,
    ) -> anyhow::Result<()>;

    async fn set_cache_threshold(&self, project_id: &str, threshold: f32) -> anyhow::Result<()>;

    /// Insert a credential at priority 1, pushing existing ones down.
    async fn rotate_credential(
        &self,
        project_id: &str,
        credential: ProviderCredential,
    ) -> anyhow::Result<()>;

    /// Soft-delete one credential.
    async fn remove_credential(
        &self,
        project_id: &str,
        provider: Provider,
        priority: u8,
    ) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Lock-free in-process store for single-node and test deployments.
#[derive(Default)]
pub struct MemoryProjectStore {
    api_keys: DashMap<String, String>,
    projects: DashMap<String, Project>,
    credentials: DashMap<String, Vec<ProviderCredential>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, api_key: impl Into<String>, project: Project) {
        self.api_keys.insert(api_key.into(), project.id.clone());
        self.projects.insert(project.id.clone(), project);
    }

    pub fn add_credential(&self, project_id: &str, credential: ProviderCredential) {
        self.credentials
            .entry(project_id.to_string())
            .or_default()
            .push(credential);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn authenticate(&self, api_key: &str) -> Result<Project, GatewayError> {
        let project_id = self
            .api_keys
            .get(api_key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::Unauthorized("invalid API key".to_string()))?;
        self.projects
            .get(&project_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::Unauthorized("unknown project".to_string()))
    }

    async fn get_project(&self, project_id: &str) -> anyhow::Result<Option<Project>> {
        Ok(self.projects.get(project_id).map(|entry| entry.value().clone()))
    }

    async fn credentials(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Vec<ProviderCredential>> {
        let mut list: Vec<ProviderCredential> = self
            .credentials
            .get(project_id)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|c| c.provider == provider && c.active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by_key(|c| c.priority);
        Ok(list)
    }

    async fn touch_credential(
        &self,
        project_id: &str,
        provider: Provider,
        priority: u8,
    ) -> anyhow::Result<()> {
        if let Some(mut entry) = self.credentials.get_mut(project_id) {
            if let Some(credential) = entry
                .value_mut()
                .iter_mut()
                .find(|c| c.provider == provider && c.priority == priority)
            {
                credential.last_used_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_cache_threshold(&self, project_id: &str, threshold: f32) -> anyhow::Result<()> {
        if let Some(mut project) = self.projects.get_mut(project_id) {
            project.cache_threshold = clamp_threshold(threshold);
        }
        Ok(())
    }

    async fn rotate_credential(
        &self,
        project_id: &str,
        mut credential: ProviderCredential,
    ) -> anyhow::Result<()> {
        credential.priority = 1;
        let provider = credential.provider;
        let mut entry = self.credentials.entry(project_id.to_string()).or_default();
        for existing in entry.value_mut().iter_mut() {
            if existing.provider == provider {
                existing.priority = existing.priority.saturating_add(1);
            }
        }
        entry.value_mut().push(credential);
        debug!(project_id, provider = %provider, "credential rotated in at priority 1");
        Ok(())
    }

    async fn remove_credential(
        &self,
        project_id: &str,
        provider: Provider,
        priority: u8,
    ) -> anyhow::Result<()> {
        if let Some(mut entry) = self.credentials.get_mut(project_id) {
            for credential in entry.value_mut().iter_mut() {
                if credential.provider == provider && credential.priority == priority {
                    credential.active = false;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP store
// ---------------------------------------------------------------------------

/// Client for the external project store service.
pub struct HttpProjectStore {
    client: reqwest::Client,
    base_url: Url,
    service_key: Option<String>,
}

impl HttpProjectStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        service_key: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self { client, base_url: Url::parse(base_url)?, service_key })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let url = self.base_url.join(path)?;
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.service_key {
            builder = builder.bearer_auth(key);
        }
        Ok(builder)
    }
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn authenticate(&self, api_key: &str) -> Result<Project, GatewayError> {
        let response = self
            .request(reqwest::Method::POST, "auth")
            .map_err(GatewayError::internal)?
            .json(&serde_json::json!({ "api_key": api_key }))
            .send()
            .await
            .map_err(GatewayError::internal)?;

        match response.status() {
            status if status.is_success() => {
                response.json().await.map_err(GatewayError::internal)
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::NOT_FOUND => {
                Err(GatewayError::Unauthorized("invalid API key".to_string()))
            }
            status => Err(GatewayError::internal(format!(
                "project store returned {status}"
            ))),
        }
    }

    async fn get_project(&self, project_id: &str) -> anyhow::Result<Option<Project>> {
        let response = self
            .request(reqwest::Method::GET, &format!("projects/{project_id}"))?
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("project store returned {}", status);
        }
        Ok(Some(response.json().await?))
    }

    async fn credentials(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Vec<ProviderCredential>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("projects/{project_id}/credentials/{provider}"),
            )?
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("project store returned {}", status);
        }
        Ok(response.json().await?)
    }

    async fn touch_credential(
        &self,
        project_id: &str,
        provider: Provider,
        priority: u8,
    ) -> anyhow::Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("projects/{project_id}/credentials/{provider}/{priority}/touch"),
        )?
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn set_cache_threshold(&self, project_id: &str, threshold: f32) -> anyhow::Result<()> {
        self.request(reqwest::Method::PATCH, &format!("projects/{project_id}"))?
            .json(&serde_json::json!({ "cache_threshold": clamp_threshold(threshold) }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn rotate_credential(
        &self,
        project_id: &str,
        credential: ProviderCredential,
    ) -> anyhow::Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("projects/{project_id}/credentials/rotate"),
        )?
        .json(&credential)
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn remove_credential(
        &self,
        project_id: &str,
        provider: Provider,
        priority: u8,
    ) -> anyhow::Result<()> {
        self.request(
            reqwest::Method::DELETE,
            &format!("projects/{project_id}/credentials/{provider}/{priority}"),
        )?
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }
}
