//! HTTP client for the collective store

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use super::remote::{PullBatch, PushAck, Registration, RemoteStore};
use crate::error::SyncError;
use crate::store::SyncCursor;
use crate::types::{KnowledgeEntry, ProblemRecord};

/// Identity presented when no API key is configured
pub const ANONYMOUS_INSTANCE: &str = "anonymous";

#[derive(Serialize)]
struct RegisterRequest<'a> {
    instance_id: &'a str,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    entries: &'a [KnowledgeEntry],
}

#[derive(Deserialize)]
struct PushResponse {
    acks: Vec<PushAck>,
}

#[derive(Deserialize)]
struct PostProblemResponse {
    id: String,
}

/// `RemoteStore` over the collective store's REST API
pub struct HttpRemote {
    client: Client,
    base_url: String,
    instance_id: String,
    api_key: RwLock<Option<String>>,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        instance_id: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("collective-memory/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            instance_id: instance_id.into(),
            api_key: RwLock::new(api_key.filter(|k| !k.trim().is_empty())),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    pub fn is_anonymous(&self) -> bool {
        self.api_key.read().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Bearer key when present, otherwise the shared anonymous identity
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key.read().unwrap_or_else(PoisonError::into_inner).as_deref() {
            Some(key) => request
                .header("Authorization", format!("Bearer {}", key))
                .header("X-Instance-Id", &self.instance_id),
            None => request.header("X-Instance-Id", ANONYMOUS_INSTANCE),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self.authorize(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        decode(response).await
    }

    fn classify(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::from_status(status.as_u16(), &body));
    }
    response.json::<T>()
        .await
        .map_err(|e| SyncError::Protocol(format!("invalid response body: {}", e)))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn register_instance(&self, instance_id: &str) -> Result<Registration, SyncError> {
        let request = self.client
            .post(self.url("auth/register"))
            .json(&RegisterRequest { instance_id });
        // Registration is the one call made without credentials
        let response = request.send().await.map_err(|e| self.classify(e))?;
        decode(response).await
    }

    async fn push_entries(&self, entries: &[KnowledgeEntry]) -> Result<Vec<PushAck>, SyncError> {
        debug!("Pushing {} entries to {}", entries.len(), self.base_url);
        let request = self.client
            .post(self.url("knowledge/batch"))
            .json(&PushRequest { entries });
        let response: PushResponse = self.send(request).await?;
        Ok(response.acks)
    }

    async fn pull_entries(&self, since: Option<SyncCursor>, limit: usize) -> Result<PullBatch, SyncError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = since {
            query.push(("cursor", cursor.0));
        }
        let request = self.client.get(self.url("knowledge/changes")).query(&query);
        self.send(request).await
    }

    async fn post_problem(&self, problem: &ProblemRecord) -> Result<String, SyncError> {
        let request = self.client.post(self.url("problems")).json(problem);
        let response: PostProblemResponse = self.send(request).await?;
        Ok(response.id)
    }

    fn set_api_key(&self, api_key: &str) {
        *self.api_key.write().unwrap_or_else(PoisonError::into_inner) = Some(api_key.to_string());
    }
}
