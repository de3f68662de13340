//! Object store client over HTTP.
//!
//! Paths follow the usual API server layout:
//! `/apis/<group>/<version>/namespaces/<ns>/<plural>/<name>`, or `/api/<version>/...`
//! for the core group.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use vmfleet_api::Resource;
use vmfleet_reconcile::{DeleteOptions, Patch, ResourceClient, StoreError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ObjectList<K> {
    #[serde(default = "Vec::new")]
    items: Vec<K>,
}

/// Error body returned by the store.
#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// [`ResourceClient`] for kind `K` backed by `reqwest`.
pub struct HttpClient<K> {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for HttpClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> HttpClient<K> {
    /// Client for `base_url` with its own reqwest client.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, base_url, token))
    }

    /// Share one connection pool between kinds.
    pub fn with_client(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            _kind: PhantomData,
        }
    }

    fn group_path(&self) -> String {
        if K::API_VERSION.contains('/') {
            format!("{}/apis/{}", self.base_url, K::API_VERSION)
        } else {
            format!("{}/api/{}", self.base_url, K::API_VERSION)
        }
    }

    fn collection_url(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => {
                format!("{}/namespaces/{}/{}", self.group_path(), ns, K::PLURAL)
            }
            _ => format!("{}/{}", self.group_path(), K::PLURAL),
        }
    }

    fn object_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_url(Some(namespace)), name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, name: &str) -> Result<Response, StoreError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(kind = K::KIND, name, status = %status, "Store request failed");
        Err(map_status::<K>(status, name, &body))
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, StoreError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn map_status<K: Resource>(status: StatusCode, name: &str, body: &str) -> StoreError {
    let parsed: Status = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        body.to_string()
    } else {
        parsed.message
    };

    match status {
        StatusCode::NOT_FOUND => StoreError::not_found(K::KIND, name),
        StatusCode::CONFLICT if parsed.reason == "AlreadyExists" => StoreError::AlreadyExists {
            kind: K::KIND.to_string(),
            name: name.to_string(),
        },
        StatusCode::CONFLICT => StoreError::Conflict(message),
        StatusCode::UNPROCESSABLE_ENTITY => StoreError::Invalid(message),
        _ => StoreError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl<K: Resource> ResourceClient<K> for HttpClient<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let request = self.client.get(self.object_url(namespace, name));
        Self::decode(self.send(request, name).await?).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let request = self.client.get(self.collection_url(namespace));
        let list: ObjectList<K> = Self::decode(self.send(request, "").await?).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.meta();
        let name = if meta.name.is_empty() {
            &meta.generate_name
        } else {
            &meta.name
        };
        let request = self
            .client
            .post(self.collection_url(Some(&meta.namespace)))
            .json(obj);
        Self::decode(self.send(request, name).await?).await
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.meta();
        let request = self
            .client
            .put(self.object_url(&meta.namespace, &meta.name))
            .json(obj);
        Self::decode(self.send(request, &meta.name).await?).await
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.meta();
        let url = format!("{}/status", self.object_url(&meta.namespace, &meta.name));
        let request = self.client.put(url).json(obj);
        Self::decode(self.send(request, &meta.name).await?).await
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Patch) -> Result<K, StoreError> {
        let request = self
            .client
            .patch(self.object_url(namespace, name))
            .header(CONTENT_TYPE, patch.content_type())
            .body(patch.to_body()?);
        Self::decode(self.send(request, name).await?).await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), StoreError> {
        let request = self
            .client
            .delete(self.object_url(namespace, name))
            .json(options);
        self.send(request, name).await?;
        Ok(())
    }
}
