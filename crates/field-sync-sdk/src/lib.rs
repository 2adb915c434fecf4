//! Client side of the collaborative field lock protocol.
//!
//! [`FieldSyncClient`] wraps the four HTTP calls; [`SessionSync`] drives the
//! per-field edit state machines and the shared background poller on top of
//! any [`FieldSyncApi`] implementation.

use async_trait::async_trait;
use field_sync_proto::{FieldAck, FieldUpdates, LockRequest, UpdateRequest};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod agent;
pub mod poller;

pub use agent::{FieldPhase, FieldView, SessionSync, SyncError};
pub use poller::{Backoff, PollerConfig, PollerHandle};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// The four calls of the field lock protocol.
#[async_trait]
pub trait FieldSyncApi: Send + Sync {
    async fn lock(&self, req: &LockRequest) -> Result<FieldAck, ClientError>;
    async fn unlock(&self, req: &LockRequest) -> Result<FieldAck, ClientError>;
    async fn update(&self, req: &UpdateRequest) -> Result<FieldAck, ClientError>;
    async fn updates(&self, session_code: &str, since: u64) -> Result<FieldUpdates, ClientError>;
}

#[derive(Clone)]
pub struct FieldSyncClient {
    http: Client,
    base_url: String,
}

impl FieldSyncClient {
    /// `base_url` is the prefix the `/fields/...` routes hang off, e.g.
    /// `http://localhost:8090` or `https://host/api`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session codes are user supplied, so they go in as one encoded segment.
    fn updates_url(&self, session_code: &str) -> Result<Url, ClientError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["fields", session_code, "updates"]);
        Ok(url)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let res = self.http.post(url).json(body).send().await?;
        read_json(res).await
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, ClientError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(ClientError::UnexpectedStatus { status, body })
    }
}

#[async_trait]
impl FieldSyncApi for FieldSyncClient {
    async fn lock(&self, req: &LockRequest) -> Result<FieldAck, ClientError> {
        self.post_json("/fields/lock", req).await
    }

    async fn unlock(&self, req: &LockRequest) -> Result<FieldAck, ClientError> {
        self.post_json("/fields/unlock", req).await
    }

    async fn update(&self, req: &UpdateRequest) -> Result<FieldAck, ClientError> {
        self.post_json("/fields/update", req).await
    }

    async fn updates(&self, session_code: &str, since: u64) -> Result<FieldUpdates, ClientError> {
        let url = self.updates_url(session_code)?;
        let res = self
            .http
            .get(url)
            .query(&[("since", since)])
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        read_json(res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = FieldSyncClient::new("http://localhost:8090/api/");
        assert_eq!(client.base_url(), "http://localhost:8090/api");
    }

    #[test]
    fn session_code_is_one_path_segment() {
        let client = FieldSyncClient::new("http://localhost:8090/api");
        let url = client.updates_url("a/b?c#d").unwrap();
        assert_eq!(url.path(), "/api/fields/a%2Fb%3Fc%23d/updates");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        let root = FieldSyncClient::new("http://localhost:8090/");
        assert_eq!(
            root.updates_url("ABC123").unwrap().as_str(),
            "http://localhost:8090/fields/ABC123/updates"
        );
    }

    #[test]
    fn unparsable_base_is_reported() {
        let client = FieldSyncClient::new("not a url");
        assert!(matches!(
            client.updates_url("ABC123"),
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
