use super::{ByteRange, RemoteBackend, RemoteDirEntry, RemoteRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{instrument, warn};

/// Talks to a Tahoe-LAFS-style WAPI: plain HTTP GET/PUT against capability
/// URIs, with directories represented as a small JSON listing document.
///
/// Grounded in the same shape `tvix-store`'s own clients use `reqwest` for
/// HTTP-based backend calls (object_store, PathInfoService over HTTP).
pub struct HttpRemoteBackend {
    client: Client,
    base_url: String,
}

impl HttpRemoteBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn object_url(&self, r: &RemoteRef) -> String {
        format!("{}/uri/{}", self.base_url, urlencode(r.as_str()))
    }

    fn dir_url(&self, r: &RemoteRef) -> String {
        format!(
            "{}/uri/{}?t=json",
            self.base_url,
            urlencode(r.as_str())
        )
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    #[instrument(skip(self), fields(remote_ref = %r))]
    async fn get_object(&self, r: &RemoteRef, range: Option<ByteRange>) -> Result<Bytes> {
        let mut req = self.client.get(self.object_url(r));
        if let Some(range) = range {
            let end = range.offset + range.length.saturating_sub(1);
            req = req.header("Range", format!("bytes={}-{}", range.offset, end));
        }
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(Error::NotFound),
            status if status.is_success() => Ok(resp.bytes().await?),
            status => {
                warn!(%status, "remote get_object failed");
                Err(Error::BackendUnavailable(format!("status {status}")))
            }
        }
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn put_object(&self, bytes: Bytes) -> Result<RemoteRef> {
        let resp = self
            .client
            .put(format!("{}/uri", self.base_url))
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::BackendUnavailable(format!("status {}", resp.status())));
        }
        let cap = resp.text().await?.trim().to_string();
        Ok(RemoteRef(cap))
    }

    #[instrument(skip(self), fields(remote_ref = %r))]
    async fn get_dir(&self, r: &RemoteRef) -> Result<Vec<RemoteDirEntry>> {
        let resp = self.client.get(self.dir_url(r)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status if status.is_success() => {
                let entries: Vec<RemoteDirEntry> = resp.json().await?;
                Ok(entries)
            }
            status => Err(Error::BackendUnavailable(format!("status {status}"))),
        }
    }

    #[instrument(skip(self, entries), fields(remote_ref = %r, n = entries.len()))]
    async fn put_dir(&self, r: &RemoteRef, entries: Vec<RemoteDirEntry>) -> Result<RemoteRef> {
        let resp = self
            .client
            .post(self.dir_url(r))
            .json(&entries)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::BackendUnavailable(format!("status {}", resp.status())));
        }
        let cap = resp.text().await?.trim().to_string();
        Ok(RemoteRef(cap))
    }

    #[instrument(skip(self), fields(remote_ref = %r))]
    async fn delete(&self, r: &RemoteRef) -> Result<()> {
        let resp = self.client.delete(self.object_url(r)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(Error::BackendUnavailable(format!("status {status}"))),
        }
    }
}
