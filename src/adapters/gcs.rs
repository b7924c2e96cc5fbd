use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use secrecy::ExposeSecret;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{ClientSettings, ProtocolAdapter, TransferMode};
use crate::{credentials::CredentialProvider, error::AdapterError, protocol::Protocol};

pub const GCS_DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Characters left alone when an object name is placed in a single path segment.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Fetches a whole blob to a local file.
#[async_trait]
pub trait BlobDownloader: Send + Sync {
    async fn download(&self, bucket: &str, object: &str, local_path: &Path) -> Result<(), AdapterError>;
}

/// Google Cloud Storage JSON API media download.
pub struct GcsJsonApi {
    client: ClientWithMiddleware,
    endpoint: Url,
    credentials: Arc<dyn CredentialProvider>,
    read_timeout: Duration,
}

impl GcsJsonApi {
    pub fn new(
        settings: &ClientSettings,
        endpoint: Url,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: settings.build_client()?,
            endpoint,
            credentials,
            read_timeout: settings.read_timeout,
        })
    }

    fn media_url(&self, bucket: &str, object: &str) -> Result<Url, AdapterError> {
        let raw = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint.as_str().trim_end_matches('/'),
            utf8_percent_encode(bucket, OBJECT_NAME),
            utf8_percent_encode(object, OBJECT_NAME),
        );
        Url::parse(&raw).map_err(|e| AdapterError::unreachable(&raw, e))
    }
}

#[async_trait]
impl BlobDownloader for GcsJsonApi {
    async fn download(&self, bucket: &str, object: &str, local_path: &Path) -> Result<(), AdapterError> {
        let url = self.media_url(bucket, object)?;
        let token = self
            .credentials
            .gs_access_token()
            .await
            .map_err(|e| AdapterError::unreachable(&url, e))?;

        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(token.expose_secret())
            .send()
            .await?
            .error_for_status()?;

        let file = tokio::fs::File::create(local_path).await?;
        let mut writer = BufWriter::new(file);
        let mut body = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(self.read_timeout, body.next())
                .await
                .map_err(|_| AdapterError::Stalled {
                    url: url.to_string(),
                })?;
            match next {
                Some(chunk) => writer.write_all(&chunk?).await?,
                None => break,
            }
        }
        writer.flush().await?;
        Ok(())
    }
}

/// `gs://bucket/object` URLs. Blobs are fetched whole, without resume.
pub struct GcsAdapter {
    downloader: Arc<dyn BlobDownloader>,
}

impl GcsAdapter {
    pub fn new(downloader: Arc<dyn BlobDownloader>) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl ProtocolAdapter for GcsAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Gs
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::WholeFile
    }

    async fn transfer(&self, url: &Url, local_path: &Path) -> Result<(), AdapterError> {
        let (bucket, object) = split_blob_url(url)?;
        tracing::debug!("Fetching blob {} from bucket {}", object, bucket);
        self.downloader.download(&bucket, &object, local_path).await
    }
}

/// Bucket and decoded object name of a `gs://` URL.
fn split_blob_url(url: &Url) -> Result<(String, String), AdapterError> {
    let bucket = url
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| AdapterError::unreachable(url, "missing bucket"))?;
    let object = percent_decode_str(url.path().trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned();
    if object.is_empty() {
        return Err(AdapterError::unreachable(url, "missing object name"));
    }
    Ok((bucket.to_string(), object))
}
