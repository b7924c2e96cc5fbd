use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use std::sync::Arc;

use super::{
    ChunkStream, ClientSettings, ProtocolAdapter,
    http::{head_size, ranged_get},
};
use crate::{
    connection_cache::{ConnectionCache, PooledConnection},
    error::AdapterError,
    protocol::Protocol,
};

/// Anonymous S3 access over HTTPS.
///
/// `s3://bucket/key` is fetched from `https://bucket.s3.amazonaws.com/key`, or
/// from `<endpoint>/bucket/key` when a path-style endpoint is configured.
pub struct S3Adapter {
    settings: ClientSettings,
    endpoint: Option<Url>,
    buckets: ConnectionCache<BucketClient>,
}

/// Client bound to one bucket.
pub struct BucketClient {
    client: ClientWithMiddleware,
    base: Url,
}

#[async_trait]
impl PooledConnection for BucketClient {
    async fn close(self: Arc<Self>) {
        tracing::debug!("Releasing S3 client for {}", self.base);
    }
}

impl BucketClient {
    fn object_url(&self, key_segments: &[String]) -> Result<Url, AdapterError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::unreachable(&self.base, "base url cannot hold a path"))?
            .pop_if_empty()
            .extend(key_segments);
        Ok(url)
    }
}

impl S3Adapter {
    pub fn new(settings: ClientSettings, endpoint: Option<Url>) -> Self {
        Self {
            settings,
            endpoint,
            buckets: ConnectionCache::new(),
        }
    }

    fn bucket_base(&self, bucket: &str) -> Result<Url, AdapterError> {
        match &self.endpoint {
            Some(endpoint) => {
                let mut base = endpoint.clone();
                base.path_segments_mut()
                    .map_err(|_| AdapterError::unreachable(endpoint, "endpoint cannot hold a path"))?
                    .pop_if_empty()
                    .push(bucket)
                    .push("");
                Ok(base)
            }
            None => Url::parse(&format!("https://{}.s3.amazonaws.com/", bucket))
                .map_err(|e| AdapterError::unreachable(bucket, e)),
        }
    }

    /// Resolves an `s3://` URL to its bucket client and the HTTPS URL of the object.
    async fn locate(&self, url: &Url) -> Result<(Arc<BucketClient>, Url), AdapterError> {
        let bucket = url
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| AdapterError::unreachable(url, "missing bucket"))?;
        let key: Vec<String> = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        if key.is_empty() {
            return Err(AdapterError::unreachable(url, "missing object key"));
        }

        let bucket_client = self
            .buckets
            .get_or_connect(bucket, || async {
                let client = self.settings.build_client()?;
                let base = self.bucket_base(bucket)?;
                Ok::<_, AdapterError>(BucketClient { client, base })
            })
            .await?;
        let object = bucket_client.object_url(&key)?;
        Ok((bucket_client, object))
    }
}

#[async_trait]
impl ProtocolAdapter for S3Adapter {
    fn protocol(&self) -> Protocol {
        Protocol::S3
    }

    async fn resolve_size(&self, url: &Url) -> Result<u64, AdapterError> {
        let (bucket, object) = self.locate(url).await?;
        head_size(&bucket.client, &object).await
    }

    async fn open(&self, url: &Url, resume_offset: u64) -> Result<ChunkStream, AdapterError> {
        let (bucket, object) = self.locate(url).await?;
        ranged_get(&bucket.client, &object, resume_offset, &self.settings).await
    }

    async fn close(&self) {
        self.buckets.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::test_settings;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_virtual_host_url() -> Result<(), Box<dyn std::error::Error>> {
        let adapter = S3Adapter::new(test_settings(), None);
        let object = adapter
            .locate(&Url::parse("s3://my-bucket/dir/file%20one.bam")?)
            .await?
            .1;
        assert_eq!(
            object.as_str(),
            "https://my-bucket.s3.amazonaws.com/dir/file%20one.bam"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_key_is_error() {
        let adapter = S3Adapter::new(test_settings(), None);
        let result = adapter
            .locate(&Url::parse("s3://my-bucket/").unwrap())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_one_client_per_bucket() -> Result<(), Box<dyn std::error::Error>> {
        let adapter = S3Adapter::new(test_settings(), None);
        for url in ["s3://a/x", "s3://a/y", "s3://b/x"] {
            adapter.locate(&Url::parse(url)?).await?;
        }
        assert_eq!(adapter.buckets.len().await, 2);
        adapter.close().await;
        assert!(adapter.buckets.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_path_style_size_and_resume() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let head = server
            .mock("HEAD", "/bucket/dir/file.bin")
            .with_status(200)
            .with_header("content-length", "10")
            .create_async()
            .await;
        let get = server
            .mock("GET", "/bucket/dir/file.bin")
            .match_header("range", Matcher::Exact("bytes=6-".to_string()))
            .with_status(206)
            .with_header("content-range", "bytes 6-9/10")
            .with_body("6789")
            .create_async()
            .await;

        let adapter = S3Adapter::new(test_settings(), Some(Url::parse(&server.url())?));
        let url = Url::parse("s3://bucket/dir/file.bin")?;
        assert_eq!(adapter.resolve_size(&url).await?, 10);

        let mut stream = adapter.open(&url, 6).await?;
        assert_eq!(stream.starts_at(), 6);
        assert_eq!(stream.read_chunk(100).await?.unwrap(), "6789");

        head.assert_async().await;
        get.assert_async().await;
        Ok(())
    }
}
