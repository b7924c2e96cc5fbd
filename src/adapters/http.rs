use async_trait::async_trait;
use reqwest::{Url, header::RANGE};
use reqwest_middleware::ClientWithMiddleware;

use super::{ChunkStream, ClientSettings, ProtocolAdapter};
use crate::{error::AdapterError, protocol::Protocol, response_info::ResponseInfo};

/// Plain HTTP(S) endpoints.
pub struct HttpAdapter {
    client: ClientWithMiddleware,
    settings: ClientSettings,
}

impl HttpAdapter {
    pub fn new(settings: ClientSettings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: settings.build_client()?,
            settings,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn resolve_size(&self, url: &Url) -> Result<u64, AdapterError> {
        head_size(&self.client, url).await
    }

    async fn open(&self, url: &Url, resume_offset: u64) -> Result<ChunkStream, AdapterError> {
        ranged_get(&self.client, url, resume_offset, &self.settings).await
    }
}

/// Size from a HEAD request. Servers that leave the length out of HEAD
/// responses are asked again with a one byte ranged GET.
pub(crate) async fn head_size(client: &ClientWithMiddleware, url: &Url) -> Result<u64, AdapterError> {
    let resp = client.head(url.clone()).send().await?.error_for_status()?;
    let info = ResponseInfo::from(&resp);
    tracing::debug!(
        "HEAD {} -> {}, accepts ranges: {}",
        url,
        info.status(),
        info.accepts_ranges()
    );
    if let Some(size) = info.total_length() {
        return Ok(size);
    }

    let resp = client
        .get(url.clone())
        .header(RANGE, "bytes=0-0")
        .send()
        .await?
        .error_for_status()?;
    let info = ResponseInfo::from(&resp);
    info.total_length().ok_or_else(|| AdapterError::SizeUnavailable {
        url: url.to_string(),
    })
}

/// GET from `offset` to the end. The returned stream reports where its body
/// actually starts, which is zero if the server ignored the range.
pub(crate) async fn ranged_get(
    client: &ClientWithMiddleware,
    url: &Url,
    offset: u64,
    settings: &ClientSettings,
) -> Result<ChunkStream, AdapterError> {
    let mut request = client.get(url.clone());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", offset));
    }
    let resp = request.send().await?.error_for_status()?;
    let info = ResponseInfo::from(&resp);
    let starts_at = info.body_offset();
    if offset > 0 && starts_at != offset {
        tracing::debug!(
            "{} answered range request for offset {} with body starting at {}",
            url,
            offset,
            starts_at
        );
    }
    Ok(ChunkStream::new(url, starts_at, resp.bytes_stream())
        .with_read_timeout(settings.read_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::test_settings;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_resolve_size_from_head() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("HEAD", "/file.bin")
            .with_status(200)
            .with_header("content-length", "1000")
            .with_header("accept-ranges", "bytes")
            .create_async()
            .await;

        let adapter = HttpAdapter::new(test_settings())?;
        let url = Url::parse(&format!("{}/file.bin", server.url()))?;
        assert_eq!(adapter.resolve_size(&url).await?, 1000);
        mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_size_missing_file_is_error() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let adapter = HttpAdapter::new(test_settings())?;
        let url = Url::parse(&format!("{}/missing", server.url()))?;
        let err = adapter.resolve_size(&url).await.unwrap_err();
        assert!(matches!(err, AdapterError::EndpointUnreachable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_open_sends_range_when_resuming() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mock = server
            .mock("GET", "/file.bin")
            .match_header("range", Matcher::Exact("bytes=400-".to_string()))
            .with_status(206)
            .with_header("content-range", "bytes 400-999/1000")
            .with_body(&body[400..])
            .create_async()
            .await;

        let adapter = HttpAdapter::new(test_settings())?;
        let url = Url::parse(&format!("{}/file.bin", server.url()))?;
        let mut stream = adapter.open(&url, 400).await?;
        assert_eq!(stream.starts_at(), 400);

        let mut received = Vec::new();
        while let Some(chunk) = stream.read_chunk(256).await? {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, &body[400..]);
        mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_open_from_zero_sends_no_range() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/file.bin")
            .match_header("range", Matcher::Missing)
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let adapter = HttpAdapter::new(test_settings())?;
        let url = Url::parse(&format!("{}/file.bin", server.url()))?;
        let mut stream = adapter.open(&url, 0).await?;
        assert_eq!(stream.read_chunk(100).await?.unwrap(), "hello");
        mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_ignored_range_starts_at_zero() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(200)
            .with_body("0123456789")
            .create_async()
            .await;

        let adapter = HttpAdapter::new(test_settings())?;
        let url = Url::parse(&format!("{}/file.bin", server.url()))?;
        let stream = adapter.open(&url, 5).await?;
        assert_eq!(stream.starts_at(), 0);
        Ok(())
    }
}
