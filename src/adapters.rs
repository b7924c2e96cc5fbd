//! Protocol adapters: one implementation of [`ProtocolAdapter`] per transfer
//! protocol, looked up by [`Protocol`] in an [`AdapterRegistry`].

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};

use crate::{error::AdapterError, protocol::Protocol};

pub mod fasp;
pub mod ftp;
pub mod gcs;
pub mod http;
pub mod s3;

pub use fasp::{AscpClient, FaspAdapter, FaspClient};
pub use ftp::FtpAdapter;
pub use gcs::{BlobDownloader, GcsAdapter, GcsJsonApi};
pub use http::HttpAdapter;
pub use s3::S3Adapter;

/// How an adapter moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Byte-range capable stream, can resume from an offset.
    Ranged,
    /// The whole file is written to a local path in one go. No resume.
    WholeFile,
}

/// Uniform capability set of a transfer protocol.
///
/// Ranged adapters implement [`resolve_size`](Self::resolve_size) and
/// [`open`](Self::open); whole-file adapters implement
/// [`transfer`](Self::transfer).
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Ranged
    }

    /// Total size of the remote resource in bytes.
    async fn resolve_size(&self, url: &Url) -> Result<u64, AdapterError> {
        Err(AdapterError::SizeUnavailable {
            url: url.to_string(),
        })
    }

    /// Opens a stream of the resource starting at `resume_offset`.
    async fn open(&self, _url: &Url, _resume_offset: u64) -> Result<ChunkStream, AdapterError> {
        Err(AdapterError::Unsupported {
            protocol: self.protocol(),
            operation: "ranged streaming",
        })
    }

    /// Retrieves the whole resource into `local_path`, replacing its content.
    async fn transfer(&self, _url: &Url, _local_path: &Path) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            protocol: self.protocol(),
            operation: "whole-file transfer",
        })
    }

    /// Releases shared resources held by the adapter. Called once at batch end.
    async fn close(&self) {}
}

/// Handle of an open remote stream. [`read_chunk`](Self::read_chunk) regroups
/// whatever the transport delivers into chunks of the requested size.
pub struct ChunkStream {
    url: String,
    starts_at: u64,
    inner: BoxStream<'static, Result<Bytes, AdapterError>>,
    pending: BytesMut,
    exhausted: bool,
    read_timeout: Option<Duration>,
}

impl ChunkStream {
    pub fn new<S, E>(url: &Url, starts_at: u64, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<AdapterError>,
    {
        Self {
            url: url.to_string(),
            starts_at,
            inner: stream.map_err(|e| -> AdapterError { e.into() }).boxed(),
            pending: BytesMut::new(),
            exhausted: false,
            read_timeout: None,
        }
    }

    /// Fails a read with [`AdapterError::Stalled`] when the transport delivers
    /// nothing for `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Offset of the first byte this stream yields. May be lower than the
    /// requested resume offset when the remote ignored the range.
    pub fn starts_at(&self) -> u64 {
        self.starts_at
    }

    async fn next_piece(&mut self) -> Result<Option<Bytes>, AdapterError> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.inner.next()).await {
                Ok(piece) => piece.transpose(),
                Err(_) => Err(AdapterError::Stalled {
                    url: self.url.clone(),
                }),
            },
            None => self.inner.next().await.transpose(),
        }
    }

    /// Up to `max_bytes` bytes, or `None` at end of stream. Every chunk but
    /// the last is exactly `max_bytes` long.
    pub async fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>, AdapterError> {
        let max_bytes = max_bytes.max(1);
        while self.pending.len() < max_bytes && !self.exhausted {
            match self.next_piece().await? {
                Some(piece) => self.pending.extend_from_slice(&piece),
                None => self.exhausted = true,
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = max_bytes.min(self.pending.len());
        Ok(Some(self.pending.split_to(take).freeze()))
    }
}

/// Lookup table from protocol to its adapter.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Protocol, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under its own protocol, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) -> &mut Self {
        self.adapters.insert(adapter.protocol(), adapter);
        self
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn ProtocolAdapter>> {
        self.adapters.get(&protocol)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.adapters.keys().copied().collect();
        protocols.sort();
        protocols
    }

    /// Closes every adapter, releasing cached connections.
    pub async fn close(&self) {
        for adapter in self.adapters.values() {
            adapter.close().await;
        }
    }
}

/// Settings shared by the reqwest based adapters.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Transient-error retries of a single request.
    pub max_request_retries: u32,
    pub user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            max_request_retries: 3,
            user_agent: format!("mdl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientSettings {
    pub fn build_client(&self) -> Result<ClientWithMiddleware, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .build()?;
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), Duration::from_secs(8))
            .build_with_max_retries(self.max_request_retries);
        Ok(ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build())
    }
}
