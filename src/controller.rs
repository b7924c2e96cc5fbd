use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use derive_builder::Builder;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::{
    adapters::{AdapterRegistry, ProtocolAdapter, TransferMode},
    checksum::ChecksumValidator,
    error::AdapterError,
    fs_utils::{atomic_replace, existing_len, file_name_from_url, partial_path_for, remove_if_exists},
    manifest::{ManifestEntry, Outcome},
    prioritizer::Candidate,
    progress::{ProgressEvent, ProgressReporter, SilentReporter},
};

/// Bytes requested from a stream per read when nothing else is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 100_000;

/// How a single candidate attempt ended, short of an adapter error.
enum Attempt {
    /// The partial file holds the complete resource.
    Complete,
    Cancelled,
}

/// Downloads one manifest entry against its ordered candidates, resuming
/// from a partial file where the protocol allows it.
#[derive(Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct TransferController {
    registry: Arc<AdapterRegistry>,
    /// Directory receiving final and partial files. Must already exist.
    destination: PathBuf,
    /// Maximum size of each chunk read from a stream and appended to disk.
    #[builder(default = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
    #[builder(default)]
    validator: ChecksumValidator,
    /// When false the partial file is promoted without hashing.
    #[builder(default = true)]
    verify_checksums: bool,
    #[builder(default = Arc::new(SilentReporter))]
    progress: Arc<dyn ProgressReporter>,
    #[builder(default)]
    cancel: CancellationToken,
}

impl TransferControllerBuilder {
    fn validate(&self) -> Result<(), TransferControllerBuilderError> {
        if let Some(block_size) = self.block_size
            && block_size == 0
        {
            return Err(TransferControllerBuilderError::ValidationError(
                "block_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl TransferController {
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Local path an entry is saved to, named after its first candidate.
    pub fn final_path_for(&self, candidates: &[Candidate]) -> Option<PathBuf> {
        candidates
            .first()
            .map(|c| self.destination.join(file_name_from_url(&c.url)))
    }

    /// Runs one entry to a conclusion. Adapter errors are never returned; they
    /// make the controller move on to the next candidate.
    pub async fn fetch(&self, entry: &ManifestEntry, candidates: &[Candidate]) -> Outcome {
        let span = info_span!("entry", id = %entry.id);
        let outcome = self.fetch_inner(entry, candidates).instrument(span).await;
        self.progress.report(ProgressEvent::Finished {
            id: entry.id.clone(),
            outcome,
        });
        outcome
    }

    async fn fetch_inner(&self, entry: &ManifestEntry, candidates: &[Candidate]) -> Outcome {
        let Some(final_path) = self.final_path_for(candidates) else {
            tracing::warn!("No retrievable location for {}", entry.id);
            return Outcome::NoCandidateUrl;
        };

        match tokio::fs::try_exists(&final_path).await {
            Ok(true) => {
                tracing::info!("{} already exists, skipping", final_path.display());
                return Outcome::Success;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Could not check {}: {}", final_path.display(), e),
        }

        let partial_path = partial_path_for(&final_path);
        for candidate in candidates {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let Some(adapter) = self.registry.get(candidate.protocol) else {
                tracing::warn!("No adapter registered for {}, skipping {}", candidate.protocol, candidate.url);
                continue;
            };

            tracing::debug!("Trying {}", candidate.url);
            let attempt = match adapter.transfer_mode() {
                TransferMode::Ranged => {
                    self.stream_candidate(entry, candidate, adapter.as_ref(), &partial_path)
                        .await
                }
                TransferMode::WholeFile => {
                    self.transfer_candidate(entry, candidate, adapter.as_ref(), &partial_path)
                        .await
                }
            };

            match attempt {
                Ok(Attempt::Complete) => {
                    return self.finish(entry, partial_path, final_path).await;
                }
                Ok(Attempt::Cancelled) => {
                    tracing::info!("Cancelled, keeping {}", partial_path.display());
                    return Outcome::Cancelled;
                }
                Err(e) => tracing::warn!("{} failed: {}", candidate.url, e),
            }
        }

        tracing::error!("Every location of {} failed", entry.id);
        Outcome::AllEndpointsUnreachable
    }

    /// Resumable path: size probe, offset recovery from the partial file, then
    /// chunked append until the stream ends.
    async fn stream_candidate(
        &self,
        entry: &ManifestEntry,
        candidate: &Candidate,
        adapter: &dyn ProtocolAdapter,
        partial_path: &Path,
    ) -> Result<Attempt, AdapterError> {
        let url = &candidate.url;
        let remote_size = adapter.resolve_size(url).await?;
        let mut offset = existing_len(partial_path).await?;

        if offset > remote_size {
            tracing::debug!(
                "Partial file is {} bytes but remote has {}, restarting",
                offset,
                remote_size
            );
            remove_if_exists(partial_path).await?;
            offset = 0;
        }

        if offset == remote_size {
            // nothing left to fetch; make sure an empty resource still leaves a file
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(partial_path)
                .await?;
            tracing::debug!("Partial file already holds all {} bytes", remote_size);
            return Ok(Attempt::Complete);
        }

        let mut stream = adapter.open(url, offset).await?;
        if stream.starts_at() != offset {
            if stream.starts_at() != 0 {
                return Err(AdapterError::unreachable(
                    url,
                    format!("asked for offset {} but got {}", offset, stream.starts_at()),
                ));
            }
            tracing::debug!("{} cannot resume, restarting from zero", url);
            offset = 0;
        }

        let file = if offset == 0 {
            tokio::fs::File::create(partial_path).await?
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial_path)
                .await?
        };
        let mut writer = BufWriter::new(file);

        self.progress.report(ProgressEvent::Started {
            id: entry.id.clone(),
            url: url.to_string(),
            protocol: candidate.protocol,
            offset,
            remote_size: Some(remote_size),
        });
        tracing::info!("Downloading {} from offset {}", url, offset);

        let mut bytes_written = offset;
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                read = stream.read_chunk(self.block_size) => Some(read),
            };
            let chunk = match read {
                None => {
                    writer.flush().await?;
                    return Ok(Attempt::Cancelled);
                }
                Some(Err(e)) => {
                    // keep what arrived for the next resume
                    writer.flush().await?;
                    return Err(e);
                }
                Some(Ok(None)) => break,
                Some(Ok(Some(chunk))) => chunk,
            };

            writer.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
            self.progress.report(ProgressEvent::Advanced {
                id: entry.id.clone(),
                bytes_written,
                remote_size: Some(remote_size),
            });
        }
        writer.flush().await?;

        if bytes_written != remote_size {
            return Err(AdapterError::unreachable(
                url,
                format!(
                    "stream ended after {} of {} bytes",
                    bytes_written, remote_size
                ),
            ));
        }
        Ok(Attempt::Complete)
    }

    /// Whole-file path: any partial file is discarded and the adapter writes
    /// the resource from scratch.
    async fn transfer_candidate(
        &self,
        entry: &ManifestEntry,
        candidate: &Candidate,
        adapter: &dyn ProtocolAdapter,
        partial_path: &Path,
    ) -> Result<Attempt, AdapterError> {
        remove_if_exists(partial_path).await?;
        self.progress.report(ProgressEvent::Started {
            id: entry.id.clone(),
            url: candidate.url.to_string(),
            protocol: candidate.protocol,
            offset: 0,
            remote_size: None,
        });
        tracing::info!("Transferring {} as a whole", candidate.url);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(Attempt::Cancelled),
            transferred = adapter.transfer(&candidate.url, partial_path) => {
                transferred?;
                let bytes_written = existing_len(partial_path).await?;
                self.progress.report(ProgressEvent::Advanced {
                    id: entry.id.clone(),
                    bytes_written,
                    remote_size: None,
                });
                Ok(Attempt::Complete)
            }
        }
    }

    /// Verifies the partial file and promotes it. A mismatching file stays on
    /// disk under its partial name.
    async fn finish(&self, entry: &ManifestEntry, partial_path: PathBuf, final_path: PathBuf) -> Outcome {
        if self.verify_checksums {
            match self
                .validator
                .verify(&partial_path, &entry.expected_checksum)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(
                        "{} checksum mismatch, keeping {}",
                        self.validator.algorithm(),
                        partial_path.display()
                    );
                    return Outcome::ChecksumMismatch;
                }
                Err(e) => {
                    tracing::error!("Could not hash {}: {}", partial_path.display(), e);
                    return Outcome::ChecksumMismatch;
                }
            }
        }

        if let Err(e) = atomic_replace(partial_path.clone(), final_path.clone()).await {
            tracing::error!(
                "Could not move {} to {}: {}",
                partial_path.display(),
                final_path.display(),
                e
            );
            return Outcome::AllEndpointsUnreachable;
        }
        tracing::info!("Saved {}", final_path.display());
        Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::test_support::{Call, FakeAdapter},
        hash::HashAlgorithm,
        progress::RecordingReporter,
        protocol::Protocol,
    };
    use reqwest::Url;
    use tempfile::tempdir;

    fn content() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn md5_hex(data: &[u8]) -> String {
        HashAlgorithm::Md5.hex_digest(data).await.unwrap()
    }

    fn candidate(protocol: Protocol, url: &str) -> Candidate {
        Candidate {
            protocol,
            url: Url::parse(url).unwrap(),
        }
    }

    fn controller(
        adapters: Vec<Arc<FakeAdapter>>,
        destination: &Path,
        reporter: Arc<RecordingReporter>,
    ) -> TransferController {
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        TransferControllerBuilder::default()
            .registry(Arc::new(registry))
            .destination(destination.to_path_buf())
            .block_size(400)
            .progress(reporter)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_candidates_touch_no_adapter() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, b"x"));
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());

        let outcome = ctl.fetch(&ManifestEntry::new("a", "abc"), &[]).await;

        assert_eq!(outcome, Outcome::NoCandidateUrl);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_final_file_short_circuits() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("f.bin"), b"done").await?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &content()));
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());

        let outcome = ctl
            .fetch(
                &ManifestEntry::new("a", "whatever"),
                &[candidate(Protocol::Http, "http://host/f.bin")],
            )
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert!(fake.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_chunks_follow_block_size() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        let reporter = Arc::new(RecordingReporter::default());
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &data));
        let ctl = controller(vec![fake], dir.path(), reporter.clone());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(reporter.advances("a"), vec![400, 800, 1000]);
        assert_eq!(tokio::fs::read(dir.path().join("f.bin")).await?, data);
        assert!(!dir.path().join("f.bin.partial").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_resumes_from_partial_offset() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        tokio::fs::write(dir.path().join("f.bin.partial"), &data[..300]).await?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &data));
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert!(
            fake.calls()
                .contains(&Call::Open("http://host/f.bin".to_string(), 300))
        );
        let saved = tokio::fs::read(dir.path().join("f.bin")).await?;
        assert_eq!(saved.len(), 1000);
        assert_eq!(saved, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_partial_is_restarted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        tokio::fs::write(dir.path().join("f.bin.partial"), vec![7u8; 1500]).await?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &data));
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert!(
            fake.calls()
                .contains(&Call::Open("http://host/f.bin".to_string(), 0))
        );
        assert_eq!(tokio::fs::read(dir.path().join("f.bin")).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_partial_goes_straight_to_verify() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        tokio::fs::write(dir.path().join("f.bin.partial"), &data).await?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &data));
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(
            fake.calls(),
            vec![Call::ResolveSize("http://host/f.bin".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_whole_file_adapter_discards_partial() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        tokio::fs::write(dir.path().join("f.bin.partial"), b"stale bytes").await?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Gs, &data).whole_file());
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Gs, "gs://bucket/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(
            fake.calls(),
            vec![Call::Transfer("gs://bucket/f.bin".to_string())]
        );
        assert_eq!(tokio::fs::read(dir.path().join("f.bin")).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_partial() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &content()));
        let ctl = controller(vec![fake], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", "d41d8cd98f00b204e9800998ecf8427e");

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::ChecksumMismatch);
        assert!(!dir.path().join("f.bin").exists());
        assert_eq!(
            tokio::fs::metadata(dir.path().join("f.bin.partial")).await?.len(),
            1000
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_validation_promotes_without_hashing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(FakeAdapter::serving(Protocol::Http, b"payload")));
        let ctl = TransferControllerBuilder::default()
            .registry(Arc::new(registry))
            .destination(dir.path().to_path_buf())
            .verify_checksums(false)
            .build()?;

        let outcome = ctl
            .fetch(
                &ManifestEntry::new("a", "not-a-digest"),
                &[candidate(Protocol::Http, "http://host/f.bin")],
            )
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(tokio::fs::read(dir.path().join("f.bin")).await?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_falls_through_to_next_candidate() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        let s3 = Arc::new(FakeAdapter::failing(Protocol::S3));
        let http = Arc::new(FakeAdapter::serving(Protocol::Http, &data));
        let ctl = controller(vec![s3.clone(), http.clone()], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(
                &entry,
                &[
                    candidate(Protocol::S3, "s3://bucket/f.bin"),
                    candidate(Protocol::Http, "http://host/f.bin"),
                ],
            )
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(s3.calls().len(), 1);
        assert!(!http.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_all_candidates_failing() {
        let dir = tempdir().unwrap();
        let ctl = controller(
            vec![
                Arc::new(FakeAdapter::failing(Protocol::Http)),
                Arc::new(FakeAdapter::failing(Protocol::Ftp)),
            ],
            dir.path(),
            Arc::default(),
        );

        let outcome = ctl
            .fetch(
                &ManifestEntry::new("a", "abc"),
                &[
                    candidate(Protocol::Http, "http://host/f.bin"),
                    candidate(Protocol::Ftp, "ftp://host/f.bin"),
                ],
            )
            .await;

        assert_eq!(outcome, Outcome::AllEndpointsUnreachable);
    }

    #[tokio::test]
    async fn test_short_stream_keeps_partial_for_resume() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        let mut short = FakeAdapter::serving(Protocol::Http, &data);
        short.truncate_at = Some(600);
        let ctl = controller(vec![Arc::new(short)], dir.path(), Arc::default());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::AllEndpointsUnreachable);
        assert_eq!(
            tokio::fs::read(dir.path().join("f.bin.partial")).await?,
            &data[..600]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_before_start() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("f.bin.partial"), b"keep").await?;
        let fake = Arc::new(FakeAdapter::serving(Protocol::Http, &content()));
        let ctl = controller(vec![fake.clone()], dir.path(), Arc::default());
        ctl.cancellation_token().cancel();

        let outcome = ctl
            .fetch(
                &ManifestEntry::new("a", "abc"),
                &[candidate(Protocol::Http, "http://host/f.bin")],
            )
            .await;

        assert_eq!(outcome, Outcome::Cancelled);
        assert!(fake.calls().is_empty());
        assert_eq!(tokio::fs::read(dir.path().join("f.bin.partial")).await?, b"keep");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_between_chunks_keeps_written_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        let reporter = Arc::new(RecordingReporter::default());
        let token = CancellationToken::new();
        let mut fake = FakeAdapter::serving(Protocol::Http, &data);
        fake.cancel_after = Some((400, token.clone()));
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(fake));
        let ctl = TransferControllerBuilder::default()
            .registry(Arc::new(registry))
            .destination(dir.path().to_path_buf())
            .block_size(400)
            .progress(reporter.clone())
            .cancel(token)
            .build()?;
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(reporter.advances("a"), vec![400]);
        assert!(!dir.path().join("f.bin").exists());
        assert_eq!(
            tokio::fs::read(dir.path().join("f.bin.partial")).await?,
            &data[..400]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_ignored_range_truncates_partial() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let data = content();
        tokio::fs::write(dir.path().join("f.bin.partial"), vec![9u8; 300]).await?;
        let mut fake = FakeAdapter::serving(Protocol::Http, &data);
        fake.ignore_range = true;
        let fake = Arc::new(fake);
        let reporter = Arc::new(RecordingReporter::default());
        let ctl = controller(vec![fake.clone()], dir.path(), reporter.clone());
        let entry = ManifestEntry::new("a", md5_hex(&data).await);

        let outcome = ctl
            .fetch(&entry, &[candidate(Protocol::Http, "http://host/f.bin")])
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert!(
            fake.calls()
                .contains(&Call::Open("http://host/f.bin".to_string(), 300))
        );
        assert_eq!(reporter.advances("a"), vec![400, 800, 1000]);
        assert_eq!(tokio::fs::read(dir.path().join("f.bin")).await?, data);
        Ok(())
    }

    #[test]
    fn test_zero_block_size_is_rejected() {
        let result = TransferControllerBuilder::default()
            .registry(Arc::new(AdapterRegistry::new()))
            .destination(PathBuf::from("/tmp"))
            .block_size(0)
            .build();
        assert!(result.is_err());
    }
}
