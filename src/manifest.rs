use std::{collections::HashMap, fmt, path::Path};

use reqwest::Url;

use crate::error::MdlError;

/// One row of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: String,
    /// Hex digest, in the algorithm the batch is configured with.
    pub expected_checksum: String,
    /// Candidate locations of the same file. May be empty for private data.
    pub candidate_urls: Vec<String>,
}

impl ManifestEntry {
    pub fn new(id: impl Into<String>, expected_checksum: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expected_checksum: expected_checksum.into(),
            candidate_urls: Vec::new(),
        }
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidate_urls = urls.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-entry result of one batch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    /// The file is present at its final path and verified, or already was.
    Success,
    /// No candidate URL survived prioritization.
    NoCandidateUrl,
    /// Every candidate failed.
    AllEndpointsUnreachable,
    /// Transfer completed but the digest disagreed. The partial file is kept.
    ChecksumMismatch,
    /// The batch was cancelled while this entry was in flight.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Outcome::Success => "downloaded and verified",
            Outcome::NoCandidateUrl => "no valid URL in the manifest",
            Outcome::AllEndpointsUnreachable => {
                "URL is present in the manifest, but not accessible at the location specified"
            }
            Outcome::ChecksumMismatch => {
                "checksum failed (file is corrupted or the wrong checksum is associated)"
            }
            Outcome::Cancelled => "cancelled before completion",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "Success",
            Outcome::NoCandidateUrl => "NoCandidateUrl",
            Outcome::AllEndpointsUnreachable => "AllEndpointsUnreachable",
            Outcome::ChecksumMismatch => "ChecksumMismatch",
            Outcome::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Reads tab separated manifests as exported by data portals:
/// a header row, then `id`, `md5`, `size`, `urls`, ... columns where `urls`
/// is a comma separated list.
pub struct TsvManifest;

impl TsvManifest {
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<ManifestEntry>, MdlError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    pub async fn from_url(url: Url) -> Result<Vec<ManifestEntry>, MdlError> {
        let text = reqwest::get(url).await?.error_for_status()?.text().await?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Vec<ManifestEntry>, MdlError> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Ok(Vec::new());
        };
        let columns: HashMap<String, usize> = header
            .split('\t')
            .enumerate()
            .map(|(i, name)| (name.trim().to_ascii_lowercase(), i))
            .collect();
        let column = |names: &[&str], fallback: usize| {
            names
                .iter()
                .find_map(|n| columns.get(*n).copied())
                .unwrap_or(fallback)
        };
        let id_col = column(&["file_id", "id"], 0);
        let md5_col = column(&["md5", "checksum"], 1);
        let urls_col = column(&["urls", "url"], 3);

        let mut entries = Vec::new();
        for (index, line) in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            let id = fields
                .get(id_col)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| MdlError::InvalidManifest {
                    line: index + 1,
                    message: "missing file id".to_string(),
                })?;
            let checksum = fields.get(md5_col).map(|s| s.trim()).unwrap_or_default();
            let urls = fields
                .get(urls_col)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            entries.push(ManifestEntry::new(id, checksum).with_urls(urls));
        }
        Ok(entries)
    }
}
