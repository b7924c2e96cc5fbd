use std::{fmt, str::FromStr};

use crate::error::MdlError;

/// Transfer protocols a candidate URL can be retrieved through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http,
    Ftp,
    /// Object storage (Amazon S3).
    S3,
    /// Cloud blob storage (Google Cloud Storage).
    Gs,
    /// High-speed transfer (Aspera FASP).
    Fasp,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Http,
        Protocol::Ftp,
        Protocol::S3,
        Protocol::Gs,
        Protocol::Fasp,
    ];

    /// Maps a URL scheme onto a protocol. `https` shares the HTTP adapter.
    pub fn from_scheme(scheme: &str) -> Option<Protocol> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Protocol::Http),
            "ftp" => Some(Protocol::Ftp),
            "s3" => Some(Protocol::S3),
            "gs" => Some(Protocol::Gs),
            "fasp" => Some(Protocol::Fasp),
            _ => None,
        }
    }

    /// Protocol of a raw manifest URL, judged by its scheme prefix.
    pub fn of_url(url: &str) -> Option<Protocol> {
        let (scheme, _) = url.split_once("://")?;
        Protocol::from_scheme(scheme)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Ftp => "FTP",
            Protocol::S3 => "S3",
            Protocol::Gs => "GS",
            Protocol::Fasp => "FASP",
        }
    }

    /// Protocols that need credentials and are never part of an inferred priority list.
    pub fn requires_explicit_selection(&self) -> bool {
        matches!(self, Protocol::Gs | Protocol::Fasp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Protocol {
    type Err = MdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Protocol::ALL
            .into_iter()
            .find(|p| p.tag().eq_ignore_ascii_case(token))
            .ok_or_else(|| MdlError::InvalidPriority {
                token: token.to_string(),
            })
    }
}

/// Ordered protocol preference, highest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriorityList(Vec<Protocol>);

impl PriorityList {
    pub fn new(protocols: Vec<Protocol>) -> Self {
        let mut deduped: Vec<Protocol> = Vec::with_capacity(protocols.len());
        for p in protocols {
            if !deduped.contains(&p) {
                deduped.push(p);
            }
        }
        Self(deduped)
    }

    /// Parses a comma separated list such as `S3,HTTP,FTP`.
    /// An empty string yields an empty list, which means "infer a default".
    pub fn parse(input: &str) -> Result<Self, MdlError> {
        let protocols = input
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Protocol::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(protocols))
    }

    /// Default order inside a recognized cloud compute environment.
    pub fn cloud_default() -> Self {
        Self(vec![Protocol::S3, Protocol::Http, Protocol::Ftp])
    }

    /// Default order everywhere else.
    pub fn standard_default() -> Self {
        Self(vec![Protocol::Http, Protocol::Ftp, Protocol::S3])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.0.contains(&protocol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.0.iter()
    }
}

impl fmt::Display for PriorityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.0.iter().map(Protocol::tag).collect();
        f.write_str(&tags.join(","))
    }
}
