use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use reqwest::Url;

use crate::{
    error::MdlError,
    protocol::{PriorityList, Protocol},
};

const EC2_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/";
const EC2_METADATA_TIMEOUT: Duration = Duration::from_millis(500);

/// A candidate URL that survived prioritization, tagged with the protocol
/// whose adapter will handle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub protocol: Protocol,
    pub url: Url,
}

/// Prefix substitution applied to candidate URLs of one protocol before they
/// are considered, e.g. to move legacy bucket locations to their new home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRewrite {
    pub protocol: Protocol,
    pub from_prefix: String,
    pub to_prefix: String,
}

impl UrlRewrite {
    pub fn new(protocol: Protocol, from_prefix: &str, to_prefix: &str) -> Self {
        Self {
            protocol,
            from_prefix: from_prefix.to_string(),
            to_prefix: to_prefix.to_string(),
        }
    }

    fn apply(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.from_prefix)
            .map(|rest| format!("{}{}", self.to_prefix, rest))
    }
}

impl FromStr for UrlRewrite {
    type Err = MdlError;

    /// Parses `PROTO:FROM=TO`, e.g. `S3:s3://old-bucket/=s3://new-bucket/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MdlError::Config {
            message: format!("Rewrite rule must be in PROTO:FROM=TO format: '{}'", s),
        };
        let (proto, rule) = s.split_once(':').ok_or_else(invalid)?;
        let (from, to) = rule.split_once('=').ok_or_else(invalid)?;
        if from.is_empty() {
            return Err(invalid());
        }
        Ok(UrlRewrite::new(proto.parse()?, from, to))
    }
}

/// Orders candidate URLs by protocol priority.
#[derive(Debug, Clone, Default)]
pub struct EndpointPrioritizer {
    rewrites: Vec<UrlRewrite>,
}

impl EndpointPrioritizer {
    pub fn new(rewrites: Vec<UrlRewrite>) -> Self {
        Self { rewrites }
    }

    fn normalize(&self, protocol: Protocol, url: &str) -> String {
        self.rewrites
            .iter()
            .filter(|r| r.protocol == protocol)
            .find_map(|r| r.apply(url))
            .unwrap_or_else(|| url.to_string())
    }

    /// For each protocol in priority order, appends every candidate of that
    /// protocol in manifest order. Candidates of protocols absent from the
    /// priority list, unknown schemes and unparsable URLs are dropped.
    ///
    /// An empty result means the entry has no retrievable location.
    pub fn select(&self, candidate_urls: &[String], priority: &PriorityList) -> Vec<Candidate> {
        let mut ordered = Vec::new();
        for protocol in priority.iter().copied() {
            for raw in candidate_urls {
                if Protocol::of_url(raw) != Some(protocol) {
                    continue;
                }
                let normalized = self.normalize(protocol, raw);
                match Url::parse(&normalized) {
                    Ok(url) => ordered.push(Candidate { protocol, url }),
                    Err(e) => {
                        tracing::warn!("Skipping invalid URL '{}': {}", normalized, e);
                    }
                }
            }
        }
        ordered
    }
}

/// Detects whether we run inside a cloud compute environment.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn in_cloud(&self) -> bool;
}

/// Probes the EC2 instance metadata service once with a short timeout.
pub struct Ec2MetadataProbe {
    endpoint: Url,
    timeout: Duration,
}

impl Default for Ec2MetadataProbe {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(EC2_METADATA_URL).expect("static metadata url is valid"),
            timeout: EC2_METADATA_TIMEOUT,
        }
    }
}

impl Ec2MetadataProbe {
    pub fn with_endpoint(endpoint: Url, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }
}

#[async_trait]
impl EnvironmentProbe for Ec2MetadataProbe {
    async fn in_cloud(&self) -> bool {
        let client = match reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };
        match client.get(self.endpoint.clone()).send().await {
            Ok(resp) => {
                let found = resp.status().is_success();
                tracing::debug!("Instance metadata probe answered {}", resp.status());
                found
            }
            Err(e) => {
                tracing::debug!("Instance metadata probe failed: {}", e);
                false
            }
        }
    }
}

/// Returns `explicit` unchanged unless it is empty, in which case the default
/// order is inferred from the environment.
pub async fn resolve_priority<P>(explicit: PriorityList, probe: &P) -> PriorityList
where
    P: EnvironmentProbe + ?Sized,
{
    if !explicit.is_empty() {
        return explicit;
    }
    let inferred = if probe.in_cloud().await {
        PriorityList::cloud_default()
    } else {
        PriorityList::standard_default()
    };
    tracing::info!("No endpoint priority given, using {}", inferred);
    inferred
}
