use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Url;
use tokio::{process::Command, sync::OnceCell};

use super::{ProtocolAdapter, TransferMode};
use crate::{
    credentials::{CredentialProvider, Credentials, FASP_PASSWORD_ENV},
    error::AdapterError,
    protocol::Protocol,
};

pub const ASCP_MIN_VERSION: &str = "3.5";
pub const ASCP_DEFAULT_RATE_LIMIT: &str = "300M";

static ASCP_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^.+version (\d[\d\.]+)").unwrap());
static AUTH_FAILURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)failed to authenticate").unwrap());

/// Runs a high-speed transfer of one remote file to a local path.
#[async_trait]
pub trait FaspClient: Send + Sync {
    async fn transfer(
        &self,
        server: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), AdapterError>;
}

/// Drives the `ascp` executable.
pub struct AscpClient {
    program: PathBuf,
    rate_limit: String,
    keyfile: Option<PathBuf>,
    version: OnceCell<Result<String, String>>,
}

impl Default for AscpClient {
    fn default() -> Self {
        Self::new(PathBuf::from("ascp"), ASCP_DEFAULT_RATE_LIMIT.to_string(), None)
    }
}

impl AscpClient {
    pub fn new(program: PathBuf, rate_limit: String, keyfile: Option<PathBuf>) -> Self {
        Self {
            program,
            rate_limit,
            keyfile,
            version: OnceCell::new(),
        }
    }

    /// Checked on first use only. The result, good or bad, is remembered.
    async fn ensure_version(&self) -> Result<(), AdapterError> {
        let checked = self
            .version
            .get_or_init(|| async {
                let output = Command::new(&self.program)
                    .arg("--version")
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| {
                        format!(
                            "unable to run `{} --version`, is it installed? {}",
                            self.program.display(),
                            e
                        )
                    })?;
                let text = String::from_utf8_lossy(&output.stdout).into_owned()
                    + &String::from_utf8_lossy(&output.stderr);
                let version = parse_ascp_version(&text)
                    .ok_or_else(|| "ascp did not report a recognizable version".to_string())?;
                if !version_at_least(&version, ASCP_MIN_VERSION) {
                    return Err(format!(
                        "found ascp version {} but {} is required",
                        version, ASCP_MIN_VERSION
                    ));
                }
                tracing::debug!("Using ascp version {}", version);
                Ok(version)
            })
            .await;
        match checked {
            Ok(_) => Ok(()),
            Err(reason) => Err(AdapterError::unreachable(self.program.display(), reason)),
        }
    }

    fn command(
        &self,
        server: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-T", "-v", "-l", self.rate_limit.as_str()]);
        if let Some(keyfile) = &self.keyfile {
            cmd.arg("-i").arg(keyfile);
        }
        cmd.arg(format!(
            "{}@{}:{}",
            credentials.username(),
            server,
            remote_path
        ))
        .arg(local_path);

        if std::env::var_os(FASP_PASSWORD_ENV).is_some() {
            tracing::info!("Honoring previously set {} environment variable", FASP_PASSWORD_ENV);
        } else if let Some(password) = credentials.password() {
            cmd.env(FASP_PASSWORD_ENV, password);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl FaspClient for AscpClient {
    async fn transfer(
        &self,
        server: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), AdapterError> {
        self.ensure_version().await?;
        if let Some(keyfile) = &self.keyfile
            && !tokio::fs::try_exists(keyfile).await?
        {
            return Err(AdapterError::unreachable(
                server,
                format!("private key {} does not exist", keyfile.display()),
            ));
        }

        tracing::info!("Beginning ascp transfer of {} from {}", remote_path, server);
        let output = self
            .command(server, credentials, remote_path, local_path)
            .output()
            .await?;
        tracing::debug!("ascp exited with {}", output.status);

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if AUTH_FAILURE_RE.is_match(&stderr) {
            return Err(AdapterError::unreachable(server, "authentication failure"));
        }
        tracing::debug!("ascp stdout: {}", String::from_utf8_lossy(&output.stdout));
        Err(AdapterError::unreachable(
            server,
            format!("ascp failed ({}): {}", output.status, stderr.trim()),
        ))
    }
}

/// `fasp://server/path` URLs. Whole-file only; ascp manages its own resume.
pub struct FaspAdapter {
    client: Arc<dyn FaspClient>,
    credentials: Arc<dyn CredentialProvider>,
}

impl FaspAdapter {
    pub fn new(client: Arc<dyn FaspClient>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for FaspAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Fasp
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::WholeFile
    }

    async fn transfer(&self, url: &Url, local_path: &Path) -> Result<(), AdapterError> {
        let server = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(AdapterError::unreachable(url, "missing server")),
        };
        let remote_path = percent_decode_str(url.path()).decode_utf8_lossy().into_owned();
        let credentials = self
            .credentials
            .fasp_credentials()
            .await
            .map_err(|e| AdapterError::unreachable(url, e))?;
        self.client
            .transfer(&server, &credentials, &remote_path, local_path)
            .await
    }
}

/// Last version number reported in `ascp --version` output.
pub fn parse_ascp_version(output: &str) -> Option<String> {
    ASCP_VERSION_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .last()
}

/// Dotted version comparison where trailing zero components are ignored.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    compare_versions(version, minimum) != Ordering::Less
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    fn normalize(v: &str) -> Vec<u64> {
        let mut parts: Vec<u64> = v
            .split('.')
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().unwrap_or(0))
            .collect();
        while parts.last() == Some(&0) {
            parts.pop();
        }
        parts
    }
    normalize(a).cmp(&normalize(b))
}
