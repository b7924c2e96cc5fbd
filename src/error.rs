use std::error::Error;
use thiserror::Error;
use tokio::task::JoinError;

use crate::protocol::Protocol;

/// Failure of a single adapter call against a single candidate URL.
///
/// These never escape the transfer controller: they are logged and turned
/// into a fall-through to the next candidate.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Endpoint unreachable at {url}: {reason}")]
    EndpointUnreachable { url: String, reason: String },
    #[error("Remote did not report a size for {url}")]
    SizeUnavailable { url: String },
    #[error("{protocol} adapter does not support {operation}")]
    Unsupported {
        protocol: Protocol,
        operation: &'static str,
    },
    #[error("Stream from {url} stalled")]
    Stalled { url: String },
    #[error("Standard I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn unreachable(url: impl ToString, reason: impl ToString) -> Self {
        Self::EndpointUnreachable {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        let url = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());

        if let Some(status) = e.status()
            && !status.is_success()
        {
            return Self::unreachable(url, format!("response status {status}"));
        }

        if e.is_timeout() {
            return Self::Stalled { url };
        }

        let reason = match e.source() {
            Some(source) => format!("{e}: {source}"),
            None => e.to_string(),
        };
        Self::unreachable(url, reason)
    }
}

impl From<reqwest_middleware::Error> for AdapterError {
    fn from(value: reqwest_middleware::Error) -> Self {
        match value {
            reqwest_middleware::Error::Middleware(error) => {
                Self::unreachable("<middleware>", error)
            }
            reqwest_middleware::Error::Reqwest(error) => AdapterError::from(error),
        }
    }
}

impl From<suppaftp::FtpError> for AdapterError {
    fn from(e: suppaftp::FtpError) -> Self {
        Self::unreachable("ftp", e)
    }
}

impl From<JoinError> for AdapterError {
    fn from(e: JoinError) -> Self {
        Self::unreachable("<task>", e)
    }
}

#[derive(Error, Debug)]
pub enum MdlError {
    #[error("Invalid endpoint priority `{token}`, valid protocols are HTTP, FTP, S3, FASP and GS")]
    InvalidPriority { token: String },
    #[error("Missing credentials for {protocol}: {message}")]
    MissingCredentials { protocol: Protocol, message: String },
    #[error("Invalid manifest at line {line}: {message}")]
    InvalidManifest { line: usize, message: String },
    #[error("Invalid url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("Configuration error: {message}")]
    Config { message: String },
    #[error("Standard I/O error: {e}")]
    StdIoError { e: std::io::Error },
    #[error("HTTP error: {0}")]
    Http(#[from] AdapterError),
    #[error("Other error: {message}")]
    Other {
        message: String,
        origin: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<std::io::Error> for MdlError {
    fn from(e: std::io::Error) -> Self {
        Self::StdIoError { e }
    }
}

impl From<reqwest::Error> for MdlError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(AdapterError::from(e))
    }
}

impl From<keyring::Error> for MdlError {
    fn from(e: keyring::Error) -> Self {
        MdlError::Other {
            message: e.to_string(),
            origin: Box::new(e),
        }
    }
}

impl From<crate::orchestrator::BatchOrchestratorBuilderError> for MdlError {
    fn from(e: crate::orchestrator::BatchOrchestratorBuilderError) -> Self {
        MdlError::Config {
            message: e.to_string(),
        }
    }
}

impl From<crate::controller::TransferControllerBuilderError> for MdlError {
    fn from(e: crate::controller::TransferControllerBuilderError) -> Self {
        MdlError::Config {
            message: e.to_string(),
        }
    }
}
