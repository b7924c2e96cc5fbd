use std::path::PathBuf;

use clap::Parser;
use mdl::{hash::HashAlgorithm, prioritizer::UrlRewrite};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Tab separated manifest to download, as a local path or an http(s) URL.
    #[arg(short, long, value_name = "PATH|URL")]
    pub manifest: String,

    /// Directory to save files into. Created if missing.
    #[arg(short, long, value_name = "DIR")]
    pub destination: Option<PathBuf>,

    /// Comma separated protocol order, highest preference first.
    /// Valid protocols are HTTP, FTP, S3, FASP and GS.
    ///
    /// When omitted, S3,HTTP,FTP is used inside AWS and HTTP,FTP,S3 elsewhere.
    /// FASP and GS are only used when named here.
    #[arg(short = 'p', long, value_name = "LIST")]
    pub endpoint_priority: Option<String>,

    /// Rewrite candidate URLs of one protocol by prefix before they are tried.
    #[arg(long = "rewrite", value_name = "PROTO:FROM=TO", num_args = 0.., action = clap::ArgAction::Append)]
    pub rewrites: Vec<UrlRewrite>,

    /// Number of times to re-run the batch while files are still failing.
    #[arg(short, long, value_name = "COUNT")]
    pub retries: Option<u32>,

    /// Bytes read from a stream and appended to disk at a time.
    #[arg(short, long, value_name = "BYTES")]
    pub block_size: Option<usize>,

    /// The maximum number of manifest entries downloaded in parallel.
    #[arg(short = 'j', long, value_name = "COUNT")]
    pub max_concurrent_downloads: Option<usize>,

    /// Digest algorithm the manifest checksums were computed with.
    #[arg(long, value_name = "ALGORITHM")]
    pub checksum_algorithm: Option<HashAlgorithm>,

    /// Save files without verifying their checksum.
    #[arg(long, default_value_t = false)]
    pub disable_validation: bool,

    /// Username for FASP transfers. The password is taken from ASPERA_SCP_PASS,
    /// then the system keyring, and is asked for on the terminal otherwise.
    #[arg(long, value_name = "USER")]
    pub user: Option<String>,

    /// Store the FASP password in the system keyring for later runs.
    #[arg(long, default_value_t = false)]
    pub remember_password: bool,

    /// Path-style S3 endpoint to use instead of `<bucket>.s3.amazonaws.com`.
    #[arg(long, value_name = "URL")]
    pub s3_endpoint: Option<String>,

    /// Google Cloud Storage API endpoint.
    #[arg(long, value_name = "URL")]
    pub gcs_endpoint: Option<String>,

    /// Path to the ascp executable.
    #[arg(long, value_name = "PATH")]
    pub ascp_path: Option<PathBuf>,

    /// Target rate handed to ascp with `-l`.
    #[arg(long, value_name = "RATE")]
    pub ascp_rate_limit: Option<String>,

    /// Private key handed to ascp with `-i`.
    #[arg(long, value_name = "FILE")]
    pub ascp_keyfile: Option<PathBuf>,

    /// Connect timeout in seconds. Fractions are supported.
    #[arg(long, value_name = "SECONDS")]
    pub connect_timeout: Option<f64>,

    /// Seconds without data after which a transfer is abandoned for the next location.
    #[arg(long, value_name = "SECONDS")]
    pub read_timeout: Option<f64>,

    /// Turn on debug logging.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}
