use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use mdl::{
    AdapterRegistry, BatchOrchestratorBuilder, BatchSummary, ClientSettings, PriorityList,
    Protocol, TransferControllerBuilder, TsvManifest,
    adapters::{
        AscpClient, FaspAdapter, FtpAdapter, GcsAdapter, GcsJsonApi, HttpAdapter, S3Adapter,
        fasp::ASCP_DEFAULT_RATE_LIMIT, gcs::GCS_DEFAULT_ENDPOINT,
    },
    checksum::ChecksumValidator,
    config::Config,
    controller::DEFAULT_BLOCK_SIZE,
    credentials::{CredentialProvider, Credentials, EnvCredentialProvider, KEYRING_TARGET, TerminalPrompt},
    error::MdlError,
    prioritizer::EndpointPrioritizer,
    progress::{ProgressEvent, ProgressReporter},
};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use tracing_indicatif::{IndicatifLayer, span_ext::IndicatifSpanExt, style::ProgressStyle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
mod args;
use args::Args;

const BAR_TEMPLATE: &str = "{spinner} {msg} [{wide_bar}] {bytes}/{total_bytes} {bytes_per_sec} {eta}";

/// Draws progress events onto the entry span's progress bar.
///
/// Start and advance events are delivered from inside the entry span, so the
/// current span is the one to draw on.
struct SpanBarReporter {
    style: Option<ProgressStyle>,
}

impl SpanBarReporter {
    fn new() -> Self {
        Self {
            style: ProgressStyle::with_template(BAR_TEMPLATE).ok(),
        }
    }
}

impl ProgressReporter for SpanBarReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started {
                id,
                url,
                offset,
                remote_size,
                ..
            } => {
                let span = Span::current();
                if let Some(style) = &self.style {
                    span.pb_set_style(style);
                }
                span.pb_set_message(&format!("{} ({})", id, url));
                if let Some(size) = remote_size {
                    span.pb_set_length(size);
                }
                span.pb_set_position(offset);
                span.pb_reset_eta();
            }
            ProgressEvent::Advanced { bytes_written, .. } => {
                Span::current().pb_set_position(bytes_written);
            }
            ProgressEvent::Finished { id, outcome } => {
                if outcome.is_success() {
                    tracing::info!("{}: {}", id, outcome.describe());
                } else {
                    tracing::warn!("{}: {}", id, outcome.describe());
                }
            }
        }
    }
}

fn init_tracing(debug: bool) {
    let indicatif_layer = IndicatifLayer::new();
    let default_directive = if debug { "mdl=debug" } else { "mdl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(debug)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .init();
}

fn parse_endpoint(value: &str) -> Result<Url, MdlError> {
    Url::parse(value).map_err(|e| MdlError::InvalidUrl {
        url: value.to_string(),
        message: e.to_string(),
    })
}

fn seconds(value: Option<f64>, default: Duration) -> Duration {
    value
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

/// Fails early when a protocol that needs secrets was explicitly selected
/// but its secrets are not available.
async fn check_credentials(
    priority: &PriorityList,
    provider: &dyn CredentialProvider,
) -> Result<Option<Credentials>, MdlError> {
    if priority.contains(Protocol::Gs) {
        provider.gs_access_token().await?;
    }
    if priority.contains(Protocol::Fasp) {
        return Ok(Some(provider.fasp_credentials().await?));
    }
    Ok(None)
}

async fn load_manifest(source: &str) -> Result<Vec<mdl::ManifestEntry>, MdlError> {
    match Url::parse(source) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => TsvManifest::from_url(url).await,
        _ => TsvManifest::from_path(PathBuf::from(source)).await,
    }
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "{} of {} file(s) downloaded after {} attempt(s)",
        summary.successes(),
        summary.outcomes.len(),
        summary.passes
    );
    for (outcome, count) in summary.failure_breakdown() {
        println!("  {} file(s) failed: {}", count, outcome.describe());
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, MdlError> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = match Config::load_default() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring unreadable config file: {}", e);
            Config::default()
        }
    };

    let priority = match args
        .endpoint_priority
        .as_deref()
        .or(config.endpoint_priority.as_deref())
    {
        Some(list) => PriorityList::parse(list)?,
        None => PriorityList::default(),
    };

    let destination = args
        .destination
        .or(config.destination)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&destination).await?;

    let settings = ClientSettings {
        connect_timeout: seconds(
            args.connect_timeout.or(config.connect_timeout_secs),
            ClientSettings::default().connect_timeout,
        ),
        read_timeout: seconds(
            args.read_timeout.or(config.read_timeout_secs),
            ClientSettings::default().read_timeout,
        ),
        ..ClientSettings::default()
    };

    let provider: Arc<dyn CredentialProvider> = Arc::new(
        EnvCredentialProvider::new(args.user.or(config.aspera_user))
            .with_password_prompt(Arc::new(TerminalPrompt)),
    );
    let fasp_credentials = check_credentials(&priority, provider.as_ref()).await?;

    let s3_endpoint = match args.s3_endpoint.or(config.s3_endpoint) {
        Some(endpoint) => Some(parse_endpoint(&endpoint)?),
        None => None,
    };
    let gcs_endpoint = parse_endpoint(
        &args
            .gcs_endpoint
            .or(config.gcs_endpoint)
            .unwrap_or_else(|| GCS_DEFAULT_ENDPOINT.to_string()),
    )?;
    let ascp = AscpClient::new(
        args.ascp_path
            .or(config.ascp_path)
            .unwrap_or_else(|| PathBuf::from("ascp")),
        args.ascp_rate_limit
            .or(config.ascp_rate_limit)
            .unwrap_or_else(|| ASCP_DEFAULT_RATE_LIMIT.to_string()),
        args.ascp_keyfile.or(config.ascp_keyfile),
    );

    let mut registry = AdapterRegistry::new();
    registry
        .register(Arc::new(HttpAdapter::new(settings.clone())?))
        .register(Arc::new(S3Adapter::new(settings.clone(), s3_endpoint)))
        .register(Arc::new(FtpAdapter::new(
            settings.connect_timeout,
            settings.read_timeout,
        )))
        .register(Arc::new(GcsAdapter::new(Arc::new(GcsJsonApi::new(
            &settings,
            gcs_endpoint,
            Arc::clone(&provider),
        )?))))
        .register(Arc::new(FaspAdapter::new(Arc::new(ascp), Arc::clone(&provider))));

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current chunk");
            ctrl_c_token.cancel();
        }
    });

    let validator = ChecksumValidator::new(
        args.checksum_algorithm
            .or(config.checksum_algorithm)
            .unwrap_or_default(),
    );
    let controller = TransferControllerBuilder::default()
        .registry(Arc::new(registry))
        .destination(destination)
        .block_size(
            args.block_size
                .or(config.block_size)
                .unwrap_or(DEFAULT_BLOCK_SIZE),
        )
        .validator(validator)
        .verify_checksums(!(args.disable_validation || config.disable_validation.unwrap_or(false)))
        .progress(Arc::new(SpanBarReporter::new()))
        .cancel(cancel)
        .build()?;

    let mut orchestrator = BatchOrchestratorBuilder::default();
    orchestrator
        .controller(Arc::new(controller))
        .priority(priority)
        .prioritizer(EndpointPrioritizer::new(args.rewrites))
        .max_retries(args.retries.or(config.retries).unwrap_or(0));
    if let Some(max_concurrent) = args
        .max_concurrent_downloads
        .or(config.max_concurrent_downloads)
    {
        orchestrator.max_concurrent(max_concurrent);
    }
    let orchestrator = orchestrator.build()?;

    let entries = load_manifest(&args.manifest).await?;
    tracing::info!("Loaded {} manifest entries", entries.len());

    let summary = orchestrator.run(&entries).await;
    print_summary(&summary);

    if args.remember_password
        && let Some(credentials) = fasp_credentials
    {
        if credentials.password().is_some() {
            credentials.save_to_keyring(KEYRING_TARGET).await?;
            tracing::info!("Stored FASP password for {} in the keyring", credentials.username());
        } else {
            tracing::warn!("No FASP password was given, nothing to remember");
        }
    }

    if summary.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
