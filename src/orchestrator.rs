use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use derive_builder::Builder;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};

use crate::{
    controller::TransferController,
    manifest::{ManifestEntry, Outcome},
    prioritizer::{Ec2MetadataProbe, EndpointPrioritizer, EnvironmentProbe, resolve_priority},
    protocol::PriorityList,
};

/// Per-entry outcomes of the last pass, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub outcomes: Vec<(String, Outcome)>,
    /// Number of passes over the batch, the first included.
    pub passes: u32,
}

impl BatchSummary {
    pub fn counts(&self) -> BTreeMap<Outcome, usize> {
        let mut counts = BTreeMap::new();
        for (_, outcome) in &self.outcomes {
            *counts.entry(*outcome).or_insert(0) += 1;
        }
        counts
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }

    pub fn is_complete(&self) -> bool {
        self.failures() == 0
    }

    /// Counts of every non-success outcome kind.
    pub fn failure_breakdown(&self) -> Vec<(Outcome, usize)> {
        self.counts()
            .into_iter()
            .filter(|(outcome, _)| !outcome.is_success())
            .collect()
    }

    /// True when the only failures are entries without a usable location,
    /// which no retry can fix.
    pub fn only_missing_locations(&self) -> bool {
        self.failures() > 0
            && self
                .outcomes
                .iter()
                .filter(|(_, o)| !o.is_success())
                .all(|(_, o)| *o == Outcome::NoCandidateUrl)
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| *o == Outcome::Cancelled)
    }
}

/// Runs every manifest entry through prioritization and the transfer
/// controller, re-running the whole batch while failures remain and the retry
/// budget allows.
#[derive(Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct BatchOrchestrator {
    controller: Arc<TransferController>,
    /// Explicit protocol order. Empty means infer it from the environment.
    #[builder(default)]
    priority: PriorityList,
    #[builder(default)]
    prioritizer: EndpointPrioritizer,
    #[builder(default = Arc::new(Ec2MetadataProbe::default()))]
    probe: Arc<dyn EnvironmentProbe>,
    /// Extra passes after the first one.
    #[builder(default = 0)]
    max_retries: u32,
    /// Entries processed at the same time.
    #[builder(default = 3)]
    max_concurrent: usize,
}

impl BatchOrchestratorBuilder {
    fn validate(&self) -> Result<(), BatchOrchestratorBuilderError> {
        if let Some(max_concurrent) = self.max_concurrent
            && max_concurrent == 0
        {
            return Err(BatchOrchestratorBuilderError::ValidationError(
                "max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl BatchOrchestrator {
    pub fn controller(&self) -> &Arc<TransferController> {
        &self.controller
    }

    /// Processes the batch until it succeeds, the retry budget runs out,
    /// only location-less entries remain, or the batch is cancelled. Shared
    /// adapter connections are closed before returning.
    pub async fn run(&self, entries: &[ManifestEntry]) -> BatchSummary {
        let priority = resolve_priority(self.priority.clone(), self.probe.as_ref()).await;
        tracing::info!("Endpoint priority: {}", priority);

        let mut passes = 0;
        let summary = loop {
            passes += 1;
            if passes > 1 {
                tracing::info!("Initiating download attempt number {}", passes);
            }
            let summary = BatchSummary {
                outcomes: self.run_pass(entries, &priority).await,
                passes,
            };

            if summary.is_complete() {
                break summary;
            }
            for (outcome, count) in summary.failure_breakdown() {
                tracing::warn!("{} file(s) failed: {}", count, outcome.describe());
            }
            if summary.was_cancelled() {
                tracing::info!("Batch cancelled");
                break summary;
            }
            if summary.only_missing_locations() {
                tracing::info!("No retrievable location for the remaining files, not retrying");
                break summary;
            }
            if passes > self.max_retries {
                break summary;
            }
        };

        self.controller.registry().close().await;
        summary
    }

    async fn run_pass(&self, entries: &[ManifestEntry], priority: &PriorityList) -> Vec<(String, Outcome)> {
        let semaphore = Semaphore::new(self.max_concurrent);
        let semaphore = &semaphore;

        let planned: Vec<_> = entries
            .iter()
            .map(|entry| {
                let candidates = self.prioritizer.select(&entry.candidate_urls, priority);
                let final_path = self.controller.final_path_for(&candidates);
                (entry, candidates, final_path)
            })
            .collect();

        // entries saving to the same file run one after another
        let mut path_locks: HashMap<PathBuf, Mutex<()>> = HashMap::new();
        for (_, _, final_path) in &planned {
            if let Some(path) = final_path {
                path_locks.entry(path.clone()).or_default();
            }
        }
        let path_locks = &path_locks;

        let work = planned
            .into_iter()
            .map(|(entry, candidates, final_path)| async move {
                let _path_guard = match final_path.as_ref().and_then(|p| path_locks.get(p)) {
                    Some(lock) => Some(lock.lock().await),
                    None => None,
                };
                let _permit = semaphore.acquire().await.ok();
                let outcome = self.controller.fetch(entry, &candidates).await;
                (entry.id.clone(), outcome)
            });
        join_all(work).await
    }
}
