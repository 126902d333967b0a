use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::fetch::{FetchError, RetryingFetcher};
use crate::models::{ActivityDocument, EntityConfig};
use crate::report::ReportRenderer;
use crate::sink::{Sink, SinkError};
use crate::source::Acquire;
use crate::table;

pub const BATCH_SIZE: usize = 5;
pub const EXPORT_MAX_ATTEMPTS: u32 = 3;
pub const EXPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("render failed: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportMode {
    #[default]
    Concurrent,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub mode: ExportMode,
    pub reorder: bool,
}

impl Default for ExportPolicy {
    fn default() -> Self {
        Self {
            max_attempts: EXPORT_MAX_ATTEMPTS,
            retry_delay: EXPORT_RETRY_DELAY,
            mode: ExportMode::Concurrent,
            reorder: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub exported: Vec<String>,
    pub failed: Vec<String>,
    pub reorder_error: Option<String>,
}

/// Drives fetch, build and render for every club, one batch at a time.
pub struct BatchOrchestrator<A, S> {
    fetcher: RetryingFetcher<A>,
    sink: S,
    sheet_id: String,
    policy: ExportPolicy,
}

impl<A: Acquire, S: Sink> BatchOrchestrator<A, S> {
    pub fn new(
        fetcher: RetryingFetcher<A>,
        sink: S,
        sheet_id: impl Into<String>,
        policy: ExportPolicy,
    ) -> Self {
        Self {
            fetcher,
            sink,
            sheet_id: sheet_id.into(),
            policy,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Never fails as a whole: a club that exhausts its attempts is recorded
    /// in `RunSummary::failed` and the run moves on.
    pub async fn run_all(&self, entities: &[EntityConfig], batch_size: usize) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("export_run", %run_id, clubs = entities.len());
        self.run_batches(run_id, entities, batch_size.max(1))
            .instrument(span)
            .await
    }

    async fn run_batches(
        &self,
        run_id: Uuid,
        entities: &[EntityConfig],
        batch_size: usize,
    ) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            ..RunSummary::default()
        };
        let batch_count = entities.len().div_ceil(batch_size);

        for (idx, batch) in entities.chunks(batch_size).enumerate() {
            info!(batch = idx + 1, batch_count, size = batch.len(), "processing batch");

            let fetched = join_all(
                batch
                    .iter()
                    .map(|entity| self.fetcher.fetch_with_retry(&entity.source_locator)),
            )
            .await;

            let outcomes: Vec<(&EntityConfig, Result<u32, ExportError>)> = match self.policy.mode {
                ExportMode::Concurrent => {
                    join_all(batch.iter().zip(fetched).map(|(entity, prefetched)| async move {
                        (entity, self.export_entity(entity, prefetched).await)
                    }))
                    .await
                }
                ExportMode::Sequential => {
                    let mut outcomes = Vec::with_capacity(batch.len());
                    for (entity, prefetched) in batch.iter().zip(fetched) {
                        outcomes.push((entity, self.export_entity(entity, prefetched).await));
                    }
                    outcomes
                }
            };

            for (entity, outcome) in outcomes {
                match outcome {
                    Ok(attempts) => {
                        info!(club = %entity.title, attempts, "exported");
                        summary.exported.push(entity.title.clone());
                    }
                    Err(err) => {
                        error!(club = %entity.title, error = %err, "export failed after all attempts");
                        summary.failed.push(entity.title.clone());
                    }
                }
            }
        }

        if self.policy.reorder {
            let order: Vec<String> = entities.iter().map(|entity| entity.title.clone()).collect();
            if let Err(err) = self.sink.reorder_surfaces(&self.sheet_id, &order).await {
                warn!(error = %err, "failed to reorder surfaces");
                summary.reorder_error = Some(err.to_string());
            }
        }

        info!(
            exported = summary.exported.len(),
            failed = summary.failed.len(),
            "run complete"
        );
        summary
    }

    /// Attempt loop for one club. Only the first attempt may reuse the batch
    /// prefetch; every later attempt starts again from a fresh fetch.
    async fn export_entity(
        &self,
        entity: &EntityConfig,
        prefetched: Result<ActivityDocument, FetchError>,
    ) -> Result<u32, ExportError> {
        let mut prefetched = match prefetched {
            Ok(document) => Some(document),
            Err(err) => {
                warn!(club = %entity.title, error = %err, "initial fetch failed");
                None
            }
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                info!(club = %entity.title, attempt, max_attempts, "retrying export");
                tokio::time::sleep(self.policy.retry_delay).await;
            }

            match self.export_once(entity, prefetched.take()).await {
                Ok(()) => return Ok(attempt),
                Err(err) if attempt < max_attempts => {
                    warn!(club = %entity.title, attempt, error = %err, "export attempt failed");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn export_once(
        &self,
        entity: &EntityConfig,
        document: Option<ActivityDocument>,
    ) -> Result<(), ExportError> {
        let document = match document {
            Some(document) => document,
            None => self.fetcher.fetch_with_retry(&entity.source_locator).await?,
        };
        let table = table::build(&document.records);
        ReportRenderer::new(&self.sink, &self.sheet_id)
            .render(&table, &entity.title, entity.threshold)
            .await?;
        Ok(())
    }
}
