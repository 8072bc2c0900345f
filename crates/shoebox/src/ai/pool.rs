//! Round-robin worker pool over AI endpoints.
//!
//! Each endpoint carries its own worker semaphore, so total in-flight
//! requests never exceed the sum of the per-endpoint worker counts.
//! Batch queries fan out concurrently and resolve in submission order.

use crate::ai::client::{
    AiEndpoint, FileClassifyRequest, FileDecision, FolderActionRequest, FolderDecision,
};
use crate::cancel::CancellationToken;
use crate::config::AppConfig;
use crate::error::{Result, ShoeboxError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct AiPool {
    endpoints: Vec<Arc<AiEndpoint>>,
    next: AtomicUsize,
    categories_json: String,
}

impl AiPool {
    /// Build the pool from the configured endpoint specs. Endpoints that
    /// fail the availability check are dropped; an empty pool is an
    /// error.
    pub async fn connect(config: &AppConfig, categories_json: String) -> Result<Self> {
        let specs = config.endpoints()?;
        if specs.is_empty() {
            return Err(ShoeboxError::AiUnavailable(
                "no AI endpoints configured".to_string(),
            ));
        }
        let mut endpoints = Vec::new();
        for spec in specs {
            let endpoint = AiEndpoint::new(spec, config);
            match endpoint.ensure_available().await {
                Ok(()) => {
                    info!(url = %endpoint.spec.url, model = %endpoint.spec.model,
                          workers = endpoint.spec.workers, "AI endpoint ready");
                    endpoints.push(Arc::new(endpoint));
                }
                Err(e) => {
                    warn!(url = %endpoint.spec.url, error = %e, "AI endpoint unavailable");
                }
            }
        }
        if endpoints.is_empty() {
            return Err(ShoeboxError::AiUnavailable(
                "no configured AI endpoint passed the availability check".to_string(),
            ));
        }
        Ok(Self {
            endpoints,
            next: AtomicUsize::new(0),
            categories_json,
        })
    }

    fn pick(&self) -> Arc<AiEndpoint> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Arc::clone(&self.endpoints[idx])
    }

    /// Summed (input, output) token counts across endpoints.
    pub fn token_totals(&self) -> (u64, u64) {
        self.endpoints.iter().fold((0, 0), |(i, o), e| {
            let (ei, eo) = e.token_totals();
            (i + ei, o + eo)
        })
    }

    /// Decide a batch of folder actions. Results come back in request
    /// order; individual failures surface as errors for the chain's
    /// default fallback.
    pub async fn decide_folders(
        &self,
        requests: Vec<FolderActionRequest>,
        cancel: &CancellationToken,
    ) -> Vec<Result<FolderDecision>> {
        let mut tasks: JoinSet<(usize, Result<FolderDecision>)> = JoinSet::new();
        for (idx, request) in requests.into_iter().enumerate() {
            let endpoint = self.pick();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if cancel.is_cancelled() {
                    return (
                        idx,
                        Err(ShoeboxError::AiUnavailable("cancelled".to_string())),
                    );
                }
                let _permit = endpoint
                    .semaphore
                    .acquire()
                    .await
                    .expect("endpoint semaphore closed");
                if cancel.is_cancelled() {
                    return (
                        idx,
                        Err(ShoeboxError::AiUnavailable("cancelled".to_string())),
                    );
                }
                (idx, endpoint.decide_folder(&request).await)
            });
        }
        collect_in_order(tasks).await
    }

    /// Classify a batch of files.
    pub async fn classify_files(
        &self,
        requests: Vec<FileClassifyRequest>,
        cancel: &CancellationToken,
    ) -> Vec<Result<FileDecision>> {
        let mut tasks: JoinSet<(usize, Result<FileDecision>)> = JoinSet::new();
        for (idx, request) in requests.into_iter().enumerate() {
            let endpoint = self.pick();
            let cancel = cancel.clone();
            let categories_json = self.categories_json.clone();
            tasks.spawn(async move {
                if cancel.is_cancelled() {
                    return (
                        idx,
                        Err(ShoeboxError::AiUnavailable("cancelled".to_string())),
                    );
                }
                let _permit = endpoint
                    .semaphore
                    .acquire()
                    .await
                    .expect("endpoint semaphore closed");
                if cancel.is_cancelled() {
                    return (
                        idx,
                        Err(ShoeboxError::AiUnavailable("cancelled".to_string())),
                    );
                }
                (idx, endpoint.classify_file(&request, &categories_json).await)
            });
        }
        collect_in_order(tasks).await
    }
}

async fn collect_in_order<T: 'static>(mut tasks: JoinSet<(usize, Result<T>)>) -> Vec<Result<T>> {
    let mut slots: Vec<Option<Result<T>>> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (idx, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "AI task panicked");
                continue;
            }
        };
        if slots.len() <= idx {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx] = Some(result);
    }
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                Err(ShoeboxError::AiUnavailable("task dropped".to_string()))
            })
        })
        .collect()
}
