//! Impression and activation handling
//!
//! The call contract offered to the route layer. Callers pass an already
//! validated, non-empty openId.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::api::{build_http_client, ConversionReporter};
use crate::auth::{HttpTokenSource, RefreshPolicy, TokenManager};
use crate::config::Config;
use crate::models::{Activation, AttributionRecord};
use crate::store::{AttributionStore, StoreError};

/// Conversion reporting wired into first-time activations.
pub struct ConversionHook {
    pub reporter: Arc<ConversionReporter>,
    pub event_type: String,
}

impl ConversionHook {
    /// Wire reporting from `config` to a token manager that is not started yet.
    ///
    /// Returns `None` when reporting is disabled or cannot be set up, in
    /// which case activations are still attributed, just not reported.
    pub fn from_config(config: &Config) -> Option<(Arc<TokenManager>, Self)> {
        if !config.conversion.enabled {
            tracing::info!("Conversion reporting disabled");
            return None;
        }

        let http = match build_http_client(&config.http) {
            Ok(http) => http,
            Err(e) => {
                tracing::warn!("Conversion reporting off: {:#}", e);
                return None;
            }
        };
        let source = match HttpTokenSource::new(http.clone(), &config.token) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Conversion reporting off: {}", e);
                return None;
            }
        };

        let manager = Arc::new(TokenManager::new(
            Arc::new(source),
            RefreshPolicy::from_config(&config.token),
        ));
        let reporter = ConversionReporter::new(
            http,
            config.conversion.endpoint.clone(),
            manager.handle(),
        )
        .with_token_wait(config.conversion.token_wait());

        Some((
            manager,
            Self {
                reporter: Arc::new(reporter),
                event_type: config.conversion.event_type.clone(),
            },
        ))
    }
}

pub struct AttributionService {
    store: AttributionStore,
    conversion: Option<ConversionHook>,
    reports: TaskTracker,
}

impl AttributionService {
    pub fn new(store: AttributionStore, conversion: Option<ConversionHook>) -> Self {
        Self {
            store,
            conversion,
            reports: TaskTracker::new(),
        }
    }

    /// Count an ad impression for `open_id`.
    pub async fn on_impression(&self, open_id: &str) -> Result<u64, StoreError> {
        let count = self
            .store
            .increment_impression(open_id)
            .await
            .map_err(|e| log_store_failure("Impression", open_id, e))?;
        tracing::debug!("Impression {} recorded for {}", count, open_id);
        Ok(count)
    }

    /// Credit `click_id` with `open_id`'s install if nothing is credited yet.
    ///
    /// A store failure is returned as-is and the player is not treated as
    /// attributed. For a newly attributed player the conversion report is
    /// sent in the background; its outcome never changes this result.
    pub async fn on_activation(
        &self,
        open_id: &str,
        click_id: &str,
    ) -> Result<Activation, StoreError> {
        let applied = self
            .store
            .set_click_if_absent(open_id, click_id)
            .await
            .map_err(|e| log_store_failure("Activation", open_id, e))?;

        if applied {
            tracing::info!("New player {} attributed to click {}", open_id, click_id);
            self.spawn_report(click_id);
        } else {
            tracing::debug!("Activation for {}, already attributed", open_id);
        }

        Ok(Activation {
            is_new_user: applied,
        })
    }

    pub async fn lookup(&self, open_id: &str) -> Result<AttributionRecord, StoreError> {
        let record = self.store.record(open_id).await?;
        tracing::debug!("Lookup {}: attributed={}", open_id, record.is_attributed());
        Ok(record)
    }

    fn spawn_report(&self, click_id: &str) {
        let Some(hook) = &self.conversion else {
            return;
        };

        let reporter = Arc::clone(&hook.reporter);
        let event_type = hook.event_type.clone();
        let click_id = click_id.to_string();

        self.reports.spawn(async move {
            match reporter.report_conversion(&event_type, &click_id).await {
                Ok(body) => tracing::info!("Conversion reported for click {}: {}", click_id, body),
                Err(e) => tracing::warn!("Conversion report for click {} dropped: {}", click_id, e),
            }
        });
    }

    /// Wait for conversion reports still in flight. New activations after
    /// this call are still attributed; their reports are still spawned.
    pub async fn drain_reports(&self) {
        self.reports.close();
        self.reports.wait().await;
        self.reports.reopen();
    }
}

fn log_store_failure(what: &str, open_id: &str, e: StoreError) -> StoreError {
    if e.is_unavailable() {
        tracing::warn!("{} for {} not recorded, store unreachable: {}", what, open_id, e);
    } else {
        tracing::warn!("{} for {} failed: {}", what, open_id, e);
    }
    e
}
