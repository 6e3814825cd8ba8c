//! Cache threshold auto-tuning from user feedback
//!
//! When a user flags a semantically cached response as incorrect, the
//! project's similarity threshold is raised just past the similarity that
//! produced the bad hit. Tuning is monotone, capped at 0.99, and idempotent
//! per log entry.

use std::sync::Arc;
use tracing::info;

use crate::error::GatewayError;
use crate::events::EventSink;
use crate::project_store::ProjectStore;
use crate::semantic_cache::{CacheDecision, MAX_THRESHOLD};

/// Margin added above the offending similarity.
const TUNE_MARGIN: f32 = 0.02;

#[derive(Clone, Debug, serde::Serialize)]
pub struct TuneOutcome {
    pub threshold: f32,
    pub changed: bool,
    /// False when the log had already been flagged before this call.
    pub newly_flagged: bool,
}

pub struct ThresholdTuner {
    store: Arc<dyn ProjectStore>,
    sink: Arc<dyn EventSink>,
}

impl ThresholdTuner {
    pub fn new(store: Arc<dyn ProjectStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    /// Handle a flag-incorrect report for one logged event.
    pub async fn flag_incorrect(
        &self,
        project_id: &str,
        log_id: &str,
    ) -> Result<TuneOutcome, GatewayError> {
        let stored = self
            .sink
            .fetch_event(project_id, log_id)
            .await
            .map_err(GatewayError::internal)?
            .ok_or_else(|| GatewayError::NotFound(format!("log {log_id} not found")))?;

        let project = self
            .store
            .get_project(project_id)
            .await
            .map_err(GatewayError::internal)?
            .ok_or_else(|| GatewayError::NotFound(format!("project {project_id} not found")))?;
        let current = project.cache_threshold;

        if stored.flagged {
            // A repeat flag still marks the log but never tunes twice.
            return Ok(TuneOutcome {
                threshold: current,
                changed: false,
                newly_flagged: false,
            });
        }

        self.sink
            .mark_flagged(project_id, log_id)
            .await
            .map_err(GatewayError::internal)?;

        // Only semantic hits carry a meaningful similarity to tune from.
        let similarity = match (stored.event.cache_decision, stored.event.cache_similarity) {
            (CacheDecision::Semantic, Some(similarity)) => similarity,
            _ => {
                return Ok(TuneOutcome {
                    threshold: current,
                    changed: false,
                    newly_flagged: true,
                })
            }
        };

        let suggested = (similarity + TUNE_MARGIN).max(current).min(MAX_THRESHOLD);
        if suggested > current {
            self.store
                .set_cache_threshold(project_id, suggested)
                .await
                .map_err(GatewayError::internal)?;
            info!(
                project_id,
                log_id,
                from = current,
                to = suggested,
                "cache threshold raised after incorrect-hit flag"
            );
            return Ok(TuneOutcome {
                threshold: suggested,
                changed: true,
                newly_flagged: true,
            });
        }

        Ok(TuneOutcome { threshold: current, changed: false, newly_flagged: true })
    }
}
