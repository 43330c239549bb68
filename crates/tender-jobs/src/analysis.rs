//! Per-user notice analysis workflow.
//!
//! `enqueue_analysis` persists the InProgress row before publishing, so a
//! queued request always has a row to update. The worker side
//! ([`AnalysisService::process_request`]) runs the engine and publishes an
//! [`AnalysisResult`] trigger; listeners re-read the stored status from the
//! repository rather than trusting the message.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tender_bus::TaskDispatcher;
use tender_core::defaults::{STUCK_ANALYSIS_ERROR, STUCK_ANALYSIS_TIMEOUT_MINUTES};
use tender_core::{
    AnalysisRepository, AnalysisRequest, AnalysisResult, AnalysisStatus, AnalysisStatusView,
    EnqueueErrorKind, EnqueueOutcome, Error, NoticeAnalysis, NoticeRepository, QueueKind, Result,
    StoredAttachment,
};

use crate::engine::AnalysisEngine;

/// Broker trigger for a stored analysis.
pub fn result_message(analysis: &NoticeAnalysis) -> AnalysisResult {
    AnalysisResult {
        analysis_id: Some(analysis.id),
        notice_id: analysis.notice_id,
        user_id: analysis.user_id.clone(),
        status: analysis.status,
        has_result: analysis.result.as_deref().is_some_and(|r| !r.is_empty()),
        error: analysis.error.clone(),
        updated_at: analysis.updated_at,
    }
}

pub struct AnalysisService {
    analyses: Arc<dyn AnalysisRepository>,
    notices: Arc<dyn NoticeRepository>,
    engine: Arc<dyn AnalysisEngine>,
    dispatcher: Arc<TaskDispatcher>,
    stuck_timeout: chrono::Duration,
}

impl AnalysisService {
    pub fn new(
        analyses: Arc<dyn AnalysisRepository>,
        notices: Arc<dyn NoticeRepository>,
        engine: Arc<dyn AnalysisEngine>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        Self {
            analyses,
            notices,
            engine,
            dispatcher,
            stuck_timeout: chrono::Duration::minutes(STUCK_ANALYSIS_TIMEOUT_MINUTES),
        }
    }

    pub fn with_stuck_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    /// Current status of the (notice, user) analysis.
    pub async fn get_status(&self, notice_id: Uuid, user_id: &str) -> Result<AnalysisStatusView> {
        Ok(self
            .analyses
            .find(notice_id, user_id)
            .await?
            .map(|a| a.status_view())
            .unwrap_or_else(|| AnalysisStatusView::not_started(notice_id, user_id)))
    }

    /// Queue an analysis run.
    ///
    /// A blank user, an unknown notice, or a disabled queue is rejected in
    /// the outcome. When the analysis is InProgress or Completed and `force`
    /// is false the outcome is a `Duplicate` carrying the existing status,
    /// and nothing is published. A publish failure marks the analysis Failed
    /// and is returned as an error.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "analysis_service", op = "enqueue"))]
    pub async fn enqueue_analysis(
        &self,
        notice_id: Uuid,
        user_id: &str,
        force: bool,
    ) -> Result<EnqueueOutcome<AnalysisStatusView>> {
        if user_id.trim().is_empty() {
            return Ok(EnqueueOutcome::rejected(
                EnqueueErrorKind::Invalid,
                "user id is required",
            ));
        }
        if !self.dispatcher.is_enabled(QueueKind::AnalysisRequest) {
            return Ok(EnqueueOutcome::rejected(
                EnqueueErrorKind::Disabled,
                "analysis queue is not configured",
            ));
        }
        if self.notices.get(notice_id).await?.is_none() {
            return Ok(EnqueueOutcome::rejected(
                EnqueueErrorKind::Invalid,
                format!("notice {} not found", notice_id),
            ));
        }

        if let Some(existing) = self.analyses.find(notice_id, user_id).await? {
            let settled = matches!(
                existing.status,
                AnalysisStatus::InProgress | AnalysisStatus::Completed
            );
            if settled && !force {
                debug!(
                    analysis_id = %existing.id,
                    status = %existing.status,
                    "Analysis already exists, not queued"
                );
                return Ok(EnqueueOutcome::rejected(
                    EnqueueErrorKind::Duplicate,
                    format!("analysis is already {}", existing.status),
                )
                .with_value(existing.status_view()));
            }
        }

        let analysis = self.analyses.begin(notice_id, user_id).await?;
        let request = AnalysisRequest {
            analysis_id: analysis.id,
            notice_id,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            force,
        };

        if let Err(e) = self.dispatcher.publish_analysis_request(request).await {
            warn!(analysis_id = %analysis.id, error = %e, "Failed to queue analysis");
            if let Err(mark) = self
                .analyses
                .fail(analysis.id, &format!("failed to queue analysis: {}", e))
                .await
            {
                warn!(analysis_id = %analysis.id, error = %mark, "Failed to mark analysis failed");
            }
            return Err(e);
        }

        info!(analysis_id = %analysis.id, "Analysis queued");
        Ok(EnqueueOutcome::enqueued(analysis.status_view()))
    }

    /// Run one queued analysis and publish its result trigger.
    #[instrument(
        skip(self, request),
        fields(
            subsystem = "jobs",
            component = "analysis_service",
            op = "process",
            analysis_id = %request.analysis_id,
            notice_id = %request.notice_id
        )
    )]
    pub async fn process_request(&self, request: &AnalysisRequest) -> Result<()> {
        let analysis = match self.analyses.get(request.analysis_id).await? {
            Some(analysis) => Some(analysis),
            None => {
                self.analyses
                    .find(request.notice_id, &request.user_id)
                    .await?
            }
        };
        let Some(analysis) = analysis else {
            warn!("Analysis row not found, request dropped");
            return Ok(());
        };
        if analysis.status != AnalysisStatus::InProgress {
            debug!(status = %analysis.status, "Analysis no longer in progress, request skipped");
            return Ok(());
        }

        let start = Instant::now();
        let finished = match self.run_engine(&analysis).await {
            Ok(text) => self.analyses.complete(analysis.id, &text).await?,
            Err(e) => {
                warn!(error = %e, "Analysis failed");
                self.analyses.fail(analysis.id, &e.to_string()).await?
            }
        };
        info!(
            status = %finished.status,
            duration_ms = start.elapsed().as_millis() as u64,
            "Analysis finished"
        );

        self.dispatcher
            .publish_analysis_result(result_message(&finished))
            .await
    }

    async fn run_engine(&self, analysis: &NoticeAnalysis) -> Result<String> {
        let notice = self
            .notices
            .get(analysis.notice_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("notice {}", analysis.notice_id)))?;
        let attachments: Vec<StoredAttachment> =
            match self.notices.active_version(notice.id).await? {
                Some(version) => self.notices.attachments(version.id).await?,
                None => Vec::new(),
            };
        self.engine.analyze(&notice, &attachments).await
    }

    /// Reset analyses stuck InProgress past the timeout to Failed and publish
    /// a result trigger for each. Returns how many were reset.
    pub async fn reset_stuck(&self) -> Result<usize> {
        let older_than = Utc::now() - self.stuck_timeout;
        let reset = self
            .analyses
            .reset_stuck(older_than, STUCK_ANALYSIS_ERROR)
            .await?;
        if reset.is_empty() {
            return Ok(0);
        }

        info!(
            subsystem = "jobs",
            component = "analysis_service",
            op = "sweep_stuck",
            count = reset.len(),
            "Reset stuck analyses"
        );
        for analysis in &reset {
            if let Err(e) = self
                .dispatcher
                .publish_analysis_result(result_message(analysis))
                .await
            {
                warn!(
                    subsystem = "jobs",
                    component = "analysis_service",
                    op = "sweep_stuck",
                    analysis_id = %analysis.id,
                    error = %e,
                    "Failed to publish result for reset analysis"
                );
            }
        }
        Ok(reset.len())
    }
}
