//! Favorite-search enqueue with in-flight dedup.
//!
//! Expected business outcomes (disabled queue, invalid request, duplicate)
//! come back as a [`FavoriteSearchOutcome`]. Only a publish that fails after
//! every retry is an error, and in that case the dedup marker is released
//! first so the caller can retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use tender_core::defaults::{
    FAVORITE_SEARCH_LIMIT, FAVORITE_SEARCH_LIMIT_FACTOR, FAVORITE_SEARCH_TOP,
    FAVORITE_SEARCH_TOP_MAX, SIMILARITY_THRESHOLD_PERCENT,
};
use tender_core::{EnqueueErrorKind, EnqueueOutcome, FavoriteSearchCommand, QueueKind, Result};

use crate::dedup::DedupGuard;
use crate::dispatcher::TaskDispatcher;

/// Caller-supplied parameters of a favorite-search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteSearchRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub query_vector_id: Option<Uuid>,
    #[serde(default)]
    pub collecting_end_limit: Option<DateTime<Utc>>,
    #[serde(default = "default_top")]
    pub top: i32,
    #[serde(default = "default_limit")]
    pub limit: i32,
    #[serde(default)]
    pub expired_only: bool,
    #[serde(default = "default_threshold")]
    pub similarity_threshold_percent: i32,
}

fn default_top() -> i32 {
    FAVORITE_SEARCH_TOP
}

fn default_limit() -> i32 {
    FAVORITE_SEARCH_LIMIT
}

fn default_threshold() -> i32 {
    SIMILARITY_THRESHOLD_PERCENT
}

impl Default for FavoriteSearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            query_vector_id: None,
            collecting_end_limit: None,
            top: FAVORITE_SEARCH_TOP,
            limit: FAVORITE_SEARCH_LIMIT,
            expired_only: false,
            similarity_threshold_percent: SIMILARITY_THRESHOLD_PERCENT,
        }
    }
}

/// Answer of [`FavoriteSearchQueue::enqueue`].
pub type FavoriteSearchOutcome = EnqueueOutcome;

/// Builds the normalized command, or explains why the request is invalid.
pub fn build_command(
    user_id: &str,
    request: &FavoriteSearchRequest,
) -> std::result::Result<FavoriteSearchCommand, &'static str> {
    if user_id.trim().is_empty() {
        return Err("user id is required");
    }
    let query = request
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string);
    if query.is_none() && request.query_vector_id.is_none() {
        return Err("a query or query vector id is required");
    }
    let Some(collecting_end_limit) = request.collecting_end_limit else {
        return Err("collecting end limit is required");
    };

    let top = request.top.clamp(1, FAVORITE_SEARCH_TOP_MAX);
    let limit = request.limit.clamp(top, top * FAVORITE_SEARCH_LIMIT_FACTOR);

    Ok(FavoriteSearchCommand {
        user_id: user_id.to_string(),
        query,
        query_vector_id: request.query_vector_id,
        collecting_end_limit,
        top,
        limit,
        expired_only: request.expired_only,
        similarity_threshold_percent: request.similarity_threshold_percent.clamp(0, 100),
    })
}

#[derive(Clone)]
pub struct FavoriteSearchQueue {
    dispatcher: Arc<TaskDispatcher>,
    guard: DedupGuard,
}

impl FavoriteSearchQueue {
    pub fn new(dispatcher: Arc<TaskDispatcher>, guard: DedupGuard) -> Self {
        Self { dispatcher, guard }
    }

    pub async fn enqueue(
        &self,
        user_id: &str,
        request: &FavoriteSearchRequest,
    ) -> Result<FavoriteSearchOutcome> {
        if !self.dispatcher.is_enabled(QueueKind::FavoriteSearch) {
            return Ok(FavoriteSearchOutcome::rejected(
                EnqueueErrorKind::Disabled,
                "favorite search queue is unavailable",
            ));
        }

        let command = match build_command(user_id, request) {
            Ok(command) => command,
            Err(reason) => {
                return Ok(FavoriteSearchOutcome::rejected(
                    EnqueueErrorKind::Invalid,
                    reason,
                ))
            }
        };

        let key = command.dedup_key();
        if !self.guard.try_reserve(&key) {
            info!(
                subsystem = "bus",
                component = "favorite_search",
                user_id,
                "Favorite search already in flight"
            );
            return Ok(FavoriteSearchOutcome::rejected(
                EnqueueErrorKind::Duplicate,
                "favorite search is already queued",
            ));
        }

        if let Err(e) = self.dispatcher.publish_favorite_search(command).await {
            self.guard.release(&key);
            warn!(
                subsystem = "bus",
                component = "favorite_search",
                user_id,
                error = %e,
                "Favorite search publish failed, dedup marker released"
            );
            return Err(e);
        }

        info!(
            subsystem = "bus",
            component = "favorite_search",
            user_id,
            "Favorite search enqueued"
        );
        Ok(FavoriteSearchOutcome::enqueued(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FavoriteSearchRequest {
        FavoriteSearchRequest {
            query: Some("  asphalt  ".into()),
            collecting_end_limit: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_command_normalizes() {
        let mut req = request();
        req.top = 500;
        req.limit = 1;
        req.similarity_threshold_percent = 150;
        let command = build_command("u", &req).unwrap();
        assert_eq!(command.query.as_deref(), Some("asphalt"));
        assert_eq!(command.top, 100);
        assert_eq!(command.limit, 100);
        assert_eq!(command.similarity_threshold_percent, 100);

        req.top = 0;
        req.limit = 10_000;
        let command = build_command("u", &req).unwrap();
        assert_eq!(command.top, 1);
        assert_eq!(command.limit, 50);
    }

    #[test]
    fn test_build_command_rejects_incomplete() {
        let mut req = request();
        req.collecting_end_limit = None;
        assert!(build_command("u", &req).is_err());

        let mut req = request();
        req.query = Some("   ".into());
        assert!(build_command("u", &req).is_err());
        req.query_vector_id = Some(Uuid::new_v4());
        assert!(build_command("u", &req).is_ok());

        assert!(build_command(" ", &request()).is_err());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: FavoriteSearchRequest =
            serde_json::from_str(r#"{"query":"x","collectingEndLimit":"2025-03-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(req.top, FAVORITE_SEARCH_TOP);
        assert_eq!(req.limit, FAVORITE_SEARCH_LIMIT);
        assert_eq!(req.similarity_threshold_percent, SIMILARITY_THRESHOLD_PERCENT);
    }
}
