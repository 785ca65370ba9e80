//! Elasticsearch-backed implementation of the projection apply surface.
//!
//! Every counter mutation is a scripted partial update against the target's
//! document, so the index itself resolves concurrent updates. Increments
//! null-guard the field and upsert a fresh document when the target has not
//! been indexed yet; decrements clamp at zero and never create documents.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use openshelf_core::TargetId;
use openshelf_projection::{ApplyError, ProjectionApplyPort};

const FIELD_COMMENT: &str = "comment_count";
const FIELD_LIKE: &str = "like_count";
const FIELD_VIEW: &str = "view_count";
const FIELD_DOWNLOAD: &str = "download_count";
const FIELD_DELETED: &str = "is_deleted";

/// Partial-update client for the search projection index.
#[derive(Debug, Clone)]
pub struct ElasticsearchProjection {
    http: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticsearchProjection {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: index.into(),
        }
    }

    fn update_url(&self, target_id: TargetId) -> String {
        format!("{}/{}/_update/{}", self.base_url, self.index, target_id)
    }

    async fn update(&self, target_id: TargetId, body: Value) -> Result<(), ApplyError> {
        let url = self.update_url(target_id);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ApplyError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(%target_id, index = %self.index, "projection update applied");
            return Ok(());
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApplyError::TargetMissing(target_id));
        }
        let detail = response.text().await.unwrap_or_default();
        Err(ApplyError::Rejected(format!("{status}: {detail}")))
    }
}

/// Scripted increment: null-guards the counter and upserts a minimal
/// document when the target is not indexed yet.
fn increment_body(field: &str, by: i64) -> Value {
    json!({
        "script": {
            "lang": "painless",
            "source": format!(
                "if (ctx._source.{field} == null) {{ ctx._source.{field} = params.by; }} \
                 else {{ ctx._source.{field} += params.by; }}"
            ),
            "params": { "by": by },
        },
        "upsert": { field: by },
    })
}

/// Scripted decrement, clamped at zero. No upsert: decrementing a document
/// that was never indexed must not create it.
fn decrement_body(field: &str) -> Value {
    json!({
        "script": {
            "lang": "painless",
            "source": format!(
                "if (ctx._source.{field} == null || ctx._source.{field} <= 0) \
                 {{ ctx._source.{field} = 0; }} else {{ ctx._source.{field} -= 1; }}"
            ),
        },
    })
}

/// Set the soft-delete flag. Replay-safe.
fn set_deleted_body(deleted: bool) -> Value {
    json!({
        "script": {
            "lang": "painless",
            "source": format!("ctx._source.{FIELD_DELETED} = params.deleted;"),
            "params": { "deleted": deleted },
        },
        "upsert": { FIELD_DELETED: deleted },
    })
}

#[async_trait]
impl ProjectionApplyPort for ElasticsearchProjection {
    async fn increase_comment_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.update(target_id, increment_body(FIELD_COMMENT, 1)).await
    }

    async fn decrease_comment_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.update(target_id, decrement_body(FIELD_COMMENT)).await
    }

    async fn increase_like_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.update(target_id, increment_body(FIELD_LIKE, 1)).await
    }

    async fn decrease_like_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.update(target_id, decrement_body(FIELD_LIKE)).await
    }

    async fn increase_view_count(&self, target_id: TargetId, by: i64) -> Result<(), ApplyError> {
        self.update(target_id, increment_body(FIELD_VIEW, by)).await
    }

    async fn increase_download_count(
        &self,
        target_id: TargetId,
        by: i64,
    ) -> Result<(), ApplyError> {
        self.update(target_id, increment_body(FIELD_DOWNLOAD, by)).await
    }

    async fn mark_deleted(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.update(target_id, set_deleted_body(true)).await
    }

    async fn mark_restored(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.update(target_id, set_deleted_body(false)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_url_joins_base_index_and_target() {
        let target = TargetId::new();
        let client = ElasticsearchProjection::new(
            reqwest::Client::new(),
            "http://localhost:9200/",
            "content_index",
        );
        assert_eq!(
            client.update_url(target),
            format!("http://localhost:9200/content_index/_update/{target}")
        );
    }

    #[test]
    fn increment_null_guards_and_upserts() {
        let body = increment_body(FIELD_LIKE, 1);
        let source = body["script"]["source"].as_str().unwrap();
        assert!(source.contains("ctx._source.like_count == null"));
        assert!(source.contains("ctx._source.like_count += params.by"));
        assert_eq!(body["script"]["params"]["by"], 1);
        assert_eq!(body["upsert"]["like_count"], 1);
    }

    #[test]
    fn increment_carries_the_batched_amount() {
        let body = increment_body(FIELD_VIEW, 37);
        assert_eq!(body["script"]["params"]["by"], 37);
        assert_eq!(body["upsert"]["view_count"], 37);
    }

    #[test]
    fn decrement_clamps_at_zero_and_never_upserts() {
        let body = decrement_body(FIELD_COMMENT);
        let source = body["script"]["source"].as_str().unwrap();
        assert!(source.contains("ctx._source.comment_count <= 0"));
        assert!(source.contains("ctx._source.comment_count = 0"));
        assert!(body.get("upsert").is_none());
    }

    #[test]
    fn set_deleted_writes_the_flag_both_ways() {
        let deleted = set_deleted_body(true);
        assert_eq!(deleted["script"]["params"]["deleted"], true);
        assert_eq!(deleted["upsert"]["is_deleted"], true);

        let restored = set_deleted_body(false);
        assert_eq!(restored["script"]["params"]["deleted"], false);
        assert_eq!(restored["upsert"]["is_deleted"], false);
    }
}
