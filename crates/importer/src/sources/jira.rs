//! Jira issues.
//!
//! Accepts both flat payloads and the REST shape where issue data lives
//! under `fields`.

use async_trait::async_trait;
use serde_json::{Map, Value};

use segway_core::{HandleError, ImportJobMessage, NormalizedMessage};

use crate::source::{identifier, label_names, missing, named, payload_object, text, SourceHandler};

/// Issue types turned into work items. Compared case-insensitively.
const IMPORTABLE_TYPES: &[&str] = &[
    "story",
    "bug",
    "task",
    "epic",
    "subtask",
    "sub-task",
    "improvement",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct JiraSource;

impl JiraSource {
    /// Look `key` up at the top level, then under `fields`.
    fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
        payload
            .get(key)
            .or_else(|| payload.get("fields").and_then(|f| f.get(key)))
    }

    fn issue_type(payload: &Value) -> Option<&str> {
        Self::lookup(payload, "issuetype", named)
    }

    fn lookup<'a>(
        payload: &'a Value,
        key: &str,
        read: fn(&'a Value, &str) -> Option<&'a str>,
    ) -> Option<&'a str> {
        read(payload, key).or_else(|| payload.get("fields").and_then(|f| read(f, key)))
    }
}

#[async_trait]
impl SourceHandler for JiraSource {
    fn source(&self) -> &str {
        "jira"
    }

    fn is_relevant(&self, job: &ImportJobMessage) -> bool {
        Self::issue_type(&job.payload)
            .map(|t| {
                IMPORTABLE_TYPES
                    .iter()
                    .any(|importable| importable.eq_ignore_ascii_case(t))
            })
            .unwrap_or(false)
    }

    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        payload_object(job)?;
        let payload = &job.payload;

        let summary = Self::lookup(payload, "summary", text)
            .ok_or_else(|| missing("jira", "summary"))?;
        let description = match Self::field(payload, "description") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            // Atlassian document format; relayed as JSON text.
            Some(other) => other.to_string(),
        };
        let key = identifier(payload, "key").or_else(|| identifier(payload, "id"));
        let external_id = format!("jira:{}", key.as_deref().unwrap_or(&job.job_id));

        let mut metadata = Map::new();
        if let Some(issue_type) = Self::issue_type(payload) {
            metadata.insert("issueType".into(), issue_type.to_lowercase().into());
        }
        if let Some(key) = key {
            metadata.insert("key".into(), key.into());
        }
        if let Some(priority) = Self::lookup(payload, "priority", named) {
            metadata.insert("priority".into(), priority.into());
        }
        if let Some(status) = Self::lookup(payload, "status", named) {
            metadata.insert("status".into(), status.into());
        }
        let labels = label_names(payload, "labels")
            .or_else(|| payload.get("fields").and_then(|f| label_names(f, "labels")));
        if let Some(labels) = labels.filter(|l| !l.is_empty()) {
            metadata.insert("labels".into(), Value::Array(labels));
        }

        Ok(NormalizedMessage::from_job(job, summary, external_id)
            .with_description(description)
            .with_metadata(Value::Object(metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(payload: Value) -> ImportJobMessage {
        serde_json::from_value(json!({
            "jobId": "J1", "domain": "importer", "source": "jira",
            "workspaceId": "ws-1", "projectId": "proj-1", "payload": payload
        }))
        .unwrap()
    }

    #[test]
    fn relevance_by_issue_type() {
        let jira = JiraSource;
        assert!(jira.is_relevant(&job(json!({"issuetype": "story"}))));
        assert!(jira.is_relevant(&job(json!({"issuetype": "Bug"}))));
        assert!(jira.is_relevant(&job(json!({"fields": {"issuetype": {"name": "Sub-task"}}}))));
        assert!(!jira.is_relevant(&job(json!({"issuetype": "comment"}))));
        assert!(!jira.is_relevant(&job(json!({"summary": "no type"}))));
        assert!(!jira.is_relevant(&job(json!("not an object"))));
    }

    #[tokio::test]
    async fn flat_story_maps_to_normalized() {
        let msg = JiraSource
            .handle(&job(json!({"issuetype": "story", "summary": "Fix bug", "key": "PROJ-12"})))
            .await
            .unwrap();
        assert_eq!(msg.name, "Fix bug");
        assert_eq!(msg.external_id, "jira:PROJ-12");
        assert_eq!(msg.description, "");
        assert_eq!(msg.workspace_id, "ws-1");
        assert_eq!(msg.source_metadata, json!({"issueType": "story", "key": "PROJ-12"}));
    }

    #[tokio::test]
    async fn rest_shape_reads_fields() {
        let payload = json!({
            "id": 10042,
            "fields": {
                "issuetype": {"name": "Bug"},
                "summary": "Crash on save",
                "description": "Steps to reproduce",
                "priority": {"name": "High"},
                "status": {"name": "To Do"},
                "labels": ["backend", "urgent"]
            }
        });
        let msg = JiraSource.handle(&job(payload)).await.unwrap();
        assert_eq!(msg.name, "Crash on save");
        assert_eq!(msg.description, "Steps to reproduce");
        assert_eq!(msg.external_id, "jira:10042");
        assert_eq!(msg.source_metadata["priority"], "High");
        assert_eq!(msg.source_metadata["status"], "To Do");
        assert_eq!(msg.source_metadata["labels"], json!(["backend", "urgent"]));
    }

    #[tokio::test]
    async fn external_id_falls_back_to_job_id() {
        let msg = JiraSource
            .handle(&job(json!({"issuetype": "task", "summary": "Write docs"})))
            .await
            .unwrap();
        assert_eq!(msg.external_id, "jira:J1");
    }

    #[tokio::test]
    async fn missing_summary_is_validation_error() {
        let err = JiraSource
            .handle(&job(json!({"issuetype": "story", "summary": "  "})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandleError::Validation(_)));
    }

    #[tokio::test]
    async fn same_job_same_output() {
        let j = job(json!({"issuetype": "epic", "summary": "Q3", "labels": [{"name": "x"}]}));
        let a = serde_json::to_vec(&JiraSource.handle(&j).await.unwrap()).unwrap();
        let b = serde_json::to_vec(&JiraSource.handle(&j).await.unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
