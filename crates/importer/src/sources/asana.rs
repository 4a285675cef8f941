//! Asana task webhook events.

use async_trait::async_trait;
use serde_json::{Map, Value};

use segway_core::{HandleError, ImportJobMessage, NormalizedMessage};

use crate::source::{identifier, missing, payload_object, text, SourceHandler};

#[derive(Debug, Clone, Copy, Default)]
pub struct AsanaSource;

#[async_trait]
impl SourceHandler for AsanaSource {
    fn source(&self) -> &str {
        "asana"
    }

    fn is_relevant(&self, job: &ImportJobMessage) -> bool {
        let payload = &job.payload;
        text(payload, "resource_type") == Some("task")
            && text(payload, "action") != Some("deleted")
    }

    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        payload_object(job)?;
        let payload = &job.payload;

        let gid = identifier(payload, "gid").ok_or_else(|| missing("asana", "gid"))?;
        let name = text(payload, "name").ok_or_else(|| missing("asana", "name"))?;
        let notes = text(payload, "notes").unwrap_or_default();

        let mut metadata = Map::new();
        metadata.insert("gid".into(), gid.clone().into());
        if let Some(subtype) = text(payload, "resource_subtype") {
            metadata.insert("resourceSubtype".into(), subtype.into());
        }
        if let Some(completed) = payload.get("completed").and_then(Value::as_bool) {
            metadata.insert("completed".into(), completed.into());
        }
        if let Some(due_on) = text(payload, "due_on") {
            metadata.insert("dueOn".into(), due_on.into());
        }
        if let Some(assignee) = payload.get("assignee").and_then(|a| identifier(a, "gid")) {
            metadata.insert("assignee".into(), assignee.into());
        }
        if let Some(url) = text(payload, "permalink_url") {
            metadata.insert("url".into(), url.into());
        }

        Ok(NormalizedMessage::from_job(job, name, format!("asana:{gid}"))
            .with_description(notes)
            .with_metadata(Value::Object(metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(payload: Value) -> ImportJobMessage {
        serde_json::from_value(json!({
            "jobId": "A1", "domain": "importer", "source": "asana",
            "workspaceId": "ws-1", "projectId": "proj-1", "payload": payload
        }))
        .unwrap()
    }

    #[test]
    fn only_live_tasks_are_relevant() {
        let asana = AsanaSource;
        assert!(asana.is_relevant(&job(json!({"resource_type": "task", "gid": "1"}))));
        assert!(asana.is_relevant(&job(json!({"resource_type": "task", "action": "changed"}))));
        assert!(!asana.is_relevant(&job(json!({"resource_type": "task", "action": "deleted"}))));
        assert!(!asana.is_relevant(&job(json!({"resource_type": "story"}))));
        assert!(!asana.is_relevant(&job(json!({}))));
    }

    #[tokio::test]
    async fn task_maps_notes_and_gid() {
        let msg = AsanaSource
            .handle(&job(json!({
                "resource_type": "task",
                "gid": "1204",
                "name": "Ship onboarding",
                "notes": "See brief",
                "completed": false,
                "assignee": {"gid": "77"}
            })))
            .await
            .unwrap();
        assert_eq!(msg.name, "Ship onboarding");
        assert_eq!(msg.description, "See brief");
        assert_eq!(msg.external_id, "asana:1204");
        assert_eq!(msg.source_metadata["assignee"], "77");
        assert_eq!(msg.source_metadata["completed"], false);
    }

    #[tokio::test]
    async fn missing_gid_is_validation_error() {
        let err = AsanaSource
            .handle(&job(json!({"resource_type": "task", "name": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err, HandleError::validation("asana payload has no usable 'gid'"));
    }
}
