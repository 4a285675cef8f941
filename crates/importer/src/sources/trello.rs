//! Trello cards.

use async_trait::async_trait;
use serde_json::{Map, Value};

use segway_core::{HandleError, ImportJobMessage, NormalizedMessage};

use crate::source::{identifier, label_names, missing, payload_object, text, SourceHandler};

#[derive(Debug, Clone, Copy, Default)]
pub struct TrelloSource;

#[async_trait]
impl SourceHandler for TrelloSource {
    fn source(&self) -> &str {
        "trello"
    }

    fn is_relevant(&self, job: &ImportJobMessage) -> bool {
        let payload = &job.payload;
        let closed = payload
            .get("closed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        text(payload, "type") == Some("card") && !closed
    }

    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        payload_object(job)?;
        let payload = &job.payload;

        let id = identifier(payload, "id").ok_or_else(|| missing("trello", "id"))?;
        let name = text(payload, "name").ok_or_else(|| missing("trello", "name"))?;
        let desc = text(payload, "desc").unwrap_or_default();

        let mut metadata = Map::new();
        for (from, to) in [("idList", "listId"), ("idBoard", "boardId"), ("due", "due")] {
            if let Some(value) = text(payload, from) {
                metadata.insert(to.into(), value.into());
            }
        }
        if let Some(url) = text(payload, "shortUrl").or_else(|| text(payload, "url")) {
            metadata.insert("url".into(), url.into());
        }
        if let Some(labels) = label_names(payload, "labels").filter(|l| !l.is_empty()) {
            metadata.insert("labels".into(), Value::Array(labels));
        }

        Ok(NormalizedMessage::from_job(job, name, format!("trello:{id}"))
            .with_description(desc)
            .with_metadata(Value::Object(metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(payload: Value) -> ImportJobMessage {
        serde_json::from_value(json!({
            "jobId": "T1", "domain": "importer", "source": "trello",
            "workspaceId": "ws-1", "projectId": "proj-1", "payload": payload
        }))
        .unwrap()
    }

    #[test]
    fn closed_cards_are_skipped() {
        let trello = TrelloSource;
        assert!(trello.is_relevant(&job(json!({"type": "card", "id": "c1"}))));
        assert!(!trello.is_relevant(&job(json!({"type": "card", "closed": true}))));
        assert!(!trello.is_relevant(&job(json!({"type": "list"}))));
    }

    #[tokio::test]
    async fn card_maps_list_labels_and_url() {
        let msg = TrelloSource
            .handle(&job(json!({
                "type": "card",
                "id": "5f1c",
                "name": "Design review",
                "desc": "Bring mockups",
                "idList": "L9",
                "labels": [{"name": "design", "color": "purple"}],
                "url": "https://trello.com/c/abc/1-design-review",
                "shortUrl": "https://trello.com/c/abc"
            })))
            .await
            .unwrap();
        assert_eq!(msg.external_id, "trello:5f1c");
        assert_eq!(msg.description, "Bring mockups");
        assert_eq!(
            msg.source_metadata,
            json!({
                "listId": "L9",
                "labels": ["design"],
                "url": "https://trello.com/c/abc"
            })
        );
    }

    #[tokio::test]
    async fn card_without_name_is_rejected() {
        let err = TrelloSource
            .handle(&job(json!({"type": "card", "id": "5f1c"})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandleError::Validation(_)));
    }
}
