//! Rows from an uploaded CSV file, one job per row.
//!
//! Payload shape: `{"rowIndex": 3, "row": {"title": "...", ...}}`.

use async_trait::async_trait;
use serde_json::{Map, Value};

use segway_core::{HandleError, ImportJobMessage, NormalizedMessage};

use crate::source::{identifier, missing, payload_object, text, SourceHandler};

/// Columns consumed by the mapping itself; everything else is metadata.
const MAPPED_COLUMNS: &[&str] = &["id", "title", "name", "description", "body"];

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSource;

impl CsvSource {
    fn row(payload: &Value) -> Option<&Value> {
        payload.get("row").filter(|row| row.is_object())
    }

    fn title(row: &Value) -> Option<&str> {
        text(row, "title").or_else(|| text(row, "name"))
    }
}

#[async_trait]
impl SourceHandler for CsvSource {
    fn source(&self) -> &str {
        "csv"
    }

    fn is_relevant(&self, job: &ImportJobMessage) -> bool {
        Self::row(&job.payload).and_then(Self::title).is_some()
    }

    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        payload_object(job)?;
        let row = Self::row(&job.payload).ok_or_else(|| missing("csv", "row"))?;
        let title = Self::title(row).ok_or_else(|| missing("csv", "title"))?;
        let description = text(row, "description")
            .or_else(|| text(row, "body"))
            .unwrap_or_default();

        let external_id = match identifier(row, "id") {
            Some(id) => format!("csv:{id}"),
            None => {
                let index = job
                    .payload
                    .get("rowIndex")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| missing("csv", "id' or 'rowIndex"))?;
                format!("csv:{}:{index}", job.job_id)
            }
        };

        let mut metadata = Map::new();
        if let Some(columns) = row.as_object() {
            for (column, value) in columns {
                if !MAPPED_COLUMNS.contains(&column.as_str()) && !value.is_null() {
                    metadata.insert(column.clone(), value.clone());
                }
            }
        }

        Ok(NormalizedMessage::from_job(job, title, external_id)
            .with_description(description)
            .with_metadata(Value::Object(metadata)))
    }
}
