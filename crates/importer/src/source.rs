//! The per-source plug-in point of the worker base.

use async_trait::async_trait;
use serde_json::Value;

use segway_core::{HandleError, ImportJobMessage, NormalizedMessage};

/// Source-specific relevance filter and transform.
///
/// Both operations must be deterministic: the same job always yields the
/// same decision and the same normalized message, so retries and broker
/// redeliveries are harmless.
#[async_trait]
pub trait SourceHandler: Send + Sync + 'static {
    /// Source name, e.g. `jira`.
    fn source(&self) -> &str;

    /// Whether the job describes something worth importing. Pure.
    fn is_relevant(&self, job: &ImportJobMessage) -> bool;

    /// Map the job onto a [`NormalizedMessage`].
    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError>;
}

/// Handler assembled from two closures.
///
/// ```ignore
/// let handler = FnSource::new(
///     "linear",
///     |job| job.payload.get("title").is_some(),
///     |job| Ok(NormalizedMessage::from_job(job, "title", "linear:1")),
/// );
/// ```
pub struct FnSource<R, H> {
    source: String,
    relevant: R,
    handle: H,
}

impl<R, H> FnSource<R, H>
where
    R: Fn(&ImportJobMessage) -> bool + Send + Sync + 'static,
    H: Fn(&ImportJobMessage) -> Result<NormalizedMessage, HandleError> + Send + Sync + 'static,
{
    pub fn new(source: impl Into<String>, relevant: R, handle: H) -> Self {
        Self {
            source: source.into(),
            relevant,
            handle,
        }
    }
}

#[async_trait]
impl<R, H> SourceHandler for FnSource<R, H>
where
    R: Fn(&ImportJobMessage) -> bool + Send + Sync + 'static,
    H: Fn(&ImportJobMessage) -> Result<NormalizedMessage, HandleError> + Send + Sync + 'static,
{
    fn source(&self) -> &str {
        &self.source
    }

    fn is_relevant(&self, job: &ImportJobMessage) -> bool {
        (self.relevant)(job)
    }

    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        (self.handle)(job)
    }
}

// ── Payload helpers ──────────────────────────────────────────────────

/// The job payload as an object, or a validation error.
pub(crate) fn payload_object(
    job: &ImportJobMessage,
) -> Result<&serde_json::Map<String, Value>, HandleError> {
    job.payload
        .as_object()
        .ok_or_else(|| HandleError::validation("payload must be a JSON object"))
}

/// Non-blank string at `key`, trimmed.
pub(crate) fn text<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// String at `key`, or the `name` of an object at `key`.
pub(crate) fn named<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match value.get(key)? {
        Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()),
        other => text(other, "name"),
    }
}

/// Identifier at `key`, accepting strings and integers.
pub(crate) fn identifier(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Names of a label list given either as strings or `{name}` objects.
pub(crate) fn label_names(value: &Value, key: &str) -> Option<Vec<Value>> {
    let labels = value.get(key)?.as_array()?;
    let names: Vec<Value> = labels
        .iter()
        .filter_map(|label| match label {
            Value::String(s) => Some(s.as_str()),
            other => text(other, "name"),
        })
        .map(|s| Value::String(s.to_string()))
        .collect();
    Some(names)
}

/// Missing-field validation error.
pub(crate) fn missing(source: &str, field: &str) -> HandleError {
    HandleError::validation(format!("{source} payload has no usable '{field}'"))
}
