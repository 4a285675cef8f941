//! Wire types flowing through the import pipeline.
//!
//! Every body on the broker is JSON. Inbound jobs and outbound normalized
//! messages use camelCase keys to match the job-submission API.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureKind;

/// Default consumer-side concurrency bound per worker.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ── Queue naming ─────────────────────────────────────────────────────

/// Inbound queue for a `(domain, source)` pair, e.g. `importer.jira`.
pub fn inbound_queue(domain: &str, source: &str) -> String {
    format!("{domain}.{source}")
}

/// Outbound queue carrying normalized messages, e.g. `importer`.
pub fn outbound_queue(domain: &str) -> String {
    domain.to_string()
}

/// Dead-letter queue for a `(domain, source)` pair, e.g. `importer.jira.dead`.
pub fn dead_letter_queue(domain: &str, source: &str) -> String {
    format!("{domain}.{source}.dead")
}

// ── ImportJobMessage ─────────────────────────────────────────────────

/// Unit of work enqueued by the job-submission API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobMessage {
    /// Idempotency key, stable across retries.
    pub job_id: String,
    pub domain: String,
    pub source: String,
    pub workspace_id: String,
    pub project_id: String,
    /// Source-specific data, relayed untouched to the handler.
    #[serde(default)]
    pub payload: Value,
    /// Delivery attempts so far. Starts at 0.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ImportJobMessage {
    /// Decode a job from a raw message body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Encode the job back into a message body.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Copy of this job for the next delivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Check required fields and that the job belongs on `binding`.
    pub fn validate_for(&self, binding: &WorkerBinding) -> Result<(), String> {
        let required = [
            ("jobId", &self.job_id),
            ("workspaceId", &self.workspace_id),
            ("projectId", &self.project_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{field} must not be empty"));
            }
        }
        if self.domain != binding.domain() || self.source != binding.source() {
            return Err(format!(
                "message routed as {}.{} but delivered on {}",
                self.domain,
                self.source,
                binding.queue()
            ));
        }
        Ok(())
    }
}

// ── NormalizedMessage ────────────────────────────────────────────────

/// Source-independent shape handed to the issue-creation consumer.
///
/// Contains nothing time- or randomness-dependent so the same job always
/// produces the same bytes; the consumer deduplicates on `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub workspace_id: String,
    pub project_id: String,
    pub source: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub external_id: String,
    #[serde(default)]
    pub source_metadata: Value,
}

impl NormalizedMessage {
    /// Start a normalized message carrying the job's routing and scoping ids.
    pub fn from_job(
        job: &ImportJobMessage,
        name: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job.job_id.clone(),
            correlation_id: job.correlation_id.clone(),
            workspace_id: job.workspace_id.clone(),
            project_id: job.project_id.clone(),
            source: job.source.clone(),
            name: name.into(),
            description: String::new(),
            external_id: external_id.into(),
            source_metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.source_metadata = metadata;
        self
    }
}

// ── DeadLetter ───────────────────────────────────────────────────────

/// Body published to `<domain>.<source>.dead` for terminal failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub domain: String,
    pub source: String,
    pub kind: FailureKind,
    pub reason: String,
    pub attempt: u32,
    /// The decoded job, with `attempt` set to the final count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<ImportJobMessage>,
    /// Raw body when it could not be decoded as a job and is valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    /// Raw body, base64-encoded, when it is not valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body_base64: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Dead letter for a job that was decoded but could not be relayed.
    pub fn for_job(
        binding: &WorkerBinding,
        job: ImportJobMessage,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            domain: binding.domain().to_string(),
            source: binding.source().to_string(),
            kind,
            reason: reason.into(),
            attempt: job.attempt,
            job: Some(job),
            raw_body: None,
            raw_body_base64: None,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Dead letter for a body that is not a valid job at all.
    ///
    /// The body is kept byte for byte: as text when it is UTF-8, otherwise
    /// base64-encoded in `rawBodyBase64`.
    pub fn for_raw_body(binding: &WorkerBinding, body: &[u8], reason: impl Into<String>) -> Self {
        let (raw_body, raw_body_base64) = match std::str::from_utf8(body) {
            Ok(text) => (Some(text.to_string()), None),
            Err(_) => (None, Some(BASE64.encode(body))),
        };
        Self {
            domain: binding.domain().to_string(),
            source: binding.source().to_string(),
            kind: FailureKind::Deserialization,
            reason: reason.into(),
            attempt: 0,
            job: None,
            raw_body,
            raw_body_base64,
            dead_lettered_at: Utc::now(),
        }
    }
}

// ── WorkerBinding ────────────────────────────────────────────────────

/// The `(domain, source)` pair a worker consumes, with its delivery policy.
///
/// Fixed at worker construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBinding {
    domain: String,
    source: String,
    queue: String,
    prefetch: u16,
    max_attempts: u32,
}

impl WorkerBinding {
    pub fn new(domain: impl Into<String>, source: impl Into<String>) -> Self {
        let domain = domain.into();
        let source = source.into();
        Self {
            queue: inbound_queue(&domain, &source),
            domain,
            source,
            prefetch: DEFAULT_PREFETCH,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Raise or lower the prefetch window (minimum 1).
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the attempt limit (minimum 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn outbound_queue(&self) -> String {
        outbound_queue(&self.domain)
    }

    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue(&self.domain, &self.source)
    }
}

impl std::fmt::Display for WorkerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.queue)
    }
}
