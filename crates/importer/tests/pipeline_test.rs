//! End-to-end message flows through a running worker on the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use segway_core::{HandleError, ImportJobMessage, NormalizedMessage, WorkerBinding};
use segway_importer::{
    CsvSource, FnSource, ImportWorker, JiraSource, SourceHandler, Worker, WorkerOptions,
};
use segway_queue::{Backoff, ConnectionManager, MemoryBroker};

const TIMEOUT: Duration = Duration::from_secs(5);

fn job(source: &str, job_id: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "jobId": job_id,
        "domain": "importer",
        "source": source,
        "workspaceId": "ws-1",
        "projectId": "proj-1",
        "payload": payload,
        "attempt": 0
    }))
    .unwrap()
}

fn decode(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

async fn connect(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    ConnectionManager::connect(
        Arc::new(broker.clone()),
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
    )
    .await
    .unwrap()
}

async fn start<S: SourceHandler>(
    broker: &MemoryBroker,
    handler: S,
    binding: WorkerBinding,
    options: WorkerOptions,
) -> ImportWorker<S> {
    let worker = ImportWorker::new(handler, binding, connect(broker).await, options);
    worker.start().await.unwrap();
    worker
}

/// Poll `condition` until it holds or the timeout elapses.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn jira_story_is_relayed() {
    let broker = MemoryBroker::new();
    let worker = start(
        &broker,
        JiraSource,
        WorkerBinding::new("importer", "jira"),
        WorkerOptions::default(),
    )
    .await;

    broker.enqueue(
        "importer.jira",
        job("jira", "J1", json!({"issuetype": "story", "summary": "Fix bug"})),
    );
    assert!(broker.wait_until(TIMEOUT, |b| b.messages("importer").len() == 1).await);
    assert!(broker.wait_until(TIMEOUT, |b| b.unacked("importer.jira") == 0).await);

    let msg = decode(&broker.messages("importer")[0]);
    assert_eq!(msg["jobId"], "J1");
    assert_eq!(msg["name"], "Fix bug");
    assert_eq!(msg["workspaceId"], "ws-1");
    assert_eq!(msg["projectId"], "proj-1");
    assert_eq!(msg["externalId"], "jira:J1");
    assert!(broker.messages("importer.jira").is_empty());

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn publish_timeout_requeues_with_attempt_one() {
    let broker = MemoryBroker::new();
    broker.stall_publishes("importer");
    let worker = start(
        &broker,
        JiraSource,
        WorkerBinding::new("importer", "jira"),
        WorkerOptions::default()
            .confirm_timeout(Duration::from_millis(50))
            .drain_timeout(Duration::from_millis(200)),
    )
    .await;

    broker.enqueue(
        "importer.jira",
        job("jira", "J1", json!({"issuetype": "story", "summary": "Fix bug"})),
    );
    let retried = broker
        .wait_until(TIMEOUT, |b| {
            b.history("importer.jira")
                .iter()
                .any(|body| decode(body)["attempt"] == 1)
        })
        .await;
    assert!(retried, "no retry with attempt 1 was published");

    let retry = broker
        .history("importer.jira")
        .into_iter()
        .map(|body| decode(&body))
        .find(|v| v["attempt"] == 1)
        .unwrap();
    assert_eq!(retry["jobId"], "J1");
    assert_eq!(retry["payload"]["summary"], "Fix bug");
    assert!(broker.messages("importer").is_empty());

    // Once the outbound queue confirms again, a later attempt gets through.
    broker.clear_faults();
    assert!(broker.wait_until(TIMEOUT, |b| b.messages("importer").len() == 1).await);
    assert_eq!(decode(&broker.messages("importer")[0])["externalId"], "jira:J1");

    worker.stop().await.unwrap();
    assert_eq!(worker.metrics().published, 1);
}

#[tokio::test]
async fn comment_is_filtered_and_acked() {
    let broker = MemoryBroker::new();
    let worker = start(
        &broker,
        JiraSource,
        WorkerBinding::new("importer", "jira"),
        WorkerOptions::default(),
    )
    .await;

    broker.enqueue(
        "importer.jira",
        job("jira", "J2", json!({"issuetype": "comment", "body": "LGTM"})),
    );
    assert!(eventually(|| worker.metrics().irrelevant == 1).await);

    assert!(broker.messages("importer").is_empty());
    assert!(broker.messages("importer.jira").is_empty());
    assert!(broker.messages("importer.jira.dead").is_empty());
    assert_eq!(broker.unacked("importer.jira"), 0);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn five_transform_errors_end_in_dead_letter() {
    let broker = MemoryBroker::new();
    let handler = FnSource::new(
        "jira",
        |_: &ImportJobMessage| true,
        |_: &ImportJobMessage| Err(HandleError::transform("project lookup unavailable")),
    );
    let worker = start(
        &broker,
        handler,
        WorkerBinding::new("importer", "jira").with_max_attempts(5),
        WorkerOptions::default(),
    )
    .await;

    broker.enqueue("importer.jira", job("jira", "J3", json!({"issuetype": "bug"})));
    assert!(
        broker
            .wait_until(TIMEOUT, |b| b.messages("importer.jira.dead").len() == 1)
            .await
    );

    let dead = decode(&broker.messages("importer.jira.dead")[0]);
    assert_eq!(dead["attempt"], 5);
    assert_eq!(dead["kind"], "transform");
    assert_eq!(dead["job"]["jobId"], "J3");
    assert!(dead["reason"]
        .as_str()
        .unwrap()
        .contains("project lookup unavailable"));

    // The original plus four retries passed through the inbound queue.
    let attempts: Vec<Value> = broker
        .history("importer.jira")
        .iter()
        .map(|body| decode(body)["attempt"].clone())
        .collect();
    assert_eq!(attempts, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    assert!(broker.messages("importer").is_empty());

    worker.stop().await.unwrap();
    assert_eq!(worker.metrics().retried, 4);
    assert_eq!(worker.metrics().dead_lettered, 1);
}

#[tokio::test]
async fn malformed_json_is_dead_lettered_without_retry() {
    let broker = MemoryBroker::new();
    let worker = start(
        &broker,
        JiraSource,
        WorkerBinding::new("importer", "jira"),
        WorkerOptions::default(),
    )
    .await;

    broker.enqueue("importer.jira", b"{\"jobId\": \"J4\",".to_vec());
    assert!(
        broker
            .wait_until(TIMEOUT, |b| b.messages("importer.jira.dead").len() == 1)
            .await
    );

    let dead = decode(&broker.messages("importer.jira.dead")[0]);
    assert_eq!(dead["kind"], "deserialization");
    assert_eq!(dead["rawBody"], "{\"jobId\": \"J4\",");
    assert_eq!(broker.history("importer.jira").len(), 1);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn same_job_produces_identical_output() {
    let broker = MemoryBroker::new();
    let worker = start(
        &broker,
        JiraSource,
        WorkerBinding::new("importer", "jira"),
        WorkerOptions::default(),
    )
    .await;

    let body = job(
        "jira",
        "J5",
        json!({"fields": {"issuetype": {"name": "Epic"}, "summary": "Q3 goals",
                          "labels": ["planning"], "priority": {"name": "Low"}}}),
    );
    broker.enqueue("importer.jira", body.clone());
    broker.enqueue("importer.jira", body);
    assert!(broker.wait_until(TIMEOUT, |b| b.messages("importer").len() == 2).await);

    let out = broker.messages("importer");
    assert_eq!(out[0], out[1]);

    worker.stop().await.unwrap();
}

/// Handler that tracks how many transforms run at once.
#[derive(Default)]
struct ConcurrencyTracker {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl SourceHandler for ConcurrencyTracker {
    fn source(&self) -> &str {
        "csv"
    }

    fn is_relevant(&self, _job: &ImportJobMessage) -> bool {
        true
    }

    async fn handle(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(NormalizedMessage::from_job(job, "row", format!("csv:{}", job.job_id)))
    }
}

#[tokio::test]
async fn prefetch_bounds_concurrent_processing() {
    let broker = MemoryBroker::new();
    let tracker = ConcurrencyTracker::default();
    let peak = tracker.peak.clone();
    let worker = start(
        &broker,
        tracker,
        WorkerBinding::new("importer", "csv").with_prefetch(2),
        WorkerOptions::default(),
    )
    .await;

    for i in 0..6 {
        broker.enqueue("importer.csv", job("csv", &format!("C{i}"), json!({})));
    }
    assert!(broker.wait_until(TIMEOUT, |b| b.messages("importer").len() == 6).await);
    worker.stop().await.unwrap();

    assert_eq!(worker.metrics().published, 6);
    assert_eq!(broker.unacked("importer.csv"), 0);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn csv_rows_map_extra_columns() {
    let broker = MemoryBroker::new();
    let worker = start(
        &broker,
        CsvSource,
        WorkerBinding::new("importer", "csv").with_prefetch(4),
        WorkerOptions::default(),
    )
    .await;

    broker.enqueue(
        "importer.csv",
        job(
            "csv",
            "C1",
            json!({"rowIndex": 2, "row": {"title": "Audit logs", "team": "infra"}}),
        ),
    );
    broker.enqueue(
        "importer.csv",
        job("csv", "C2", json!({"rowIndex": 3, "row": {"title": ""}})),
    );
    assert!(broker.wait_until(TIMEOUT, |b| b.messages("importer").len() == 1).await);
    assert!(eventually(|| worker.metrics().irrelevant == 1).await);

    let msg = decode(&broker.messages("importer")[0]);
    assert_eq!(msg["externalId"], "csv:C1:2");
    assert_eq!(msg["sourceMetadata"], json!({"team": "infra"}));

    worker.stop().await.unwrap();
}
