//! Delayed flush triggers.
//!
//! A trigger asks for `flush_messages(chat_id, token)` to run after a delay.
//! In production QStash holds the delay and calls the flush webhook; without
//! a QStash token the job is delivered in process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use spark_shared::constants::{TRIGGER_RETRIES, TRIGGER_TIMEOUT_SECS};

use crate::flush::FlushCoordinator;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("trigger request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("trigger rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("scheduler closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushJob {
    pub chat_id: String,
    pub token: String,
    pub delay: Duration,
}

#[async_trait]
pub trait FlushScheduler: Send + Sync + 'static {
    async fn schedule(&self, job: FlushJob) -> Result<(), SchedulerError>;
}

// ---------------------------------------------------------------------------
// QStash
// ---------------------------------------------------------------------------

/// Body of a flush webhook.
#[derive(Debug, Serialize, Deserialize)]
pub struct FlushRequest {
    #[serde(rename = "chatId", default)]
    pub chat_id: String,
    #[serde(rename = "flushToken", default)]
    pub flush_token: String,
}

pub struct QStashScheduler {
    http: reqwest::Client,
    qstash_url: String,
    bearer: String,
    backend_url: String,
}

impl QStashScheduler {
    pub fn new(
        qstash_url: impl Into<String>,
        bearer: impl Into<String>,
        backend_url: impl Into<String>,
    ) -> Result<Self, SchedulerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(TRIGGER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            qstash_url: qstash_url.into(),
            bearer: bearer.into(),
            backend_url: backend_url.into(),
        })
    }

    /// `<qstash>/v2/publish/<backend>/v1/chat/flush`
    pub fn publish_url(&self) -> String {
        format!(
            "{}/v2/publish/{}/v1/chat/flush",
            self.qstash_url, self.backend_url
        )
    }
}

#[async_trait]
impl FlushScheduler for QStashScheduler {
    async fn schedule(&self, job: FlushJob) -> Result<(), SchedulerError> {
        let body = FlushRequest {
            chat_id: job.chat_id.clone(),
            flush_token: job.token.clone(),
        };

        let mut request = self
            .http
            .post(self.publish_url())
            .bearer_auth(&self.bearer)
            .header(
                "Upstash-Deduplication-Id",
                format!("chat--{}--flush--{}", job.chat_id, job.token),
            )
            .header("Upstash-Retries", TRIGGER_RETRIES.to_string())
            .json(&body);
        if !job.delay.is_zero() {
            request = request.header("Upstash-Delay", format!("{}s", job.delay.as_secs()));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            chat_id = %job.chat_id,
            delay_secs = job.delay.as_secs(),
            "Flush trigger published"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Delivers jobs over a channel to [`run_local_jobs`].
#[derive(Clone)]
pub struct LocalScheduler {
    tx: mpsc::UnboundedSender<FlushJob>,
}

impl LocalScheduler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FlushJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FlushScheduler for LocalScheduler {
    async fn schedule(&self, job: FlushJob) -> Result<(), SchedulerError> {
        self.tx.send(job).map_err(|_| SchedulerError::Closed)
    }
}

/// Identity of a queued job. Immediate and delayed triggers for one token
/// are tracked apart so a full batch is never held behind an idle timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    chat_id: String,
    token: String,
    immediate: bool,
}

impl From<&FlushJob> for PendingKey {
    fn from(job: &FlushJob) -> Self {
        Self {
            chat_id: job.chat_id.clone(),
            token: job.token.clone(),
            immediate: job.delay.is_zero(),
        }
    }
}

/// Run each job after its delay. Returns when every scheduler handle is gone.
///
/// A job whose (chat, token) is already waiting or running is dropped, the
/// same way QStash drops a repeated deduplication id.
pub async fn run_local_jobs(
    mut rx: mpsc::UnboundedReceiver<FlushJob>,
    coordinator: Arc<FlushCoordinator>,
) {
    info!("In-process flush scheduler running");
    let pending: Arc<Mutex<HashSet<PendingKey>>> = Arc::default();
    while let Some(job) = rx.recv().await {
        let key = PendingKey::from(&job);
        if !pending.lock().await.insert(key.clone()) {
            debug!(chat_id = %job.chat_id, "Flush already pending, skipping");
            continue;
        }

        let coordinator = coordinator.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            if !job.delay.is_zero() {
                tokio::time::sleep(job.delay).await;
            }
            match coordinator.flush_messages(&job.chat_id, &job.token).await {
                Ok(outcome) => debug!(chat_id = %job.chat_id, ?outcome, "Local flush done"),
                Err(e) => warn!(chat_id = %job.chat_id, error = %e, "Local flush failed"),
            }
            pending.lock().await.remove(&key);
        });
    }
}

/// Records jobs instead of running them.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingScheduler {
    pub jobs: std::sync::Mutex<Vec<FlushJob>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingScheduler {
    pub fn jobs(&self) -> Vec<FlushJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<FlushJob> {
        self.jobs.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl FlushScheduler for RecordingScheduler {
    async fn schedule(&self, job: FlushJob) -> Result<(), SchedulerError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::FlushSettings;
    use crate::testing::Fixture;
    use spark_buffer::BufferStore;
    use spark_shared::{EventEnvelope, Message};
    use spark_store::ChatRepository;

    #[test]
    fn test_publish_url() {
        let scheduler =
            QStashScheduler::new("https://qstash.upstash.io", "tok", "https://api.example.com")
                .unwrap();
        assert_eq!(
            scheduler.publish_url(),
            "https://qstash.upstash.io/v2/publish/https://api.example.com/v1/chat/flush"
        );
    }

    #[test]
    fn test_flush_request_wire_names() {
        let body = serde_json::to_value(FlushRequest {
            chat_id: "c1".into(),
            flush_token: "T1".into(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"chatId": "c1", "flushToken": "T1"}));
    }

    #[tokio::test]
    async fn test_local_scheduler_delivers_jobs() {
        let (scheduler, mut rx) = LocalScheduler::channel();
        let job = FlushJob {
            chat_id: "c1".into(),
            token: "T1".into(),
            delay: Duration::ZERO,
        };
        scheduler.schedule(job.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(job));

        drop(rx);
        assert!(scheduler
            .schedule(FlushJob {
                chat_id: "c1".into(),
                token: "T2".into(),
                delay: Duration::ZERO,
            })
            .await
            .is_err());
    }

    type LocalParts = (
        Fixture,
        Arc<FlushCoordinator>,
        LocalScheduler,
        mpsc::UnboundedReceiver<FlushJob>,
    );

    fn local_fixture() -> LocalParts {
        let fx = Fixture::new();
        let (local, rx) = LocalScheduler::channel();
        let coordinator = Arc::new(FlushCoordinator::new(
            fx.buffer.clone(),
            fx.repo.clone(),
            Arc::new(local.clone()),
            FlushSettings {
                batch_size: 50,
                idle_delay: Duration::from_secs(3600),
            },
        ));
        (fx, coordinator, local, rx)
    }

    async fn buffer_many(fx: &Fixture, n: usize) {
        for i in 0..n {
            let m = Message::text("he", format!("m{i}"));
            let event = EventEnvelope::Message { message: m.clone() };
            fx.buffer.append("c1", &m, &event, chrono::Utc::now()).await.unwrap();
        }
    }

    async fn wait_for_appends(fx: &Fixture, n: usize) {
        for _ in 0..200 {
            if fx.repo.append_calls() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Let any duplicate job finish too.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_local_jobs_drain_a_token_once() {
        let (fx, coordinator, _local, rx) = local_fixture();
        buffer_many(&fx, 51).await;

        let first = coordinator.schedule_flush("c1").await.unwrap();
        let second = coordinator.schedule_flush("c1").await.unwrap();
        assert_eq!(first.token, second.token);
        assert!(first.delay.is_zero() && second.delay.is_zero());

        let runner = tokio::spawn(run_local_jobs(rx, coordinator));
        wait_for_appends(&fx, 1).await;

        assert_eq!(fx.repo.append_calls(), 1);
        assert_eq!(fx.repo.load_chat("c1").await.unwrap().messages.len(), 50);
        assert_eq!(fx.buffer.len("c1").await.unwrap(), 1);
        runner.abort();
    }

    #[tokio::test]
    async fn test_local_jobs_run_again_after_completion() {
        let (fx, coordinator, local, rx) = local_fixture();
        let runner = tokio::spawn(run_local_jobs(rx, coordinator));

        buffer_many(&fx, 2).await;
        let job = FlushJob {
            chat_id: "c1".into(),
            token: String::new(),
            delay: Duration::ZERO,
        };
        local.schedule(job.clone()).await.unwrap();
        wait_for_appends(&fx, 1).await;
        assert_eq!(fx.buffer.len("c1").await.unwrap(), 0);

        // Same key again, but the first run is finished: it is not skipped.
        fx.buffer.set_flush_token("c1", "", Duration::from_secs(60)).await.unwrap();
        buffer_many(&fx, 1).await;
        local.schedule(job).await.unwrap();
        wait_for_appends(&fx, 2).await;
        assert_eq!(fx.repo.append_calls(), 2);
        runner.abort();
    }
}
